//! Report artifact reader.
//!
//! Reads whitespace-delimited numeric tables such as `jeans-errors.dat`:
//! `#` lines are headers, every other non-blank line is one [`ErrorRow`].

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors raised while reading a report artifact.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("cannot read report {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// `line` is 1-based; `column` is the 0-based index rules use.
    #[error("line {line}, column index {column}: not a number: '{text}'")]
    NotANumber {
        line: usize,
        column: usize,
        text: String,
    },

    #[error("line {line}, column index {column}: NaN")]
    NanValue { line: usize, column: usize },
}

/// One data line of a report artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRow(pub Vec<f64>);

impl ErrorRow {
    pub fn get(&self, column: usize) -> Option<f64> {
        self.0.get(column).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<f64>> for ErrorRow {
    fn from(fields: Vec<f64>) -> Self {
        ErrorRow(fields)
    }
}

/// Parser for report artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactReader {
    reject_nan: bool,
}

impl Default for ArtifactReader {
    fn default() -> Self {
        Self { reject_nan: true }
    }
}

impl ArtifactReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept NaN fields instead of failing on them.
    pub fn allow_nan(mut self) -> Self {
        self.reject_nan = false;
        self
    }

    /// Read and parse the report at `path`.
    pub fn read(&self, path: &Path) -> Result<Vec<ErrorRow>, ReportError> {
        let text = std::fs::read_to_string(path).map_err(|source| ReportError::Read {
            path: path.display().to_string(),
            source,
        })?;
        self.parse(&text)
    }

    /// Parse report text. Line numbers in errors are 1-based.
    pub fn parse(&self, text: &str) -> Result<Vec<ErrorRow>, ReportError> {
        let mut rows = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let mut fields = Vec::new();
            for (column, token) in trimmed.split_whitespace().enumerate() {
                let value: f64 = token.parse().map_err(|_| ReportError::NotANumber {
                    line: idx + 1,
                    column,
                    text: token.to_string(),
                })?;
                if self.reject_nan && value.is_nan() {
                    return Err(ReportError::NanValue {
                        line: idx + 1,
                        column,
                    });
                }
                fields.push(value);
            }
            rows.push(ErrorRow(fields));
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JEANS: &str = "\
# Nx1 Nx2 Nx3 Ncycle RMS-L1-Error d_L1 M1_L1 M2_L1 M3_L1 E_L1
64 32 32 120 8.1e-08 1.0e-08 2.0e-08 3.0e-08 4.0e-08 5.0e-08

64 32 32 120 9.0e-08 1.0e-08 2.0e-08 3.0e-08 4.0e-08 5.0e-08
";

    #[test]
    fn test_parse_skips_headers_and_blanks() {
        let rows = ArtifactReader::new().parse(JEANS).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), 10);
        assert_eq!(rows[0].get(4), Some(8.1e-8));
        assert_eq!(rows[1].get(4), Some(9.0e-8));
        assert_eq!(rows[1].get(10), None);
    }

    #[test]
    fn test_parse_rejects_non_numeric() {
        let err = ArtifactReader::new().parse("1.0 abc 3.0\n").unwrap_err();
        match err {
            ReportError::NotANumber { line, column, text } => {
                assert_eq!(line, 1);
                assert_eq!(column, 1);
                assert_eq!(text, "abc");
            }
            other => panic!("expected NotANumber, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_nan_by_default() {
        let err = ArtifactReader::new().parse("# h\n1.0 nan\n").unwrap_err();
        assert!(matches!(err, ReportError::NanValue { line: 2, column: 1 }));
        assert_eq!(err.to_string(), "line 2, column index 1: NaN");
    }

    #[test]
    fn test_parse_allow_nan() {
        let rows = ArtifactReader::new().allow_nan().parse("1.0 NaN\n").unwrap();
        assert!(rows[0].get(1).unwrap().is_nan());
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ArtifactReader::new()
            .read(&dir.path().join("missing.dat"))
            .unwrap_err();
        assert!(err.to_string().contains("missing.dat"));
    }

    #[test]
    fn test_read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.dat");
        std::fs::write(&path, JEANS).unwrap();
        let rows = ArtifactReader::new().read(&path).unwrap();
        assert_eq!(rows.len(), 2);
    }
}
