//! Error taxonomy for the regression harness.
//!
//! A failed tolerance rule is not an error: it is reported through
//! [`crate::validator::Verdict`]. Everything here aborts the current test case.

use crate::report::ReportError;
use crate::store::StoreError;

/// Harness errors.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Bad or empty matrix, inconsistent plan. Raised before any build.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// External build exited non-zero (or could not be run to completion).
    #[error("build failed for variant '{variant}' ({step}): {reason}")]
    BuildFailure {
        variant: String,
        step: String,
        exit_code: Option<i32>,
        reason: String,
    },

    /// External run exited non-zero (or could not be run to completion).
    #[error("run failed for variant '{variant}': {reason}")]
    RunFailure {
        variant: String,
        exit_code: Option<i32>,
        reason: String,
    },

    #[error("report error: {0}")]
    Report(#[from] ReportError),

    #[error("artifact store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl HarnessError {
    /// Shorthand for a [`HarnessError::Configuration`].
    pub fn config(msg: impl Into<String>) -> Self {
        HarnessError::Configuration(msg.into())
    }
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_display() {
        let err = HarnessError::config("catalogue is empty");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("catalogue is empty"));
    }

    #[test]
    fn test_build_failure_names_variant_and_step() {
        let err = HarnessError::BuildFailure {
            variant: "mpi_fft".to_string(),
            step: "make".to_string(),
            exit_code: Some(2),
            reason: "exited with code 2".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("mpi_fft"));
        assert!(msg.contains("make"));
        assert!(msg.contains("code 2"));
    }

    #[test]
    fn test_run_failure_display() {
        let err = HarnessError::RunFailure {
            variant: "fft".to_string(),
            exit_code: None,
            reason: "timed out after 5 seconds".to_string(),
        };
        assert!(err.to_string().contains("run failed for variant 'fft'"));
    }
}
