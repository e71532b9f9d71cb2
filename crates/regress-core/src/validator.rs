//! Consistency validator over parsed report rows.
//!
//! Evaluates a [`RuleSet`] against [`ErrorRow`]s to produce a [`Verdict`].
//! [`validate`] stops at the first failing rule; [`audit`] collects every
//! failure. Only the fields named by the rules are read.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::report::ErrorRow;

/// How a rule compares its fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    /// `rows[left][col] <= bound`
    AbsoluteBound,
    /// `|rows[left][col] - rows[right][col]| <= bound`
    RelativeDifference,
    /// `rows[left][col] == rows[right][col]`, bit-for-bit.
    ExactEquality,
}

/// One declarative tolerance check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToleranceRule {
    pub comparator: Comparator,
    pub left: usize,
    /// Second row; unused by [`Comparator::AbsoluteBound`].
    #[serde(default)]
    pub right: Option<usize>,
    /// Required by the bounded comparators, absent for [`Comparator::ExactEquality`].
    #[serde(default)]
    pub bound: Option<f64>,
    /// Overrides [`RuleSet::column`] for this rule.
    #[serde(default)]
    pub column: Option<usize>,
    pub message: String,
}

impl ToleranceRule {
    pub fn absolute(row: usize, bound: f64, message: impl Into<String>) -> Self {
        Self {
            comparator: Comparator::AbsoluteBound,
            left: row,
            right: None,
            bound: Some(bound),
            column: None,
            message: message.into(),
        }
    }

    pub fn relative(left: usize, right: usize, bound: f64, message: impl Into<String>) -> Self {
        Self {
            comparator: Comparator::RelativeDifference,
            left,
            right: Some(right),
            bound: Some(bound),
            column: None,
            message: message.into(),
        }
    }

    pub fn exact(left: usize, right: usize, message: impl Into<String>) -> Self {
        Self {
            comparator: Comparator::ExactEquality,
            left,
            right: Some(right),
            bound: None,
            column: None,
            message: message.into(),
        }
    }

    /// Read a different column than the rule set's default.
    pub fn on_column(mut self, column: usize) -> Self {
        self.column = Some(column);
        self
    }

    /// Check the operands match the comparator and the rows exist in a
    /// report of `rows` lines, when that count is known.
    pub fn check(&self, rows: Option<usize>) -> Result<(), String> {
        let operands = match (self.comparator, self.right, self.bound) {
            (Comparator::AbsoluteBound, None, Some(_))
            | (Comparator::RelativeDifference, Some(_), Some(_))
            | (Comparator::ExactEquality, Some(_), None) => Ok(()),
            (Comparator::AbsoluteBound, Some(_), _) => Err("an absolute bound takes no right row"),
            (Comparator::ExactEquality, _, Some(_)) => Err("exact equality takes no bound"),
            (Comparator::AbsoluteBound, None, None)
            | (Comparator::RelativeDifference, Some(_), None) => Err("a bound is required"),
            (_, None, _) => Err("a right row is required"),
        };
        operands.map_err(str::to_string)?;

        if let Some(bound) = self.bound {
            if !(bound >= 0.0) || bound.is_infinite() {
                return Err(format!("bound {} is not a finite non-negative number", bound));
            }
        }
        if let Some(rows) = rows {
            for row in std::iter::once(self.left).chain(self.right) {
                if row >= rows {
                    return Err(format!("row {} is outside a report of {} rows", row, rows));
                }
            }
        }
        Ok(())
    }
}

/// Ordered rules plus the default column they read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSet {
    pub column: usize,
    #[serde(default)]
    pub rules: Vec<ToleranceRule>,
}

impl RuleSet {
    pub fn new(column: usize) -> Self {
        Self {
            column,
            rules: Vec::new(),
        }
    }

    /// Add a rule (builder pattern).
    pub fn with_rule(mut self, rule: ToleranceRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// First malformed rule, as `rule <idx> ('<message>'): <reason>`.
    pub fn check(&self, rows: Option<usize>) -> Result<(), String> {
        for (idx, rule) in self.rules.iter().enumerate() {
            rule.check(rows)
                .map_err(|reason| format!("rule {} ('{}'): {}", idx, rule.message, reason))?;
        }
        Ok(())
    }
}

/// A single violated rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleFailure {
    /// Position of the rule in its set.
    pub rule_index: usize,
    /// Rule message with the compared values appended.
    pub message: String,
    pub left: Option<f64>,
    pub right: Option<f64>,
}

/// Outcome of validating rows against a rule set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    /// Failures found (empty when passed).
    pub failures: Vec<RuleFailure>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            failures: Vec::new(),
        }
    }

    /// Verdict carrying a single failure not tied to a rule.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            failures: vec![RuleFailure {
                rule_index: usize::MAX,
                message: message.into(),
                left: None,
                right: None,
            }],
        }
    }

    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// Primary diagnostic: the first failure's message.
    pub fn message(&self) -> Option<&str> {
        self.failures.first().map(|f| f.message.as_str())
    }
}

/// Evaluate rules in order and stop at the first failure.
pub fn validate(rows: &[ErrorRow], rule_set: &RuleSet) -> Verdict {
    let failures = rule_set
        .rules
        .iter()
        .enumerate()
        .find_map(|(idx, rule)| check_rule(idx, rule, rows, rule_set.column))
        .into_iter()
        .collect();
    Verdict { failures }
}

/// Evaluate every rule and collect all failures.
pub fn audit(rows: &[ErrorRow], rule_set: &RuleSet) -> Verdict {
    let failures = rule_set
        .rules
        .iter()
        .enumerate()
        .filter_map(|(idx, rule)| check_rule(idx, rule, rows, rule_set.column))
        .collect();
    Verdict { failures }
}

fn field(rows: &[ErrorRow], row: usize, column: usize) -> Result<f64, String> {
    let r = rows
        .get(row)
        .ok_or_else(|| format!("row {} not present (report has {} rows)", row, rows.len()))?;
    r.get(column)
        .ok_or_else(|| format!("row {} has no column {} ({} fields)", row, column, r.len()))
}

fn check_rule(
    idx: usize,
    rule: &ToleranceRule,
    rows: &[ErrorRow],
    default_column: usize,
) -> Option<RuleFailure> {
    let column = rule.column.unwrap_or(default_column);
    let missing = |reason: String| RuleFailure {
        rule_index: idx,
        message: format!("{}: {}", rule.message, reason),
        left: None,
        right: None,
    };

    let left = match field(rows, rule.left, column) {
        Ok(v) => v,
        Err(reason) => return Some(missing(reason)),
    };

    let failure = match rule.comparator {
        Comparator::AbsoluteBound => {
            // Written as a negated `<=` so NaN fails.
            let Some(bound) = rule.bound else {
                return Some(missing("rule has no bound".to_string()));
            };
            if !(left <= bound) {
                Some(RuleFailure {
                    rule_index: idx,
                    message: format!("{}: {:e} > {:e}", rule.message, left, bound),
                    left: Some(left),
                    right: None,
                })
            } else {
                None
            }
        }
        Comparator::RelativeDifference | Comparator::ExactEquality => {
            let Some(right_row) = rule.right else {
                return Some(missing("rule has no right-hand row".to_string()));
            };
            let right = match field(rows, right_row, column) {
                Ok(v) => v,
                Err(reason) => return Some(missing(reason)),
            };
            let ok = match (rule.comparator, rule.bound) {
                (Comparator::ExactEquality, _) => left == right,
                (_, Some(bound)) => (left - right).abs() <= bound,
                (_, None) => return Some(missing("rule has no bound".to_string())),
            };
            if ok {
                None
            } else {
                Some(RuleFailure {
                    rule_index: idx,
                    message: format!("{}: {:e} vs {:e}", rule.message, left, right),
                    left: Some(left),
                    right: Some(right),
                })
            }
        }
    };

    if let Some(f) = &failure {
        warn!(rule = idx, "{}", f.message);
    }
    failure
}
