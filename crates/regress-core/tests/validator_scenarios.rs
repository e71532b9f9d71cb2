//! Tolerance rule scenarios from report text through to verdict.

use regress_core::catalog::jeans_3d;
use regress_core::{
    audit, validate, ArtifactReader, ErrorRow, ReportError, RuleSet, ToleranceRule,
};

fn rows(errors: &[f64]) -> Vec<ErrorRow> {
    errors
        .iter()
        .map(|e| ErrorRow(vec![0.0, 0.0, 0.0, 0.0, *e]))
        .collect()
}

fn consistency_rules() -> RuleSet {
    RuleSet::new(4)
        .with_rule(ToleranceRule::exact(0, 2, "serial and one-process runs differ"))
        .with_rule(ToleranceRule::absolute(0, 1e-7, "row 0 error too large"))
        .with_rule(ToleranceRule::absolute(1, 1e-7, "row 1 error too large"))
}

#[test]
fn test_identical_errors_within_ceiling_pass() {
    let verdict = validate(&rows(&[8e-8, 9e-8, 8e-8]), &consistency_rules());
    assert!(verdict.passed());
    assert!(verdict.message().is_none());
}

#[test]
fn test_exact_equality_failure_cites_both_values() {
    let verdict = validate(&rows(&[8e-8, 9e-8, 8.5e-8]), &consistency_rules());
    assert!(!verdict.passed());
    let message = verdict.message().unwrap();
    assert!(message.starts_with("serial and one-process runs differ"));
    assert!(message.contains("8e-8"), "{message}");
    assert!(message.contains("8.5e-8"), "{message}");
    assert_eq!(verdict.failures[0].rule_index, 0);
}

#[test]
fn test_relative_difference_bound() {
    let rule = RuleSet::new(4).with_rule(ToleranceRule::relative(
        0,
        1,
        5.0e-4,
        "distributed drift too large",
    ));

    assert!(validate(&rows(&[8.0e-8, 8.0003e-8]), &rule).passed());

    let verdict = validate(&rows(&[8.0e-8, 8.1e-4]), &rule);
    assert!(!verdict.passed());
    assert!(verdict
        .message()
        .unwrap()
        .starts_with("distributed drift too large"));
}

#[test]
fn test_first_failure_wins_and_audit_collects_all() {
    // Both the equality rule and the row 1 ceiling are violated.
    let data = rows(&[8e-8, 2e-7, 9e-8]);

    let verdict = validate(&data, &consistency_rules());
    assert_eq!(verdict.failures.len(), 1);
    assert_eq!(verdict.failures[0].rule_index, 0);

    let verdict = audit(&data, &consistency_rules());
    let indices: Vec<_> = verdict.failures.iter().map(|f| f.rule_index).collect();
    assert_eq!(indices, vec![0, 2]);
}

#[test]
fn test_serial_and_one_process_rows_from_report_text() {
    // Report text as written by the solver: header comment, then one row per run.
    let text = "\
# Nx1 Nx2 Nx3 Ncycle RMS-L1-Error
64 32 32 120 5.123456789012345e-08
64 32 32 120 4.2e-08
64 32 32 120 5.123456789012345e-08
";
    let parsed = ArtifactReader::new().parse(text).unwrap();
    assert_eq!(parsed.len(), 3);

    let verdict = validate(&parsed, &consistency_rules());
    assert!(verdict.passed(), "{:?}", verdict.message());
}

#[test]
fn test_nan_in_report_is_rejected_before_validation() {
    let text = "64 32 32 120 NaN\n";
    let err = ArtifactReader::new().parse(text).unwrap_err();
    assert!(matches!(err, ReportError::NanValue { line: 1, .. }));

    // With NaN allowed the ceiling check still fails.
    let parsed = ArtifactReader::new().allow_nan().parse(text).unwrap();
    let rules = RuleSet::new(4).with_rule(ToleranceRule::absolute(0, 1e-7, "error too large"));
    assert!(!validate(&parsed, &rules).passed());
}

#[test]
fn test_missing_row_is_a_failure() {
    let verdict = validate(&rows(&[8e-8, 9e-8]), &consistency_rules());
    assert!(!verdict.passed());
    assert!(verdict.message().unwrap().contains("row 2 not present"));
}

#[test]
fn test_jeans_rules_against_mpi_drift() {
    let rules = jeans_3d().analysis.unwrap().rules;
    let mut errors = vec![5e-8, 4e-8, 5e-8, 5e-8, 5e-8, 4e-8, 4e-8, 4e-8];
    assert!(validate(&rows(&errors), &rules).passed());

    errors[7] = 4e-8 + 6e-4;
    let verdict = validate(&rows(&errors), &rules);
    assert_eq!(
        verdict.failures[0].rule_index, 7,
        "{:?}",
        verdict.message()
    );
    assert!(verdict
        .message()
        .unwrap()
        .starts_with("Linear wave error between 4 and 1 cores too large for FFT gravity"));
}
