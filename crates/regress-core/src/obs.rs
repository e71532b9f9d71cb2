//! Structured lifecycle events for test-case execution.
//!
//! Every event is an `info!`/`warn!` line with an `event` field so that JSON
//! logs can be filtered per lifecycle stage.

use tracing::{info, warn};

use crate::launcher::Parallelism;

/// Span tagged with the case name and run id.
///
/// ```ignore
/// driver.execute_with_id(case, run_id).instrument(case_span("jeans_3d", &run_id)).await
/// // every log line inside carries case=jeans_3d
/// ```
pub fn case_span(case: &str, run_id: &str) -> tracing::Span {
    tracing::info_span!("regress.case", case = %case, run_id = %run_id)
}

pub fn emit_case_started(case: &str, builds: usize, runs: usize, digest: &str) {
    info!(
        event = "case.started",
        case = %case,
        builds = builds,
        runs = runs,
        plan_digest = %digest,
    );
}

pub fn emit_phase_entered(case: &str, phase: &str) {
    info!(event = "phase.entered", case = %case, phase = %phase);
}

/// A build finished; `mode` is `clean` or `object_only`.
pub fn emit_build_finished(tag: &str, group: &str, mode: &str, duration_ms: u64) {
    info!(
        event = "build.finished",
        variant = %tag,
        group = %group,
        mode = %mode,
        duration_ms = duration_ms,
    );
}

pub fn emit_run_finished(tag: &str, parallelism: Parallelism, duration_ms: u64, coverage: bool) {
    info!(
        event = "run.finished",
        variant = %tag,
        parallelism = %parallelism,
        duration_ms = duration_ms,
        coverage = coverage,
    );
}

pub fn emit_case_finished(case: &str, passed: bool, duration_ms: u64) {
    info!(
        event = "case.finished",
        case = %case,
        passed = passed,
        duration_ms = duration_ms,
    );
}

/// The case was aborted by an error in PREPARE or RUN (warning level).
pub fn emit_case_aborted(case: &str, phase: &str, error: &dyn std::fmt::Display) {
    warn!(event = "case.aborted", case = %case, phase = %phase, error = %error);
}
