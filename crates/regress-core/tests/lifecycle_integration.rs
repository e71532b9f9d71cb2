//! Integration tests for the lifecycle driver with in-memory launcher and store.

use std::path::PathBuf;
use std::sync::Arc;

use regress_core::catalog::jeans_3d;
use regress_core::fakes::{MemoryArtifactStore, RecordingLauncher, StoreOp};
use regress_core::plan::{CatalogueSource, ExplicitBuild};
use regress_core::{
    ArtifactStore, BuildMode, BuildVariant, CapabilityFlag, ClassRule, Classifier, HarnessError, LaunchContext,
    LifecycleDriver, Matcher, Parallelism, Precision, PreparePlan, RunRequest, TestCase,
};

const REPORT: &str = "jeans-errors.dat";

fn context(dir: &tempfile::TempDir) -> LaunchContext {
    let mut ctx = LaunchContext::new(dir.path());
    ctx.output_root = dir.path().to_path_buf();
    ctx
}

fn driver(
    ctx: LaunchContext,
    launcher: &Arc<RecordingLauncher>,
    store: &Arc<MemoryArtifactStore>,
) -> LifecycleDriver {
    LifecycleDriver::new(ctx, launcher.clone(), store.clone())
}

/// Eight report rows for the Jeans case; column 4 carries the error.
fn jeans_rows(errors: [f64; 8]) -> Vec<Vec<f64>> {
    errors
        .iter()
        .map(|e| vec![64.0, 32.0, 32.0, 1.0, *e])
        .collect()
}

fn consistent_errors() -> [f64; 8] {
    [
        5.0e-8, // mg serial
        4.0e-8, // fft serial
        5.0e-8, // mpi_mg np=1
        5.1e-8, // mpi_mg np=2
        5.2e-8, // mpi_mg np=4
        4.0e-8, // mpi_fft np=1
        4.1e-8, // mpi_fft np=2
        4.2e-8, // mpi_fft np=4
    ]
}

/// Test: consistent Jeans errors pass and trees move in the expected order
#[tokio::test]
async fn test_jeans_flow_passes() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(
        RecordingLauncher::new()
            .with_report(REPORT, jeans_rows(consistent_errors()))
            .with_coverage(),
    );
    let store = Arc::new(MemoryArtifactStore::new());

    let outcome = driver(context(&dir), &launcher, &store)
        .execute(&jeans_3d())
        .await
        .expect("case aborted");

    assert!(outcome.passed, "unexpected failure: {:?}", outcome.message);
    assert_eq!(outcome.builds.len(), 4);
    assert_eq!(outcome.clean_builds(), 4);
    assert_eq!(outcome.runs.len(), 8);
    assert!(!outcome.plan_digest.is_empty());

    assert_eq!(
        store.ops(),
        vec![
            StoreOp::Save("mpi_fft".into()),
            StoreOp::Save("mpi_mg".into()),
            StoreOp::Save("fft".into()),
            StoreOp::Restore("fft".into()),
            StoreOp::Restore("mpi_mg".into()),
            StoreOp::Restore("mpi_fft".into()),
        ]
    );

    // The serial mg binary is the last build and is used without a restore.
    assert!(!outcome.runs[0].restored);
    assert!(outcome.runs[1].restored);
    assert!(!outcome.runs[3].restored);

    let parallelism: Vec<_> = launcher.runs().iter().map(|r| r.parallelism).collect();
    assert_eq!(
        parallelism,
        vec![
            Parallelism::Serial,
            Parallelism::Serial,
            Parallelism::Distributed(1),
            Parallelism::Distributed(2),
            Parallelism::Distributed(4),
            Parallelism::Distributed(1),
            Parallelism::Distributed(2),
            Parallelism::Distributed(4),
        ]
    );
}

/// Test: each coverage tag is recorded once, qualified by the case name
#[tokio::test]
async fn test_jeans_coverage_tags() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(
        RecordingLauncher::new()
            .with_report(REPORT, jeans_rows(consistent_errors()))
            .with_coverage(),
    );
    let store = Arc::new(MemoryArtifactStore::new());

    let outcome = driver(context(&dir), &launcher, &store)
        .execute(&jeans_3d())
        .await
        .unwrap();

    // Exempt case: no case-wide capture after RUN.
    assert!(outcome.coverage_exempt);
    assert_eq!(
        launcher.coverage_tags(),
        vec![
            "jeans_3d_mg",
            "jeans_3d_fft",
            "jeans_3d_mpi_mg",
            "jeans_3d_mpi_fft"
        ]
    );
    let recorded = outcome.runs.iter().filter(|r| r.coverage_recorded).count();
    assert_eq!(recorded, 4);
}

/// Test: serial and one-process MG errors differing by one ulp fail the case
#[tokio::test]
async fn test_jeans_flow_detects_serial_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let mut errors = consistent_errors();
    errors[2] = f64::from_bits(errors[0].to_bits() + 1);
    let launcher = Arc::new(RecordingLauncher::new().with_report(REPORT, jeans_rows(errors)));
    let store = Arc::new(MemoryArtifactStore::new());

    let outcome = driver(context(&dir), &launcher, &store)
        .execute(&jeans_3d())
        .await
        .unwrap();

    assert!(!outcome.passed);
    assert_eq!(outcome.failures.len(), 1);
    assert!(outcome
        .message
        .unwrap()
        .starts_with("Linear wave error with one core w/wo MPI not identical for MG gravity"));
}

/// Test: a stale report from an earlier session does not leak into ANALYZE
#[tokio::test]
async fn test_stale_report_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(REPORT), "1 1 1 1 9.0\n2 2 2 2 9.0\n").unwrap();
    let launcher = Arc::new(
        RecordingLauncher::new().with_report(REPORT, jeans_rows(consistent_errors())),
    );
    let store = Arc::new(MemoryArtifactStore::new());

    let outcome = driver(context(&dir), &launcher, &store)
        .execute(&jeans_3d())
        .await
        .unwrap();
    assert!(outcome.passed, "unexpected failure: {:?}", outcome.message);
}

/// Test: a short report fails the row-count check before any rule runs
#[tokio::test]
async fn test_short_report_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut rows = jeans_rows(consistent_errors());
    rows.pop();
    let launcher = Arc::new(RecordingLauncher::new().with_report(REPORT, rows));
    let store = Arc::new(MemoryArtifactStore::new());

    let outcome = driver(context(&dir), &launcher, &store)
        .execute(&jeans_3d())
        .await
        .unwrap();
    assert!(!outcome.passed);
    assert!(outcome.message.unwrap().contains("has 7 rows, expected 8"));
}

/// Test: a build failure aborts PREPARE and nothing runs
#[tokio::test]
async fn test_build_failure_aborts_case() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(RecordingLauncher::new().failing_build("mpi_mg"));
    let store = Arc::new(MemoryArtifactStore::new());

    let err = driver(context(&dir), &launcher, &store)
        .execute(&jeans_3d())
        .await
        .unwrap_err();

    match err {
        HarnessError::BuildFailure {
            variant, exit_code, ..
        } => {
            assert_eq!(variant, "mpi_mg");
            assert_eq!(exit_code, Some(2));
        }
        other => panic!("expected BuildFailure, got {other:?}"),
    }
    assert_eq!(launcher.builds().len(), 2);
    assert!(launcher.runs().is_empty());
    // The tree preserved before the failure does not outlive the case.
    assert_eq!(
        store.ops(),
        vec![
            StoreOp::Save("mpi_fft".into()),
            StoreOp::Discard("mpi_fft".into())
        ]
    );
    assert!(!store.contains("mpi_fft").unwrap());
}

/// Test: a run failure aborts RUN and the report is never analyzed
#[tokio::test]
async fn test_run_failure_aborts_case() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(
        RecordingLauncher::new()
            .with_report(REPORT, jeans_rows(consistent_errors()))
            .failing_run(3),
    );
    let store = Arc::new(MemoryArtifactStore::new());

    let err = driver(context(&dir), &launcher, &store)
        .execute(&jeans_3d())
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::RunFailure { ref variant, .. } if variant == "mpi_mg"));
    assert_eq!(launcher.runs().len(), 4);
    let report = std::fs::read_to_string(dir.path().join(REPORT)).unwrap();
    assert_eq!(report.lines().count(), 3);

    // fft and mpi_mg were restored before the failure; mpi_fft never was.
    assert_eq!(store.ops().last(), Some(&StoreOp::Discard("mpi_fft".into())));
    for tag in ["mpi_fft", "mpi_mg", "fft"] {
        assert!(!store.contains(tag).unwrap(), "{tag} still preserved");
    }
}

/// Test: a tree left under a preserved tag by an aborted session is dropped before PREPARE
#[tokio::test]
async fn test_leftover_preserved_tree_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(
        RecordingLauncher::new().with_report(REPORT, jeans_rows(consistent_errors())),
    );
    let store = Arc::new(MemoryArtifactStore::new());
    store.save("fft").unwrap();

    let outcome = driver(context(&dir), &launcher, &store)
        .execute(&jeans_3d())
        .await
        .expect("case aborted");

    assert!(outcome.passed, "unexpected failure: {:?}", outcome.message);
    assert_eq!(
        &store.ops()[..3],
        &[
            StoreOp::Save("fft".into()),
            StoreOp::Discard("fft".into()),
            StoreOp::Save("mpi_fft".into()),
        ]
    );
}

/// Test: an unsatisfiable plan is rejected before the first build
#[tokio::test]
async fn test_configuration_error_before_any_build() {
    let dir = tempfile::tempdir().unwrap();
    let case = TestCase {
        name: "broken".to_string(),
        description: String::new(),
        prepare: PreparePlan::Explicit {
            variants: vec![ExplicitBuild {
                variant: BuildVariant::new("mg", "jeans"),
                preserve: false,
            }],
            exclude: vec![],
        },
        runs: vec![RunRequest {
            variant: "fft".to_string(),
            input: PathBuf::from("hydro/athinput.jeans_3d"),
            args: vec![],
            parallelism: Parallelism::Serial,
            coverage_tag: None,
        }],
        coverage_exempt: false,
        analysis: None,
    };
    let launcher = Arc::new(RecordingLauncher::new());
    let store = Arc::new(MemoryArtifactStore::new());

    let err = driver(context(&dir), &launcher, &store)
        .execute(&case)
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::Configuration(_)));
    assert!(launcher.invocations().is_empty());
    assert!(store.ops().is_empty());
}

/// Test: three groups in two precisions give six clean builds, the rest object-only
#[tokio::test]
async fn test_compile_sweep_build_discipline() {
    let dir = tempfile::tempdir().unwrap();
    let case = TestCase {
        name: "compile_sweep".to_string(),
        description: String::new(),
        prepare: PreparePlan::Sweep {
            catalogue: CatalogueSource::Literal {
                ids: ["gr_bondi", "gr_torus", "rotor", "cpaw", "blast", "sod", "kh"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            classifier: Classifier::default()
                .with_rule(ClassRule::new(
                    "gr",
                    Matcher::Prefix {
                        prefix: "gr_".to_string(),
                    },
                    vec![CapabilityFlag::switch("g")],
                ))
                .with_rule(ClassRule::new(
                    "mhd",
                    Matcher::Members {
                        members: ["rotor", "cpaw"].iter().map(|s| s.to_string()).collect(),
                    },
                    vec![CapabilityFlag::switch("b")],
                ))
                .with_rule(ClassRule::new("hydro", Matcher::Any, vec![])),
            exclude: vec![],
            shared_flags: vec![CapabilityFlag::switch("f")],
            precisions: vec![Precision::Single, Precision::Double],
        },
        runs: vec![],
        coverage_exempt: false,
        analysis: None,
    };
    let launcher = Arc::new(RecordingLauncher::new().with_coverage());
    let store = Arc::new(MemoryArtifactStore::new());

    let outcome = driver(context(&dir), &launcher, &store)
        .execute(&case)
        .await
        .unwrap();

    assert!(outcome.passed);
    let builds = launcher.builds();
    assert_eq!(builds.len(), 14);
    assert_eq!(builds.iter().filter(|(_, _, o)| o.clean_first).count(), 6);
    assert_eq!(builds.iter().filter(|(_, _, o)| o.obj_only).count(), 8);
    assert_eq!(outcome.clean_builds(), 6);
    assert_eq!(outcome.object_only_builds(), 8);

    // Every object-only build shares its tree's flags with the clean build before it.
    let mut tree = None;
    for (_, fingerprint, options) in &builds {
        if options.clean_first {
            tree = Some(fingerprint.clone());
        } else {
            assert_eq!(tree.as_ref(), Some(fingerprint));
        }
    }

    // Build-only, not exempt: one case-wide coverage capture.
    assert_eq!(launcher.coverage_tags(), vec!["compile_sweep"]);
    assert!(store.ops().is_empty());
    let modes: Vec<_> = outcome.builds.iter().map(|b| b.mode).collect();
    assert_eq!(modes[0], BuildMode::Clean);
    assert_eq!(modes.len(), 14);
}
