//! Regression harness for a configure-and-make numerical solver.
//!
//! Provides a test-case driver that:
//! - Builds solver variants from a configuration matrix
//! - Preserves and restores build trees between variants
//! - Runs the solver serially and under a parallel launcher
//! - Validates the error report against tolerance rules

pub mod catalog;
pub mod driver;
pub mod error;
pub mod fakes;
pub mod launcher;
pub mod matrix;
pub mod obs;
pub mod plan;
pub mod report;
pub mod store;
pub mod telemetry;
pub mod validator;
pub mod variant;

// Re-export key types
pub use catalog::{builtin_cases, find_case};
pub use driver::{BuildMode, CaseOutcome, LifecycleDriver, Phase};
pub use error::{HarnessError, Result};
pub use launcher::{
    BuildOptions, LaunchContext, Launcher, Parallelism, ProcessLauncher, RunRequest,
};
pub use matrix::{derive_groups, Catalogue, ClassRule, Classifier, Matcher};
pub use plan::{load_cases, parse_cases, Analysis, PreparePlan, ResolvedPlan, TestCase};
pub use report::{ArtifactReader, ErrorRow, ReportError};
pub use store::{ArtifactStore, FsArtifactStore, StoreError};
pub use telemetry::init_tracing;
pub use validator::{audit, validate, Comparator, RuleSet, ToleranceRule, Verdict};
pub use variant::{BuildVariant, CapabilityFlag, Precision, ProblemGroup};
