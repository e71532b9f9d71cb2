//! In-memory fakes for the launcher and artifact store (testing only)
//!
//! `RecordingLauncher` records every invocation instead of spawning processes
//! and can append scripted report rows; `MemoryArtifactStore` keeps the set
//! of preserved tags in a map. Both satisfy the trait contracts without a
//! solver on disk.

use std::collections::{BTreeSet, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{HarnessError, Result};
use crate::launcher::{
    BuildOptions, BuildResult, LaunchContext, Launcher, RunRequest, RunResult, StepOutput,
};
use crate::store::{ArtifactStore, StoreError, StoreResult};
use crate::variant::BuildVariant;

// ---------------------------------------------------------------------------
// RecordingLauncher
// ---------------------------------------------------------------------------

/// One recorded launcher call.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Build {
        tag: String,
        fingerprint: String,
        options: BuildOptions,
    },
    Run(RunRequest),
    Coverage(String),
}

#[derive(Debug, Default)]
struct Script {
    report: Option<PathBuf>,
    rows: VecDeque<String>,
}

/// Launcher double that records calls and never spawns a process.
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    calls: Mutex<Vec<Invocation>>,
    script: Mutex<Script>,
    fail_build: Option<String>,
    fail_run: Option<usize>,
    coverage: bool,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one scripted row to `report` (relative to the output root) per run.
    pub fn with_report(self, report: impl Into<PathBuf>, rows: Vec<Vec<f64>>) -> Self {
        {
            let mut script = self.script.lock().unwrap();
            script.report = Some(report.into());
            script.rows = rows
                .into_iter()
                .map(|row| {
                    row.iter()
                        .map(|v| format!("{:e}", v))
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect();
        }
        self
    }

    /// Fail the build of the variant with this tag.
    pub fn failing_build(mut self, tag: impl Into<String>) -> Self {
        self.fail_build = Some(tag.into());
        self
    }

    /// Fail the run with this zero-based index.
    pub fn failing_run(mut self, index: usize) -> Self {
        self.fail_run = Some(index);
        self
    }

    /// Report coverage captures as recorded.
    pub fn with_coverage(mut self) -> Self {
        self.coverage = true;
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Build invocations as `(tag, fingerprint, options)`.
    pub fn builds(&self) -> Vec<(String, String, BuildOptions)> {
        self.invocations()
            .into_iter()
            .filter_map(|call| match call {
                Invocation::Build {
                    tag,
                    fingerprint,
                    options,
                } => Some((tag, fingerprint, options)),
                _ => None,
            })
            .collect()
    }

    pub fn runs(&self) -> Vec<RunRequest> {
        self.invocations()
            .into_iter()
            .filter_map(|call| match call {
                Invocation::Run(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn coverage_tags(&self) -> Vec<String> {
        self.invocations()
            .into_iter()
            .filter_map(|call| match call {
                Invocation::Coverage(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    fn passed(step: &str) -> StepOutput {
        StepOutput {
            step: step.to_string(),
            command: vec![],
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            success: true,
        }
    }
}

#[async_trait]
impl Launcher for RecordingLauncher {
    async fn build(
        &self,
        _ctx: &LaunchContext,
        variant: &BuildVariant,
        options: &BuildOptions,
    ) -> Result<BuildResult> {
        self.calls.lock().unwrap().push(Invocation::Build {
            tag: variant.tag().to_string(),
            fingerprint: variant.fingerprint(),
            options: options.clone(),
        });

        if self.fail_build.as_deref() == Some(variant.tag()) {
            return Err(HarnessError::BuildFailure {
                variant: variant.tag().to_string(),
                step: "make".to_string(),
                exit_code: Some(2),
                reason: "scripted build failure".to_string(),
            });
        }

        Ok(BuildResult {
            variant: variant.tag().to_string(),
            options: options.clone(),
            steps: vec![Self::passed("make")],
        })
    }

    async fn run(&self, ctx: &LaunchContext, request: &RunRequest) -> Result<RunResult> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Invocation::Run(request.clone()));
            calls
                .iter()
                .filter(|c| matches!(c, Invocation::Run(_)))
                .count()
                - 1
        };

        if self.fail_run == Some(index) {
            return Err(HarnessError::RunFailure {
                variant: request.variant.clone(),
                exit_code: Some(1),
                reason: "scripted run failure".to_string(),
            });
        }

        {
            let mut script = self.script.lock().unwrap();
            if let Some(report) = script.report.clone() {
                if let Some(row) = script.rows.pop_front() {
                    let path = ctx.output_root.join(report);
                    let mut file = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)?;
                    writeln!(file, "{}", row)?;
                }
            }
        }

        let coverage_recorded = match &request.coverage_tag {
            Some(tag) => self.capture_coverage(ctx, tag).await?,
            None => false,
        };

        Ok(RunResult {
            variant: request.variant.clone(),
            parallelism: request.parallelism,
            output: Self::passed("run"),
            coverage_recorded,
        })
    }

    async fn capture_coverage(&self, _ctx: &LaunchContext, tag: &str) -> Result<bool> {
        if !self.coverage {
            return Ok(false);
        }
        self.calls
            .lock()
            .unwrap()
            .push(Invocation::Coverage(tag.to_string()));
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

/// One recorded store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Save(String),
    Restore(String),
    /// Only logged when a saved tree was actually removed.
    Discard(String),
}

#[derive(Debug, Default)]
struct StoreState {
    saved: BTreeSet<String>,
    ops: Vec<StoreOp>,
}

/// In-memory artifact store backed by a set of preserved tags.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    state: Mutex<StoreState>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.state.lock().unwrap().ops.clone()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn save(&self, tag: &str) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        state.saved.insert(tag.to_string());
        state.ops.push(StoreOp::Save(tag.to_string()));
        Ok(())
    }

    fn restore(&self, tag: &str) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.saved.remove(tag) {
            return Err(StoreError::NotFound {
                tag: tag.to_string(),
            });
        }
        state.ops.push(StoreOp::Restore(tag.to_string()));
        Ok(())
    }

    fn contains(&self, tag: &str) -> StoreResult<bool> {
        Ok(self.state.lock().unwrap().saved.contains(tag))
    }

    fn discard(&self, tag: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().unwrap();
        let removed = state.saved.remove(tag);
        if removed {
            state.ops.push(StoreOp::Discard(tag.to_string()));
        }
        Ok(removed)
    }
}
