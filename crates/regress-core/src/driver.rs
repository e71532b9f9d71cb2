//! Test-case lifecycle: PREPARE → RUN → ANALYZE.
//!
//! The driver owns the single active build tree. It tracks which group the
//! tree was compiled for and which variant's binary is linked in it, so the
//! "one clean build per group, object-only for the rest" discipline is
//! checked on its own state rather than inferred from the filesystem.
//! Preserving and restoring trees between variants goes through the
//! [`ArtifactStore`]; nothing else renames build artifacts. Saved trees do
//! not outlive the case: stale ones are discarded before PREPARE and any
//! still outstanding are discarded when the case completes or aborts.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::error::{HarnessError, Result};
use crate::launcher::{LaunchContext, Launcher, Parallelism, ProcessLauncher, RunRequest};
use crate::obs;
use crate::plan::{Analysis, BuildStep, ResolvedPlan, TestCase};
use crate::report::ArtifactReader;
use crate::store::{ArtifactStore, FsArtifactStore};
use crate::validator::{audit, validate, RuleFailure, Verdict};

/// Lifecycle phase of a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Prepare,
    Run,
    Analyze,
    Done,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Prepare => "prepare",
            Phase::Run => "run",
            Phase::Analyze => "analyze",
            Phase::Done => "done",
        }
    }

    fn next(&self) -> Option<Phase> {
        match self {
            Phase::Pending => Some(Phase::Prepare),
            Phase::Prepare => Some(Phase::Run),
            Phase::Run => Some(Phase::Analyze),
            Phase::Analyze => Some(Phase::Done),
            Phase::Done => None,
        }
    }
}

/// How a build used the active tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    /// Fresh tree, linked executable.
    Clean,
    /// Reused tree, objects only.
    ObjectOnly,
}

impl BuildMode {
    pub fn name(&self) -> &'static str {
        match self {
            BuildMode::Clean => "clean",
            BuildMode::ObjectOnly => "object_only",
        }
    }
}

/// A completed build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildRecord {
    pub variant: String,
    pub group: String,
    pub mode: BuildMode,
    pub preserved: bool,
    pub duration_ms: u64,
}

/// A completed run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub variant: String,
    pub parallelism: Parallelism,
    /// Whether the variant's tree had to be restored before this run.
    pub restored: bool,
    pub coverage_recorded: bool,
    pub duration_ms: u64,
}

/// The tree currently in the active build location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTree {
    /// Group the object tree was compiled for.
    pub group: String,
    /// Variant whose executable is linked, if any.
    pub linked: Option<String>,
}

/// Result of one test case that ran to ANALYZE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseOutcome {
    pub case: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub plan_digest: String,
    pub passed: bool,
    /// First failure's diagnostic, when failed.
    pub message: Option<String>,
    pub failures: Vec<RuleFailure>,
    pub builds: Vec<BuildRecord>,
    pub runs: Vec<RunRecord>,
    /// RUN tagged coverage itself; no case-wide capture was taken.
    pub coverage_exempt: bool,
    pub duration_ms: u64,
}

impl CaseOutcome {
    pub fn clean_builds(&self) -> usize {
        self.count_builds(BuildMode::Clean)
    }

    pub fn object_only_builds(&self) -> usize {
        self.count_builds(BuildMode::ObjectOnly)
    }

    fn count_builds(&self, mode: BuildMode) -> usize {
        self.builds.iter().filter(|b| b.mode == mode).count()
    }
}

/// Mutable per-case state, discarded when the case completes.
#[derive(Debug)]
struct CaseState {
    phase: Phase,
    active: Option<ActiveTree>,
    /// variant tag -> group, for trees coming back from the store
    groups: HashMap<String, String>,
    /// Tags saved by this case and not yet restored.
    saved: BTreeSet<String>,
    builds: Vec<BuildRecord>,
    runs: Vec<RunRecord>,
}

impl CaseState {
    fn new() -> Self {
        Self {
            phase: Phase::Pending,
            active: None,
            groups: HashMap::new(),
            saved: BTreeSet::new(),
            builds: Vec::new(),
            runs: Vec::new(),
        }
    }

    fn advance(&mut self, case: &str, to: Phase) -> Result<()> {
        if self.phase.next() != Some(to) {
            return Err(HarnessError::config(format!(
                "case '{}': cannot enter {} from {}",
                case,
                to.name(),
                self.phase.name()
            )));
        }
        self.phase = to;
        obs::emit_phase_entered(case, to.name());
        Ok(())
    }

    fn linked(&self) -> Option<&str> {
        self.active.as_ref().and_then(|t| t.linked.as_deref())
    }
}

/// Drives test cases through their lifecycle, one at a time.
pub struct LifecycleDriver {
    ctx: LaunchContext,
    launcher: Arc<dyn Launcher>,
    store: Arc<dyn ArtifactStore>,
}

impl LifecycleDriver {
    pub fn new(
        ctx: LaunchContext,
        launcher: Arc<dyn Launcher>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            ctx,
            launcher,
            store,
        }
    }

    /// Driver spawning real processes and renaming trees inside the build root.
    pub fn with_processes(ctx: LaunchContext) -> Self {
        let store = FsArtifactStore::new(&ctx.build_root, ctx.executable.clone());
        Self::new(ctx, Arc::new(ProcessLauncher::new()), Arc::new(store))
    }

    pub fn context(&self) -> &LaunchContext {
        &self.ctx
    }

    /// Execute one test case.
    ///
    /// `Err` means the case was aborted: a bad plan (before any build), a
    /// build or run failure, or an unreadable report. A violated tolerance
    /// rule is an `Ok` outcome with `passed == false`.
    pub async fn execute(&self, case: &TestCase) -> Result<CaseOutcome> {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::case_span(&case.name, &run_id);
        self.execute_with_id(case, run_id).instrument(span).await
    }

    async fn execute_with_id(&self, case: &TestCase, run_id: String) -> Result<CaseOutcome> {
        let start = Instant::now();
        let started_at = Utc::now();

        let plan = case.resolve(&self.ctx)?;
        obs::emit_case_started(&case.name, plan.builds.len(), plan.runs.len(), &plan.digest);

        let mut state = CaseState::new();
        let driven = self.drive(case, &plan, &mut state).await;
        self.discard_outstanding(&mut state);
        let verdict = match driven {
            Ok(verdict) => verdict,
            Err(e) => {
                obs::emit_case_aborted(&case.name, state.phase.name(), &e);
                return Err(e);
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let passed = verdict.passed();
        obs::emit_case_finished(&case.name, passed, duration_ms);

        Ok(CaseOutcome {
            case: case.name.clone(),
            run_id,
            started_at,
            plan_digest: plan.digest,
            passed,
            message: verdict.message().map(str::to_string),
            failures: verdict.failures,
            builds: state.builds,
            runs: state.runs,
            coverage_exempt: case.coverage_exempt,
            duration_ms,
        })
    }

    async fn drive(
        &self,
        case: &TestCase,
        plan: &ResolvedPlan,
        state: &mut CaseState,
    ) -> Result<Verdict> {
        state.advance(&case.name, Phase::Prepare)?;
        self.discard_stale(plan)?;
        for step in &plan.builds {
            self.build(step, state).await?;
        }

        state.advance(&case.name, Phase::Run)?;
        if let Some(analysis) = &case.analysis {
            self.reset_report(analysis).await?;
        }
        for request in &plan.runs {
            self.run(&case.name, request, state).await?;
        }
        if !case.coverage_exempt && self.launcher.capture_coverage(&self.ctx, &case.name).await? {
            debug!(case = %case.name, "Captured case-wide coverage");
        }

        state.advance(&case.name, Phase::Analyze)?;
        let verdict = match &case.analysis {
            Some(analysis) => self.analyze(analysis)?,
            None => Verdict::pass(),
        };

        state.advance(&case.name, Phase::Done)?;
        Ok(verdict)
    }

    async fn build(&self, step: &BuildStep, state: &mut CaseState) -> Result<()> {
        let tag = step.variant.tag();
        let same_tree = state
            .active
            .as_ref()
            .map(|t| t.group == step.group)
            .unwrap_or(false);

        let mode = match (step.options.clean_first, step.options.obj_only) {
            (true, _) => BuildMode::Clean,
            (false, true) if same_tree => BuildMode::ObjectOnly,
            (false, true) => {
                return Err(HarnessError::config(format!(
                    "build of '{}' reuses an object tree but none is active for group '{}'",
                    tag, step.group
                )))
            }
            (false, false) => {
                return Err(HarnessError::config(format!(
                    "build of '{}' must either start clean or compile objects only",
                    tag
                )))
            }
        };

        info!(variant = %tag, group = %step.group, mode = mode.name(), "Building variant");
        let start = Instant::now();
        self.launcher
            .build(&self.ctx, &step.variant, &step.options)
            .await?;
        let duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_build_finished(tag, &step.group, mode.name(), duration_ms);

        state.active = Some(ActiveTree {
            group: step.group.clone(),
            linked: (!step.options.obj_only).then(|| tag.to_string()),
        });
        state.groups.insert(tag.to_string(), step.group.clone());

        if step.preserve {
            self.store.save(tag)?;
            state.saved.insert(tag.to_string());
            state.active = None;
            debug!(variant = %tag, "Preserved variant tree");
        }

        state.builds.push(BuildRecord {
            variant: tag.to_string(),
            group: step.group.clone(),
            mode,
            preserved: step.preserve,
            duration_ms,
        });
        Ok(())
    }

    async fn run(&self, case: &str, request: &RunRequest, state: &mut CaseState) -> Result<()> {
        let tag = request.variant.as_str();
        let restored = state.linked() != Some(tag);
        if restored {
            self.store.restore(tag)?;
            state.saved.remove(tag);
            let group = state.groups.get(tag).cloned().unwrap_or_else(|| tag.to_string());
            state.active = Some(ActiveTree {
                group,
                linked: Some(tag.to_string()),
            });
            debug!(variant = %tag, "Restored variant tree");
        }

        info!(variant = %tag, parallelism = %request.parallelism, "Running variant");
        let start = Instant::now();
        let result = self.launcher.run(&self.ctx, &qualify_coverage(case, request)).await?;
        let duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_run_finished(tag, request.parallelism, duration_ms, result.coverage_recorded);

        state.runs.push(RunRecord {
            variant: tag.to_string(),
            parallelism: request.parallelism,
            restored,
            coverage_recorded: result.coverage_recorded,
            duration_ms,
        });
        Ok(())
    }

    /// Drop trees an earlier, interrupted session left under this plan's tags.
    fn discard_stale(&self, plan: &ResolvedPlan) -> Result<()> {
        for step in plan.builds.iter().filter(|s| s.preserve) {
            let tag = step.variant.tag();
            if self.store.discard(tag)? {
                warn!(variant = %tag, "Discarded stale preserved tree");
            }
        }
        Ok(())
    }

    /// Discard trees saved by this case that no run restored. Failures are
    /// logged and never replace the case's own result.
    fn discard_outstanding(&self, state: &mut CaseState) {
        for tag in std::mem::take(&mut state.saved) {
            match self.store.discard(&tag) {
                Ok(_) => debug!(variant = %tag, "Discarded preserved tree"),
                Err(e) => warn!(variant = %tag, error = %e, "Failed to discard preserved tree"),
            }
        }
    }

    /// Remove a stale report so rows come only from this case's runs.
    async fn reset_report(&self, analysis: &Analysis) -> Result<()> {
        let path = self.ctx.output_root.join(&analysis.report);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(report = %path.display(), "Removed stale report");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn analyze(&self, analysis: &Analysis) -> Result<Verdict> {
        let path = self.ctx.output_root.join(&analysis.report);
        let reader = if analysis.allow_nan {
            ArtifactReader::new().allow_nan()
        } else {
            ArtifactReader::new()
        };
        let rows = reader.read(&path)?;
        debug!(report = %path.display(), rows = rows.len(), "Read report");

        if let Some(expected) = analysis.expected_rows {
            if rows.len() != expected {
                return Ok(Verdict::fail(format!(
                    "report {} has {} rows, expected {}",
                    analysis.report.display(),
                    rows.len(),
                    expected
                )));
            }
        }

        Ok(if analysis.audit {
            audit(&rows, &analysis.rules)
        } else {
            validate(&rows, &analysis.rules)
        })
    }
}

/// Per-run coverage is recorded as `<case>_<tag>`.
fn qualify_coverage(case: &str, request: &RunRequest) -> RunRequest {
    let mut request = request.clone();
    request.coverage_tag = request
        .coverage_tag
        .take()
        .map(|tag| format!("{}_{}", case, tag));
    request
}
