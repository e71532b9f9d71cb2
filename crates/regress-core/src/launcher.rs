//! External process invocation: solver builds, solver runs, coverage capture.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::variant::{BuildVariant, CapabilityFlag};

/// Placeholder replaced by the process count in [`LaunchContext::parallel_cmd`].
pub const NPROC_PLACEHOLDER: &str = "{np}";

/// Placeholder replaced by the coverage tag in [`LaunchContext::coverage_cmd`].
pub const TAG_PLACEHOLDER: &str = "{tag}";

/// Everything a launch needs to know about the environment.
///
/// Passed explicitly to every launcher call instead of relying on the
/// process working directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchContext {
    /// Solver source tree; configure and make run here.
    pub build_root: PathBuf,

    /// Root that input deck paths are relative to.
    pub input_root: PathBuf,

    /// Working directory for runs; report artifacts land here.
    pub output_root: PathBuf,

    /// Executable name under `<build_root>/bin`.
    pub executable: String,

    /// Configure command, variant flags are appended.
    pub configure_cmd: Vec<String>,

    /// Make command; `clean` or `objs` is appended as needed.
    pub make_cmd: Vec<String>,

    /// Parallel launch prefix containing [`NPROC_PLACEHOLDER`].
    pub parallel_cmd: Vec<String>,

    /// Extra options inserted after the parallel launch prefix.
    #[serde(default)]
    pub parallel_opts: Vec<String>,

    /// Coverage capture command containing [`TAG_PLACEHOLDER`].
    #[serde(default)]
    pub coverage_cmd: Option<Vec<String>>,

    /// Per-process timeout in seconds (0 = none).
    #[serde(default)]
    pub timeout_secs: u64,
}

impl LaunchContext {
    /// Context rooted at `build_root` with conventional sub-paths and commands.
    pub fn new(build_root: impl Into<PathBuf>) -> Self {
        let build_root = build_root.into();
        Self {
            input_root: build_root.join("inputs"),
            output_root: build_root.join("bin"),
            build_root,
            executable: "athena".to_string(),
            configure_cmd: vec!["python".to_string(), "configure.py".to_string()],
            make_cmd: vec!["make".to_string(), "-j8".to_string()],
            parallel_cmd: vec![
                "mpirun".to_string(),
                "-np".to_string(),
                NPROC_PLACEHOLDER.to_string(),
            ],
            parallel_opts: Vec::new(),
            coverage_cmd: None,
            timeout_secs: 0,
        }
    }

    /// Make every root absolute against the current directory.
    pub fn absolutize(mut self) -> std::io::Result<Self> {
        let cwd = std::env::current_dir()?;
        for root in [
            &mut self.build_root,
            &mut self.input_root,
            &mut self.output_root,
        ] {
            if root.is_relative() {
                *root = cwd.join(&*root);
            }
        }
        Ok(self)
    }

    /// Path of the active executable.
    pub fn executable_path(&self) -> PathBuf {
        self.build_root.join("bin").join(&self.executable)
    }
}

impl Default for LaunchContext {
    fn default() -> Self {
        Self::new(".")
    }
}

/// Serial or N-process execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parallelism {
    Serial,
    Distributed(u32),
}

impl Parallelism {
    pub fn processes(&self) -> Option<u32> {
        match self {
            Parallelism::Serial => None,
            Parallelism::Distributed(n) => Some(*n),
        }
    }
}

impl std::fmt::Display for Parallelism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Parallelism::Serial => f.write_str("serial"),
            Parallelism::Distributed(n) => write!(f, "np={}", n),
        }
    }
}

/// How a build treats the existing object tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Run `make clean` first.
    pub clean_first: bool,

    /// Compile objects only, do not link an executable.
    pub obj_only: bool,

    /// Flags appended after the variant's own.
    #[serde(default)]
    pub extra_flags: Vec<CapabilityFlag>,
}

impl BuildOptions {
    /// Clean, fully linked build.
    pub fn clean() -> Self {
        Self {
            clean_first: true,
            obj_only: false,
            extra_flags: Vec::new(),
        }
    }

    /// Object-only build reusing the current tree.
    pub fn object_only() -> Self {
        Self {
            clean_first: false,
            obj_only: true,
            extra_flags: Vec::new(),
        }
    }

    pub fn with_extra_flag(mut self, flag: CapabilityFlag) -> Self {
        self.extra_flags.push(flag);
        self
    }
}

/// One solver invocation against an input deck.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Tag of the variant whose binary must be active.
    pub variant: String,

    /// Input deck, relative to [`LaunchContext::input_root`].
    pub input: PathBuf,

    /// `section/key=value` overrides, in order.
    #[serde(default)]
    pub args: Vec<String>,

    pub parallelism: Parallelism,

    /// Coverage tag recorded after this run.
    #[serde(default)]
    pub coverage_tag: Option<String>,
}

/// Captured result of a single external command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub step: String,
    pub command: Vec<String>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub success: bool,
}

impl StepOutput {
    /// Whether this step passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }
}

/// Result of a successful build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub variant: String,
    pub options: BuildOptions,
    pub steps: Vec<StepOutput>,
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub variant: String,
    pub parallelism: Parallelism,
    pub output: StepOutput,
    /// Whether a coverage capture followed the run.
    pub coverage_recorded: bool,
}

/// Seam between the lifecycle driver and the outside world.
///
/// Non-zero exit statuses surface as [`HarnessError::BuildFailure`] or
/// [`HarnessError::RunFailure`]; launchers never retry.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Configure and compile `variant`.
    async fn build(
        &self,
        ctx: &LaunchContext,
        variant: &BuildVariant,
        options: &BuildOptions,
    ) -> Result<BuildResult>;

    /// Run the active executable.
    async fn run(&self, ctx: &LaunchContext, request: &RunRequest) -> Result<RunResult>;

    /// Record coverage under `tag`. Returns false when coverage is not configured.
    async fn capture_coverage(&self, ctx: &LaunchContext, tag: &str) -> Result<bool>;
}

/// Builds the configure command line for a variant.
pub fn configure_command(
    ctx: &LaunchContext,
    variant: &BuildVariant,
    options: &BuildOptions,
) -> Vec<String> {
    let mut cmd = ctx.configure_cmd.clone();
    cmd.extend(variant.configure_args());
    cmd.extend(options.extra_flags.iter().map(CapabilityFlag::to_arg));
    cmd
}

/// Builds the full run command line, parallel wrapper included.
pub fn run_command(ctx: &LaunchContext, request: &RunRequest) -> Vec<String> {
    let mut cmd = Vec::new();
    if let Some(np) = request.parallelism.processes() {
        cmd.extend(
            ctx.parallel_cmd
                .iter()
                .map(|part| part.replace(NPROC_PLACEHOLDER, &np.to_string())),
        );
        cmd.extend(ctx.parallel_opts.iter().cloned());
    }
    cmd.push(ctx.executable_path().to_string_lossy().into_owned());
    cmd.push("-i".to_string());
    cmd.push(ctx.input_root.join(&request.input).to_string_lossy().into_owned());
    cmd.extend(request.args.iter().cloned());
    cmd
}

/// Launcher that spawns real processes with `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }

    /// Execute a command to completion, honouring the context timeout.
    ///
    /// `Err` means the process could not be spawned or timed out; a non-zero
    /// exit is reported through [`StepOutput::success`].
    pub async fn execute(
        step: &str,
        command: &[String],
        cwd: &Path,
        timeout_secs: u64,
    ) -> std::result::Result<StepOutput, String> {
        let start = Instant::now();

        if command.is_empty() {
            return Err(format!("step {} has empty command", step));
        }

        let exe = &command[0];
        let args = &command[1..];
        debug!(step = %step, command = ?command, cwd = %cwd.display(), "Spawning");

        let child = Command::new(exe)
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn '{}': {}", exe, e))?;

        let waited = if timeout_secs > 0 {
            tokio::time::timeout(
                std::time::Duration::from_secs(timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| format!("{} timed out after {} seconds", step, timeout_secs))?
        } else {
            child.wait_with_output().await
        };
        let output = waited.map_err(|e| format!("failed waiting for '{}': {}", exe, e))?;

        Ok(StepOutput {
            step: step.to_string(),
            command: command.to_vec(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: output.status.success(),
        })
    }

    async fn build_step(
        ctx: &LaunchContext,
        variant: &BuildVariant,
        step: &str,
        command: Vec<String>,
    ) -> Result<StepOutput> {
        let output = Self::execute(step, &command, &ctx.build_root, ctx.timeout_secs)
            .await
            .map_err(|reason| HarnessError::BuildFailure {
                variant: variant.tag().to_string(),
                step: step.to_string(),
                exit_code: None,
                reason,
            })?;

        if !output.passed() {
            return Err(HarnessError::BuildFailure {
                variant: variant.tag().to_string(),
                step: step.to_string(),
                exit_code: Some(output.exit_code),
                reason: format!(
                    "exited with code {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn build(
        &self,
        ctx: &LaunchContext,
        variant: &BuildVariant,
        options: &BuildOptions,
    ) -> Result<BuildResult> {
        let mut steps = Vec::new();

        let configure = configure_command(ctx, variant, options);
        steps.push(Self::build_step(ctx, variant, "configure", configure).await?);

        if options.clean_first {
            let mut clean = ctx.make_cmd.clone();
            clean.push("clean".to_string());
            steps.push(Self::build_step(ctx, variant, "clean", clean).await?);
        }

        let mut make = ctx.make_cmd.clone();
        if options.obj_only {
            make.push("objs".to_string());
        }
        steps.push(Self::build_step(ctx, variant, "make", make).await?);

        Ok(BuildResult {
            variant: variant.tag().to_string(),
            options: options.clone(),
            steps,
        })
    }

    async fn run(&self, ctx: &LaunchContext, request: &RunRequest) -> Result<RunResult> {
        let command = run_command(ctx, request);
        let output = Self::execute("run", &command, &ctx.output_root, ctx.timeout_secs)
            .await
            .map_err(|reason| HarnessError::RunFailure {
                variant: request.variant.clone(),
                exit_code: None,
                reason,
            })?;

        if !output.passed() {
            return Err(HarnessError::RunFailure {
                variant: request.variant.clone(),
                exit_code: Some(output.exit_code),
                reason: format!(
                    "{} exited with code {}: {}",
                    request.parallelism,
                    output.exit_code,
                    output.stderr.trim()
                ),
            });
        }

        let coverage_recorded = match &request.coverage_tag {
            Some(tag) => self.capture_coverage(ctx, tag).await?,
            None => false,
        };

        Ok(RunResult {
            variant: request.variant.clone(),
            parallelism: request.parallelism,
            output,
            coverage_recorded,
        })
    }

    async fn capture_coverage(&self, ctx: &LaunchContext, tag: &str) -> Result<bool> {
        let Some(template) = &ctx.coverage_cmd else {
            return Ok(false);
        };
        let command: Vec<String> = template
            .iter()
            .map(|part| part.replace(TAG_PLACEHOLDER, tag))
            .collect();

        let output = Self::execute("coverage", &command, &ctx.build_root, ctx.timeout_secs)
            .await
            .map_err(|reason| HarnessError::RunFailure {
                variant: tag.to_string(),
                exit_code: None,
                reason,
            })?;
        if !output.passed() {
            return Err(HarnessError::RunFailure {
                variant: tag.to_string(),
                exit_code: Some(output.exit_code),
                reason: format!("coverage capture exited with code {}", output.exit_code),
            });
        }
        Ok(true)
    }
}
