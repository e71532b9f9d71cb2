//! Solver regression harness CLI
//!
//! The `regress` command builds, runs and checks regression test cases
//! against a solver source tree.
//!
//! ## Commands
//!
//! - `list`: Show built-in and file-defined test cases
//! - `plan`: Print the resolved build/run steps of a case as JSON
//! - `run`: Execute one or more test cases

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, Level};

use regress_core::launcher::NPROC_PLACEHOLDER;
use regress_core::{
    builtin_cases, load_cases, CaseOutcome, LaunchContext, LifecycleDriver, TestCase,
};

#[derive(Parser)]
#[command(name = "regress")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Regression test harness for a configure-and-make solver", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Extra test cases (TOML file with [[case]] tables)
    #[arg(long, global = true)]
    cases: Option<PathBuf>,

    #[command(flatten)]
    env: EnvArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Where the solver lives and how to launch it.
#[derive(Args, Debug, Clone)]
struct EnvArgs {
    /// Solver source tree (configure.py, Makefile, src/)
    #[arg(long, global = true, env = "REGRESS_BUILD_ROOT", default_value = ".")]
    build_root: PathBuf,

    /// Input deck root (default: <build-root>/inputs)
    #[arg(long, global = true, env = "REGRESS_INPUT_ROOT")]
    input_root: Option<PathBuf>,

    /// Run directory where reports are written (default: <build-root>/bin)
    #[arg(long, global = true, env = "REGRESS_OUTPUT_ROOT")]
    output_root: Option<PathBuf>,

    /// Parallel launcher executable
    #[arg(long, global = true, env = "REGRESS_MPIRUN", default_value = "mpirun")]
    mpirun: String,

    /// Extra launcher options, whitespace separated
    #[arg(long, global = true, env = "REGRESS_MPIRUN_OPTS", default_value = "")]
    mpirun_opts: String,

    /// Per-process timeout in seconds (0 = none)
    #[arg(long, global = true, env = "REGRESS_TIMEOUT_SECS", default_value = "0")]
    timeout_secs: u64,

    /// Coverage capture command; `{tag}` is replaced by the coverage tag
    #[arg(long, global = true, env = "REGRESS_COVERAGE")]
    coverage: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available test cases
    List,

    /// Print the resolved plan of a test case as JSON
    Plan {
        /// Test case name
        case: String,
    },

    /// Run test cases
    Run {
        /// Test case names
        #[arg(required_unless_present = "all")]
        names: Vec<String>,

        /// Run every available test case
        #[arg(long, conflicts_with = "names")]
        all: bool,

        /// Write the outcomes as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    regress_core::init_tracing(cli.json, level);

    let cases = available_cases(cli.cases.as_deref())?;
    let ctx = launch_context(&cli.env)?;

    match cli.command {
        Commands::List => cmd_list(&cases),
        Commands::Plan { case } => cmd_plan(&ctx, &cases, &case),
        Commands::Run { names, all, report } => {
            cmd_run(ctx, &cases, &names, all, report.as_deref()).await
        }
    }
}

/// Built-in cases followed by those from `--cases`; names must be unique.
fn available_cases(file: Option<&Path>) -> Result<Vec<TestCase>> {
    let mut cases = builtin_cases();
    if let Some(path) = file {
        let extra = load_cases(path)
            .with_context(|| format!("Failed to load test cases from {}", path.display()))?;
        for case in extra {
            if cases.iter().any(|c| c.name == case.name) {
                anyhow::bail!("Test case '{}' is defined twice", case.name);
            }
            cases.push(case);
        }
    }
    Ok(cases)
}

fn launch_context(args: &EnvArgs) -> Result<LaunchContext> {
    let mut ctx = LaunchContext::new(&args.build_root);
    if let Some(input_root) = &args.input_root {
        ctx.input_root = input_root.clone();
    }
    if let Some(output_root) = &args.output_root {
        ctx.output_root = output_root.clone();
    }
    ctx.parallel_cmd = vec![
        args.mpirun.clone(),
        "-np".to_string(),
        NPROC_PLACEHOLDER.to_string(),
    ];
    ctx.parallel_opts = split_words(&args.mpirun_opts);
    ctx.coverage_cmd = args.coverage.as_deref().map(split_words);
    ctx.timeout_secs = args.timeout_secs;

    ctx.absolutize()
        .context("Failed to resolve build, input or output root")
}

fn split_words(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

fn find<'a>(cases: &'a [TestCase], name: &str) -> Result<&'a TestCase> {
    cases
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| anyhow::anyhow!("Unknown test case: {}", name))
}

fn cmd_list(cases: &[TestCase]) -> Result<()> {
    for case in cases {
        let runs = case.runs.len();
        let kind = if case.analysis.is_some() {
            "analyzed"
        } else {
            "build/run only"
        };
        println!("{:<20} {} run(s), {:<14} {}", case.name, runs, kind, case.description);
    }
    Ok(())
}

fn cmd_plan(ctx: &LaunchContext, cases: &[TestCase], name: &str) -> Result<()> {
    let case = find(cases, name)?;
    let plan = case
        .resolve(ctx)
        .with_context(|| format!("Failed to resolve test case '{}'", name))?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

/// One line of the run summary.
#[derive(Debug, Serialize)]
struct CaseSummary {
    case: String,
    passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<CaseOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn cmd_run(
    ctx: LaunchContext,
    cases: &[TestCase],
    names: &[String],
    all: bool,
    report: Option<&Path>,
) -> Result<()> {
    let selected: Vec<&TestCase> = if all {
        cases.iter().collect()
    } else {
        names
            .iter()
            .map(|n| find(cases, n))
            .collect::<Result<_>>()?
    };

    println!("Build root: {}", ctx.build_root.display());
    println!("Test cases: {}", selected.len());
    println!();

    let driver = LifecycleDriver::with_processes(ctx);
    let start = Instant::now();
    let mut summaries = Vec::new();

    for case in selected {
        info!(case = %case.name, "Starting test case");
        let summary = match driver.execute(case).await {
            Ok(outcome) => CaseSummary {
                case: case.name.clone(),
                passed: outcome.passed,
                outcome: Some(outcome),
                error: None,
            },
            Err(e) => {
                error!(case = %case.name, error = %e, "Test case aborted");
                CaseSummary {
                    case: case.name.clone(),
                    passed: false,
                    outcome: None,
                    error: Some(e.to_string()),
                }
            }
        };
        print_summary(&summary);
        summaries.push(summary);
    }

    let passed = summaries.iter().filter(|s| s.passed).count();
    println!();
    println!(
        "Summary: {}/{} test cases passed ({}ms)",
        passed,
        summaries.len(),
        start.elapsed().as_millis()
    );

    if let Some(path) = report {
        let json = serde_json::to_string_pretty(&summaries)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        println!("Report: {}", path.display());
    }

    if passed == summaries.len() {
        Ok(())
    } else {
        anyhow::bail!("{} test case(s) failed", summaries.len() - passed)
    }
}

fn print_summary(summary: &CaseSummary) {
    let status = if summary.passed { "✓" } else { "✗" };
    match (&summary.outcome, &summary.error) {
        (Some(outcome), _) => {
            println!(
                "  {} {} ({}ms, {} build(s), {} run(s))",
                status,
                summary.case,
                outcome.duration_ms,
                outcome.builds.len(),
                outcome.runs.len()
            );
            for failure in &outcome.failures {
                println!("      - {}", failure.message);
            }
        }
        (None, Some(error)) => println!("  {} {} aborted: {}", status, summary.case, error),
        (None, None) => println!("  {} {}", status, summary.case),
    }
}
