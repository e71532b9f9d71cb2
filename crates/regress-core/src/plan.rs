//! Test case definitions and their resolution into ordered build/run steps.
//!
//! A [`TestCase`] is declarative (and TOML-loadable). [`TestCase::resolve`]
//! expands its matrix into a [`ResolvedPlan`] and checks, before anything is
//! built, that every run step will find its variant's binary available.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::launcher::{BuildOptions, LaunchContext, RunRequest};
use crate::matrix::{derive_groups, explicit_variants, Catalogue, Classifier};
use crate::validator::RuleSet;
use crate::variant::{BuildVariant, CapabilityFlag, Precision};

/// One regression test case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestCase {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub prepare: PreparePlan,

    /// Run steps, in the order their report rows are expected.
    #[serde(default)]
    pub runs: Vec<RunRequest>,

    /// The run steps tag coverage themselves; skip the case-wide capture.
    #[serde(default)]
    pub coverage_exempt: bool,

    /// Absent for build-only cases, which pass once PREPARE and RUN succeed.
    #[serde(default)]
    pub analysis: Option<Analysis>,
}

/// Where the problem catalogue of a sweep comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CatalogueSource {
    /// Every `<id>.<extension>` in `dir` (relative to the build root).
    Directory { dir: PathBuf, extension: String },

    /// A literal list.
    Literal { ids: Vec<String> },
}

impl CatalogueSource {
    pub fn load(&self, ctx: &LaunchContext) -> Result<Catalogue> {
        match self {
            CatalogueSource::Directory { dir, extension } => {
                Catalogue::discover(&ctx.build_root.join(dir), extension)
            }
            CatalogueSource::Literal { ids } => Ok(Catalogue::literal(ids.iter().cloned())),
        }
    }
}

/// A variant built for later runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExplicitBuild {
    pub variant: BuildVariant,

    /// Move the binary and object tree aside under the variant tag once built.
    #[serde(default)]
    pub preserve: bool,
}

/// How PREPARE enumerates its builds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PreparePlan {
    /// Hand-specified variants, each built clean and linked, in order.
    Explicit {
        variants: Vec<ExplicitBuild>,
        #[serde(default)]
        exclude: Vec<String>,
    },

    /// Compile sweep over a classified catalogue, once per precision.
    /// The first member of each group builds clean and linked, the rest
    /// object-only on the same tree.
    Sweep {
        catalogue: CatalogueSource,
        classifier: Classifier,
        #[serde(default)]
        exclude: Vec<String>,
        /// Flags given to every configure call, ahead of the group's own.
        #[serde(default)]
        shared_flags: Vec<CapabilityFlag>,
        #[serde(default = "default_precisions")]
        precisions: Vec<Precision>,
    },
}

fn default_precisions() -> Vec<Precision> {
    vec![Precision::Double]
}

/// What ANALYZE reads and checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Analysis {
    /// Report artifact, relative to the output root.
    pub report: PathBuf,

    pub rules: RuleSet,

    /// Row count the report must have before any rule is checked.
    #[serde(default)]
    pub expected_rows: Option<usize>,

    /// Collect every failing rule instead of stopping at the first.
    #[serde(default)]
    pub audit: bool,

    #[serde(default)]
    pub allow_nan: bool,
}

/// One PREPARE step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildStep {
    pub variant: BuildVariant,
    pub options: BuildOptions,
    /// Name of the group whose object tree this build uses.
    pub group: String,
    pub preserve: bool,
}

/// A test case expanded into concrete, ordered steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedPlan {
    pub builds: Vec<BuildStep>,
    pub runs: Vec<RunRequest>,
    /// SHA-256 over the ordered steps.
    pub digest: String,
}

impl ResolvedPlan {
    pub fn clean_builds(&self) -> usize {
        self.builds.iter().filter(|b| b.options.clean_first).count()
    }

    pub fn object_only_builds(&self) -> usize {
        self.builds.iter().filter(|b| b.options.obj_only).count()
    }
}

impl TestCase {
    /// Expand the matrix and check run availability. Touches nothing on disk
    /// except a catalogue directory listing.
    pub fn resolve(&self, ctx: &LaunchContext) -> Result<ResolvedPlan> {
        let builds = match &self.prepare {
            PreparePlan::Explicit { variants, exclude } => {
                let all: Vec<BuildVariant> = variants.iter().map(|b| b.variant.clone()).collect();
                let kept = explicit_variants(&all, exclude)?;
                variants
                    .iter()
                    .filter(|b| kept.contains(&b.variant))
                    .map(|b| BuildStep {
                        variant: b.variant.clone(),
                        options: BuildOptions::clean(),
                        group: b.variant.id().to_string(),
                        preserve: b.preserve,
                    })
                    .collect()
            }
            PreparePlan::Sweep {
                catalogue,
                classifier,
                exclude,
                shared_flags,
                precisions,
            } => {
                if precisions.is_empty() {
                    return Err(HarnessError::config(format!(
                        "case '{}' sweeps no precisions",
                        self.name
                    )));
                }
                let catalogue = catalogue.load(ctx)?;
                let classifier = with_shared_flags(classifier, shared_flags);

                let mut builds = Vec::new();
                for precision in precisions {
                    for group in derive_groups(&catalogue, &classifier, exclude, *precision)? {
                        let group_key = format!("{}_{}", group.name(), precision.name());
                        for (i, variant) in group.variants().into_iter().enumerate() {
                            let options = if i == 0 {
                                BuildOptions::clean()
                            } else {
                                BuildOptions::object_only()
                            };
                            builds.push(BuildStep {
                                variant,
                                options,
                                group: group_key.clone(),
                                preserve: false,
                            });
                        }
                    }
                }
                builds
            }
        };

        check_availability(&self.name, &builds, &self.runs)?;
        if let Some(analysis) = &self.analysis {
            analysis
                .rules
                .check(analysis.expected_rows)
                .map_err(|e| HarnessError::config(format!("case '{}': {}", self.name, e)))?;
        }
        let digest = plan_digest(&builds, &self.runs)?;
        debug!(
            case = %self.name,
            builds = builds.len(),
            runs = self.runs.len(),
            digest = %&digest[..12],
            "Resolved test case plan"
        );

        Ok(ResolvedPlan {
            builds,
            runs: self.runs.clone(),
            digest,
        })
    }
}

fn with_shared_flags(classifier: &Classifier, shared: &[CapabilityFlag]) -> Classifier {
    let mut classifier = classifier.clone();
    for rule in &mut classifier.rules {
        let mut flags = shared.to_vec();
        flags.append(&mut rule.flags);
        rule.flags = flags;
    }
    classifier
}

/// Walk the steps the way the driver will and reject runs whose binary would
/// be missing, preserved linkless builds, and repeated coverage tags.
fn check_availability(case: &str, builds: &[BuildStep], runs: &[RunRequest]) -> Result<()> {
    let mut active: Option<&str> = None;
    let mut saved: BTreeSet<&str> = BTreeSet::new();

    for step in builds {
        let tag = step.variant.tag();
        active = if step.options.obj_only { None } else { Some(tag) };
        if step.preserve {
            if step.options.obj_only {
                return Err(HarnessError::config(format!(
                    "case '{}': object-only build '{}' cannot be preserved",
                    case, tag
                )));
            }
            if !saved.insert(tag) {
                return Err(HarnessError::config(format!(
                    "case '{}': variant tag '{}' preserved twice",
                    case, tag
                )));
            }
            active = None;
        }
    }

    let mut covered = BTreeSet::new();
    for (i, run) in runs.iter().enumerate() {
        let tag = run.variant.as_str();
        if run.parallelism.processes() == Some(0) {
            return Err(HarnessError::config(format!(
                "case '{}': run step {} launches zero processes",
                case, i
            )));
        }
        if active != Some(tag) {
            if !saved.remove(tag) {
                return Err(HarnessError::config(format!(
                    "case '{}': run step {} needs variant '{}' which is not available",
                    case, i, tag
                )));
            }
            active = Some(tag);
        }
        if run.coverage_tag.is_some() && !covered.insert(tag) {
            return Err(HarnessError::config(format!(
                "case '{}': variant '{}' carries more than one coverage tag",
                case, tag
            )));
        }
    }
    Ok(())
}

fn plan_digest(builds: &[BuildStep], runs: &[RunRequest]) -> Result<String> {
    let mut hasher = Sha256::new();
    for build in builds {
        hasher.update(serde_json::to_vec(build).map_err(|e| HarnessError::config(e.to_string()))?);
        hasher.update(b"\0");
    }
    for run in runs {
        hasher.update(serde_json::to_vec(run).map_err(|e| HarnessError::config(e.to_string()))?);
        hasher.update(b"\0");
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Top-level shape of a case file: one `[[case]]` table per test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CaseFile {
    #[serde(rename = "case", default)]
    cases: Vec<TestCase>,
}

/// Parse test cases from TOML text.
pub fn parse_cases(text: &str) -> Result<Vec<TestCase>> {
    let file: CaseFile = toml::from_str(text)?;
    Ok(file.cases)
}

/// Load test cases from a TOML file.
pub fn load_cases(path: &Path) -> Result<Vec<TestCase>> {
    let text = std::fs::read_to_string(path)?;
    parse_cases(&text)
}
