//! Configuration matrix: problem catalogues, classification and grouping.
//!
//! Two ways to enumerate what gets built:
//! - explicit: hand-written [`BuildVariant`]s, one per named configuration;
//! - derived: a [`Catalogue`] of problem identifiers classified by a
//!   first-match [`Classifier`] and partitioned into [`ProblemGroup`]s.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::variant::{BuildVariant, CapabilityFlag, Precision, ProblemGroup};

/// Set of known problem identifiers, kept sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalogue {
    ids: BTreeSet<String>,
}

impl Catalogue {
    /// Catalogue from a literal list.
    pub fn literal<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Catalogue of every `<id>.<extension>` file directly inside `dir`.
    pub fn discover(dir: &Path, extension: &str) -> Result<Self> {
        let mut ids = BTreeSet::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().map(|e| e == extension).unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.insert(stem.to_string());
                }
            }
        }

        if ids.is_empty() {
            return Err(HarnessError::config(format!(
                "no *.{} sources found in {}",
                extension,
                dir.display()
            )));
        }

        debug!(dir = %dir.display(), count = ids.len(), "Discovered problem catalogue");
        Ok(Self { ids })
    }

    /// Remove excluded identifiers. Every exclusion must name a present identifier.
    pub fn exclude<S: AsRef<str>>(&mut self, exclusions: &[S]) -> Result<()> {
        for id in exclusions {
            let id = id.as_ref();
            if !self.ids.remove(id) {
                return Err(HarnessError::config(format!(
                    "cannot exclude '{}': not in the catalogue",
                    id
                )));
            }
        }
        Ok(())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// How a classification rule selects identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum Matcher {
    /// Identifier starts with `prefix`.
    Prefix { prefix: String },

    /// Identifier is one of `members`.
    Members { members: BTreeSet<String> },

    /// Matches everything; used as the trailing fallback.
    Any,
}

impl Matcher {
    pub fn matches(&self, id: &str) -> bool {
        match self {
            Matcher::Prefix { prefix } => id.starts_with(prefix.as_str()),
            Matcher::Members { members } => members.contains(id),
            Matcher::Any => true,
        }
    }
}

/// Maps matching identifiers to a group name and capability flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRule {
    pub group: String,
    pub matcher: Matcher,
    #[serde(default)]
    pub flags: Vec<CapabilityFlag>,
}

impl ClassRule {
    pub fn new(group: impl Into<String>, matcher: Matcher, flags: Vec<CapabilityFlag>) -> Self {
        Self {
            group: group.into(),
            matcher,
            flags,
        }
    }
}

/// Ordered classification rules, first match wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classifier {
    pub rules: Vec<ClassRule>,
}

impl Classifier {
    pub fn new(rules: Vec<ClassRule>) -> Self {
        Self { rules }
    }

    /// Add a rule (builder pattern).
    pub fn with_rule(mut self, rule: ClassRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn classify(&self, id: &str) -> Option<&ClassRule> {
        self.rules.iter().find(|rule| rule.matcher.matches(id))
    }
}

/// Partition a catalogue into problem groups.
///
/// Exclusions are applied first. Rules with identical flag sets collapse into
/// the group of the earliest such rule; groups come out in rule order with
/// members sorted. Rules matching nothing produce no group.
pub fn derive_groups<S: AsRef<str>>(
    catalogue: &Catalogue,
    classifier: &Classifier,
    exclusions: &[S],
    precision: Precision,
) -> Result<Vec<ProblemGroup>> {
    let mut catalogue = catalogue.clone();
    catalogue.exclude(exclusions)?;
    if catalogue.is_empty() {
        return Err(HarnessError::config("problem catalogue is empty"));
    }

    // fingerprint -> (group name, flags, members), in first-seen rule order
    let mut order: Vec<String> = Vec::new();
    let mut buckets: BTreeMap<String, (String, Vec<CapabilityFlag>, Vec<String>)> =
        BTreeMap::new();

    for rule in &classifier.rules {
        let shape = BuildVariant::new(rule.group.clone(), String::new())
            .with_flags(rule.flags.iter().cloned())
            .with_precision(precision);
        let key = shape.fingerprint();
        if !buckets.contains_key(&key) {
            order.push(key.clone());
            buckets.insert(key, (rule.group.clone(), rule.flags.clone(), Vec::new()));
        }
    }

    for id in catalogue.ids() {
        let rule = classifier.classify(id).ok_or_else(|| {
            HarnessError::config(format!("problem '{}' matches no classification rule", id))
        })?;
        let key = BuildVariant::new(rule.group.clone(), String::new())
            .with_flags(rule.flags.iter().cloned())
            .with_precision(precision)
            .fingerprint();
        if let Some((_, _, members)) = buckets.get_mut(&key) {
            members.push(id.to_string());
        }
    }

    let mut groups = Vec::new();
    for key in order {
        if let Some((name, flags, members)) = buckets.remove(&key) {
            if members.is_empty() {
                debug!(group = %name, "Classification group is empty, skipping");
                continue;
            }
            groups.push(ProblemGroup::new(name, flags, precision, members));
        }
    }

    Ok(groups)
}

/// Validate an explicit enumeration and drop excluded variants (by id).
pub fn explicit_variants<S: AsRef<str>>(
    variants: &[BuildVariant],
    exclusions: &[S],
) -> Result<Vec<BuildVariant>> {
    for id in exclusions {
        let id = id.as_ref();
        if !variants.iter().any(|v| v.id() == id) {
            return Err(HarnessError::config(format!(
                "cannot exclude '{}': no such variant",
                id
            )));
        }
    }

    let kept: Vec<BuildVariant> = variants
        .iter()
        .filter(|v| !exclusions.iter().any(|x| x.as_ref() == v.id()))
        .cloned()
        .collect();

    if kept.is_empty() {
        return Err(HarnessError::config("build matrix is empty"));
    }

    let mut tags = BTreeSet::new();
    for v in &kept {
        if !tags.insert(v.tag()) {
            return Err(HarnessError::config(format!(
                "duplicate variant tag '{}'",
                v.tag()
            )));
        }
    }

    Ok(kept)
}
