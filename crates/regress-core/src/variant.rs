//! Build variants, capability flags and problem groups.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{HarnessError, Result};

/// A solver capability flag passed to the configure step.
///
/// Written as `name` for a switch (`-name`) or `key=value` for an option
/// (`--key=value`), which is also the TOML form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CapabilityFlag {
    /// Boolean switch, e.g. `mpi`, `fft`, `b`.
    Switch(String),

    /// Enumerated option, e.g. `grav=fft`, `coord=minkowski`.
    Option { key: String, value: String },
}

impl CapabilityFlag {
    /// Create a switch flag.
    pub fn switch(name: impl Into<String>) -> Self {
        CapabilityFlag::Switch(name.into())
    }

    /// Create a key/value option flag.
    pub fn option(key: impl Into<String>, value: impl Into<String>) -> Self {
        CapabilityFlag::Option {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Render as a configure argument.
    pub fn to_arg(&self) -> String {
        match self {
            CapabilityFlag::Switch(name) => format!("-{}", name),
            CapabilityFlag::Option { key, value } => format!("--{}={}", key, value),
        }
    }
}

impl fmt::Display for CapabilityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityFlag::Switch(name) => f.write_str(name),
            CapabilityFlag::Option { key, value } => write!(f, "{}={}", key, value),
        }
    }
}

impl FromStr for CapabilityFlag {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().trim_start_matches('-');
        if s.is_empty() {
            return Err(HarnessError::config("capability flag must not be empty"));
        }
        match s.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                Ok(CapabilityFlag::option(key, value))
            }
            Some(_) => Err(HarnessError::config(format!(
                "malformed capability option '{}'",
                s
            ))),
            None => Ok(CapabilityFlag::switch(s)),
        }
    }
}

impl TryFrom<String> for CapabilityFlag {
    type Error = HarnessError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CapabilityFlag> for String {
    fn from(flag: CapabilityFlag) -> Self {
        flag.to_string()
    }
}

/// Floating-point precision the solver is compiled with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Double,
    Single,
}

impl Precision {
    pub fn name(&self) -> &'static str {
        match self {
            Precision::Double => "double",
            Precision::Single => "single",
        }
    }

    /// Extra configure flag selecting this precision, if any.
    pub fn flag(&self) -> Option<CapabilityFlag> {
        match self {
            Precision::Double => None,
            Precision::Single => Some(CapabilityFlag::switch("float")),
        }
    }
}

/// One buildable configuration: capability flags plus a problem selector.
///
/// Immutable once constructed; the builder methods consume `self`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "VariantDef")]
pub struct BuildVariant {
    id: String,
    problem: String,
    flags: Vec<CapabilityFlag>,
    precision: Precision,
    tag: String,
}

/// Serialized form of [`BuildVariant`]; `tag` falls back to `id`.
#[derive(Deserialize)]
struct VariantDef {
    id: String,
    problem: String,
    #[serde(default)]
    flags: Vec<CapabilityFlag>,
    #[serde(default)]
    precision: Precision,
    #[serde(default)]
    tag: Option<String>,
}

impl From<VariantDef> for BuildVariant {
    fn from(def: VariantDef) -> Self {
        let tag = def.tag.unwrap_or_else(|| def.id.clone());
        BuildVariant::new(def.id, def.problem)
            .with_flags(def.flags)
            .with_precision(def.precision)
            .with_tag(tag)
    }
}

impl BuildVariant {
    /// New variant for `problem`. The tag defaults to the identifier.
    pub fn new(id: impl Into<String>, problem: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            tag: id.clone(),
            id,
            problem: problem.into(),
            flags: Vec::new(),
            precision: Precision::Double,
        }
    }

    pub fn with_flag(mut self, flag: CapabilityFlag) -> Self {
        self.flags.push(flag);
        self
    }

    pub fn with_flags(mut self, flags: impl IntoIterator<Item = CapabilityFlag>) -> Self {
        self.flags.extend(flags);
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Tag used to name this variant's preserved binary and object tree.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn problem(&self) -> &str {
        &self.problem
    }

    pub fn flags(&self) -> &[CapabilityFlag] {
        &self.flags
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Configure arguments: flags in declaration order, precision, problem selector.
    pub fn configure_args(&self) -> Vec<String> {
        let mut args: Vec<String> = self.flags.iter().map(CapabilityFlag::to_arg).collect();
        if let Some(flag) = self.precision.flag() {
            args.push(flag.to_arg());
        }
        args.push(format!("--prob={}", self.problem));
        args
    }

    /// Digest of everything except the problem selector.
    ///
    /// Two variants with the same fingerprint can share one object tree.
    pub fn fingerprint(&self) -> String {
        flag_fingerprint(&self.flags, self.precision)
    }
}

/// Variants sharing every flag except the problem selector.
///
/// The shared flags are stored once, so members cannot disagree on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemGroup {
    name: String,
    flags: Vec<CapabilityFlag>,
    precision: Precision,
    members: Vec<String>,
}

impl ProblemGroup {
    pub fn new(
        name: impl Into<String>,
        flags: Vec<CapabilityFlag>,
        precision: Precision,
        members: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            flags,
            precision,
            members,
        }
    }

    /// Build a group from existing variants, checking they agree on every flag.
    pub fn from_variants(name: impl Into<String>, variants: &[BuildVariant]) -> Result<Self> {
        let name = name.into();
        let first = variants
            .first()
            .ok_or_else(|| HarnessError::config(format!("group '{}' has no members", name)))?;

        if let Some(odd) = variants.iter().find(|v| v.fingerprint() != first.fingerprint()) {
            return Err(HarnessError::config(format!(
                "variant '{}' does not share the flags of group '{}'",
                odd.id(),
                name
            )));
        }

        Ok(Self {
            name,
            flags: first.flags.clone(),
            precision: first.precision,
            members: variants.iter().map(|v| v.problem.clone()).collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> &[CapabilityFlag] {
        &self.flags
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Same group compiled with another precision.
    pub fn with_precision(&self, precision: Precision) -> Self {
        Self {
            precision,
            ..self.clone()
        }
    }

    /// Key shared by every member's [`BuildVariant::fingerprint`].
    pub fn fingerprint(&self) -> String {
        flag_fingerprint(&self.flags, self.precision)
    }

    /// Expand into one variant per member, in member order.
    pub fn variants(&self) -> Vec<BuildVariant> {
        self.members
            .iter()
            .map(|problem| {
                BuildVariant::new(problem.clone(), problem.clone())
                    .with_flags(self.flags.iter().cloned())
                    .with_precision(self.precision)
                    .with_tag(format!("{}_{}_{}", self.name, self.precision.name(), problem))
            })
            .collect()
    }
}

/// Order-sensitive digest of a flag set and precision.
fn flag_fingerprint(flags: &[CapabilityFlag], precision: Precision) -> String {
    let mut hasher = Sha256::new();
    for flag in flags {
        hasher.update(flag.to_string().as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(precision.name().as_bytes());
    hex::encode(hasher.finalize())
}
