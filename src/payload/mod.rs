//! Payloads: the inputs every candidate is asked to identify.

pub mod archive;
pub mod ledger;
pub mod materializer;
pub mod repo;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::identifier::{HashAlgorithm, IdentifierVersion};

pub use ledger::TempLedger;
pub use materializer::{MaterializedPayload, Materializer, MaterializerConfig};

/// Expected identifiers for refs found by discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedRefs {
    #[serde(default)]
    pub branches: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Pins the identifier version or hash a single candidate is asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionOverride {
    #[serde(default)]
    pub version: Option<IdentifierVersion>,
    #[serde(default)]
    pub hash: Option<HashAlgorithm>,
}

/// One entry of the test corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub name: String,
    pub path: PathBuf,
    /// Filled from the category key when loaded from configuration.
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_swhid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_swhid_sha256: Option<String>,
    /// Set for negative tests that every candidate should reject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub discover_branches: bool,
    #[serde(default)]
    pub discover_tags: bool,
    /// Build the deterministic sample repository when the path is absent.
    #[serde(default)]
    pub synthetic: bool,
    #[serde(default)]
    pub expected: ExpectedRefs,
    #[serde(default)]
    pub overrides: BTreeMap<String, VersionOverride>,
}

impl Payload {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            category: category.into(),
            description: None,
            expected_swhid: None,
            expected_swhid_sha256: None,
            expected_error: None,
            commit: None,
            tag: None,
            discover_branches: false,
            discover_tags: false,
            synthetic: false,
            expected: ExpectedRefs::default(),
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_expected(mut self, identifier: impl Into<String>) -> Self {
        self.expected_swhid = Some(identifier.into());
        self
    }

    pub fn with_expected_sha256(mut self, identifier: impl Into<String>) -> Self {
        self.expected_swhid_sha256 = Some(identifier.into());
        self
    }

    pub fn with_expected_error(mut self, error: impl Into<String>) -> Self {
        self.expected_error = Some(error.into());
        self
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_discovery(mut self, branches: bool, tags: bool) -> Self {
        self.discover_branches = branches;
        self.discover_tags = tags;
        self
    }

    pub fn synthetic(mut self) -> Self {
        self.synthetic = true;
        self
    }

    pub fn with_override(mut self, candidate: impl Into<String>, pin: VersionOverride) -> Self {
        self.overrides.insert(candidate.into(), pin);
        self
    }

    /// Expected identifier for a given version.
    pub fn expected_for(&self, version: IdentifierVersion) -> Option<&str> {
        match version {
            IdentifierVersion::Primary => self.expected_swhid.as_deref(),
            IdentifierVersion::Secondary => self.expected_swhid_sha256.as_deref(),
        }
    }

    pub fn is_negative_test(&self) -> bool {
        self.expected_error.is_some()
    }

    /// Revision payload for a discovered branch.
    pub fn derive_branch(&self, branch: &str) -> Self {
        let mut derived = self.derived(format!("{}@branch:{}", self.name, branch), "revision");
        derived.commit = Some(branch.to_string());
        derived.expected_swhid = self.expected.branches.get(branch).cloned();
        derived
    }

    /// Release payload for a discovered annotated tag.
    pub fn derive_tag(&self, tag: &str) -> Self {
        let mut derived = self.derived(format!("{}@tag:{}", self.name, tag), "release");
        derived.tag = Some(tag.to_string());
        derived.expected_swhid = self.expected.tags.get(tag).cloned();
        derived
    }

    fn derived(&self, name: String, category: &str) -> Self {
        let mut derived = Payload::new(name, self.path.clone(), category);
        derived.description = self.description.clone();
        derived.overrides = self.overrides.clone();
        derived
    }
}

/// True for categories whose payloads must be repositories.
pub fn is_vcs_category(category: &str) -> bool {
    let head = category.split('/').next().unwrap_or(category);
    matches!(head, "git" | "git-repository" | "snapshot" | "revision" | "release")
}

/// The whole corpus, grouped by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadSuite {
    categories: BTreeMap<String, Vec<Payload>>,
}

impl PayloadSuite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a payload under its category.
    pub fn push(&mut self, payload: Payload) {
        self.categories
            .entry(payload.category.clone())
            .or_default()
            .push(payload);
    }

    /// Stamps every payload with the category it is filed under.
    pub fn assign_categories(&mut self) {
        for (category, payloads) in self.categories.iter_mut() {
            for payload in payloads.iter_mut() {
                payload.category = category.clone();
            }
        }
    }

    pub fn categories(&self) -> impl Iterator<Item = (&String, &Vec<Payload>)> {
        self.categories.iter()
    }

    pub fn len(&self) -> usize {
        self.categories.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payloads sorted by category then name, optionally restricted to
    /// `categories`.
    pub fn ordered(&self, categories: Option<&[String]>) -> Vec<Payload> {
        let mut payloads: Vec<Payload> = self
            .categories
            .iter()
            .filter(|(category, _)| {
                categories.map_or(true, |wanted| wanted.iter().any(|w| w == *category))
            })
            .flat_map(|(_, payloads)| payloads.iter().cloned())
            .collect();
        payloads.sort_by(|a, b| (&a.category, &a.name).cmp(&(&b.category, &b.name)));
        payloads
    }
}

impl FromIterator<Payload> for PayloadSuite {
    fn from_iter<I: IntoIterator<Item = Payload>>(iter: I) -> Self {
        let mut suite = PayloadSuite::new();
        for payload in iter {
            suite.push(payload);
        }
        suite
    }
}
