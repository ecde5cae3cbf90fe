//! Candidate implementations under test.
//!
//! A candidate is opaque to the harness. It declares who it is
//! ([`CandidateInfo`]), what it can compute ([`CandidateCapabilities`]) and
//! how it is launched ([`Launch`]). Candidates either live inside this binary
//! and are hosted by the worker entry point, or are external programs that
//! speak the execution protocol themselves.

pub mod git;
pub mod protocol;
pub mod registry;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CandidateError;
use crate::identifier::{HashAlgorithm, IdentifierVersion, ObjectType};

pub use git::GitCandidate;
pub use protocol::ProtocolCandidate;
pub use registry::CandidateRegistry;

/// Identity and metadata of a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInfo {
    /// Unique key across the registry.
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl CandidateInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            language: String::new(),
            description: String::new(),
            build_command: None,
            test_command: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }
}

/// What a candidate claims it can compute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateCapabilities {
    /// Object type codes (`cnt`, `dir`, `rev`, `rel`, `snp`).
    #[serde(default = "default_supported_types")]
    pub supported_types: Vec<String>,
    #[serde(default)]
    pub supported_qualifiers: Vec<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_max_payload_size_mb")]
    pub max_payload_size_mb: u64,
    #[serde(default = "default_true")]
    pub supports_unicode: bool,
    #[serde(default)]
    pub supports_percent_encoding: bool,
    /// Identifier versions the candidate can produce.
    #[serde(default = "default_identifier_versions")]
    pub identifier_versions: Vec<u8>,
}

fn default_supported_types() -> Vec<String> {
    ObjectType::ALL.iter().map(|t| t.code().to_string()).collect()
}

fn default_api_version() -> String {
    "1.0".to_string()
}

fn default_max_payload_size_mb() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_identifier_versions() -> Vec<u8> {
    vec![1, 2]
}

impl Default for CandidateCapabilities {
    fn default() -> Self {
        Self {
            supported_types: default_supported_types(),
            supported_qualifiers: Vec::new(),
            api_version: default_api_version(),
            max_payload_size_mb: default_max_payload_size_mb(),
            supports_unicode: true,
            supports_percent_encoding: false,
            identifier_versions: default_identifier_versions(),
        }
    }
}

impl CandidateCapabilities {
    /// Restricts the supported object types.
    pub fn with_types(mut self, types: &[ObjectType]) -> Self {
        self.supported_types = types.iter().map(|t| t.code().to_string()).collect();
        self
    }

    /// Restricts the identifier versions.
    pub fn with_versions(mut self, versions: &[IdentifierVersion]) -> Self {
        self.identifier_versions = versions.iter().map(|v| v.number()).collect();
        self
    }

    pub fn with_max_payload_size_mb(mut self, mb: u64) -> Self {
        self.max_payload_size_mb = mb;
        self
    }

    pub fn supports_type(&self, object_type: ObjectType) -> bool {
        self.supported_types.iter().any(|c| c == object_type.code())
    }

    pub fn supports_version(&self, version: IdentifierVersion) -> bool {
        self.identifier_versions.contains(&version.number())
    }

    /// True when a payload of `size_bytes` is within the declared ceiling.
    pub fn accepts_size(&self, size_bytes: u64) -> bool {
        size_bytes <= self.max_payload_size_mb.saturating_mul(1024 * 1024)
    }
}

/// Per-call options handed to a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ComputeOptions {
    pub version: IdentifierVersion,
    pub hash_algorithm: Option<HashAlgorithm>,
    pub commit: Option<String>,
    pub tag: Option<String>,
}

impl ComputeOptions {
    pub fn new(version: IdentifierVersion) -> Self {
        Self {
            version,
            ..Default::default()
        }
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_hash(mut self, hash: HashAlgorithm) -> Self {
        self.hash_algorithm = Some(hash);
        self
    }

    /// Hash algorithm to use, falling back to the version default.
    pub fn hash(&self) -> HashAlgorithm {
        self.hash_algorithm
            .unwrap_or_else(|| self.version.default_hash())
    }

    /// Flattens into the protocol's `extra_options` map.
    pub fn to_extra_options(&self) -> BTreeMap<String, serde_json::Value> {
        let mut extra = BTreeMap::new();
        extra.insert("version".to_string(), self.version.number().into());
        extra.insert("hash_algo".to_string(), self.hash().as_str().into());
        if let Some(commit) = &self.commit {
            extra.insert("commit".to_string(), commit.clone().into());
        }
        if let Some(tag) = &self.tag {
            extra.insert("tag".to_string(), tag.clone().into());
        }
        extra
    }

    /// Rebuilds options from a protocol `extra_options` map.
    pub fn from_extra_options(extra: &BTreeMap<String, serde_json::Value>) -> Self {
        let version = extra
            .get("version")
            .and_then(|v| v.as_u64())
            .and_then(|n| u8::try_from(n).ok())
            .and_then(|n| IdentifierVersion::try_from(n).ok())
            .unwrap_or_default();
        let hash_algorithm = extra
            .get("hash_algo")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());
        let text = |key: &str| extra.get(key).and_then(|v| v.as_str()).map(str::to_string);
        Self {
            version,
            hash_algorithm,
            commit: text("commit"),
            tag: text("tag"),
        }
    }
}

/// An external command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra variables passed through the sandbox allow-list.
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Builds a spec from an argv vector.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program).with_args(args.iter().cloned()))
    }

    /// Looks the program up the way a shell would.
    pub fn resolve_program(&self) -> Option<PathBuf> {
        if self.program.components().count() > 1 {
            return self.program.is_file().then(|| self.program.clone());
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(&self.program))
            .find(|candidate| candidate.is_file())
    }
}

/// How the sandbox starts a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    /// Implemented in this binary, started through the worker entry point.
    Hosted,
    /// A standalone program speaking the execution protocol.
    Command(CommandSpec),
}

/// A candidate implementation.
#[async_trait]
pub trait CandidateHandle: Send + Sync {
    fn info(&self) -> &CandidateInfo;

    fn capabilities(&self) -> &CandidateCapabilities;

    fn name(&self) -> &str {
        &self.info().name
    }

    fn launch(&self) -> Launch {
        Launch::Hosted
    }

    /// Checks whether the candidate's toolchain is usable on this host.
    async fn is_available(&self) -> bool;

    /// Picks an object type for payloads whose category does not imply one.
    fn detect_object_type(&self, path: &Path) -> ObjectType {
        ObjectType::detect(path)
    }

    /// Computes an identifier for `payload`.
    async fn compute(
        &self,
        payload: &Path,
        object_type: ObjectType,
        options: &ComputeOptions,
    ) -> Result<String, CandidateError>;
}
