//! Identifier vocabulary shared by candidates, the sandbox and the comparator.
//!
//! An identifier has the shape `swh:<version>:<type>:<hash>[;qualifiers]`.
//! Version 1 identifiers carry a 40 hex digit SHA-1, version 2 identifiers a
//! 64 hex digit SHA-256.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of object an identifier names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Content,
    Directory,
    Revision,
    Release,
    Snapshot,
}

impl ObjectType {
    /// All object types, in code order.
    pub const ALL: [ObjectType; 5] = [
        ObjectType::Content,
        ObjectType::Directory,
        ObjectType::Revision,
        ObjectType::Release,
        ObjectType::Snapshot,
    ];

    /// Three letter code used inside identifiers and capability declarations.
    pub fn code(&self) -> &'static str {
        match self {
            ObjectType::Content => "cnt",
            ObjectType::Directory => "dir",
            ObjectType::Revision => "rev",
            ObjectType::Release => "rel",
            ObjectType::Snapshot => "snp",
        }
    }

    /// Long name used in the execution protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Content => "content",
            ObjectType::Directory => "directory",
            ObjectType::Revision => "revision",
            ObjectType::Release => "release",
            ObjectType::Snapshot => "snapshot",
        }
    }

    /// Parses a three letter code.
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// Maps a payload category onto the object type it implies.
    ///
    /// Returns `None` for categories that need auto-detection
    /// (`git-repository`, `archive` and anything unknown).
    pub fn from_category(category: &str) -> Option<Self> {
        let head = category.split('/').next().unwrap_or(category);
        match head {
            "content" => Some(ObjectType::Content),
            "directory" => Some(ObjectType::Directory),
            "git" | "snapshot" => Some(ObjectType::Snapshot),
            "revision" => Some(ObjectType::Revision),
            "release" => Some(ObjectType::Release),
            _ => None,
        }
    }

    /// Default auto-detection: files are contents, repositories are
    /// snapshots, plain directories are directories.
    pub fn detect(path: &Path) -> Self {
        if path.is_file() {
            ObjectType::Content
        } else if is_repository(path) {
            ObjectType::Snapshot
        } else {
            ObjectType::Directory
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ObjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(t) = Self::from_code(s) {
            return Ok(t);
        }
        match s.to_lowercase().as_str() {
            "content" => Ok(ObjectType::Content),
            "directory" => Ok(ObjectType::Directory),
            "revision" => Ok(ObjectType::Revision),
            "release" => Ok(ObjectType::Release),
            "snapshot" => Ok(ObjectType::Snapshot),
            other => Err(format!("Unknown object type: {}", other)),
        }
    }
}

/// True when `path` is a working tree with `.git` or a bare repository.
pub fn is_repository(path: &Path) -> bool {
    if path.join(".git").exists() {
        return true;
    }
    path.join("HEAD").is_file() && path.join("refs").is_dir() && path.join("objects").is_dir()
}

/// Identifier scheme version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IdentifierVersion {
    /// `swh:1:` identifiers, SHA-1 based.
    Primary,
    /// `swh:2:` identifiers, SHA-256 based.
    Secondary,
}

impl IdentifierVersion {
    pub fn number(&self) -> u8 {
        match self {
            IdentifierVersion::Primary => 1,
            IdentifierVersion::Secondary => 2,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            IdentifierVersion::Primary => "swh:1:",
            IdentifierVersion::Secondary => "swh:2:",
        }
    }

    /// Hash algorithm the version uses unless overridden.
    pub fn default_hash(&self) -> HashAlgorithm {
        match self {
            IdentifierVersion::Primary => HashAlgorithm::Sha1,
            IdentifierVersion::Secondary => HashAlgorithm::Sha256,
        }
    }

    /// Key under which an outcome for `candidate` is stored in a verdict.
    pub fn outcome_key(&self, candidate: &str) -> String {
        match self {
            IdentifierVersion::Primary => candidate.to_string(),
            IdentifierVersion::Secondary => format!("{}_v2", candidate),
        }
    }

    /// Reads the version out of an identifier prefix.
    pub fn of(identifier: &str) -> Option<Self> {
        if identifier.starts_with("swh:1:") {
            Some(IdentifierVersion::Primary)
        } else if identifier.starts_with("swh:2:") {
            Some(IdentifierVersion::Secondary)
        } else {
            None
        }
    }
}

impl Default for IdentifierVersion {
    fn default() -> Self {
        Self::Primary
    }
}

impl From<IdentifierVersion> for u8 {
    fn from(v: IdentifierVersion) -> Self {
        v.number()
    }
}

impl TryFrom<u8> for IdentifierVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(IdentifierVersion::Primary),
            2 => Ok(IdentifierVersion::Secondary),
            other => Err(format!("Unknown identifier version: {}", other)),
        }
    }
}

impl std::fmt::Display for IdentifierVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.number())
    }
}

/// Hash algorithm requested from a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(HashAlgorithm::Sha1),
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            other => Err(format!("Unknown hash algorithm: {}", other)),
        }
    }
}

/// Syntax errors in a returned identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("malformed identifier '{0}'")]
    Malformed(String),

    #[error("unknown object type code '{0}'")]
    UnknownType(String),

    #[error("unsupported identifier version {0}")]
    UnknownVersion(String),

    #[error("hash of {got} hex digits, expected {expected} for version {version}")]
    HashLength {
        version: u8,
        expected: usize,
        got: usize,
    },
}

impl IdentifierError {
    /// Short, stable classification used as an outcome subtype.
    pub fn subtype(&self) -> &'static str {
        match self {
            IdentifierError::Malformed(_) => "malformed",
            IdentifierError::UnknownType(_) => "unknown_type",
            IdentifierError::UnknownVersion(_) => "unknown_version",
            IdentifierError::HashLength { .. } => "hash_length",
        }
    }
}

/// Structural view of a syntactically valid identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedIdentifier {
    pub version: IdentifierVersion,
    pub object_type: ObjectType,
    pub hash: String,
    pub qualifiers: Option<String>,
}

fn identifier_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^swh:([0-9]+):([a-z]{3}):([0-9a-f]+)(?:;(.*))?$").ok())
        .as_ref()
}

/// Checks identifier syntax. Semantic correctness is never judged here.
pub fn parse_identifier(raw: &str) -> Result<ParsedIdentifier, IdentifierError> {
    let caps = identifier_regex()
        .and_then(|re| re.captures(raw.trim()))
        .ok_or_else(|| IdentifierError::Malformed(raw.to_string()))?;

    let version = match &caps[1] {
        "1" => IdentifierVersion::Primary,
        "2" => IdentifierVersion::Secondary,
        other => return Err(IdentifierError::UnknownVersion(other.to_string())),
    };
    let object_type = ObjectType::from_code(&caps[2])
        .ok_or_else(|| IdentifierError::UnknownType(caps[2].to_string()))?;

    let hash = caps[3].to_string();
    let expected = match version {
        IdentifierVersion::Primary => 40,
        IdentifierVersion::Secondary => 64,
    };
    if hash.len() != expected {
        return Err(IdentifierError::HashLength {
            version: version.number(),
            expected,
            got: hash.len(),
        });
    }

    Ok(ParsedIdentifier {
        version,
        object_type,
        hash,
        qualifiers: caps.get(4).map(|m| m.as_str().to_string()),
    })
}
