//! Error types for conformance runs.
//!
//! Each subsystem owns one enum:
//! - Configuration loading and validation
//! - Git plumbing used by the materializer and the built-in candidate
//! - Payload materialization
//! - Candidate computation
//! - Candidate registration
//! - Whole-run orchestration
//!
//! Failures of a single execution never surface as these errors. They are
//! folded into an [`OutcomeError`] at the point where they occur.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::outcome::{ErrorKind, OutcomeError};

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by git invocations.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to spawn git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("git {args} timed out after {timeout:?}")]
    Timeout { args: String, timeout: Duration },

    #[error("git {args} exited with {status}: {stderr}")]
    Failed {
        args: String,
        status: i32,
        stderr: String,
    },
}

/// Errors that can occur while preparing a payload for execution.
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("Payload not found: {0}")]
    NotFound(PathBuf),

    #[error("Not a git repository: {0}")]
    NotARepository(PathBuf),

    #[error("Failed to extract archive '{path}': {reason}")]
    Extraction { path: PathBuf, reason: String },

    #[error("{step} timed out after {timeout:?}")]
    Timeout { step: String, timeout: Duration },

    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MaterializeError {
    /// Converts into the error recorded on every skipped outcome of the payload.
    pub fn to_outcome_error(&self) -> OutcomeError {
        let subtype = match self {
            MaterializeError::NotFound(_) => "file_not_found",
            MaterializeError::NotARepository(_) => "not_a_repository",
            MaterializeError::Extraction { .. } => "extraction_failed",
            MaterializeError::Timeout { .. } => "materialize_timeout",
            MaterializeError::Git(_) => "git_failed",
            MaterializeError::Io(_) => "io",
        };
        OutcomeError::new(ErrorKind::Io, subtype, self.to_string())
    }
}

/// Errors a candidate reports from a computation.
#[derive(Debug, Error)]
pub enum CandidateError {
    /// The candidate has no opinion on this input.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("{kind}/{subtype}: {message}")]
    Failed {
        kind: ErrorKind,
        subtype: String,
        message: String,
    },

    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CandidateError {
    pub fn failed(kind: ErrorKind, subtype: impl Into<String>, message: impl Into<String>) -> Self {
        CandidateError::Failed {
            kind,
            subtype: subtype.into(),
            message: message.into(),
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, CandidateError::Unsupported(_))
    }

    /// Wire code used when the error crosses the execution protocol.
    pub fn code(&self) -> &'static str {
        match self {
            CandidateError::Unsupported(_) => "UNSUPPORTED",
            CandidateError::Failed { kind, .. } => kind.code(),
            CandidateError::Git(_) => ErrorKind::Compute.code(),
            CandidateError::Io(_) => ErrorKind::Io.code(),
        }
    }

    pub fn to_outcome_error(&self) -> OutcomeError {
        match self {
            CandidateError::Unsupported(reason) => {
                OutcomeError::new(ErrorKind::Validate, "unsupported_type", reason.clone())
            }
            CandidateError::Failed {
                kind,
                subtype,
                message,
            } => OutcomeError::new(*kind, subtype.clone(), message.clone()),
            CandidateError::Git(e) => OutcomeError::new(ErrorKind::Compute, "git", e.to_string()),
            CandidateError::Io(e) => OutcomeError::new(ErrorKind::Io, "io", e.to_string()),
        }
    }
}

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Candidate '{0}' is already registered")]
    DuplicateCandidate(String),

    #[error("Candidate '{0}' not found in registry")]
    CandidateNotFound(String),
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("No available candidates to run")]
    NoCandidates,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
