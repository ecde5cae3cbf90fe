//! swhid-conformance: runs several implementations of software heritage
//! identifiers against a shared corpus and reports where they disagree.
//!
//! A run loads a [`config::HarnessConfig`], materializes each
//! [`payload::Payload`], executes every [`candidate::CandidateHandle`] in a
//! [`sandbox`] and reduces the outcomes with [`comparator::reconcile`].

// Core modules
pub mod candidate;
pub mod cli;
pub mod comparator;
pub mod config;
pub mod error;
pub mod git;
pub mod identifier;
pub mod metrics;
pub mod outcome;
pub mod payload;
pub mod report;
pub mod sandbox;
pub mod scheduler;

// Re-export commonly used types
pub use error::{
    CandidateError, ConfigError, GitError, MaterializeError, OrchestratorError, RegistryError,
};
pub use outcome::{ErrorKind, ExecutionOutcome, OutcomeError, OutcomeState};
