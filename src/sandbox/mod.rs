//! Sandboxed execution adapter.
//!
//! Runs an untrusted candidate as a child process and speaks the stdio
//! protocol with it.
//!
//! # Architecture
//!
//! ```text
//! ExecutionRequest → SandboxExecutor → child (own process group, private cwd,
//!                                       allow-listed env, rlimits)
//!                          │                │ stdin: one Request
//!                          │                ▼ stdout: one Response
//!                          └── monitor: wall clock, VmHWM, CPU → SIGTERM/SIGKILL
//! ```
//!
//! Every failure mode ends up as an [`OutcomeError`](crate::outcome::OutcomeError);
//! the executor never returns `Err`.

pub mod executor;
pub mod limits;
pub mod probe;
pub mod protocol;
pub mod worker;

pub use executor::{ExecutionRequest, IsolationMode, SandboxExecutor};
pub use limits::SandboxLimits;
pub use protocol::{Request, Response};

use crate::outcome::{ErrorKind, OutcomeError};

/// Error types for sandbox setup.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Setup failed: {0}")]
    Setup(#[source] std::io::Error),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("No worker host configured for hosted candidate '{0}'")]
    NoWorkerHost(String),
}

impl SandboxError {
    pub fn to_outcome_error(&self) -> OutcomeError {
        let subtype = match self {
            SandboxError::Setup(_) => "sandbox_setup",
            SandboxError::Spawn { .. } => "spawn_failed",
            SandboxError::Encode(_) => "encode_failed",
            SandboxError::NoWorkerHost(_) => "no_worker_host",
        };
        OutcomeError::new(ErrorKind::Io, subtype, self.to_string())
    }
}
