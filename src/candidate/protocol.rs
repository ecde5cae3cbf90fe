//! Candidates that are standalone programs speaking the stdio protocol.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use super::{
    CandidateCapabilities, CandidateHandle, CandidateInfo, CommandSpec, ComputeOptions, Launch,
};
use crate::error::CandidateError;
use crate::identifier::ObjectType;
use crate::sandbox::executor::{run_child, ChildFailure};
use crate::sandbox::{Request, SandboxLimits};

/// Adapter for any executable that reads one request on stdin and writes
/// one response on stdout.
pub struct ProtocolCandidate {
    info: CandidateInfo,
    capabilities: CandidateCapabilities,
    command: CommandSpec,
    limits: SandboxLimits,
}

impl ProtocolCandidate {
    pub fn new(info: CandidateInfo, command: CommandSpec) -> Self {
        Self {
            info,
            capabilities: CandidateCapabilities::default(),
            command,
            limits: SandboxLimits::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CandidateCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Limits applied when the candidate is called directly rather than
    /// through a [`SandboxExecutor`](crate::sandbox::SandboxExecutor).
    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }
}

#[async_trait]
impl CandidateHandle for ProtocolCandidate {
    fn info(&self) -> &CandidateInfo {
        &self.info
    }

    fn capabilities(&self) -> &CandidateCapabilities {
        &self.capabilities
    }

    fn launch(&self) -> Launch {
        Launch::Command(self.command.clone())
    }

    async fn is_available(&self) -> bool {
        let found = self.command.resolve_program().is_some();
        if !found {
            debug!(
                candidate = %self.info.name,
                program = %self.command.program.display(),
                "Candidate program not found"
            );
        }
        found
    }

    async fn compute(
        &self,
        payload: &Path,
        object_type: ObjectType,
        options: &ComputeOptions,
    ) -> Result<String, CandidateError> {
        // A protocol candidate is always a separate process.
        let request = Request::compute(payload, object_type, options);
        let run = run_child(&self.command, &request, &self.limits).await;
        match run.result {
            Ok(identifier) => Ok(identifier),
            Err(ChildFailure::Unsupported(reason)) => Err(CandidateError::Unsupported(reason)),
            Err(ChildFailure::Error(e)) => Err(CandidateError::failed(e.kind, e.subtype, e.message)),
        }
    }
}
