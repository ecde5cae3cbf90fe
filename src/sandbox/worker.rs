//! Child-side entry point for candidates hosted in this binary.
//!
//! The sandbox re-executes the binary as `worker --candidate <name>`; this
//! module reads the request from stdin, runs the candidate and writes the
//! response to stdout.

use std::path::PathBuf;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::protocol::{Request, Response, OP_CAPABILITIES, OP_COMPUTE, OP_INFO};
use crate::candidate::{CandidateRegistry, ComputeOptions};
use crate::identifier::ObjectType;

/// Serves one request on stdio. Returns the process exit code.
pub async fn serve_stdio(registry: &CandidateRegistry, candidate: &str) -> anyhow::Result<i32> {
    let mut raw = Vec::new();
    tokio::io::stdin().read_to_end(&mut raw).await?;

    let response = handle_request(registry, candidate, &raw).await;
    let mut line = serde_json::to_vec(&response)?;
    line.push(b'\n');

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(if response.ok { 0 } else { 1 })
}

/// Answers one raw request for `candidate`.
pub async fn handle_request(registry: &CandidateRegistry, candidate: &str, raw: &[u8]) -> Response {
    let request: Request = match serde_json::from_slice(raw) {
        Ok(request) => request,
        Err(e) => return Response::failure("INVALID_REQUEST", format!("Invalid JSON: {}", e)),
    };
    let handle = match registry.get(candidate) {
        Ok(handle) => handle,
        Err(e) => return Response::failure("UNKNOWN_CANDIDATE", e.to_string()),
    };

    match request.operation.as_str() {
        OP_COMPUTE => {
            let Some(path) = request.payload_path.map(PathBuf::from) else {
                return Response::failure("INVALID_REQUEST", "Missing payload_path");
            };
            let object_type = match request.object_type.as_deref().map(str::parse::<ObjectType>) {
                Some(Ok(t)) => t,
                Some(Err(e)) => return Response::failure("INVALID_REQUEST", e),
                None => handle.detect_object_type(&path),
            };
            let options = ComputeOptions::from_extra_options(&request.extra_options);
            debug!(candidate, object_type = %object_type, "Hosted compute");

            match handle.compute(&path, object_type, &options).await {
                Ok(identifier) => Response::success(identifier),
                Err(e) => {
                    let subtype = e.to_outcome_error().subtype;
                    Response::failure(e.code(), e.to_string()).with_subtype(subtype)
                }
            }
        }
        OP_CAPABILITIES => match serde_json::to_value(handle.capabilities()) {
            Ok(value) => Response::with_capabilities(value),
            Err(e) => Response::failure("COMPUTE_ERROR", e.to_string()),
        },
        OP_INFO => match serde_json::to_value(handle.info()) {
            Ok(value) => Response::with_info(value),
            Err(e) => Response::failure("COMPUTE_ERROR", e.to_string()),
        },
        other => Response::failure("INVALID_OPERATION", format!("Unknown operation: {}", other)),
    }
}
