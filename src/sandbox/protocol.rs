//! The stdio request/response protocol spoken with candidate processes.
//!
//! The harness writes exactly one JSON request to the child's stdin and
//! closes it. The child writes exactly one JSON response to stdout.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::candidate::ComputeOptions;
use crate::identifier::ObjectType;

pub const OP_COMPUTE: &str = "compute";
pub const OP_CAPABILITIES: &str = "capabilities";
pub const OP_INFO: &str = "info";

/// Request sent to a candidate process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(default)]
    pub extra_options: BTreeMap<String, serde_json::Value>,
}

impl Request {
    /// Builds a compute request.
    pub fn compute(payload_path: &Path, object_type: ObjectType, options: &ComputeOptions) -> Self {
        Self {
            operation: OP_COMPUTE.to_string(),
            payload_path: Some(payload_path.to_string_lossy().into_owned()),
            object_type: Some(object_type.as_str().to_string()),
            extra_options: options.to_extra_options(),
        }
    }

    /// Builds a request for an operation without a payload.
    pub fn operation(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            payload_path: None,
            object_type: None,
            extra_options: BTreeMap::new(),
        }
    }
}

/// Error object inside a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    pub message: String,
    #[serde(default)]
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
}

/// Response read back from a candidate process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, alias = "swhid", skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
}

impl Response {
    pub fn success(result: impl Into<String>) -> Self {
        Self {
            ok: true,
            result: Some(result.into()),
            error: None,
            capabilities: None,
            info: None,
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ResponseError {
                message: message.into(),
                code: code.into(),
                subtype: None,
            }),
            capabilities: None,
            info: None,
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.subtype = Some(subtype.into());
        }
        self
    }

    pub fn with_capabilities(value: serde_json::Value) -> Self {
        Self {
            ok: true,
            result: None,
            error: None,
            capabilities: Some(value),
            info: None,
        }
    }

    pub fn with_info(value: serde_json::Value) -> Self {
        Self {
            ok: true,
            result: None,
            error: None,
            capabilities: None,
            info: Some(value),
        }
    }

    /// True when the error code marks the payload as outside the candidate's scope.
    pub fn is_unsupported(&self) -> bool {
        self.error.as_ref().is_some_and(|e| {
            matches!(
                e.code.trim().to_ascii_uppercase().as_str(),
                "UNSUPPORTED" | "UNSUPPORTED_TYPE"
            )
        })
    }
}

/// Decodes the single response expected on a child's stdout.
///
/// Returns a description of the violation when stdout is empty, not JSON, or
/// holds more than one JSON value.
pub fn decode_response(stdout: &[u8]) -> Result<Response, String> {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("no response on stdout".to_string());
    }

    let mut stream = serde_json::Deserializer::from_str(trimmed).into_iter::<Response>();
    let response = match stream.next() {
        Some(Ok(response)) => response,
        Some(Err(e)) => return Err(format!("malformed response: {}", e)),
        None => return Err("no response on stdout".to_string()),
    };
    if stream.next().is_some() {
        return Err("more than one response on stdout".to_string());
    }
    Ok(response)
}
