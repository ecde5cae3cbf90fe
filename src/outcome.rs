//! Execution outcomes and the closed error taxonomy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identifier::IdentifierVersion;

/// Closed classification of why an execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "PARSE_ERROR")]
    Parse,
    #[serde(rename = "NORMALIZE_ERROR")]
    Normalize,
    #[serde(rename = "VALIDATION_ERROR")]
    Validate,
    #[serde(rename = "COMPUTE_ERROR")]
    Compute,
    #[serde(rename = "MISMATCH_ERROR")]
    Mismatch,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "RESOURCE_LIMIT")]
    ResourceLimit,
    #[serde(rename = "IO_ERROR")]
    Io,
}

impl ErrorKind {
    /// Wire code for the kind.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Parse => "PARSE_ERROR",
            ErrorKind::Normalize => "NORMALIZE_ERROR",
            ErrorKind::Validate => "VALIDATION_ERROR",
            ErrorKind::Compute => "COMPUTE_ERROR",
            ErrorKind::Mismatch => "MISMATCH_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ResourceLimit => "RESOURCE_LIMIT",
            ErrorKind::Io => "IO_ERROR",
        }
    }

    /// Maps a code reported by a candidate onto the closed set.
    ///
    /// Codes outside the taxonomy are treated as computation failures.
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "PARSE_ERROR" | "PARSE" => ErrorKind::Parse,
            "NORMALIZE_ERROR" | "NORMALIZE" => ErrorKind::Normalize,
            "VALIDATION_ERROR" | "VALIDATE" | "VALIDATION" => ErrorKind::Validate,
            "MISMATCH_ERROR" | "MISMATCH" => ErrorKind::Mismatch,
            "TIMEOUT" => ErrorKind::Timeout,
            "RESOURCE_LIMIT" => ErrorKind::ResourceLimit,
            "IO_ERROR" | "IO" => ErrorKind::Io,
            _ => ErrorKind::Compute,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Structured failure attached to an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub kind: ErrorKind,
    /// Free-text refinement of the kind, e.g. `wall_clock` or `file_not_found`.
    pub subtype: String,
    pub message: String,
}

impl OutcomeError {
    pub fn new(kind: ErrorKind, subtype: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            subtype: subtype.into(),
            message: truncate_string(message.into(), 4000),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            "wall_clock",
            format!("Execution exceeded {:.1}s wall-clock limit", limit.as_secs_f64()),
        )
    }

    pub fn memory_limit(limit_mb: u64) -> Self {
        Self::new(
            ErrorKind::ResourceLimit,
            "memory",
            format!("Peak resident memory exceeded {} MB", limit_mb),
        )
    }

    pub fn cpu_limit(limit_secs: u64) -> Self {
        Self::new(
            ErrorKind::ResourceLimit,
            "cpu",
            format!("CPU time exceeded {}s", limit_secs),
        )
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, "protocol_violation", message)
    }

    pub fn process_crash(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, "process_crash", message)
    }

    pub fn file_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, "file_not_found", message)
    }
}

impl std::fmt::Display for OutcomeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}: {}", self.kind, self.subtype, self.message)
    }
}

/// Terminal state of one (payload, candidate, version) execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeState {
    /// The candidate returned an identifier.
    Computed,
    /// The candidate ran and failed.
    Failed,
    /// The candidate declared it has no opinion on this payload.
    Unsupported,
    /// The payload could not be materialized, so the candidate never ran.
    Skipped,
}

impl std::fmt::Display for OutcomeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeState::Computed => write!(f, "computed"),
            OutcomeState::Failed => write!(f, "failed"),
            OutcomeState::Unsupported => write!(f, "unsupported"),
            OutcomeState::Skipped => write!(f, "skipped"),
        }
    }
}

/// Resource usage sampled during an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub wall_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_rss_kb: Option<u64>,
}

/// Result of running one candidate against one payload at one version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub payload: String,
    pub category: String,
    pub candidate: String,
    pub version: IdentifierVersion,
    pub state: OutcomeState,
    pub identifier: Option<String>,
    pub error: Option<OutcomeError>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ResourceMetrics>,
}

/// Serializes a `Duration` as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl ExecutionOutcome {
    /// Creates an outcome carrying a computed identifier.
    pub fn computed(
        payload: impl Into<String>,
        category: impl Into<String>,
        candidate: impl Into<String>,
        version: IdentifierVersion,
        identifier: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            payload: payload.into(),
            category: category.into(),
            candidate: candidate.into(),
            version,
            state: OutcomeState::Computed,
            identifier: Some(identifier.into()),
            error: None,
            duration,
            metrics: None,
        }
    }

    /// Creates a failed outcome.
    pub fn failed(
        payload: impl Into<String>,
        category: impl Into<String>,
        candidate: impl Into<String>,
        version: IdentifierVersion,
        error: OutcomeError,
        duration: Duration,
    ) -> Self {
        Self {
            payload: payload.into(),
            category: category.into(),
            candidate: candidate.into(),
            version,
            state: OutcomeState::Failed,
            identifier: None,
            error: Some(error),
            duration,
            metrics: None,
        }
    }

    /// Creates the synthetic outcome for a capability mismatch.
    pub fn unsupported(
        payload: impl Into<String>,
        category: impl Into<String>,
        candidate: impl Into<String>,
        version: IdentifierVersion,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            payload: payload.into(),
            category: category.into(),
            candidate: candidate.into(),
            version,
            state: OutcomeState::Unsupported,
            identifier: None,
            error: Some(OutcomeError::new(
                ErrorKind::Validate,
                "unsupported_type",
                reason,
            )),
            duration: Duration::ZERO,
            metrics: None,
        }
    }

    /// Creates the outcome recorded when a payload could not be materialized.
    pub fn skipped(
        payload: impl Into<String>,
        category: impl Into<String>,
        candidate: impl Into<String>,
        version: IdentifierVersion,
        error: OutcomeError,
    ) -> Self {
        Self {
            payload: payload.into(),
            category: category.into(),
            candidate: candidate.into(),
            version,
            state: OutcomeState::Skipped,
            identifier: None,
            error: Some(error),
            duration: Duration::ZERO,
            metrics: None,
        }
    }

    /// Sets the resource metrics.
    pub fn with_metrics(mut self, metrics: ResourceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_success(&self) -> bool {
        self.state == OutcomeState::Computed && self.identifier.is_some()
    }

    pub fn is_unsupported(&self) -> bool {
        self.state == OutcomeState::Unsupported
    }

    pub fn is_skipped(&self) -> bool {
        self.state == OutcomeState::Skipped
    }

    /// Key of this outcome in its verdict's outcome map.
    pub fn key(&self) -> String {
        self.version.outcome_key(&self.candidate)
    }
}

/// Truncates a string to a maximum length, respecting char boundaries.
pub(crate) fn truncate_string(s: String, max_len: usize) -> String {
    if s.len() <= max_len {
        return s;
    }
    let mut cut = max_len;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... [truncated]", &s[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_duration_serializes_as_millis() {
        let outcome = ExecutionOutcome::computed(
            "empty",
            "content",
            "git-cmd",
            IdentifierVersion::Primary,
            "swh:1:cnt:e69de29bb2d1d6434b8b29ae775ad8c2e48c5391",
            Duration::from_millis(1250),
        );
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["duration_ms"], 1250);
        assert!(json.get("duration").is_none());

        let back: ExecutionOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back.duration, Duration::from_millis(1250));
    }

    #[test]
    fn test_error_kind_from_code() {
        assert_eq!(ErrorKind::from_code("PARSE_ERROR"), ErrorKind::Parse);
        assert_eq!(ErrorKind::from_code("validation_error"), ErrorKind::Validate);
        assert_eq!(ErrorKind::from_code("TIMEOUT"), ErrorKind::Timeout);
        assert_eq!(ErrorKind::from_code("INVALID_REQUEST"), ErrorKind::Compute);
        assert_eq!(ErrorKind::from_code(""), ErrorKind::Compute);
    }

    #[test]
    fn test_error_kind_serializes_as_wire_code() {
        let json = serde_json::to_string(&ErrorKind::ResourceLimit).unwrap();
        assert_eq!(json, "\"RESOURCE_LIMIT\"");
        for kind in [ErrorKind::Parse, ErrorKind::Io, ErrorKind::Mismatch] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.code()));
        }
    }

    #[test]
    fn test_outcome_constructors() {
        let ok = ExecutionOutcome::computed(
            "empty",
            "content",
            "git-cmd",
            IdentifierVersion::Primary,
            "swh:1:cnt:e69de29bb2d1d6434b8b29ae775ad8c2e48c5391",
            Duration::from_millis(12),
        );
        assert!(ok.is_success());
        assert_eq!(ok.key(), "git-cmd");

        let unsupported = ExecutionOutcome::unsupported(
            "repo",
            "git",
            "py",
            IdentifierVersion::Secondary,
            "snapshot not supported",
        );
        assert!(unsupported.is_unsupported());
        assert!(!unsupported.is_success());
        assert_eq!(unsupported.key(), "py_v2");
        assert_eq!(unsupported.error.as_ref().unwrap().kind, ErrorKind::Validate);

        let skipped = ExecutionOutcome::skipped(
            "gone",
            "content",
            "py",
            IdentifierVersion::Primary,
            OutcomeError::file_not_found("missing"),
        );
        assert!(skipped.is_skipped());
        assert_eq!(skipped.error.unwrap().subtype, "file_not_found");
    }

    #[test]
    fn test_truncate_string_respects_char_boundaries() {
        let s = "é".repeat(10);
        let t = truncate_string(s, 5);
        assert!(t.ends_with("... [truncated]"));
        assert!(t.starts_with("éé"));
    }
}
