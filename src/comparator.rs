//! Reduces the outcomes for one payload to a single verdict.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::identifier::IdentifierVersion;
use crate::outcome::ExecutionOutcome;

/// Expected values a payload declares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expectations {
    pub primary: Option<String>,
    pub secondary: Option<String>,
    pub error: Option<String>,
}

impl Expectations {
    pub fn for_version(&self, version: IdentifierVersion) -> Option<&str> {
        match version {
            IdentifierVersion::Primary => self.primary.as_deref(),
            IdentifierVersion::Secondary => self.secondary.as_deref(),
        }
    }
}

/// Why a verdict came out the way it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum VerdictReason {
    /// Every candidate computed the same identifier per version.
    Agreement,
    /// No candidate had an opinion.
    AllUnsupported,
    /// Negative test rejected by every candidate that ran.
    CorrectRejection,
    /// The payload never reached the candidates.
    NotMaterialized,
    /// At least one supporting candidate failed.
    CandidateFailed { candidates: Vec<String> },
    /// Candidates produced different identifiers.
    Divergent { version: IdentifierVersion },
    /// Candidates agree with each other but not with the reference value.
    ExpectedMismatch {
        version: IdentifierVersion,
        expected: String,
        got: String,
    },
}

/// Reconciled result for one payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonVerdict {
    pub payload: String,
    pub category: String,
    /// Keyed by candidate name, with a `_v2` suffix for secondary outcomes.
    pub outcomes: BTreeMap<String, ExecutionOutcome>,
    pub all_agree: bool,
    #[serde(flatten)]
    pub reason: VerdictReason,
    pub expected: Expectations,
}

impl ComparisonVerdict {
    /// True when every outcome was skipped because the payload was missing.
    pub fn is_fully_skipped(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.values().all(ExecutionOutcome::is_skipped)
    }
}

/// Decides whether the outcome set agrees.
///
/// Rules, in order:
/// 1. a skipped outcome means the payload never ran: disagree;
/// 2. nothing supported: agree;
/// 3. negative test where every supporting candidate failed: agree;
/// 4. any supporting failure: disagree;
/// 5. per version, identifiers must form a singleton equal to the expected
///    value when one is set.
pub fn reconcile(
    payload: impl Into<String>,
    category: impl Into<String>,
    outcomes: BTreeMap<String, ExecutionOutcome>,
    expected: Expectations,
) -> ComparisonVerdict {
    let reason = judge(&outcomes, &expected);
    ComparisonVerdict {
        payload: payload.into(),
        category: category.into(),
        all_agree: matches!(
            reason,
            VerdictReason::Agreement | VerdictReason::AllUnsupported | VerdictReason::CorrectRejection
        ),
        outcomes,
        reason,
        expected,
    }
}

fn judge(outcomes: &BTreeMap<String, ExecutionOutcome>, expected: &Expectations) -> VerdictReason {
    if outcomes.values().any(ExecutionOutcome::is_skipped) {
        return VerdictReason::NotMaterialized;
    }

    let supporting: Vec<(&String, &ExecutionOutcome)> = outcomes
        .iter()
        .filter(|(_, outcome)| !outcome.is_unsupported())
        .collect();
    if supporting.is_empty() {
        return VerdictReason::AllUnsupported;
    }

    if expected.error.is_some() && supporting.iter().all(|(_, o)| !o.is_success()) {
        return VerdictReason::CorrectRejection;
    }

    let failed: Vec<String> = supporting
        .iter()
        .filter(|(_, o)| !o.is_success())
        .map(|(key, _)| (*key).clone())
        .collect();
    if !failed.is_empty() {
        return VerdictReason::CandidateFailed { candidates: failed };
    }

    let mut by_version: BTreeMap<IdentifierVersion, BTreeSet<&str>> = BTreeMap::new();
    for (_, outcome) in &supporting {
        if let Some(identifier) = outcome.identifier.as_deref() {
            by_version.entry(outcome.version).or_default().insert(identifier);
        }
    }

    for (version, identifiers) in &by_version {
        if identifiers.len() != 1 {
            return VerdictReason::Divergent { version: *version };
        }
        if let (Some(want), Some(got)) = (expected.for_version(*version), identifiers.first()) {
            if want != *got {
                return VerdictReason::ExpectedMismatch {
                    version: *version,
                    expected: want.to_string(),
                    got: got.to_string(),
                };
            }
        }
    }
    VerdictReason::Agreement
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{ErrorKind, OutcomeError};
    use std::time::Duration;

    const A: &str = "swh:1:cnt:e69de29bb2d1d6434b8b29ae775ad8c2e48c5391";
    const B: &str = "swh:1:cnt:8ab686eafeb1f44702738c8b0f24f2567c36da6d";
    const A2: &str = "swh:2:cnt:473a0f4c3be8a93681a267e3b1e9a7dcda1185436fe141f7749120a303721813";

    fn ok(candidate: &str, id: &str) -> ExecutionOutcome {
        let version = IdentifierVersion::of(id).unwrap();
        ExecutionOutcome::computed("p", "content", candidate, version, id, Duration::from_millis(1))
    }

    fn fail(candidate: &str) -> ExecutionOutcome {
        ExecutionOutcome::failed(
            "p",
            "content",
            candidate,
            IdentifierVersion::Primary,
            OutcomeError::new(ErrorKind::Validate, "invalid", "rejected"),
            Duration::from_millis(1),
        )
    }

    fn unsupported(candidate: &str) -> ExecutionOutcome {
        ExecutionOutcome::unsupported("p", "content", candidate, IdentifierVersion::Primary, "no")
    }

    fn map(outcomes: Vec<ExecutionOutcome>) -> BTreeMap<String, ExecutionOutcome> {
        outcomes.into_iter().map(|o| (o.key(), o)).collect()
    }

    fn verdict(outcomes: Vec<ExecutionOutcome>, expected: Expectations) -> ComparisonVerdict {
        reconcile("p", "content", map(outcomes), expected)
    }

    #[test]
    fn test_agreement_with_expected() {
        let v = verdict(
            vec![ok("a", A), ok("b", A)],
            Expectations {
                primary: Some(A.to_string()),
                ..Default::default()
            },
        );
        assert!(v.all_agree);
        assert_eq!(v.reason, VerdictReason::Agreement);
    }

    #[test]
    fn test_all_unsupported_agrees() {
        let v = verdict(vec![unsupported("a"), unsupported("b")], Expectations::default());
        assert!(v.all_agree);
        assert_eq!(v.reason, VerdictReason::AllUnsupported);
    }

    #[test]
    fn test_unsupported_candidates_are_ignored() {
        let v = verdict(vec![ok("a", A), unsupported("b")], Expectations::default());
        assert!(v.all_agree);
    }

    #[test]
    fn test_negative_test_law() {
        let negative = Expectations {
            error: Some("invalid".to_string()),
            ..Default::default()
        };
        let v = verdict(vec![fail("a"), fail("b"), unsupported("c")], negative.clone());
        assert!(v.all_agree);
        assert_eq!(v.reason, VerdictReason::CorrectRejection);

        let v = verdict(vec![fail("a"), ok("b", A)], negative);
        assert!(!v.all_agree);
        assert_eq!(
            v.reason,
            VerdictReason::CandidateFailed {
                candidates: vec!["a".to_string()]
            }
        );
    }

    #[test]
    fn test_any_failure_disagrees() {
        let v = verdict(vec![ok("a", A), fail("b")], Expectations::default());
        assert!(!v.all_agree);
    }

    #[test]
    fn test_divergent_identifiers() {
        let v = verdict(vec![ok("a", A), ok("b", B)], Expectations::default());
        assert!(!v.all_agree);
        assert_eq!(
            v.reason,
            VerdictReason::Divergent {
                version: IdentifierVersion::Primary
            }
        );
    }

    #[test]
    fn test_expected_value_law() {
        let v = verdict(
            vec![ok("a", B), ok("b", B)],
            Expectations {
                primary: Some(A.to_string()),
                ..Default::default()
            },
        );
        assert!(!v.all_agree);
        assert!(matches!(v.reason, VerdictReason::ExpectedMismatch { .. }));
    }

    #[test]
    fn test_versions_are_compared_separately() {
        let v = verdict(
            vec![ok("a", A), ok("a", A2), ok("b", A), ok("b", A2)],
            Expectations {
                primary: Some(A.to_string()),
                secondary: Some(A2.to_string()),
                error: None,
            },
        );
        assert_eq!(v.outcomes.len(), 4);
        assert!(v.outcomes.contains_key("a_v2"));
        assert!(v.all_agree);
    }

    #[test]
    fn test_skipped_payload_disagrees() {
        let skipped = ExecutionOutcome::skipped(
            "p",
            "content",
            "a",
            IdentifierVersion::Primary,
            OutcomeError::file_not_found("missing"),
        );
        let v = verdict(
            vec![skipped],
            Expectations {
                error: Some("anything".to_string()),
                ..Default::default()
            },
        );
        assert!(!v.all_agree);
        assert_eq!(v.reason, VerdictReason::NotMaterialized);
        assert!(v.is_fully_skipped());
    }

    #[test]
    fn test_empty_outcome_set_agrees() {
        let v = verdict(vec![], Expectations::default());
        assert!(v.all_agree);
    }

    #[test]
    fn test_verdict_serializes_reason_inline() {
        let v = verdict(vec![ok("a", A)], Expectations::default());
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["reason"], "agreement");
        assert_eq!(json["all_agree"], true);
    }
}
