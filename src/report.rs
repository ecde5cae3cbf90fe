//! Run report assembly and serialization.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::candidate::CandidateInfo;
use crate::comparator::{ComparisonVerdict, Expectations, VerdictReason};
use crate::outcome::{ErrorKind, ExecutionOutcome, OutcomeState, ResourceMetrics};
use crate::scheduler::RunOutcome;

/// Serialization format of a report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// One pretty-printed JSON document.
    #[default]
    Json,
    /// One JSON object per line.
    Ndjson,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Ndjson => "ndjson",
        }
    }
}

/// Per-outcome status as reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Pass,
    Fail,
    Skipped,
}

/// Extra detail attached to mismatches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MismatchContext {
    pub got: String,
    pub expected: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportError {
    pub code: String,
    pub subtype: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<MismatchContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeEntry {
    pub candidate: String,
    pub version: u8,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swhid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ResourceMetrics>,
}

impl OutcomeEntry {
    /// Grades one outcome against the payload's expectations.
    pub fn grade(outcome: &ExecutionOutcome, expected: &Expectations) -> Self {
        let mut entry = Self {
            candidate: outcome.candidate.clone(),
            version: outcome.version.number(),
            status: TestStatus::Pass,
            swhid: outcome.identifier.clone(),
            error: outcome.error.as_ref().map(|e| ReportError {
                code: e.kind.code().to_string(),
                subtype: e.subtype.clone(),
                message: e.message.clone(),
                context: None,
            }),
            duration_ms: outcome.duration.as_millis() as u64,
            metrics: outcome.metrics,
        };

        match outcome.state {
            OutcomeState::Unsupported | OutcomeState::Skipped => {
                entry.status = TestStatus::Skipped;
            }
            OutcomeState::Failed => {
                entry.status = if expected.error.is_some() {
                    TestStatus::Pass
                } else {
                    TestStatus::Fail
                };
            }
            OutcomeState::Computed => {
                let got = outcome.identifier.clone().unwrap_or_default();
                let want = expected
                    .error
                    .as_ref()
                    .map(|e| format!("error: {}", e))
                    .or_else(|| expected.for_version(outcome.version).map(str::to_string));
                if let Some(want) = want.filter(|w| *w != got) {
                    entry.status = TestStatus::Fail;
                    entry.error = Some(ReportError {
                        code: ErrorKind::Mismatch.code().to_string(),
                        subtype: "expected_mismatch".to_string(),
                        message: format!("expected {}, got {}", want, got),
                        context: Some(MismatchContext {
                            got,
                            expected: want,
                        }),
                    });
                }
            }
        }
        entry
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictEntry {
    pub payload: String,
    pub category: String,
    pub all_agree: bool,
    #[serde(flatten)]
    pub reason: VerdictReason,
    pub expected: Expectations,
    /// Keyed like the verdict's outcome map.
    pub results: BTreeMap<String, OutcomeEntry>,
}

impl From<&ComparisonVerdict> for VerdictEntry {
    fn from(verdict: &ComparisonVerdict) -> Self {
        Self {
            payload: verdict.payload.clone(),
            category: verdict.category.clone(),
            all_agree: verdict.all_agree,
            reason: verdict.reason.clone(),
            expected: verdict.expected.clone(),
            results: verdict
                .outcomes
                .iter()
                .map(|(key, outcome)| (key.clone(), OutcomeEntry::grade(outcome, &verdict.expected)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_payloads: usize,
    pub agree: usize,
    pub disagree: usize,
    /// Payloads no candidate ever saw.
    pub skipped_payloads: usize,
    pub candidates: BTreeMap<String, CandidateSummary>,
}

impl RunSummary {
    fn tally(verdicts: &[ComparisonVerdict], entries: &[VerdictEntry]) -> Self {
        let mut summary = RunSummary {
            total_payloads: verdicts.len(),
            ..Default::default()
        };
        for verdict in verdicts {
            if verdict.all_agree {
                summary.agree += 1;
            } else {
                summary.disagree += 1;
            }
            if verdict.is_fully_skipped() {
                summary.skipped_payloads += 1;
            }
        }
        for entry in entries.iter().flat_map(|v| v.results.values()) {
            let counts = summary.candidates.entry(entry.candidate.clone()).or_default();
            match entry.status {
                TestStatus::Pass => counts.passed += 1,
                TestStatus::Fail => counts.failed += 1,
                TestStatus::Skipped => counts.skipped += 1,
            }
        }
        summary
    }
}

/// Everything a conformance run reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub candidates: Vec<CandidateInfo>,
    pub verdicts: Vec<VerdictEntry>,
    pub summary: RunSummary,
}

impl RunReport {
    pub fn from_run(run: &RunOutcome) -> Self {
        Self::from_run_at(run, Utc::now())
    }

    pub fn from_run_at(run: &RunOutcome, created_at: DateTime<Utc>) -> Self {
        let verdicts: Vec<VerdictEntry> = run.verdicts.iter().map(VerdictEntry::from).collect();
        let summary = RunSummary::tally(&run.verdicts, &verdicts);
        Self {
            run_id: generate_run_id(created_at),
            created_at,
            candidates: run.candidates.clone(),
            verdicts,
            summary,
        }
    }

    /// Process exit status: 0 when every payload agrees, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.summary.disagree == 0 {
            0
        } else {
            1
        }
    }

    pub fn render(&self, format: ReportFormat) -> serde_json::Result<String> {
        match format {
            ReportFormat::Json => serde_json::to_string_pretty(self),
            ReportFormat::Ndjson => self.to_ndjson(),
        }
    }

    /// `run_info`, one `candidate` line each, one `verdict` line each, then
    /// `summary`.
    pub fn to_ndjson(&self) -> serde_json::Result<String> {
        let mut lines = Vec::with_capacity(self.candidates.len() + self.verdicts.len() + 2);
        lines.push(tagged(
            "run_info",
            &serde_json::json!({ "run_id": self.run_id, "created_at": self.created_at }),
        )?);
        for candidate in &self.candidates {
            lines.push(tagged("candidate", candidate)?);
        }
        for verdict in &self.verdicts {
            lines.push(tagged("verdict", verdict)?);
        }
        lines.push(tagged("summary", &self.summary)?);

        let mut out = lines.join("\n");
        out.push('\n');
        Ok(out)
    }
}

fn tagged<T: Serialize>(kind: &str, value: &T) -> serde_json::Result<String> {
    let mut value = serde_json::to_value(value)?;
    if let serde_json::Value::Object(map) = &mut value {
        map.insert("type".to_string(), serde_json::Value::from(kind));
    }
    serde_json::to_string(&value)
}

/// `YYYY-MM-DDTHH-MM-SSZ_<6 hex digits>`, the suffix derived from the full
/// timestamp.
pub fn generate_run_id(at: DateTime<Utc>) -> String {
    let digest = Sha256::digest(at.to_rfc3339().as_bytes());
    let suffix = hex::encode(digest);
    format!("{}_{}", at.format("%Y-%m-%dT%H-%M-%SZ"), &suffix[..6])
}
