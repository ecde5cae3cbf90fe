//! Recording facade over the raw Prometheus metrics.

use super::prometheus::{
    ACTIVE_EXECUTIONS, EXECUTIONS_TOTAL, EXECUTION_DURATION, MATERIALIZE_FAILURES, VERDICTS_TOTAL,
};
use crate::outcome::ExecutionOutcome;

/// Records conformance run metrics.
///
/// Every method is a no-op until [`init_metrics`](super::init_metrics) has
/// run, so library users that never export metrics pay nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Records a finished execution under its candidate and state.
    pub fn record_execution(&self, outcome: &ExecutionOutcome) {
        let state = outcome.state.to_string();
        if let Some(total) = EXECUTIONS_TOTAL.get() {
            total
                .with_label_values(&[outcome.candidate.as_str(), state.as_str()])
                .inc();
        }
        if let Some(duration) = EXECUTION_DURATION.get() {
            duration
                .with_label_values(&[outcome.candidate.as_str()])
                .observe(outcome.duration.as_secs_f64());
        }

        tracing::trace!(
            candidate = %outcome.candidate,
            state = %state,
            duration_ms = outcome.duration.as_millis() as u64,
            "Recorded execution metric"
        );
    }

    pub fn record_verdict(&self, all_agree: bool) {
        let verdict = if all_agree { "agree" } else { "disagree" };
        if let Some(total) = VERDICTS_TOTAL.get() {
            total.with_label_values(&[verdict]).inc();
        }
    }

    pub fn record_materialize_failure(&self) {
        if let Some(failures) = MATERIALIZE_FAILURES.get() {
            failures.inc();
        }
    }

    pub fn inc_active(&self) {
        if let Some(active) = ACTIVE_EXECUTIONS.get() {
            active.inc();
        }
    }

    pub fn dec_active(&self) {
        if let Some(active) = ACTIVE_EXECUTIONS.get() {
            active.dec();
        }
    }
}
