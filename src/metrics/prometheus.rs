//! Prometheus metrics registration and export.

use prometheus::{CounterVec, Encoder, Gauge, HistogramVec, IntCounter, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Registry holding every conformance metric.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Executions by candidate and terminal state.
pub static EXECUTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Execution wall time in seconds, labeled by candidate.
pub static EXECUTION_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Verdicts by outcome (`agree` or `disagree`).
pub static VERDICTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Executions currently running.
pub static ACTIVE_EXECUTIONS: OnceLock<Gauge> = OnceLock::new();

/// Payloads that could not be materialized.
pub static MATERIALIZE_FAILURES: OnceLock<IntCounter> = OnceLock::new();

/// Initializes and registers all metrics.
///
/// Calling it more than once is harmless: later calls build a fresh registry
/// but the statics keep the first one.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric definition is rejected.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }
    let registry = Registry::new();

    let executions_total = CounterVec::new(
        Opts::new("swhid_executions_total", "Candidate executions by terminal state"),
        &["candidate", "state"],
    )?;

    let execution_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "swhid_execution_duration_seconds",
            "Candidate execution wall time in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        &["candidate"],
    )?;

    let verdicts_total = CounterVec::new(
        Opts::new("swhid_verdicts_total", "Payload verdicts"),
        &["verdict"],
    )?;

    let active_executions = Gauge::new(
        "swhid_active_executions",
        "Number of candidate executions in flight",
    )?;

    let materialize_failures = IntCounter::new(
        "swhid_materialize_failures_total",
        "Payloads that could not be materialized",
    )?;

    registry.register(Box::new(executions_total.clone()))?;
    registry.register(Box::new(execution_duration.clone()))?;
    registry.register(Box::new(verdicts_total.clone()))?;
    registry.register(Box::new(active_executions.clone()))?;
    registry.register(Box::new(materialize_failures.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = EXECUTIONS_TOTAL.set(executions_total);
    let _ = EXECUTION_DURATION.set(execution_duration);
    let _ = VERDICTS_TOTAL.set(verdicts_total);
    let _ = ACTIVE_EXECUTIONS.set(active_executions);
    let _ = MATERIALIZE_FAILURES.set(materialize_failures);

    tracing::debug!("Prometheus metrics initialized");
    Ok(())
}

/// Renders all registered metrics in the Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }
    String::from_utf8(buffer).unwrap_or_else(|e| format!("# Error converting metrics: {}\n", e))
}
