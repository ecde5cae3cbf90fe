//! Scheduler: drives every payload through materialization, dispatch and
//! comparison.
//!
//! ```text
//! payloads ─► Materializer ─► plan (type, versions, capabilities)
//!                  │                    │
//!                  │ failure            ▼
//!                  ▼              WorkerPool (N workers)
//!            skipped outcomes           │
//!                  └──────────┬─────────┘
//!                             ▼
//!                    reconcile per payload ─► sorted verdicts
//! ```
//!
//! Each payload moves through `Pending → Materializing → (Skipped |
//! Dispatching) → Complete`. Only the temporary directory ledger is shared
//! between payloads.

pub mod pool;

pub use pool::{Job, PoolStats, WorkerPool, WorkerPoolConfig};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::candidate::{CandidateHandle, CandidateInfo, CandidateRegistry, ComputeOptions};
use crate::comparator::{reconcile, ComparisonVerdict, Expectations};
use crate::error::OrchestratorError;
use crate::identifier::{HashAlgorithm, IdentifierVersion, ObjectType};
use crate::metrics::MetricsCollector;
use crate::outcome::{ExecutionOutcome, OutcomeError};
use crate::payload::{Materializer, Payload};
use crate::sandbox::{ExecutionRequest, SandboxExecutor, SandboxLimits};

/// Lifecycle of one payload within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadPhase {
    Pending,
    Materializing,
    Skipped,
    Dispatching,
    Complete,
}

impl std::fmt::Display for PayloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PayloadPhase::Pending => "pending",
            PayloadPhase::Materializing => "materializing",
            PayloadPhase::Skipped => "skipped",
            PayloadPhase::Dispatching => "dispatching",
            PayloadPhase::Complete => "complete",
        };
        f.write_str(name)
    }
}

fn transition(payload: &Payload, from: PayloadPhase, to: PayloadPhase) {
    debug!(
        payload = %payload.name,
        category = %payload.category,
        "{} -> {}",
        from,
        to
    );
}

/// Run-wide settings for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub parallel_tests: usize,
    /// Ask every candidate for both identifier versions.
    pub dual_version: bool,
    pub limits: SandboxLimits,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            parallel_tests: 4,
            dual_version: false,
            limits: SandboxLimits::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parallel_tests(mut self, n: usize) -> Self {
        self.parallel_tests = n;
        self
    }

    pub fn with_dual_version(mut self, dual: bool) -> Self {
        self.dual_version = dual;
        self
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Sorted by (category, payload name).
    pub verdicts: Vec<ComparisonVerdict>,
    /// Candidates that took part, sorted by name.
    pub candidates: Vec<CandidateInfo>,
    pub stats: PoolStats,
}

impl RunOutcome {
    pub fn all_agree(&self) -> bool {
        self.verdicts.iter().all(|v| v.all_agree)
    }
}

/// A payload whose inputs are ready, or the reason they are not.
struct Prepared {
    payload: Payload,
    root: Result<PathBuf, OutcomeError>,
    size_bytes: u64,
    commit: Option<String>,
}

/// Coordinates candidates, materializer, worker pool and comparator.
pub struct Orchestrator {
    registry: CandidateRegistry,
    executor: Arc<SandboxExecutor>,
    materializer: Materializer,
    config: OrchestratorConfig,
    metrics: MetricsCollector,
}

impl Orchestrator {
    pub fn new(
        registry: CandidateRegistry,
        executor: SandboxExecutor,
        materializer: Materializer,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            executor: Arc::new(executor),
            materializer,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn registry(&self) -> &CandidateRegistry {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Selected candidates whose toolchain is usable on this host.
    pub async fn available_candidates(
        &self,
        filter: Option<&[String]>,
    ) -> Vec<Arc<dyn CandidateHandle>> {
        let selected = self.registry.select(filter);
        let checks = join_all(selected.iter().map(|c| c.is_available())).await;
        selected
            .into_iter()
            .zip(checks)
            .filter_map(|(candidate, available)| {
                if !available {
                    warn!(candidate = %candidate.name(), "Candidate not available, skipping");
                }
                available.then_some(candidate)
            })
            .collect()
    }

    /// Runs `payloads` against the selected candidates.
    ///
    /// Individual payload failures never abort the run; they surface as
    /// disagreeing verdicts.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::NoCandidates` when no selected candidate is
    /// available.
    pub async fn run(
        &self,
        payloads: &[Payload],
        filter: Option<&[String]>,
    ) -> Result<RunOutcome, OrchestratorError> {
        let candidates = self.available_candidates(filter).await;
        if candidates.is_empty() {
            return Err(OrchestratorError::NoCandidates);
        }
        info!(
            candidates = candidates.len(),
            payloads = payloads.len(),
            "Starting conformance run"
        );

        let prepared = self.prepare_all(payloads).await;

        let mut maps: Vec<BTreeMap<String, ExecutionOutcome>> =
            vec![BTreeMap::new(); prepared.len()];
        let mut jobs = Vec::new();
        let mut owners = Vec::new();
        for (index, item) in prepared.iter().enumerate() {
            for candidate in &candidates {
                for planned in self.plan(item, candidate) {
                    match planned {
                        Planned::Ready(job) => {
                            jobs.push(job);
                            owners.push(index);
                        }
                        Planned::Done(outcome) => {
                            self.metrics.record_execution(&outcome);
                            maps[index].insert(outcome.key(), outcome);
                        }
                    }
                }
            }
        }

        let pool = WorkerPool::new(
            WorkerPoolConfig::new(self.config.parallel_tests).with_limits(self.config.limits.clone()),
            Arc::clone(&self.executor),
        );
        let outcomes = pool.run(jobs).await;
        for (owner, outcome) in owners.into_iter().zip(outcomes) {
            if let Some(map) = maps.get_mut(owner) {
                map.insert(outcome.key(), outcome);
            }
        }

        let mut verdicts: Vec<ComparisonVerdict> = prepared
            .into_iter()
            .zip(maps)
            .map(|(item, outcomes)| self.judge(item, outcomes))
            .collect();
        verdicts.sort_by(|a, b| (&a.category, &a.payload).cmp(&(&b.category, &b.payload)));

        let released = self.materializer.ledger().cleanup();
        if released > 0 {
            debug!("Released {} temporary directories", released);
        }

        let stats = pool.stats();
        info!(
            verdicts = verdicts.len(),
            executions = stats.total_processed(),
            success_rate = format!("{:.1}%", stats.success_rate()),
            "Conformance run finished"
        );

        let mut infos: Vec<CandidateInfo> = candidates.iter().map(|c| c.info().clone()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(RunOutcome {
            verdicts,
            candidates: infos,
            stats,
        })
    }

    /// Materializes every payload, expanding discovered refs in place.
    async fn prepare_all(&self, payloads: &[Payload]) -> Vec<Prepared> {
        let mut prepared = Vec::with_capacity(payloads.len());
        for payload in payloads {
            transition(payload, PayloadPhase::Pending, PayloadPhase::Materializing);
            match self.materializer.materialize(payload).await {
                Ok(ready) => {
                    transition(payload, PayloadPhase::Materializing, PayloadPhase::Dispatching);
                    let commit = self.commit_for(&ready.payload, &ready.root).await;
                    for derived in ready.derived {
                        let commit = self.commit_for(&derived, &ready.root).await;
                        prepared.push(Prepared {
                            payload: derived,
                            root: Ok(ready.root.clone()),
                            size_bytes: ready.size_bytes,
                            commit,
                        });
                    }
                    prepared.push(Prepared {
                        payload: ready.payload,
                        root: Ok(ready.root),
                        size_bytes: ready.size_bytes,
                        commit,
                    });
                }
                Err(e) => {
                    warn!(payload = %payload.name, error = %e, "Materialization failed");
                    self.metrics.record_materialize_failure();
                    transition(payload, PayloadPhase::Materializing, PayloadPhase::Skipped);
                    prepared.push(Prepared {
                        payload: payload.clone(),
                        root: Err(e.to_outcome_error()),
                        size_bytes: 0,
                        commit: None,
                    });
                }
            }
        }
        prepared
    }

    async fn commit_for(&self, payload: &Payload, root: &std::path::Path) -> Option<String> {
        let reference = payload.commit.as_deref()?;
        if ObjectType::from_category(&payload.category) == Some(ObjectType::Revision) {
            Some(self.materializer.resolve_commit(root, reference).await)
        } else {
            Some(reference.to_string())
        }
    }

    /// Decides what each (candidate, version) pair of a payload needs.
    fn plan(&self, item: &Prepared, candidate: &Arc<dyn CandidateHandle>) -> Vec<Planned> {
        let payload = &item.payload;
        let name = candidate.name();
        let versions = plan_versions(payload, name, self.config.dual_version);

        let root = match &item.root {
            Ok(root) => root,
            Err(error) => return versions
                .into_iter()
                .map(|(version, _)| {
                    Planned::Done(ExecutionOutcome::skipped(
                        &payload.name,
                        &payload.category,
                        name,
                        version,
                        error.clone(),
                    ))
                })
                .collect(),
        };

        let object_type = ObjectType::from_category(&payload.category)
            .unwrap_or_else(|| candidate.detect_object_type(root));
        let caps = candidate.capabilities();

        versions
            .into_iter()
            .map(|(version, hash)| {
                let unsupported = |reason: String| {
                    Planned::Done(ExecutionOutcome::unsupported(
                        &payload.name,
                        &payload.category,
                        name,
                        version,
                        reason,
                    ))
                };
                if !caps.supports_type(object_type) {
                    return unsupported(format!("object type {} not supported", object_type.code()));
                }
                if !caps.supports_version(version) {
                    return unsupported(format!(
                        "identifier version {} not supported",
                        version.number()
                    ));
                }
                if !caps.accepts_size(item.size_bytes) {
                    return unsupported(format!(
                        "payload of {} bytes exceeds {} MB",
                        item.size_bytes, caps.max_payload_size_mb
                    ));
                }

                let mut options = ComputeOptions::new(version);
                if let Some(hash) = hash {
                    options = options.with_hash(hash);
                }
                if let Some(commit) = &item.commit {
                    options = options.with_commit(commit.clone());
                }
                if let Some(tag) = &payload.tag {
                    options = options.with_tag(tag.clone());
                }
                Planned::Ready(Job::new(
                    Arc::clone(candidate),
                    ExecutionRequest {
                        payload: payload.name.clone(),
                        category: payload.category.clone(),
                        payload_path: root.clone(),
                        object_type,
                        options,
                    },
                ))
            })
            .collect()
    }

    fn judge(&self, item: Prepared, outcomes: BTreeMap<String, ExecutionOutcome>) -> ComparisonVerdict {
        let payload = item.payload;
        if item.root.is_ok() {
            transition(&payload, PayloadPhase::Dispatching, PayloadPhase::Complete);
        } else {
            transition(&payload, PayloadPhase::Skipped, PayloadPhase::Complete);
        }
        let expected = Expectations {
            primary: payload.expected_swhid.clone(),
            secondary: payload.expected_swhid_sha256.clone(),
            error: payload.expected_error.clone(),
        };
        let verdict = reconcile(&payload.name, &payload.category, outcomes, expected);
        self.metrics.record_verdict(verdict.all_agree);
        info!(
            payload = %verdict.payload,
            category = %verdict.category,
            all_agree = verdict.all_agree,
            reason = ?verdict.reason,
            "Verdict"
        );
        verdict
    }
}

enum Planned {
    Ready(Job),
    Done(ExecutionOutcome),
}

/// Identifier versions (and pinned hashes) a candidate is asked for.
pub fn plan_versions(
    payload: &Payload,
    candidate: &str,
    dual_version: bool,
) -> Vec<(IdentifierVersion, Option<HashAlgorithm>)> {
    let pin = payload.overrides.get(candidate);
    let hash = pin.and_then(|p| p.hash);
    if let Some(version) = pin.and_then(|p| p.version) {
        return vec![(version, hash)];
    }

    let primary = payload.expected_swhid.is_some();
    let secondary = payload.expected_swhid_sha256.is_some();
    if (primary && secondary) || dual_version {
        vec![
            (IdentifierVersion::Primary, hash),
            (IdentifierVersion::Secondary, hash),
        ]
    } else if secondary {
        vec![(IdentifierVersion::Secondary, hash)]
    } else {
        vec![(IdentifierVersion::Primary, hash)]
    }
}
