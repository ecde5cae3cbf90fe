//! Fixed-width worker pool for candidate executions.
//!
//! Every queued job yields exactly one outcome. Workers pull jobs from a
//! shared queue and hand each outcome back over a channel. A job whose
//! execution panics is answered with an `IO_ERROR`/`worker_lost` outcome and
//! its worker moves on to the next job.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::candidate::CandidateHandle;
use crate::metrics::MetricsCollector;
use crate::outcome::{ErrorKind, ExecutionOutcome, OutcomeError};
use crate::sandbox::{ExecutionRequest, SandboxExecutor, SandboxLimits};

/// Upper bound on pool width.
pub const MAX_WORKERS: usize = 32;

/// One (payload, candidate, version) execution waiting for a worker.
#[derive(Clone)]
pub struct Job {
    pub candidate: Arc<dyn CandidateHandle>,
    pub request: ExecutionRequest,
}

impl Job {
    pub fn new(candidate: Arc<dyn CandidateHandle>, request: ExecutionRequest) -> Self {
        Self { candidate, request }
    }

    fn lost(&self) -> ExecutionOutcome {
        ExecutionOutcome::failed(
            &self.request.payload,
            &self.request.category,
            self.candidate.name(),
            self.request.options.version,
            OutcomeError::new(
                ErrorKind::Io,
                "worker_lost",
                "worker terminated before reporting an outcome",
            ),
            Duration::ZERO,
        )
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("candidate", &self.candidate.name())
            .field("request", &self.request)
            .finish()
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks, clamped to `1..=MAX_WORKERS`.
    pub num_workers: usize,
    /// Limits applied to every execution.
    pub limits: SandboxLimits,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            limits: SandboxLimits::default(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    fn width(&self) -> usize {
        self.num_workers.clamp(1, MAX_WORKERS)
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub num_workers: usize,
    /// Executions that produced an identifier.
    pub jobs_computed: u64,
    /// Executions that ended in any other state.
    pub jobs_other: u64,
    /// Jobs answered with a `worker_lost` outcome.
    pub jobs_lost: u64,
    pub average_job_duration: Duration,
}

impl PoolStats {
    pub fn total_processed(&self) -> u64 {
        self.jobs_computed + self.jobs_other + self.jobs_lost
    }

    /// Share of executions that computed an identifier, in percent.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_computed as f64 / total as f64) * 100.0
    }
}

#[derive(Default)]
struct SharedPoolStats {
    jobs_computed: AtomicU64,
    jobs_other: AtomicU64,
    jobs_lost: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedPoolStats {
    fn record(&self, outcome: &ExecutionOutcome) {
        if outcome.is_success() {
            self.jobs_computed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.jobs_other.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms
            .fetch_add(outcome.duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let computed = self.jobs_computed.load(Ordering::SeqCst);
        let other = self.jobs_other.load(Ordering::SeqCst);
        let lost = self.jobs_lost.load(Ordering::SeqCst);
        let timed = computed + other;
        let average_job_duration = if timed > 0 {
            Duration::from_millis(self.total_duration_ms.load(Ordering::SeqCst) / timed)
        } else {
            Duration::ZERO
        };
        PoolStats {
            num_workers,
            jobs_computed: computed,
            jobs_other: other,
            jobs_lost: lost,
            average_job_duration,
        }
    }
}

/// Decrements the active gauge even if the execution unwinds.
struct ActiveGuard(MetricsCollector);

impl ActiveGuard {
    fn enter(metrics: MetricsCollector) -> Self {
        metrics.inc_active();
        Self(metrics)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.dec_active();
    }
}

type JobQueue = Arc<Mutex<mpsc::UnboundedReceiver<(usize, Job)>>>;

/// Runs batches of jobs on a fixed number of workers.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    executor: Arc<SandboxExecutor>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, executor: Arc<SandboxExecutor>) -> Self {
        Self {
            config,
            executor,
            stats: Arc::new(SharedPoolStats::default()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.config.width()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.num_workers())
    }

    /// Runs every job and returns the outcomes in job order.
    pub async fn run(&self, jobs: Vec<Job>) -> Vec<ExecutionOutcome> {
        if jobs.is_empty() {
            return Vec::new();
        }
        let fallbacks: Vec<ExecutionOutcome> = jobs.iter().map(Job::lost).collect();
        let width = self.num_workers().min(jobs.len());

        let (job_tx, job_rx) = mpsc::unbounded_channel();
        for entry in jobs.into_iter().enumerate() {
            // The receiver is alive until the workers below finish.
            let _ = job_tx.send(entry);
        }
        drop(job_tx);
        let queue: JobQueue = Arc::new(Mutex::new(job_rx));

        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        let mut handles = Vec::with_capacity(width);
        for i in 0..width {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&queue),
                results: result_tx.clone(),
                executor: Arc::clone(&self.executor),
                limits: self.config.limits.clone(),
                stats: Arc::clone(&self.stats),
                metrics: self.metrics,
            };
            handles.push(tokio::spawn(worker.run()));
        }
        drop(result_tx);
        info!(num_workers = width, jobs = fallbacks.len(), "Worker pool started");

        let mut slots: Vec<Option<ExecutionOutcome>> = vec![None; fallbacks.len()];
        while let Some((index, outcome)) = result_rx.recv().await {
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(outcome);
            }
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }

        slots
            .into_iter()
            .zip(fallbacks)
            .map(|(slot, fallback)| {
                slot.unwrap_or_else(|| {
                    self.stats.jobs_lost.fetch_add(1, Ordering::SeqCst);
                    error!(
                        payload = %fallback.payload,
                        candidate = %fallback.candidate,
                        "Job lost with its worker"
                    );
                    fallback
                })
            })
            .collect()
    }
}

struct Worker {
    id: String,
    queue: JobQueue,
    results: mpsc::UnboundedSender<(usize, ExecutionOutcome)>,
    executor: Arc<SandboxExecutor>,
    limits: SandboxLimits,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    async fn run(self) {
        debug!(worker_id = %self.id, "Worker started");
        loop {
            let next = self.queue.lock().await.recv().await;
            let Some((index, job)) = next else {
                break;
            };

            let executed = {
                let _active = ActiveGuard::enter(self.metrics);
                AssertUnwindSafe(self.executor.execute(
                    job.candidate.as_ref(),
                    &job.request,
                    &self.limits,
                ))
                .catch_unwind()
                .await
            };
            let outcome = match executed {
                Ok(outcome) => {
                    self.stats.record(&outcome);
                    outcome
                }
                Err(_) => {
                    self.stats.jobs_lost.fetch_add(1, Ordering::SeqCst);
                    error!(
                        worker_id = %self.id,
                        payload = %job.request.payload,
                        candidate = %job.candidate.name(),
                        "Execution panicked"
                    );
                    job.lost()
                }
            };
            self.metrics.record_execution(&outcome);
            if self.results.send((index, outcome)).is_err() {
                break;
            }
        }
        debug!(worker_id = %self.id, "Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{CandidateCapabilities, CandidateInfo, ComputeOptions};
    use crate::error::CandidateError;
    use crate::identifier::{IdentifierVersion, ObjectType};
    use crate::sandbox::IsolationMode;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicUsize;

    const EMPTY: &str = "swh:1:cnt:e69de29bb2d1d6434b8b29ae775ad8c2e48c5391";

    struct Recorder {
        info: CandidateInfo,
        caps: CandidateCapabilities,
        running: AtomicUsize,
        peak: AtomicUsize,
        panic_on: Option<String>,
    }

    impl Recorder {
        fn new(name: &str) -> Self {
            Self {
                info: CandidateInfo::new(name),
                caps: CandidateCapabilities::default(),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                panic_on: None,
            }
        }
    }

    #[async_trait]
    impl CandidateHandle for Recorder {
        fn info(&self) -> &CandidateInfo {
            &self.info
        }

        fn capabilities(&self) -> &CandidateCapabilities {
            &self.caps
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn compute(
            &self,
            payload: &Path,
            _object_type: ObjectType,
            _options: &ComputeOptions,
        ) -> Result<String, CandidateError> {
            if self.panic_on.as_deref() == payload.to_str() {
                panic!("asked to panic");
            }
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(EMPTY.to_string())
        }
    }

    fn job(candidate: &Arc<Recorder>, payload: &str) -> Job {
        let handle: Arc<dyn CandidateHandle> = Arc::clone(candidate) as Arc<dyn CandidateHandle>;
        Job::new(
            handle,
            ExecutionRequest {
                payload: payload.to_string(),
                category: "content".to_string(),
                payload_path: PathBuf::from(payload),
                object_type: ObjectType::Content,
                options: ComputeOptions::new(IdentifierVersion::Primary),
            },
        )
    }

    fn pool(width: usize) -> WorkerPool {
        WorkerPool::new(
            WorkerPoolConfig::new(width),
            Arc::new(SandboxExecutor::new(IsolationMode::InProcess)),
        )
    }

    #[tokio::test]
    async fn test_outcomes_keep_job_order() {
        let recorder = Arc::new(Recorder::new("recorder"));
        let jobs: Vec<Job> = (0..10).map(|i| job(&recorder, &format!("p{}", i))).collect();

        let pool = pool(3);
        let outcomes = pool.run(jobs).await;
        let names: Vec<&str> = outcomes.iter().map(|o| o.payload.as_str()).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("p{}", i)).collect();
        assert_eq!(names, expected);
        assert!(outcomes.iter().all(ExecutionOutcome::is_success));

        let stats = pool.stats();
        assert_eq!(stats.total_processed(), 10);
        assert_eq!(stats.success_rate(), 100.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_width_bounds_concurrency() {
        let recorder = Arc::new(Recorder::new("recorder"));
        let jobs: Vec<Job> = (0..12).map(|i| job(&recorder, &format!("p{}", i))).collect();

        pool(2).run(jobs).await;
        assert!(recorder.peak.load(Ordering::SeqCst) <= 2);
        assert!(recorder.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_panicking_execution_yields_worker_lost() {
        let mut recorder = Recorder::new("fragile");
        recorder.panic_on = Some("boom".to_string());
        let recorder = Arc::new(recorder);
        let jobs = vec![job(&recorder, "a"), job(&recorder, "boom"), job(&recorder, "b")];

        let pool = pool(1);
        let outcomes = pool.run(jobs).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_success());
        let lost = outcomes[1].error.as_ref().unwrap();
        assert_eq!(lost.kind, ErrorKind::Io);
        assert_eq!(lost.subtype, "worker_lost");
        // The single worker survives the panic and still runs the third job.
        assert!(outcomes[2].is_success());
        assert_eq!(pool.stats().jobs_lost, 1);
        assert_eq!(pool.stats().total_processed(), 3);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        assert!(pool(4).run(Vec::new()).await.is_empty());
    }

    #[test]
    fn test_width_is_clamped() {
        assert_eq!(WorkerPoolConfig::new(0).width(), 1);
        assert_eq!(WorkerPoolConfig::new(100).width(), MAX_WORKERS);
    }
}
