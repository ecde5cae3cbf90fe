//! Sandboxed execution of one candidate against one payload.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::limits::{apply_rlimits, SandboxLimits};
use super::probe;
use super::protocol::{decode_response, Request, Response};
use super::SandboxError;
use crate::candidate::{CandidateHandle, CommandSpec, ComputeOptions, Launch};
use crate::identifier::{parse_identifier, ObjectType};
use crate::outcome::{ErrorKind, ExecutionOutcome, OutcomeError, ResourceMetrics};

/// Variables copied from the orchestrator into the child when present.
const INHERITED_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "PYTHONPATH",
    "PYTHONHOME",
    "LD_LIBRARY_PATH",
    "GEM_PATH",
    "GEM_HOME",
    "GOPATH",
    "GOCACHE",
    "CARGO_HOME",
    "RUSTUP_HOME",
    "JAVA_HOME",
    "NODE_PATH",
    "PERL5LIB",
    "RUST_LOG",
];

/// Cap on captured stdout and stderr.
const MAX_CAPTURE_BYTES: u64 = 16 * 1024 * 1024;

/// How a candidate is isolated from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Child process with resource limits.
    #[default]
    Subprocess,
    /// Direct call under a wall-clock timeout. Memory and CPU are not enforced.
    InProcess,
}

/// Everything the adapter needs to run one execution.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub payload: String,
    pub category: String,
    pub payload_path: PathBuf,
    pub object_type: ObjectType,
    pub options: ComputeOptions,
}

/// Why a child execution produced no identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildFailure {
    Unsupported(String),
    Error(OutcomeError),
}

/// Result of one protocol exchange with a child.
#[derive(Debug, Clone)]
pub struct ChildRun {
    pub result: Result<String, ChildFailure>,
    pub metrics: ResourceMetrics,
}

impl ChildRun {
    fn failed(error: OutcomeError, started: Instant) -> Self {
        Self {
            result: Err(ChildFailure::Error(error)),
            metrics: ResourceMetrics {
                wall_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            },
        }
    }

    fn into_outcome(self, request: &ExecutionRequest, candidate: &str) -> ExecutionOutcome {
        let duration = Duration::from_millis(self.metrics.wall_ms);
        let version = request.options.version;
        let outcome = match self.result {
            Ok(identifier) => ExecutionOutcome::computed(
                &request.payload,
                &request.category,
                candidate,
                version,
                identifier,
                duration,
            ),
            Err(ChildFailure::Unsupported(reason)) => {
                let mut outcome = ExecutionOutcome::unsupported(
                    &request.payload,
                    &request.category,
                    candidate,
                    version,
                    reason,
                );
                outcome.duration = duration;
                outcome
            }
            Err(ChildFailure::Error(error)) => ExecutionOutcome::failed(
                &request.payload,
                &request.category,
                candidate,
                version,
                error,
                duration,
            ),
        };
        outcome.with_metrics(self.metrics)
    }
}

/// Runs candidates in isolation and translates everything into outcomes.
///
/// The executor holds no per-call state, so one instance is shared by every
/// worker of a run.
#[derive(Debug, Clone, Default)]
pub struct SandboxExecutor {
    mode: IsolationMode,
    worker_host: Option<CommandSpec>,
}

impl SandboxExecutor {
    pub fn new(mode: IsolationMode) -> Self {
        Self {
            mode,
            worker_host: None,
        }
    }

    /// Sets the command that hosts in-binary candidates in a child process.
    pub fn with_worker_host(mut self, host: CommandSpec) -> Self {
        self.worker_host = Some(host);
        self
    }

    /// Uses the running executable's `worker` subcommand as host.
    pub fn with_current_exe_host(self) -> std::io::Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(self.with_worker_host(CommandSpec::new(exe).with_args(["worker"])))
    }

    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    /// Runs `candidate` on the request and returns exactly one outcome.
    pub async fn execute(
        &self,
        candidate: &dyn CandidateHandle,
        request: &ExecutionRequest,
        limits: &SandboxLimits,
    ) -> ExecutionOutcome {
        let name = candidate.name().to_string();
        let run = match self.mode {
            IsolationMode::Subprocess => match self.launch_spec(candidate) {
                Ok(spec) => {
                    let wire = Request::compute(
                        &request.payload_path,
                        request.object_type,
                        &request.options,
                    );
                    run_child(&spec, &wire, limits).await
                }
                Err(e) => ChildRun::failed(e.to_outcome_error(), Instant::now()),
            },
            IsolationMode::InProcess => run_in_process(candidate, request, limits).await,
        };
        debug!(
            payload = %request.payload,
            candidate = %name,
            version = %request.options.version,
            wall_ms = run.metrics.wall_ms,
            "Execution finished"
        );
        run.into_outcome(request, &name)
    }

    fn launch_spec(&self, candidate: &dyn CandidateHandle) -> Result<CommandSpec, SandboxError> {
        match candidate.launch() {
            Launch::Command(spec) => Ok(spec),
            Launch::Hosted => {
                let host = self
                    .worker_host
                    .clone()
                    .ok_or_else(|| SandboxError::NoWorkerHost(candidate.name().to_string()))?;
                Ok(host.with_args(["--candidate", candidate.name()]))
            }
        }
    }
}

async fn run_in_process(
    candidate: &dyn CandidateHandle,
    request: &ExecutionRequest,
    limits: &SandboxLimits,
) -> ChildRun {
    let started = Instant::now();
    let computed = tokio::time::timeout(
        limits.timeout,
        candidate.compute(&request.payload_path, request.object_type, &request.options),
    )
    .await;

    let result = match computed {
        Ok(Ok(identifier)) => validate_identifier(identifier),
        Ok(Err(e)) if e.is_unsupported() => Err(ChildFailure::Unsupported(e.to_string())),
        Ok(Err(e)) => Err(ChildFailure::Error(e.to_outcome_error())),
        Err(_) => Err(ChildFailure::Error(OutcomeError::timeout(limits.timeout))),
    };
    ChildRun {
        result,
        metrics: ResourceMetrics {
            wall_ms: started.elapsed().as_millis() as u64,
            ..Default::default()
        },
    }
}

/// Spawns `spec`, performs one protocol exchange and enforces `limits`.
pub async fn run_child(spec: &CommandSpec, request: &Request, limits: &SandboxLimits) -> ChildRun {
    let started = Instant::now();
    let invocation = Uuid::new_v4();

    let body = match serde_json::to_vec(request) {
        Ok(body) => body,
        Err(e) => return ChildRun::failed(SandboxError::Encode(e).to_outcome_error(), started),
    };
    let workdir = match tempfile::Builder::new().prefix("swhid_impl_").tempdir() {
        Ok(dir) => dir,
        Err(e) => return ChildRun::failed(SandboxError::Setup(e).to_outcome_error(), started),
    };

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(workdir.path())
        .env_clear()
        .envs(child_env(workdir.path(), &spec.env))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let address_space = limits.address_space_bytes();
    let cpu_secs = limits.max_cpu_secs;
    // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || apply_rlimits(address_space, cpu_secs));
    }

    debug!(
        invocation = %invocation,
        program = %spec.program.display(),
        "Spawning candidate process"
    );
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let err = SandboxError::Spawn {
                program: spec.program.display().to_string(),
                source: e,
            };
            return ChildRun::failed(err.to_outcome_error(), started);
        }
    };
    let pid = child.id();

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            // A child that exits without reading its request is judged by its exit status.
            if stdin.write_all(&body).await.is_ok() {
                let _ = stdin.shutdown().await;
            }
        });
    }
    let stdout_task = child.stdout.take().map(capture);
    let stderr_task = child.stderr.take().map(capture);

    let mut peak_rss_kb: Option<u64> = None;
    let mut peak_virtual_kb: Option<u64> = None;
    let mut cpu_ms: Option<u64> = None;
    let deadline = tokio::time::sleep(limits.timeout);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(limits.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let exit = loop {
        tokio::select! {
            status = child.wait() => break Exit::Finished(status),
            _ = &mut deadline => break Exit::Breach(OutcomeError::timeout(limits.timeout)),
            _ = ticker.tick() => {
                let Some(pid) = pid else { continue };
                let sample = probe::sample(pid);
                if let Some(kb) = sample.memory_kb() {
                    peak_rss_kb = Some(peak_rss_kb.map_or(kb, |p| p.max(kb)));
                }
                if let Some(kb) = sample.peak_virtual_kb {
                    peak_virtual_kb = Some(peak_virtual_kb.map_or(kb, |p| p.max(kb)));
                }
                if sample.cpu_ms.is_some() {
                    cpu_ms = sample.cpu_ms;
                }
                if peak_rss_kb.is_some_and(|kb| kb > limits.memory_limit_kb()) {
                    break Exit::Breach(OutcomeError::memory_limit(limits.max_memory_mb));
                }
                if limits.max_cpu_secs > 0 && cpu_ms.is_some_and(|ms| ms > limits.cpu_limit_ms()) {
                    break Exit::Breach(OutcomeError::cpu_limit(limits.max_cpu_secs));
                }
            }
        }
    };

    if let Exit::Breach(ref error) = exit {
        warn!(invocation = %invocation, "Terminating candidate process: {}", error);
        terminate(&mut child, pid, limits.grace_period).await;
    } else if let Some(pid) = pid {
        // Reap anything the candidate left running in its group.
        signal_group(pid, Signal::SIGKILL);
    }

    let stdout = collect(stdout_task, limits.grace_period).await;
    let stderr = collect(stderr_task, limits.grace_period).await;
    let metrics = ResourceMetrics {
        wall_ms: started.elapsed().as_millis() as u64,
        cpu_ms,
        peak_rss_kb,
    };

    let result = match exit {
        Exit::Breach(error) => Err(ChildFailure::Error(error)),
        Exit::Finished(Err(e)) => Err(ChildFailure::Error(OutcomeError::new(
            ErrorKind::Io,
            "wait_failed",
            e.to_string(),
        ))),
        Exit::Finished(Ok(status)) => {
            interpret(status, &stdout, &stderr, limits, peak_virtual_kb)
        }
    };
    ChildRun { result, metrics }
}

enum Exit {
    Finished(std::io::Result<ExitStatus>),
    Breach(OutcomeError),
}

/// Judges a child that exited on its own.
///
/// With the address-space cap enabled, a child that dies without a response
/// after its virtual size grew past the memory ceiling ran into the cap and
/// is reported as a memory breach.
fn interpret(
    status: ExitStatus,
    stdout: &[u8],
    stderr: &[u8],
    limits: &SandboxLimits,
    peak_virtual_kb: Option<u64>,
) -> Result<String, ChildFailure> {
    if status.signal() == Some(Signal::SIGXCPU as i32) {
        return Err(ChildFailure::Error(OutcomeError::cpu_limit(limits.max_cpu_secs)));
    }
    let address_space_reached = limits.address_space_bytes().is_some()
        && peak_virtual_kb.is_some_and(|kb| kb > limits.memory_limit_kb());

    match decode_response(stdout) {
        Ok(response) if response.ok && !status.success() => Err(ChildFailure::Error(
            OutcomeError::process_crash(format!(
                "{} after reporting success: {}",
                describe_status(status),
                stderr_tail(stderr)
            )),
        )),
        Ok(response) => translate(response),
        Err(_) if !status.success() && address_space_reached => Err(ChildFailure::Error(
            OutcomeError::memory_limit(limits.max_memory_mb),
        )),
        Err(violation) if !status.success() => Err(ChildFailure::Error(
            OutcomeError::process_crash(format!(
                "{} ({}): {}",
                describe_status(status),
                violation,
                stderr_tail(stderr)
            )),
        )),
        Err(violation) => Err(ChildFailure::Error(OutcomeError::protocol_violation(
            violation,
        ))),
    }
}

/// Maps a decoded response onto an identifier or a typed failure.
pub(crate) fn translate(response: Response) -> Result<String, ChildFailure> {
    if response.ok {
        return match response.result {
            Some(identifier) => validate_identifier(identifier),
            None => Err(ChildFailure::Error(OutcomeError::protocol_violation(
                "response has ok=true but no result",
            ))),
        };
    }

    if response.is_unsupported() {
        let message = response.error.map(|e| e.message).unwrap_or_default();
        return Err(ChildFailure::Unsupported(message));
    }
    match response.error {
        Some(error) => {
            let kind = ErrorKind::from_code(&error.code);
            let subtype = error.subtype.unwrap_or_else(|| {
                if error.code.is_empty() {
                    "candidate_error".to_string()
                } else {
                    error.code.to_ascii_lowercase()
                }
            });
            Err(ChildFailure::Error(OutcomeError::new(kind, subtype, error.message)))
        }
        None => Err(ChildFailure::Error(OutcomeError::protocol_violation(
            "response has ok=false but no error",
        ))),
    }
}

fn validate_identifier(identifier: String) -> Result<String, ChildFailure> {
    let trimmed = identifier.trim().to_string();
    match parse_identifier(&trimmed) {
        Ok(_) => Ok(trimmed),
        Err(e) => Err(ChildFailure::Error(OutcomeError::new(
            ErrorKind::Parse,
            e.subtype(),
            e.to_string(),
        ))),
    }
}

fn child_env(workdir: &Path, extra: &[(String, String)]) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = INHERITED_ENV
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect();
    env.push(("TMPDIR".to_string(), workdir.to_string_lossy().into_owned()));
    env.extend(extra.iter().cloned());
    env
}

fn capture<R>(reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        let _ = reader.take(MAX_CAPTURE_BYTES).read_to_end(&mut buffer).await;
        buffer
    })
}

async fn collect(task: Option<JoinHandle<Vec<u8>>>, wait: Duration) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match tokio::time::timeout(wait, task).await {
        Ok(Ok(buffer)) => buffer,
        _ => Vec::new(),
    }
}

/// SIGTERM the group, then SIGKILL once the grace period runs out.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    if let Some(pid) = pid {
        signal_group(pid, Signal::SIGTERM);
    }
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        if let Some(pid) = pid {
            signal_group(pid, Signal::SIGKILL);
        }
        return;
    }
    if let Some(pid) = pid {
        signal_group(pid, Signal::SIGKILL);
    }
    if let Err(e) = child.kill().await {
        debug!("Failed to kill candidate process: {}", e);
    }
}

fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => debug!("Failed to send {} to process group {}: {}", signal, raw, e),
    }
}

fn describe_status(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(signal)) => format!("killed by signal {}", signal),
        (None, None) => "abnormal exit".to_string(),
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(1999)
        .map(|(i, _)| i)
        .unwrap_or(0);
    trimmed[start..].to_string()
}
