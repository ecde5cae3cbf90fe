//! Resource ceilings for a sandboxed execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Multiplier applied to the memory ceiling for `RLIMIT_AS`.
///
/// Address space is always larger than resident memory, so the kernel limit
/// is a backstop and the resident-memory monitor enforces the real ceiling.
/// The backstop is off unless requested: a candidate stopped by it sees a
/// failed allocation rather than a signal.
const ADDRESS_SPACE_HEADROOM: u64 = 4;

/// Limits enforced on every candidate process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Wall-clock timeout for the whole execution.
    pub timeout: Duration,
    /// Peak resident memory ceiling in MB.
    pub max_memory_mb: u64,
    /// CPU time ceiling in seconds.
    pub max_cpu_secs: u64,
    /// Time between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    /// Interval of the resource monitor.
    pub poll_interval: Duration,
    /// Whether to also cap the address space with `RLIMIT_AS`.
    #[serde(default)]
    pub limit_address_space: bool,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_memory_mb: 500,
            max_cpu_secs: 60,
            grace_period: Duration::from_secs(2),
            poll_interval: Duration::from_millis(25),
            limit_address_space: false,
        }
    }
}

impl SandboxLimits {
    /// Sets the wall-clock timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the memory ceiling in MB.
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    /// Sets the CPU time ceiling.
    pub fn with_cpu_secs(mut self, secs: u64) -> Self {
        self.max_cpu_secs = secs;
        self
    }

    /// Sets the grace period between SIGTERM and SIGKILL.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enables or disables the `RLIMIT_AS` backstop.
    pub fn with_address_space_limit(mut self, enabled: bool) -> Self {
        self.limit_address_space = enabled;
        self
    }

    pub fn memory_limit_kb(&self) -> u64 {
        self.max_memory_mb.saturating_mul(1024)
    }

    pub fn cpu_limit_ms(&self) -> u64 {
        self.max_cpu_secs.saturating_mul(1000)
    }

    /// Address space ceiling in bytes, when enabled.
    pub fn address_space_bytes(&self) -> Option<u64> {
        self.limit_address_space.then(|| {
            self.max_memory_mb
                .saturating_mul(1024 * 1024)
                .saturating_mul(ADDRESS_SPACE_HEADROOM)
        })
    }
}

/// Applies kernel limits in the forked child, before exec.
///
/// Only async-signal-safe calls are allowed here.
#[cfg(unix)]
pub(crate) fn apply_rlimits(address_space: Option<u64>, cpu_secs: u64) -> std::io::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};

    if let Some(bytes) = address_space {
        setrlimit(Resource::RLIMIT_AS, bytes as _, bytes as _)?;
    }
    if cpu_secs > 0 {
        // SIGXCPU at the soft limit, SIGKILL one second later.
        setrlimit(Resource::RLIMIT_CPU, cpu_secs as _, cpu_secs.saturating_add(1) as _)?;
    }
    Ok(())
}
