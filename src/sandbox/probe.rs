//! Resource probes for a running child process.

/// One reading of a process's resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSample {
    pub rss_kb: Option<u64>,
    pub peak_rss_kb: Option<u64>,
    /// Peak virtual size (`VmPeak`), compared against the address-space cap.
    pub peak_virtual_kb: Option<u64>,
    pub cpu_ms: Option<u64>,
}

impl ProcessSample {
    /// Best available resident memory figure.
    pub fn memory_kb(&self) -> Option<u64> {
        match (self.peak_rss_kb, self.rss_kb) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// `/proc/<pid>/stat` reports times in USER_HZ, fixed at 100 by the ABI.
#[cfg(target_os = "linux")]
const USER_HZ: u64 = 100;

#[cfg(target_os = "linux")]
pub fn sample(pid: u32) -> ProcessSample {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok();
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok();
    ProcessSample {
        rss_kb: status.as_deref().and_then(|s| status_field_kb(s, "VmRSS:")),
        peak_rss_kb: status.as_deref().and_then(|s| status_field_kb(s, "VmHWM:")),
        peak_virtual_kb: status.as_deref().and_then(|s| status_field_kb(s, "VmPeak:")),
        cpu_ms: stat.as_deref().and_then(cpu_time_ms),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn sample(_pid: u32) -> ProcessSample {
    ProcessSample::default()
}

fn status_field_kb(status: &str, field: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with(field))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
}

/// utime + stime from a `/proc/<pid>/stat` line, in milliseconds.
#[cfg(target_os = "linux")]
fn cpu_time_ms(stat: &str) -> Option<u64> {
    // The command name may contain spaces, so split after its closing paren.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) * 1000 / USER_HZ)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_field_parsing() {
        let status = "Name:\tsh\nVmPeak:\t   10240 kB\nVmHWM:\t    2048 kB\nVmRSS:\t    1024 kB\n";
        assert_eq!(status_field_kb(status, "VmPeak:"), Some(10240));
        assert_eq!(status_field_kb(status, "VmHWM:"), Some(2048));
        assert_eq!(status_field_kb(status, "VmRSS:"), Some(1024));
        assert_eq!(status_field_kb(status, "VmSwap:"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_cpu_time_parsing_handles_spaces_in_name() {
        let stat = "1234 (my prog) S 1 1234 1234 0 -1 4194304 100 0 0 0 250 50 0 0 20 0 1 0 1 0 0";
        assert_eq!(cpu_time_ms(stat), Some(3000));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sample_self() {
        let s = sample(std::process::id());
        assert!(s.memory_kb().unwrap_or(0) > 0);
        assert!(s.cpu_ms.is_some());
    }

    #[test]
    fn test_memory_kb_prefers_larger() {
        let s = ProcessSample {
            rss_kb: Some(10),
            peak_rss_kb: Some(20),
            peak_virtual_kb: Some(100),
            cpu_ms: None,
        };
        assert_eq!(s.memory_kb(), Some(20));
        assert_eq!(ProcessSample::default().memory_kb(), None);
    }
}
