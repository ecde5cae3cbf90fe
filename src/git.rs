//! Thin async wrapper over the `git` CLI.
//!
//! Every invocation is time-bounded and runs with host configuration
//! ignored, so results only depend on the repository and the arguments.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::GitError;

/// Default bound for a single git step.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for one git invocation.
#[derive(Debug, Clone)]
pub struct GitCommand {
    cwd: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    timeout: Duration,
}

impl GitCommand {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the command and returns trimmed stdout.
    pub async fn run(&self) -> Result<String, GitError> {
        let joined = self.args.join(" ");
        debug!(cwd = %self.cwd.display(), "git {}", joined);

        let mut cmd = Command::new("git");
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_CONFIG_GLOBAL", "/dev/null")
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("TZ", "UTC")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(GitError::Spawn)?;
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(GitError::Spawn)?,
            Err(_) => {
                return Err(GitError::Timeout {
                    args: joined,
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(GitError::Failed {
                args: joined,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Shorthand for a git call with the default timeout.
pub async fn git(cwd: &Path, args: &[&str]) -> Result<String, GitError> {
    GitCommand::new(cwd).args(args.iter().copied()).run().await
}

/// True when a usable `git` binary is on `PATH`.
pub async fn git_available() -> bool {
    let cwd = std::env::temp_dir();
    GitCommand::new(cwd)
        .args(["--version"])
        .with_timeout(Duration::from_secs(5))
        .run()
        .await
        .is_ok()
}

/// True for a full 40 hex digit object name.
pub fn is_full_sha(reference: &str) -> bool {
    reference.len() == 40 && reference.bytes().all(|b| b.is_ascii_hexdigit())
}
