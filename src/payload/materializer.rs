//! Turns configured payloads into paths candidates can read.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::archive;
use super::repo;
use super::{is_vcs_category, Payload, TempLedger};
use crate::error::MaterializeError;
use crate::git::DEFAULT_GIT_TIMEOUT;
use crate::identifier::is_repository;

/// Settings for materialization.
#[derive(Debug, Clone)]
pub struct MaterializerConfig {
    /// Directory relative payload paths are resolved against.
    pub base_dir: PathBuf,
    /// Bound on each git step.
    pub git_timeout: Duration,
    /// Bound on archive extraction.
    pub extract_timeout: Duration,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            git_timeout: DEFAULT_GIT_TIMEOUT,
            extract_timeout: Duration::from_secs(60),
        }
    }
}

impl MaterializerConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_git_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }

    pub fn with_extract_timeout(mut self, timeout: Duration) -> Self {
        self.extract_timeout = timeout;
        self
    }
}

/// Makes `path` absolute against the current directory, without touching
/// the filesystem.
pub fn absolutize(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    std::path::absolute(&path).unwrap_or(path)
}

/// A payload ready for dispatch.
#[derive(Debug, Clone)]
pub struct MaterializedPayload {
    pub payload: Payload,
    /// Path handed to candidates.
    pub root: PathBuf,
    pub size_bytes: u64,
    /// Payloads synthesized from discovered branches and tags.
    pub derived: Vec<Payload>,
}

/// Prepares payloads, recording every temporary directory in the ledger.
#[derive(Debug, Clone)]
pub struct Materializer {
    config: MaterializerConfig,
    ledger: Arc<TempLedger>,
}

impl Materializer {
    pub fn new(config: MaterializerConfig, ledger: Arc<TempLedger>) -> Self {
        Self { config, ledger }
    }

    pub fn config(&self) -> &MaterializerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<TempLedger> {
        &self.ledger
    }

    /// Resolves a payload path against the base directory.
    ///
    /// The result is absolute: candidates run in their own working
    /// directory and must still be able to open it.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            absolutize(self.config.base_dir.join(path))
        }
    }

    pub async fn materialize(&self, payload: &Payload) -> Result<MaterializedPayload, MaterializeError> {
        let configured = self.resolve_path(&payload.path);
        let vcs = is_vcs_category(&payload.category);

        let root = if archive::is_archive(&configured) {
            self.extract(&configured).await?
        } else if vcs && !configured.exists() && payload.synthetic {
            let dir = self.ledger.create("swhid_synthetic_")?;
            let repo_path = dir.join(&payload.name);
            repo::create_synthetic_repo(&repo_path, self.config.git_timeout).await?;
            repo_path
        } else {
            configured
        };

        if !root.exists() {
            return Err(MaterializeError::NotFound(root));
        }
        if vcs && !is_repository(&root) {
            return Err(MaterializeError::NotARepository(root));
        }

        // A failed discovery leaves the parent payload intact.
        let mut derived = Vec::new();
        if payload.discover_branches {
            match repo::list_branches(&root, self.config.git_timeout).await {
                Ok(branches) => derived.extend(branches.iter().map(|b| payload.derive_branch(b))),
                Err(e) => warn!(payload = %payload.name, error = %e, "Branch discovery failed"),
            }
        }
        if payload.discover_tags {
            match repo::list_annotated_tags(&root, self.config.git_timeout).await {
                Ok(tags) => derived.extend(tags.iter().map(|t| payload.derive_tag(t))),
                Err(e) => warn!(payload = %payload.name, error = %e, "Tag discovery failed"),
            }
        }
        if !derived.is_empty() {
            info!(
                payload = %payload.name,
                "Discovered {} refs",
                derived.len()
            );
        }

        let measured = root.clone();
        let size_bytes = tokio::task::spawn_blocking(move || payload_size(&measured))
            .await
            .unwrap_or(0);
        debug!(payload = %payload.name, root = %root.display(), size_bytes, "Materialized");

        Ok(MaterializedPayload {
            payload: payload.clone(),
            root,
            size_bytes,
            derived,
        })
    }

    /// Resolves a revision reference inside a materialized repository.
    pub async fn resolve_commit(&self, root: &Path, reference: &str) -> String {
        repo::resolve_commit(root, reference, self.config.git_timeout).await
    }

    async fn extract(&self, archive_path: &Path) -> Result<PathBuf, MaterializeError> {
        if !archive_path.exists() {
            return Err(MaterializeError::NotFound(archive_path.to_path_buf()));
        }
        let dest = self.ledger.create("swhid_archive_")?;
        let source = archive_path.to_path_buf();
        let task = tokio::task::spawn_blocking(move || archive::extract(&source, &dest));

        match tokio::time::timeout(self.config.extract_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(MaterializeError::Extraction {
                path: archive_path.to_path_buf(),
                reason: join.to_string(),
            }),
            Err(_) => Err(MaterializeError::Timeout {
                step: format!("extracting {}", archive_path.display()),
                timeout: self.config.extract_timeout,
            }),
        }
    }
}

/// Total size of regular files under `path`.
fn payload_size(path: &Path) -> u64 {
    if path.is_file() {
        return std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    }
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
