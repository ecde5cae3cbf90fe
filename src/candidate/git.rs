//! Built-in candidate backed by the `git` command line.
//!
//! Git object ids coincide with version 1 identifiers for contents,
//! directories, revisions and releases, which makes the git CLI a useful
//! reference candidate. Snapshots have no git equivalent.

use std::path::Path;

use async_trait::async_trait;
use walkdir::WalkDir;

use super::{CandidateCapabilities, CandidateHandle, CandidateInfo, ComputeOptions};
use crate::error::CandidateError;
use crate::git::{git, git_available, GitCommand};
use crate::identifier::{IdentifierVersion, ObjectType};
use crate::outcome::ErrorKind;

pub const GIT_CANDIDATE_NAME: &str = "git-cmd";

/// Reference candidate computing identifiers with git plumbing commands.
pub struct GitCandidate {
    info: CandidateInfo,
    capabilities: CandidateCapabilities,
}

impl GitCandidate {
    pub fn new() -> Self {
        Self {
            info: CandidateInfo::new(GIT_CANDIDATE_NAME)
                .with_version(env!("CARGO_PKG_VERSION"))
                .with_language("git")
                .with_description("Identifiers from git hash-object, write-tree and rev-parse")
                .with_dependency("git"),
            capabilities: CandidateCapabilities::default()
                .with_types(&[
                    ObjectType::Content,
                    ObjectType::Directory,
                    ObjectType::Revision,
                    ObjectType::Release,
                ])
                .with_versions(&[IdentifierVersion::Primary]),
        }
    }

    async fn content(&self, payload: &Path) -> Result<String, CandidateError> {
        if !payload.is_file() {
            return Err(CandidateError::failed(
                ErrorKind::Validate,
                "not_a_file",
                format!("{} is not a regular file", payload.display()),
            ));
        }
        let cwd = payload.parent().unwrap_or_else(|| Path::new("/"));
        let path = payload.to_string_lossy();
        let sha = git(cwd, &["hash-object", "--no-filters", "--", path.as_ref()]).await?;
        Ok(format!("swh:1:cnt:{}", sha))
    }

    async fn directory(&self, payload: &Path) -> Result<String, CandidateError> {
        if !payload.is_dir() {
            return Err(CandidateError::failed(
                ErrorKind::Validate,
                "not_a_directory",
                format!("{} is not a directory", payload.display()),
            ));
        }

        let scratch = tempfile::Builder::new().prefix("swhid_gitcmd_").tempdir()?;
        let worktree = scratch.path().to_path_buf();
        let source = payload.to_path_buf();
        let target = worktree.clone();
        tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|e| CandidateError::failed(ErrorKind::Io, "copy_failed", e.to_string()))??;

        git(&worktree, &["init", "-q"]).await?;
        git(&worktree, &["config", "core.autocrlf", "false"]).await?;
        git(&worktree, &["config", "core.filemode", "true"]).await?;
        GitCommand::new(&worktree)
            .args(["add", "-A", "--force", "."])
            .run()
            .await?;
        let tree = git(&worktree, &["write-tree"]).await?;
        Ok(format!("swh:1:dir:{}", tree))
    }

    async fn revision(&self, repo: &Path, options: &ComputeOptions) -> Result<String, CandidateError> {
        let reference = options.commit.as_deref().unwrap_or("HEAD");
        let spec = format!("{}^{{commit}}", reference);
        let sha = git(repo, &["rev-parse", "--verify", "--quiet", &spec])
            .await
            .map_err(|e| {
                CandidateError::failed(
                    ErrorKind::Validate,
                    "unknown_commit",
                    format!("cannot resolve '{}': {}", reference, e),
                )
            })?;
        Ok(format!("swh:1:rev:{}", sha))
    }

    async fn release(&self, repo: &Path, options: &ComputeOptions) -> Result<String, CandidateError> {
        let Some(tag) = options.tag.as_deref() else {
            return Err(CandidateError::failed(
                ErrorKind::Validate,
                "missing_tag",
                "release requires a tag name",
            ));
        };
        let reference = format!("refs/tags/{}", tag);
        let kind = git(repo, &["cat-file", "-t", &reference]).await.map_err(|e| {
            CandidateError::failed(
                ErrorKind::Validate,
                "unknown_tag",
                format!("cannot resolve tag '{}': {}", tag, e),
            )
        })?;
        if kind != "tag" {
            return Err(CandidateError::failed(
                ErrorKind::Validate,
                "lightweight_tag",
                format!("tag '{}' is not annotated", tag),
            ));
        }
        let sha = git(repo, &["rev-parse", "--verify", &reference]).await?;
        Ok(format!("swh:1:rel:{}", sha))
    }
}

impl Default for GitCandidate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CandidateHandle for GitCandidate {
    fn info(&self) -> &CandidateInfo {
        &self.info
    }

    fn capabilities(&self) -> &CandidateCapabilities {
        &self.capabilities
    }

    async fn is_available(&self) -> bool {
        git_available().await
    }

    async fn compute(
        &self,
        payload: &Path,
        object_type: ObjectType,
        options: &ComputeOptions,
    ) -> Result<String, CandidateError> {
        if options.version != IdentifierVersion::Primary {
            return Err(CandidateError::Unsupported(format!(
                "{} only produces version 1 identifiers",
                GIT_CANDIDATE_NAME
            )));
        }
        if !payload.exists() {
            return Err(CandidateError::failed(
                ErrorKind::Io,
                "file_not_found",
                format!("{} does not exist", payload.display()),
            ));
        }
        match object_type {
            ObjectType::Content => self.content(payload).await,
            ObjectType::Directory => self.directory(payload).await,
            ObjectType::Revision => self.revision(payload, options).await,
            ObjectType::Release => self.release(payload, options).await,
            ObjectType::Snapshot => Err(CandidateError::Unsupported(
                "git has no snapshot object".to_string(),
            )),
        }
    }
}

/// Copies a directory tree, keeping symlinks as links and skipping `.git`.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");

    for entry in walker {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
