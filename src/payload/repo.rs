//! Repository payloads: the synthetic sample repository, ref discovery and
//! commit resolution.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{GitError, MaterializeError};
use crate::git::{is_full_sha, GitCommand};

/// Logical time of the first synthetic commit.
pub const SYNTHETIC_EPOCH: i64 = 1_112_911_993;

/// Seconds between consecutive synthetic history steps.
pub const SYNTHETIC_STEP: i64 = 60;

pub const SYNTHETIC_BRANCH: &str = "main";
pub const SYNTHETIC_TAG: &str = "v1.0";

const AUTHOR_NAME: &str = "Test User";
const AUTHOR_EMAIL: &str = "test@example.com";

fn synthetic_date(step: i64) -> String {
    format!("{} +0000", SYNTHETIC_EPOCH + step * SYNTHETIC_STEP)
}

fn step_error(step: &str, error: GitError) -> MaterializeError {
    match error {
        GitError::Timeout { timeout, .. } => MaterializeError::Timeout {
            step: format!("git {}", step),
            timeout,
        },
        other => MaterializeError::Git(other),
    }
}

async fn run_step(
    repo: &Path,
    args: &[&str],
    step: i64,
    timeout: Duration,
) -> Result<String, MaterializeError> {
    let date = synthetic_date(step);
    GitCommand::new(repo)
        .args(args.iter().copied())
        .env("GIT_AUTHOR_NAME", AUTHOR_NAME)
        .env("GIT_AUTHOR_EMAIL", AUTHOR_EMAIL)
        .env("GIT_COMMITTER_NAME", AUTHOR_NAME)
        .env("GIT_COMMITTER_EMAIL", AUTHOR_EMAIL)
        .env("GIT_AUTHOR_DATE", date.as_str())
        .env("GIT_COMMITTER_DATE", date.as_str())
        .with_timeout(timeout)
        .run()
        .await
        .map_err(|e| step_error(args.first().copied().unwrap_or("git"), e))
}

/// Builds the deterministic sample repository at `path`.
///
/// One commit adding `README.md` on `main` and one annotated tag `v1.0`.
/// Identity, timestamps and configuration are fixed, so two constructions
/// produce identical object ids.
pub async fn create_synthetic_repo(path: &Path, timeout: Duration) -> Result<(), MaterializeError> {
    info!("Creating synthetic repository at {}", path.display());
    tokio::fs::create_dir_all(path).await?;

    run_step(path, &["init", "-q"], 0, timeout).await?;
    run_step(
        path,
        &["symbolic-ref", "HEAD", &format!("refs/heads/{}", SYNTHETIC_BRANCH)],
        0,
        timeout,
    )
    .await?;
    for (key, value) in [
        ("user.name", AUTHOR_NAME),
        ("user.email", AUTHOR_EMAIL),
        ("commit.gpgsign", "false"),
        ("tag.gpgsign", "false"),
        ("core.autocrlf", "false"),
        ("core.filemode", "true"),
        ("core.precomposeunicode", "false"),
    ] {
        run_step(path, &["config", key, value], 0, timeout).await?;
    }

    tokio::fs::write(path.join("README.md"), b"# Sample Repo\n").await?;
    run_step(path, &["add", "README.md"], 0, timeout).await?;
    run_step(path, &["commit", "-q", "-m", "Initial commit"], 0, timeout).await?;
    run_step(
        path,
        &["tag", "-a", SYNTHETIC_TAG, "-m", "Release v1.0"],
        1,
        timeout,
    )
    .await?;
    Ok(())
}

/// Local branch names, sorted and deduplicated.
pub async fn list_branches(repo: &Path, timeout: Duration) -> Result<Vec<String>, MaterializeError> {
    let out = GitCommand::new(repo)
        .args(["for-each-ref", "--format=%(refname:short)", "refs/heads"])
        .with_timeout(timeout)
        .run()
        .await
        .map_err(|e| step_error("for-each-ref", e))?;
    Ok(sorted_unique(out.lines().map(str::to_string)))
}

/// Annotated tag names, sorted and deduplicated. Lightweight tags are skipped.
pub async fn list_annotated_tags(
    repo: &Path,
    timeout: Duration,
) -> Result<Vec<String>, MaterializeError> {
    let out = GitCommand::new(repo)
        .args([
            "for-each-ref",
            "--format=%(objecttype) %(refname:short)",
            "refs/tags",
        ])
        .with_timeout(timeout)
        .run()
        .await
        .map_err(|e| step_error("for-each-ref", e))?;
    Ok(sorted_unique(out.lines().filter_map(|line| {
        line.strip_prefix("tag ").map(str::to_string)
    })))
}

/// Resolves a commit reference to a full object name.
///
/// `HEAD` and full SHAs pass through untouched, and so does anything git
/// cannot resolve, leaving the verdict to the candidates.
pub async fn resolve_commit(repo: &Path, reference: &str, timeout: Duration) -> String {
    if reference == "HEAD" || is_full_sha(reference) {
        return reference.to_string();
    }
    let spec = format!("{}^{{commit}}", reference);
    match GitCommand::new(repo)
        .args(["rev-parse", "--verify", "--quiet", spec.as_str()])
        .with_timeout(timeout)
        .run()
        .await
    {
        Ok(sha) if is_full_sha(&sha) => sha,
        Ok(other) => {
            debug!("rev-parse {} returned unexpected '{}'", reference, other);
            reference.to_string()
        }
        Err(e) => {
            debug!("Could not resolve {}: {}", reference, e);
            reference.to_string()
        }
    }
}

fn sorted_unique(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut items: Vec<String> = items.filter(|s| !s.is_empty()).collect();
    items.sort();
    items.dedup();
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{git, git_available};

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn test_synthetic_dates() {
        assert_eq!(synthetic_date(0), "1112911993 +0000");
        assert_eq!(synthetic_date(1), "1112912053 +0000");
    }

    #[test]
    fn test_sorted_unique() {
        let items = ["b", "a", "", "b"].iter().map(|s| s.to_string());
        assert_eq!(sorted_unique(items), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_synthetic_repo_is_reproducible() {
        if !git_available().await {
            return;
        }
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        create_synthetic_repo(a.path(), TIMEOUT).await.unwrap();
        create_synthetic_repo(b.path(), TIMEOUT).await.unwrap();

        let head_a = git(a.path(), &["rev-parse", "HEAD"]).await.unwrap();
        let head_b = git(b.path(), &["rev-parse", "HEAD"]).await.unwrap();
        assert_eq!(head_a, head_b);

        let tag_a = git(a.path(), &["rev-parse", "refs/tags/v1.0"]).await.unwrap();
        let tag_b = git(b.path(), &["rev-parse", "refs/tags/v1.0"]).await.unwrap();
        assert_eq!(tag_a, tag_b);
        assert_ne!(tag_a, head_a);
    }

    #[tokio::test]
    async fn test_discovery_and_resolution() {
        if !git_available().await {
            return;
        }
        let repo = tempfile::tempdir().unwrap();
        create_synthetic_repo(repo.path(), TIMEOUT).await.unwrap();
        git(repo.path(), &["branch", "feature"]).await.unwrap();
        git(repo.path(), &["tag", "light"]).await.unwrap();

        let branches = list_branches(repo.path(), TIMEOUT).await.unwrap();
        assert_eq!(branches, vec!["feature", "main"]);

        let tags = list_annotated_tags(repo.path(), TIMEOUT).await.unwrap();
        assert_eq!(tags, vec!["v1.0"]);

        let head = git(repo.path(), &["rev-parse", "HEAD"]).await.unwrap();
        assert_eq!(resolve_commit(repo.path(), "main", TIMEOUT).await, head);
        assert_eq!(resolve_commit(repo.path(), &head[..7], TIMEOUT).await, head);
        assert_eq!(resolve_commit(repo.path(), "v1.0", TIMEOUT).await, head);
        assert_eq!(resolve_commit(repo.path(), "HEAD", TIMEOUT).await, "HEAD");
        assert_eq!(resolve_commit(repo.path(), "no-such-ref", TIMEOUT).await, "no-such-ref");
    }
}
