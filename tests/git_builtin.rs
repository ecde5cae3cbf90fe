//! The built-in git implementation against real payloads, including the
//! synthetic repository and its discovered refs.

use std::sync::Arc;
use std::time::Duration;

use swhid_conformance::candidate::{CandidateHandle, CandidateRegistry, CommandSpec, GitCandidate};
use swhid_conformance::comparator::VerdictReason;
use swhid_conformance::git::{git, git_available};
use swhid_conformance::payload::repo::create_synthetic_repo;
use swhid_conformance::payload::{Materializer, MaterializerConfig, Payload, TempLedger};
use swhid_conformance::outcome::OutcomeState;
use swhid_conformance::sandbox::{IsolationMode, SandboxExecutor};
use swhid_conformance::scheduler::{Orchestrator, OrchestratorConfig};

fn orchestrator(base: &std::path::Path) -> Orchestrator {
    let mut registry = CandidateRegistry::new();
    let git: Arc<dyn CandidateHandle> = Arc::new(GitCandidate::new());
    registry.register(git).unwrap();
    Orchestrator::new(
        registry,
        SandboxExecutor::new(IsolationMode::InProcess),
        Materializer::new(MaterializerConfig::new(base), Arc::new(TempLedger::new())),
        OrchestratorConfig::new().with_parallel_tests(2),
    )
}

#[tokio::test]
async fn test_content_and_directory_payloads() {
    if !git_available().await {
        return;
    }
    let base = tempfile::tempdir().unwrap();
    std::fs::write(base.path().join("hello.txt"), b"Hello, World!\n").unwrap();
    std::fs::create_dir(base.path().join("empty_dir")).unwrap();

    let payloads = vec![
        Payload::new("hello", "hello.txt", "content")
            .with_expected("swh:1:cnt:8ab686eafeb1f44702738c8b0f24f2567c36da6d"),
        Payload::new("empty", "empty_dir", "directory")
            .with_expected("swh:1:dir:4b825dc642cb6eb9a060e54bf8d69288fbee4904"),
    ];
    let run = orchestrator(base.path()).run(&payloads, None).await.unwrap();

    for verdict in &run.verdicts {
        assert!(verdict.all_agree, "{}: {:?}", verdict.payload, verdict.reason);
        assert_eq!(verdict.reason, VerdictReason::Agreement);
    }
}

#[tokio::test]
async fn test_secondary_version_is_unsupported() {
    if !git_available().await {
        return;
    }
    let base = tempfile::tempdir().unwrap();
    std::fs::write(base.path().join("hello.txt"), b"Hello, World!\n").unwrap();

    let payload = Payload::new("hello", "hello.txt", "content").with_expected_sha256(
        "swh:2:cnt:0000000000000000000000000000000000000000000000000000000000000000",
    );
    let run = orchestrator(base.path()).run(&[payload], None).await.unwrap();
    assert_eq!(run.verdicts[0].reason, VerdictReason::AllUnsupported);
}

#[tokio::test]
async fn test_synthetic_repository_refs() {
    if !git_available().await {
        return;
    }
    let reference = tempfile::tempdir().unwrap();
    create_synthetic_repo(reference.path(), Duration::from_secs(10))
        .await
        .unwrap();
    let head = git(reference.path(), &["rev-parse", "main"]).await.unwrap();
    let tag = git(reference.path(), &["rev-parse", "refs/tags/v1.0"]).await.unwrap();

    let base = tempfile::tempdir().unwrap();
    let payload = Payload::new("sample", "repos/sample", "git-repository")
        .synthetic()
        .with_discovery(true, true);
    let run = orchestrator(base.path()).run(&[payload], None).await.unwrap();

    let names: Vec<&str> = run.verdicts.iter().map(|v| v.payload.as_str()).collect();
    assert_eq!(names, vec!["sample", "sample@tag:v1.0", "sample@branch:main"]);

    let branch = run
        .verdicts
        .iter()
        .find(|v| v.payload == "sample@branch:main")
        .unwrap();
    assert_eq!(
        branch.outcomes["git-cmd"].identifier.as_deref(),
        Some(format!("swh:1:rev:{}", head).as_str())
    );

    let release = run
        .verdicts
        .iter()
        .find(|v| v.payload == "sample@tag:v1.0")
        .unwrap();
    assert_eq!(
        release.outcomes["git-cmd"].identifier.as_deref(),
        Some(format!("swh:1:rel:{}", tag).as_str())
    );

    // Snapshots are outside the built-in implementation's capabilities.
    let snapshot = run.verdicts.iter().find(|v| v.payload == "sample").unwrap();
    assert_eq!(snapshot.reason, VerdictReason::AllUnsupported);
    assert!(!base.path().join("repos/sample").exists());
}

#[tokio::test]
async fn test_hosted_worker_in_subprocess_mode() {
    if !git_available().await {
        return;
    }
    let base = tempfile::tempdir().unwrap();
    std::fs::write(base.path().join("hello.txt"), b"Hello, World!\n").unwrap();

    let mut registry = CandidateRegistry::new();
    let git: Arc<dyn CandidateHandle> = Arc::new(GitCandidate::new());
    registry.register(git).unwrap();
    let host = CommandSpec::new(env!("CARGO_BIN_EXE_swhid-conformance")).with_args(["worker"]);
    let orch = Orchestrator::new(
        registry,
        SandboxExecutor::new(IsolationMode::Subprocess).with_worker_host(host),
        Materializer::new(MaterializerConfig::new(base.path()), Arc::new(TempLedger::new())),
        OrchestratorConfig::new().with_parallel_tests(2),
    );

    let payloads = vec![
        Payload::new("hello", "hello.txt", "content")
            .with_expected("swh:1:cnt:8ab686eafeb1f44702738c8b0f24f2567c36da6d"),
    ];
    let run = orch.run(&payloads, None).await.unwrap();

    let outcome = &run.verdicts[0].outcomes["git-cmd"];
    assert_eq!(outcome.state, OutcomeState::Computed, "{:?}", outcome.error);
    assert!(run.verdicts[0].all_agree);
    assert!(outcome.metrics.is_some());
}
