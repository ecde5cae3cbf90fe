//! End-to-end runs against throwaway shell implementations.
//!
//! Each implementation is a `/bin/sh -c` script speaking the stdio protocol,
//! so these tests exercise the real subprocess sandbox.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use swhid_conformance::candidate::{
    CandidateCapabilities, CandidateHandle, CandidateInfo, CandidateRegistry, CommandSpec,
    ProtocolCandidate,
};
use swhid_conformance::comparator::VerdictReason;
use swhid_conformance::config::HarnessConfig;
use swhid_conformance::identifier::{IdentifierVersion, ObjectType};
use swhid_conformance::payload::{Materializer, MaterializerConfig, Payload, TempLedger};
use swhid_conformance::report::{ReportFormat, RunReport, TestStatus};
use swhid_conformance::sandbox::{IsolationMode, SandboxExecutor, SandboxLimits};
use swhid_conformance::scheduler::{Orchestrator, OrchestratorConfig, RunOutcome};
use swhid_conformance::{ErrorKind, OrchestratorError};

const EMPTY_BLOB: &str = "swh:1:cnt:e69de29bb2d1d6434b8b29ae775ad8c2e48c5391";
const HELLO_BLOB: &str = "swh:1:cnt:8ab686eafeb1f44702738c8b0f24f2567c36da6d";

fn answering(name: &str, identifier: &str) -> Arc<dyn CandidateHandle> {
    script(
        name,
        &format!("printf '%s' '{{\"ok\":true,\"result\":\"{}\"}}'", identifier),
    )
}

fn rejecting(name: &str) -> Arc<dyn CandidateHandle> {
    script(
        name,
        r#"printf '%s' '{"ok":false,"error":{"code":"VALIDATION_ERROR","subtype":"invalid_payload","message":"rejected"}}'; exit 1"#,
    )
}

fn script(name: &str, body: &str) -> Arc<dyn CandidateHandle> {
    Arc::new(ProtocolCandidate::new(
        CandidateInfo::new(name).with_language("sh"),
        CommandSpec::new("/bin/sh").with_args(["-c", body]),
    ))
}

fn orchestrator(base: &Path, candidates: Vec<Arc<dyn CandidateHandle>>) -> Orchestrator {
    orchestrator_with(base, candidates, SandboxLimits::default().with_timeout(Duration::from_secs(10)))
}

fn orchestrator_with(
    base: &Path,
    candidates: Vec<Arc<dyn CandidateHandle>>,
    limits: SandboxLimits,
) -> Orchestrator {
    let mut registry = CandidateRegistry::new();
    for candidate in candidates {
        registry.register(candidate).unwrap();
    }
    Orchestrator::new(
        registry,
        SandboxExecutor::new(IsolationMode::Subprocess),
        Materializer::new(MaterializerConfig::new(base), Arc::new(TempLedger::new())),
        OrchestratorConfig::new()
            .with_parallel_tests(2)
            .with_limits(limits),
    )
}

fn corpus(base: &Path) {
    std::fs::create_dir_all(base.join("payloads/content")).unwrap();
    std::fs::write(base.join("payloads/content/empty"), b"").unwrap();
    std::fs::write(base.join("payloads/content/hello"), b"Hello, World!\n").unwrap();
}

fn identifiers(run: &RunOutcome) -> Vec<(String, Vec<(String, Option<String>)>)> {
    run.verdicts
        .iter()
        .map(|v| {
            let ids = v
                .outcomes
                .iter()
                .map(|(k, o)| (k.clone(), o.identifier.clone()))
                .collect();
            (v.payload.clone(), ids)
        })
        .collect()
}

#[tokio::test]
async fn test_empty_content_agreement() {
    let base = tempfile::tempdir().unwrap();
    corpus(base.path());
    let orch = orchestrator(
        base.path(),
        vec![answering("a", EMPTY_BLOB), answering("b", EMPTY_BLOB)],
    );

    let payload = Payload::new("empty", "payloads/content/empty", "content").with_expected(EMPTY_BLOB);
    let run = orch.run(&[payload], None).await.unwrap();

    assert_eq!(run.verdicts.len(), 1);
    let verdict = &run.verdicts[0];
    assert!(verdict.all_agree, "{:?}", verdict.reason);
    assert_eq!(verdict.reason, VerdictReason::Agreement);
    assert_eq!(verdict.outcomes.len(), 2);
    for outcome in verdict.outcomes.values() {
        assert_eq!(outcome.identifier.as_deref(), Some(EMPTY_BLOB));
        assert_eq!(outcome.version, IdentifierVersion::Primary);
        assert!(outcome.metrics.is_some());
    }

    let report = RunReport::from_run(&run);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.summary.candidates["a"].passed, 1);
}

#[tokio::test]
async fn test_two_candidates_disagree() {
    let base = tempfile::tempdir().unwrap();
    corpus(base.path());
    let orch = orchestrator(
        base.path(),
        vec![answering("a", EMPTY_BLOB), answering("b", HELLO_BLOB)],
    );

    let run = orch
        .run(&[Payload::new("empty", "payloads/content/empty", "content")], None)
        .await
        .unwrap();

    let verdict = &run.verdicts[0];
    assert!(!verdict.all_agree);
    assert_eq!(
        verdict.reason,
        VerdictReason::Divergent {
            version: IdentifierVersion::Primary
        }
    );
    assert_eq!(RunReport::from_run(&run).exit_code(), 1);
}

#[tokio::test]
async fn test_missing_payload_is_skipped_for_everyone() {
    let base = tempfile::tempdir().unwrap();
    corpus(base.path());
    let orch = orchestrator(
        base.path(),
        vec![answering("a", EMPTY_BLOB), answering("b", EMPTY_BLOB)],
    );

    let payloads = vec![
        Payload::new("empty", "payloads/content/empty", "content"),
        Payload::new("ghost", "payloads/content/ghost", "content"),
    ];
    let run = orch.run(&payloads, None).await.unwrap();

    let ghost = run.verdicts.iter().find(|v| v.payload == "ghost").unwrap();
    assert!(!ghost.all_agree);
    assert_eq!(ghost.reason, VerdictReason::NotMaterialized);
    assert!(ghost.is_fully_skipped());
    for outcome in ghost.outcomes.values() {
        let error = outcome.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Io);
        assert_eq!(error.subtype, "file_not_found");
    }

    let empty = run.verdicts.iter().find(|v| v.payload == "empty").unwrap();
    assert!(empty.all_agree);

    let report = RunReport::from_run(&run);
    assert_eq!(report.summary.skipped_payloads, 1);
    assert_eq!(report.summary.disagree, 1);
    let entry = &report.verdicts.iter().find(|v| v.payload == "ghost").unwrap().results["a"];
    assert_eq!(entry.status, TestStatus::Skipped);
}

#[tokio::test]
async fn test_unsupported_unanimity_agrees() {
    let base = tempfile::tempdir().unwrap();
    corpus(base.path());
    let dir_only = CandidateCapabilities::default().with_types(&[ObjectType::Directory]);
    let candidates: Vec<Arc<dyn CandidateHandle>> = ["a", "b"]
        .iter()
        .map(|name| {
            Arc::new(
                ProtocolCandidate::new(
                    CandidateInfo::new(*name),
                    CommandSpec::new("/bin/sh").with_args(["-c", "exit 3"]),
                )
                .with_capabilities(dir_only.clone()),
            ) as Arc<dyn CandidateHandle>
        })
        .collect();
    let orch = orchestrator(base.path(), candidates);

    let run = orch
        .run(&[Payload::new("empty", "payloads/content/empty", "content")], None)
        .await
        .unwrap();
    let verdict = &run.verdicts[0];
    assert!(verdict.all_agree);
    assert_eq!(verdict.reason, VerdictReason::AllUnsupported);
    // The capability filter answers without spawning anything.
    assert_eq!(run.stats.total_processed(), 0);
}

#[tokio::test]
async fn test_negative_test_rejected_by_all_agrees() {
    let base = tempfile::tempdir().unwrap();
    corpus(base.path());
    let orch = orchestrator(base.path(), vec![rejecting("a"), rejecting("b")]);

    let payload = Payload::new("hello", "payloads/content/hello", "content")
        .with_expected_error("invalid_payload");
    let run = orch.run(&[payload], None).await.unwrap();

    let verdict = &run.verdicts[0];
    assert!(verdict.all_agree);
    assert_eq!(verdict.reason, VerdictReason::CorrectRejection);
    let error = verdict.outcomes["a"].error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Validate);
    assert_eq!(error.subtype, "invalid_payload");
}

#[tokio::test]
async fn test_timeout_is_enforced() {
    let base = tempfile::tempdir().unwrap();
    corpus(base.path());
    let limits = SandboxLimits::default()
        .with_timeout(Duration::from_secs(1))
        .with_grace_period(Duration::from_millis(500));
    let orch = orchestrator_with(
        base.path(),
        vec![script("slow", "sleep 5"), answering("fast", EMPTY_BLOB)],
        limits,
    );

    let started = std::time::Instant::now();
    let run = orch
        .run(&[Payload::new("empty", "payloads/content/empty", "content")], None)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(4));

    let verdict = &run.verdicts[0];
    assert!(!verdict.all_agree);
    let error = verdict.outcomes["slow"].error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn test_dual_version_fan_out() {
    let base = tempfile::tempdir().unwrap();
    corpus(base.path());
    let v2 = "swh:2:cnt:473a0f4c3be8a93681a267e3b1e9a7dcda1185436fe141f7749120a303721813";
    let answer_by_version = format!(
        r#"read -r req; case "$req" in *'"version":2'*) id='{}';; *) id='{}';; esac; printf '{{"ok":true,"result":"%s"}}' "$id""#,
        v2, EMPTY_BLOB
    );
    let orch = orchestrator(base.path(), vec![script("a", &answer_by_version)]);

    let payload = Payload::new("empty", "payloads/content/empty", "content")
        .with_expected(EMPTY_BLOB)
        .with_expected_sha256(v2);
    let run = orch.run(&[payload], None).await.unwrap();

    let verdict = &run.verdicts[0];
    let keys: Vec<&String> = verdict.outcomes.keys().collect();
    assert_eq!(keys, vec!["a", "a_v2"]);
    assert!(verdict.all_agree, "{:?}", verdict.reason);
}

#[tokio::test]
async fn test_runs_are_deterministic() {
    let base = tempfile::tempdir().unwrap();
    corpus(base.path());
    let payloads = vec![
        Payload::new("hello", "payloads/content/hello", "content"),
        Payload::new("empty", "payloads/content/empty", "content"),
        Payload::new("ghost", "payloads/content/ghost", "content"),
    ];

    let first = orchestrator(
        base.path(),
        vec![answering("a", EMPTY_BLOB), answering("b", HELLO_BLOB)],
    )
    .run(&payloads, None)
    .await
    .unwrap();
    let second = orchestrator(
        base.path(),
        vec![answering("a", EMPTY_BLOB), answering("b", HELLO_BLOB)],
    )
    .run(&payloads, None)
    .await
    .unwrap();

    assert_eq!(identifiers(&first), identifiers(&second));
    let order: Vec<&str> = first.verdicts.iter().map(|v| v.payload.as_str()).collect();
    assert_eq!(order, vec!["empty", "ghost", "hello"]);
}

#[tokio::test]
async fn test_no_available_candidates_is_an_error() {
    let base = tempfile::tempdir().unwrap();
    let missing: Arc<dyn CandidateHandle> = Arc::new(ProtocolCandidate::new(
        CandidateInfo::new("missing"),
        CommandSpec::new("no-such-conformance-binary"),
    ));
    let orch = orchestrator(base.path(), vec![missing]);
    let result = orch
        .run(&[Payload::new("empty", "payloads/content/empty", "content")], None)
        .await;
    assert!(matches!(result, Err(OrchestratorError::NoCandidates)));
}

#[tokio::test]
async fn test_configured_run_end_to_end() {
    let base = tempfile::tempdir().unwrap();
    corpus(base.path());
    let yaml = format!(
        r#"
settings:
  parallel_tests: 2
  timeout: 10
candidates:
  - name: sh-a
    command: ["/bin/sh", "-c", "printf '%s' '{{\"ok\":true,\"swhid\":\"{id}\"}}'"]
  - name: sh-b
    command: ["/bin/sh", "-c", "printf '%s' '{{\"ok\":true,\"result\":\"{id}\"}}'"]
payloads:
  content:
    - name: empty
      path: payloads/content/empty
      expected_swhid: "{id}"
"#,
        id = EMPTY_BLOB
    );
    let path = base.path().join("config.yaml");
    std::fs::write(&path, yaml).unwrap();

    let config = HarnessConfig::load(&path).unwrap();
    let orch = config.build_orchestrator().unwrap();
    let selection = vec!["sh-a".to_string(), "sh-b".to_string()];
    let run = orch
        .run(&config.payloads.ordered(None), Some(&selection))
        .await
        .unwrap();

    assert_eq!(run.candidates.len(), 2);
    assert!(run.all_agree());

    let report = RunReport::from_run(&run);
    let ndjson = report.render(ReportFormat::Ndjson).unwrap();
    assert_eq!(ndjson.lines().count(), 1 + 2 + 1 + 1);
}

#[tokio::test]
async fn test_relative_base_dir_reaches_candidates() {
    // Candidates run in their own scratch directory, so a path relative to
    // the harness working directory would not resolve for them.
    let local = tempfile::Builder::new()
        .prefix("swhid_rel_")
        .tempdir_in(".")
        .unwrap();
    corpus(local.path());
    let dir_name = local.path().file_name().unwrap().to_string_lossy().into_owned();

    let seeing = script(
        "seeing",
        &format!(
            r#"p=$(sed -n 's/.*"payload_path":"\([^"]*\)".*/\1/p'); if [ -e "$p" ]; then printf '%s' '{{"ok":true,"result":"{id}"}}'; else printf '{{"ok":false,"error":{{"code":"IO_ERROR","message":"cannot see %s from %s"}}}}' "$p" "$PWD"; fi"#,
            id = EMPTY_BLOB
        ),
    );
    let orch = orchestrator(Path::new("."), vec![seeing]);
    let payload = Payload::new(
        "empty",
        format!("{}/payloads/content/empty", dir_name),
        "content",
    )
    .with_expected(EMPTY_BLOB);
    let run = orch.run(&[payload], None).await.unwrap();

    let verdict = &run.verdicts[0];
    assert!(verdict.all_agree, "{:?}", verdict.outcomes["seeing"].error);
    assert_eq!(verdict.outcomes["seeing"].identifier.as_deref(), Some(EMPTY_BLOB));
}
