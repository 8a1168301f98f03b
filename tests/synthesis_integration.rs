//! End-to-end synthesis against the in-memory service and backend.
//!
//! No external CLI or interpreter is needed; suitable for CI.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use regex_forge::mock::{MockGenerationService, MockRun, MockSandboxBackend};
use regex_forge::result::CaptureCaseResult;
use regex_forge::sandbox::is_sandbox_unavailable;
use regex_forge::session::{MemorySessionStore, SessionConfig};
use regex_forge::{
    ApprovalGate, CaptureTest, CaseResult, RegexRequest, Runtime, SandboxLifecycleManager,
    SessionLifecycleManager, SynthesisLoop, SynthesisOptions, TestMode, TestResult, ToolCall,
    TurnHandler, TurnOutput,
};

fn date_request() -> RegexRequest {
    RegexRequest::capturing(
        "ISO date with year, month and day groups",
        vec![CaptureTest {
            input: "2024-01-15".to_string(),
            expected_groups: vec![
                Some("2024".to_string()),
                Some("01".to_string()),
                Some("15".to_string()),
            ],
            expected_named_groups: None,
        }],
    )
}

fn capture_report(actual: Vec<Option<&str>>) -> MockRun {
    let expected = vec![Some("2024"), Some("01"), Some("15")];
    let passed = actual == expected;
    let case = CaptureCaseResult {
        input: "2024-01-15".to_string(),
        expected: expected.iter().map(|g| g.map(str::to_string)).collect(),
        actual: Some(actual.iter().map(|g| g.map(str::to_string)).collect()),
        passed,
        named_groups: None,
    };
    MockRun::report(&TestResult::from_cases(
        TestMode::Capture,
        vec![CaseResult::Capture(case)],
    ))
}

#[tokio::test]
async fn capture_loop_recovers_after_reflection() {
    let service = Arc::new(MockGenerationService::new());
    let backend = Arc::new(MockSandboxBackend::new());
    let sandboxes = Arc::new(SandboxLifecycleManager::new(backend.clone()));

    service.push_candidate("(\\d{4})-(\\d{2})", "").await;
    service.push_text("The day is never captured; add a third group.").await;
    service.push_candidate("(\\d{4})-(\\d{2})-(\\d{2})", "").await;
    backend.push_run(capture_report(vec![Some("2024"), Some("01")])).await;
    backend
        .push_run(capture_report(vec![Some("2024"), Some("01"), Some("15")]))
        .await;

    let synthesis = SynthesisLoop::new(service.clone(), sandboxes);
    let result = synthesis
        .run(&date_request(), &SynthesisOptions::new(Runtime::Javascript))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.iterations, 2);
    assert_eq!(result.pattern, "(\\d{4})-(\\d{2})-(\\d{2})");
    assert_eq!(result.token_usage.total, 45);

    let history = result.history.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reflection, "The day is never captured; add a third group.");

    let requests = service.requests().await;
    assert!(requests[2].user_prompt.contains("Diagnosis: The day is never captured"));
    assert_eq!(backend.create_count(), 1);
}

#[tokio::test]
async fn repeated_unavailability_propagates_after_one_replacement() {
    let service = Arc::new(MockGenerationService::new());
    let backend = Arc::new(MockSandboxBackend::new());
    let sandboxes = Arc::new(SandboxLifecycleManager::new(backend.clone()));

    service.push_candidate("\\d+", "").await;
    backend.push_run(MockRun::Unavailable).await;
    backend.push_run(MockRun::Unavailable).await;

    let synthesis = SynthesisLoop::new(service, sandboxes);
    let err = synthesis
        .run(
            &RegexRequest::matching("digits", vec!["1".to_string()], vec![]),
            &SynthesisOptions::new(Runtime::Javascript),
        )
        .await
        .unwrap_err();

    assert!(is_sandbox_unavailable(&err));
    assert_eq!(backend.create_count(), 2);
    assert_eq!(backend.run_count(), 2);
}

#[tokio::test]
async fn abort_mid_generation_returns_promptly() {
    let service = Arc::new(
        MockGenerationService::new().with_delay(Duration::from_secs(3600)),
    );
    let backend = Arc::new(MockSandboxBackend::new());
    let sandboxes = Arc::new(SandboxLifecycleManager::new(backend.clone()));
    service.push_candidate("\\d+", "").await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let synthesis = SynthesisLoop::new(service, sandboxes);
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        synthesis.run(
            &RegexRequest::matching("digits", vec!["1".to_string()], vec![]),
            &SynthesisOptions::new(Runtime::Python).with_cancel(cancel),
        ),
    )
    .await
    .expect("loop did not observe the abort")
    .unwrap();

    assert!(result.aborted);
    assert!(!result.success);
    assert_eq!(result.pattern, "(?!)");
    assert_eq!(backend.run_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn idle_session_releases_its_sandbox() {
    let service = Arc::new(MockGenerationService::new());
    let backend = Arc::new(MockSandboxBackend::new());
    let sandboxes = Arc::new(SandboxLifecycleManager::new(backend.clone()));
    let sessions = SessionLifecycleManager::new(
        Arc::new(MemorySessionStore::new()),
        SessionConfig::default(),
    )
    .with_sandboxes(sandboxes.clone());
    let (gate, _approvals) = ApprovalGate::channel(1);
    let handler = TurnHandler::new(service.clone(), sandboxes, sessions.clone(), Arc::new(gate));

    sessions.connect("s1").await.unwrap();
    service.push_candidate("(\\d{4})-(\\d{2})-(\\d{2})", "").await;
    backend
        .push_run(capture_report(vec![Some("2024"), Some("01"), Some("15")]))
        .await;

    let call = ToolCall::GenerateRegex {
        tool_call_id: "call-1".to_string(),
        request: date_request(),
        runtime: Runtime::Javascript,
        max_iterations: None,
    };
    let output = handler
        .handle("s1", call, &CancellationToken::new(), None)
        .await
        .unwrap();
    assert!(matches!(output, TurnOutput::Regex(ref result) if result.success));
    assert_eq!(backend.live_count().await, 1);

    sessions.disconnect("s1").await;
    tokio::time::sleep(Duration::from_secs(301)).await;

    assert!(sessions.state("s1").await.is_none());
    assert_eq!(backend.live_count().await, 0);
}
