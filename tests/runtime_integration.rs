//! Verification against real interpreters.
//!
//! These need `node`, `python3` and `unshare` on PATH; run with --ignored.

use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use regex_forge::verify::{VerificationExecutor, VerifyOptions};
use regex_forge::{
    CaptureTest, CodeCandidate, CodeTask, CodeTestCase, ProcessBackend, RegexCandidate,
    RegexRequest, Runtime, SandboxLifecycleManager,
};

struct Harness {
    _dir: TempDir,
    sandboxes: Arc<SandboxLifecycleManager>,
    executor: VerificationExecutor,
}

fn harness() -> Harness {
    let dir = TempDir::new().expect("failed to create temp dir");
    let backend = ProcessBackend::with_base_dir(dir.path());
    let sandboxes = Arc::new(SandboxLifecycleManager::new(Arc::new(backend)));
    Harness {
        _dir: dir,
        executor: VerificationExecutor::new(sandboxes.clone()),
        sandboxes,
    }
}

fn date_request() -> RegexRequest {
    RegexRequest::capturing(
        "ISO date",
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

#[tokio::test]
#[ignore] // Requires node and unshare
async fn javascript_digits_pass_both_examples() {
    let h = harness();
    let mut sandbox = h.sandboxes.get_or_create(Runtime::Javascript, None).await.unwrap();
    let request = RegexRequest::matching("digits", vec!["123".to_string()], vec!["abc".to_string()]);

    let result = h
        .executor
        .execute_regex_test(
            &mut sandbox,
            &RegexCandidate::new("\\d+", "g"),
            &request,
            &VerifyOptions::new(Runtime::Javascript, CancellationToken::new()),
        )
        .await
        .unwrap();

    assert!(result.passed, "{:?}", result);
    assert_eq!(result.total, 2);
    assert_eq!(result.passed_count, 2);
    assert_eq!(result.failed_count, 0);
}

#[tokio::test]
#[ignore] // Requires node, python3 and unshare
async fn date_capture_passes_in_both_runtimes() {
    let h = harness();
    for runtime in [Runtime::Javascript, Runtime::Python] {
        let mut sandbox = h.sandboxes.get_or_create(runtime, None).await.unwrap();
        let result = h
            .executor
            .execute_regex_test(
                &mut sandbox,
                &RegexCandidate::new("(\\d{4})-(\\d{2})-(\\d{2})", ""),
                &date_request(),
                &VerifyOptions::new(runtime, CancellationToken::new()),
            )
            .await
            .unwrap();
        assert!(result.passed, "{}: {:?}", runtime, result);
    }
}

#[tokio::test]
#[ignore] // Requires python3 and unshare
async fn unparseable_pattern_reports_compile_error() {
    let h = harness();
    let mut sandbox = h.sandboxes.get_or_create(Runtime::Python, None).await.unwrap();
    let request = RegexRequest::matching("anything", vec!["a".to_string()], vec![]);

    let result = h
        .executor
        .execute_regex_test(
            &mut sandbox,
            &RegexCandidate::new("([", ""),
            &request,
            &VerifyOptions::new(Runtime::Python, CancellationToken::new()),
        )
        .await
        .unwrap();

    assert!(!result.passed);
    assert_eq!(result.total, 0);
    assert!(result.compile_error.is_some_and(|e| !e.is_empty()));
}

#[tokio::test]
#[ignore] // Requires node and unshare
async fn unmatched_optional_group_is_null_not_empty() {
    let h = harness();
    let mut sandbox = h.sandboxes.get_or_create(Runtime::Javascript, None).await.unwrap();
    let request = RegexRequest::capturing(
        "optional suffix",
        vec![
            CaptureTest {
                input: "a".to_string(),
                expected_groups: vec![Some("a".to_string()), None],
                expected_named_groups: None,
            },
            CaptureTest {
                input: "a".to_string(),
                expected_groups: vec![Some("a".to_string()), Some(String::new())],
                expected_named_groups: None,
            },
        ],
    );

    let result = h
        .executor
        .execute_regex_test(
            &mut sandbox,
            &RegexCandidate::new("(a)(b)?", ""),
            &request,
            &VerifyOptions::new(Runtime::Javascript, CancellationToken::new()),
        )
        .await
        .unwrap();

    assert_eq!(result.passed_count, 1);
    assert_eq!(result.failed_count, 1);
    assert!(result.results[0].passed());
}

#[tokio::test]
#[ignore] // Requires python3 and unshare
async fn generated_code_is_checked_per_case() {
    let h = harness();
    let mut sandbox = h.sandboxes.get_or_create(Runtime::Python, None).await.unwrap();
    let task = CodeTask {
        description: "count words".to_string(),
        test_cases: vec![
            CodeTestCase {
                input: "a b c".to_string(),
                expected: serde_json::json!(3),
            },
            CodeTestCase {
                input: "".to_string(),
                expected: serde_json::json!(1),
            },
        ],
    };
    let candidate = CodeCandidate {
        reasoning: "split on whitespace".to_string(),
        code: "def solve(s):\n    return len(s.split())\n".to_string(),
    };

    let result = h
        .executor
        .execute_code_test(
            &mut sandbox,
            &candidate,
            &task,
            &VerifyOptions::new(Runtime::Python, CancellationToken::new()),
        )
        .await
        .unwrap();

    assert_eq!(result.total, 2);
    assert_eq!(result.passed_count, 1);
}
