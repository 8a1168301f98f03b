//! Transport-agnostic handler for the HTTP verification endpoint.
//!
//! Verifies a caller-supplied pattern against examples without any
//! generation. The transport decodes [`VerifyRequest`], calls
//! [`VerificationEndpoint::handle`], and encodes either the response or the
//! [`ApiError`] with [`ApiError::status`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::request::{CaptureTest, RegexRequest, Runtime, TestMode};
use crate::result::{ErrorKind, RegexCandidate, TestResult};
use crate::sandbox::SandboxLifecycleManager;
use crate::verify::{VerificationExecutor, VerifyOptions};

/// Default per-request execution timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Largest accepted execution timeout in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub pattern: String,
    #[serde(default)]
    pub flags: String,
    pub mode: TestMode,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    /// Execution timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub should_match: Vec<String>,
    #[serde(default)]
    pub should_not_match: Vec<String>,
    #[serde(default)]
    pub capture_tests: Vec<CaptureTest>,
}

impl VerifyRequest {
    fn validate(&self) -> std::result::Result<(RegexRequest, Duration), ApiError> {
        if self.pattern.is_empty() {
            return Err(ApiError::validation("pattern must not be empty"));
        }

        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if !(1..=MAX_TIMEOUT_SECS).contains(&timeout) {
            return Err(ApiError::validation(format!(
                "timeout must be between 1 and {} seconds",
                MAX_TIMEOUT_SECS
            )));
        }

        let request = match self.mode {
            TestMode::Match => {
                if self.should_match.is_empty() && self.should_not_match.is_empty() {
                    return Err(ApiError::validation(
                        "match mode needs at least one entry in shouldMatch or shouldNotMatch",
                    ));
                }
                RegexRequest::matching(
                    "verification request",
                    self.should_match.clone(),
                    self.should_not_match.clone(),
                )
            }
            TestMode::Capture => {
                if self.capture_tests.is_empty() {
                    return Err(ApiError::validation(
                        "capture mode needs at least one entry in captureTests",
                    ));
                }
                RegexRequest::capturing("verification request", self.capture_tests.clone())
            }
            TestMode::Code => {
                return Err(ApiError::validation("mode must be 'match' or 'capture'"));
            }
        };

        Ok((request, Duration::from_secs(timeout)))
    }
}

/// Successful verification: the test result plus where it ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    #[serde(flatten)]
    pub test_results: TestResult,
    pub sandbox_id: String,
    pub runtime: Runtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    ValidationError,
    SyntaxError,
    ExecutionError,
    TimeoutError,
}

/// Typed error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub code: ApiErrorCode,
}

impl ApiError {
    fn new(code: ApiErrorCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }

    fn validation(error: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::ValidationError, error)
    }

    /// HTTP status code for this error.
    pub fn status(&self) -> u16 {
        match self.code {
            ApiErrorCode::ValidationError => 400,
            ApiErrorCode::SyntaxError => 422,
            ApiErrorCode::ExecutionError => 500,
            ApiErrorCode::TimeoutError => 504,
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        match error {
            Error::Validation(message) => Self::validation(message),
            Error::Timeout(seconds) => Self::new(
                ApiErrorCode::TimeoutError,
                format!("execution timed out after {} seconds", seconds),
            ),
            other => Self::new(ApiErrorCode::ExecutionError, other.to_string()),
        }
    }
}

/// Verifies patterns on demand.
pub struct VerificationEndpoint {
    sandboxes: Arc<SandboxLifecycleManager>,
    executor: VerificationExecutor,
}

impl VerificationEndpoint {
    pub fn new(sandboxes: Arc<SandboxLifecycleManager>) -> Self {
        Self {
            executor: VerificationExecutor::new(sandboxes.clone()),
            sandboxes,
        }
    }

    pub async fn handle(
        &self,
        request: VerifyRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<VerifyResponse, ApiError> {
        let (regex_request, timeout) = request.validate()?;
        let runtime = request.runtime;

        let mut sandbox = self
            .sandboxes
            .get_or_create(runtime, request.sandbox_id.as_deref())
            .await?;

        let candidate = RegexCandidate::new(request.pattern, request.flags);
        let options = VerifyOptions::new(runtime, cancel.clone()).with_timeout(timeout);
        let test_results = self
            .executor
            .execute_regex_test(&mut sandbox, &candidate, &regex_request, &options)
            .await?;

        tracing::info!(
            sandbox_id = %sandbox.id,
            passed = test_results.passed,
            total = test_results.total,
            "verification request handled"
        );

        if let Some(kind) = test_results.error_kind {
            let message = test_results.compile_error.unwrap_or_default();
            let code = match kind {
                ErrorKind::Compile => ApiErrorCode::SyntaxError,
                ErrorKind::Timeout => ApiErrorCode::TimeoutError,
                ErrorKind::Sandbox | ErrorKind::Parse => ApiErrorCode::ExecutionError,
            };
            return Err(ApiError::new(code, message));
        }

        Ok(VerifyResponse {
            test_results,
            sandbox_id: sandbox.id,
            runtime,
        })
    }
}
