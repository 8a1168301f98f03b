//! Verification of candidates inside a sandbox.
//!
//! The executor builds a runtime script, runs it through the
//! [`SandboxLifecycleManager`], and turns whatever comes back into a
//! [`TestResult`]. Under normal operation it never fails: compile errors,
//! crashes, timeouts, and unreadable output all become degraded results.
//! Only aborts and sandbox unavailability that survived the lifecycle
//! manager's single retry are returned as errors.

mod precheck;
mod script;

pub use precheck::precheck;
pub use script::{code_script, regex_script};

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::request::{CodeTask, RegexRequest, Runtime, TestMode};
use crate::result::{
    CaptureCaseResult, CaseResult, CodeCandidate, CodeCaseResult, MatchCaseResult,
    RegexCandidate, TestResult,
};
use crate::sandbox::{
    is_sandbox_unavailable, ExecuteOptions, ReplacementCallback, Sandbox,
    SandboxLifecycleManager,
};

/// Default per-execution timeout.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Options for one verification run.
#[derive(Clone)]
pub struct VerifyOptions {
    pub runtime: Runtime,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    pub on_replaced: Option<ReplacementCallback>,
}

impl VerifyOptions {
    pub fn new(runtime: Runtime, cancel: CancellationToken) -> Self {
        Self {
            runtime,
            timeout: DEFAULT_EXECUTION_TIMEOUT,
            cancel,
            on_replaced: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_replacement_callback(mut self, callback: Option<ReplacementCallback>) -> Self {
        self.on_replaced = callback;
        self
    }

    fn execute_options(&self) -> ExecuteOptions {
        ExecuteOptions::new(self.timeout, self.cancel.clone())
            .with_runtime(self.runtime)
            .with_replacement_callback(self.on_replaced.clone())
    }
}

/// The fields of a script report that are read back.
///
/// Counts and the verdict are recomputed from `results`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptReport {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    compile_error: Option<String>,
}

/// Compiles and runs verification scripts inside sandboxes.
pub struct VerificationExecutor {
    sandboxes: Arc<SandboxLifecycleManager>,
}

impl VerificationExecutor {
    pub fn new(sandboxes: Arc<SandboxLifecycleManager>) -> Self {
        Self { sandboxes }
    }

    /// Verifies a regex candidate against the request's examples.
    ///
    /// If the sandbox is replaced during execution, `sandbox` is updated in
    /// place.
    pub async fn execute_regex_test(
        &self,
        sandbox: &mut Sandbox,
        candidate: &RegexCandidate,
        request: &RegexRequest,
        options: &VerifyOptions,
    ) -> Result<TestResult> {
        let mode = request.test_mode();

        if let Some(message) = precheck(options.runtime, &candidate.pattern, &candidate.flags) {
            tracing::debug!(pattern = %candidate.pattern, error = %message, "pattern rejected by pre-check");
            return Ok(TestResult::compile_failure(mode, message));
        }

        let script = regex_script(options.runtime, candidate, request)?;
        self.run(sandbox, &script, mode, options).await
    }

    /// Verifies a code candidate against the task's test cases.
    pub async fn execute_code_test(
        &self,
        sandbox: &mut Sandbox,
        candidate: &CodeCandidate,
        task: &CodeTask,
        options: &VerifyOptions,
    ) -> Result<TestResult> {
        let script = code_script(options.runtime, candidate, task)?;
        self.run(sandbox, &script, TestMode::Code, options).await
    }

    async fn run(
        &self,
        sandbox: &mut Sandbox,
        script: &str,
        mode: TestMode,
        options: &VerifyOptions,
    ) -> Result<TestResult> {
        let outcome = match self
            .sandboxes
            .execute(sandbox, script, &options.execute_options())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) if e.is_abort() || is_sandbox_unavailable(&e) => return Err(e),
            Err(Error::Timeout(seconds)) => {
                tracing::warn!(sandbox_id = %sandbox.id, seconds, "verification timed out");
                return Ok(TestResult::timeout_failure(mode, seconds));
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %sandbox.id, error = %e, "verification run failed");
                return Ok(TestResult::sandbox_failure(mode, e.to_string()));
            }
        };

        if outcome.exit_code != 0 {
            return Ok(TestResult::sandbox_failure(
                mode,
                format!("exit code {}: {}", outcome.exit_code, outcome.stdout.trim()),
            ));
        }

        Ok(parse_report(mode, &outcome.stdout))
    }
}

/// Decodes the last JSON line of script output.
///
/// Any other output is kept as `stdout` on the result.
pub fn parse_report(mode: TestMode, stdout: &str) -> TestResult {
    let lines: Vec<&str> = stdout.lines().collect();
    let Some(position) = lines.iter().rposition(|l| l.trim_start().starts_with('{')) else {
        return TestResult::parse_failure(mode, "no JSON report in script output")
            .with_stdout(Some(stdout.to_string()));
    };

    let extra: Vec<&str> = lines
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != position)
        .map(|(_, l)| *l)
        .collect();
    let extra = Some(extra.join("\n"));

    let report: ScriptReport = match serde_json::from_str(lines[position].trim()) {
        Ok(report) => report,
        Err(e) => {
            return TestResult::parse_failure(mode, format!("unreadable report: {}", e))
                .with_stdout(extra)
        }
    };

    if let Some(message) = report.compile_error {
        return TestResult::compile_failure(mode, message).with_stdout(extra);
    }

    match decode_cases(mode, report.results) {
        Ok(cases) => TestResult::from_cases(mode, cases).with_stdout(extra),
        Err(e) => TestResult::parse_failure(mode, format!("unreadable case: {}", e)).with_stdout(extra),
    }
}

fn decode_cases(mode: TestMode, raw: Vec<Value>) -> serde_json::Result<Vec<CaseResult>> {
    raw.into_iter()
        .map(|value| {
            Ok(match mode {
                TestMode::Match => CaseResult::Match(serde_json::from_value::<MatchCaseResult>(value)?),
                TestMode::Capture => {
                    CaseResult::Capture(serde_json::from_value::<CaptureCaseResult>(value)?)
                }
                TestMode::Code => CaseResult::Code(serde_json::from_value::<CodeCaseResult>(value)?),
            })
        })
        .collect()
}
