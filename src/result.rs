//! Candidate, verification, and loop result types.

use std::collections::BTreeMap;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use crate::request::{Runtime, TestMode};

/// Prefix for degraded results caused by sandbox process failures.
pub const SANDBOX_ERROR_PREFIX: &str = "SANDBOX ERROR: ";

/// Prefix for degraded results caused by unreadable script output.
pub const PARSE_ERROR_PREFIX: &str = "PARSE ERROR: ";

/// A generated regex proposed for verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegexCandidate {
    pub pattern: String,
    pub flags: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl RegexCandidate {
    pub fn new(pattern: impl Into<String>, flags: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            flags: flags.into(),
            reasoning: None,
        }
    }
}

/// A generated code snippet for the code-fallback path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeCandidate {
    pub reasoning: String,
    pub code: String,
}

/// Outcome of one match-mode example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCaseResult {
    pub input: String,
    pub expected: bool,
    pub actual: bool,
    pub passed: bool,
}

/// Outcome of one capture-mode test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureCaseResult {
    pub input: String,
    pub expected: Vec<Option<String>>,
    pub actual: Option<Vec<Option<String>>>,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub named_groups: Option<BTreeMap<String, Option<String>>>,
}

/// Outcome of one code-mode test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeCaseResult {
    pub input: String,
    pub expected: serde_json::Value,
    pub actual: serde_json::Value,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-case outcome; the shape follows the result's `test_mode`.
///
/// Script output is decoded per mode in [`crate::verify`], so the untagged
/// form only matters for re-reading serialized results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CaseResult {
    Match(MatchCaseResult),
    Capture(CaptureCaseResult),
    Code(CodeCaseResult),
}

impl CaseResult {
    pub fn passed(&self) -> bool {
        match self {
            CaseResult::Match(c) => c.passed,
            CaseResult::Capture(c) => c.passed,
            CaseResult::Code(c) => c.passed,
        }
    }

    pub fn input(&self) -> &str {
        match self {
            CaseResult::Match(c) => &c.input,
            CaseResult::Capture(c) => &c.input,
            CaseResult::Code(c) => &c.input,
        }
    }
}

/// Why a result carries no (or partial) case data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The pattern or code failed to compile.
    Compile,
    /// The sandbox process exited abnormally.
    Sandbox,
    /// The sandbox execution hit its timeout.
    Timeout,
    /// The script output could not be decoded.
    Parse,
}

/// Structured pass/fail verdict for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub passed: bool,
    pub total: usize,
    pub passed_count: usize,
    pub failed_count: usize,
    pub results: Vec<CaseResult>,
    pub test_mode: TestMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
}

impl TestResult {
    /// Builds a result from evaluated cases, deriving counts and the verdict.
    pub fn from_cases(test_mode: TestMode, results: Vec<CaseResult>) -> Self {
        let passed_count = results.iter().filter(|r| r.passed()).count();
        let total = results.len();
        Self {
            passed: passed_count == total,
            total,
            passed_count,
            failed_count: total - passed_count,
            results,
            test_mode,
            compile_error: None,
            error_kind: None,
            stdout: None,
        }
    }

    /// A result for a candidate that failed to compile; no cases are evaluated.
    pub fn compile_failure(test_mode: TestMode, message: impl Into<String>) -> Self {
        Self::failure(test_mode, message.into(), ErrorKind::Compile)
    }

    /// A degraded result for a sandbox process failure.
    pub fn sandbox_failure(test_mode: TestMode, message: impl AsRef<str>) -> Self {
        Self::failure(
            test_mode,
            format!("{}{}", SANDBOX_ERROR_PREFIX, message.as_ref()),
            ErrorKind::Sandbox,
        )
    }

    /// A degraded result for an execution that ran out of time.
    pub fn timeout_failure(test_mode: TestMode, seconds: u64) -> Self {
        Self::failure(
            test_mode,
            format!(
                "{}execution timed out after {} seconds",
                SANDBOX_ERROR_PREFIX, seconds
            ),
            ErrorKind::Timeout,
        )
    }

    /// A degraded result for script output that could not be decoded.
    pub fn parse_failure(test_mode: TestMode, message: impl AsRef<str>) -> Self {
        Self::failure(
            test_mode,
            format!("{}{}", PARSE_ERROR_PREFIX, message.as_ref()),
            ErrorKind::Parse,
        )
    }

    fn failure(test_mode: TestMode, message: String, kind: ErrorKind) -> Self {
        Self {
            passed: false,
            total: 0,
            passed_count: 0,
            failed_count: 0,
            results: Vec::new(),
            test_mode,
            compile_error: Some(message),
            error_kind: Some(kind),
            stdout: None,
        }
    }

    /// Attaches captured stdout.
    pub fn with_stdout(mut self, stdout: Option<String>) -> Self {
        self.stdout = stdout.filter(|s| !s.trim().is_empty());
        self
    }

    /// Iterates over the cases that did not pass.
    pub fn failing_cases(&self) -> impl Iterator<Item = &CaseResult> {
        self.results.iter().filter(|r| !r.passed())
    }
}

/// Token accounting for generation-service calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total: u64,
    pub prompt: u64,
    pub completion: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            total: prompt + completion,
            prompt,
            completion,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.prompt += other.prompt;
        self.completion += other.completion;
    }
}

/// One completed, non-passing iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationResult {
    pub candidate: RegexCandidate,
    pub test_results: TestResult,
    pub reflection: String,
}

/// Terminal value of a synthesis loop run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegexGenerationResult {
    pub pattern: String,
    pub flags: String,
    pub success: bool,
    #[serde(default)]
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    pub runtime: Runtime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<IterationResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_results: Option<TestResult>,
    #[serde(default)]
    pub token_usage: TokenUsage,
}
