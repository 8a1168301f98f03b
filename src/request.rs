//! Caller-supplied synthesis requests.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Target runtime whose regex dialect the candidate must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    #[default]
    Javascript,
    Python,
}

impl Runtime {
    /// Returns the wire name of the runtime.
    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Javascript => "javascript",
            Runtime::Python => "python",
        }
    }

    /// Interpreter binary used to run verification scripts.
    pub fn interpreter(&self) -> &'static str {
        match self {
            Runtime::Javascript => "node",
            Runtime::Python => "python3",
        }
    }

    /// File name verification scripts are written to.
    pub fn script_file_name(&self) -> &'static str {
        match self {
            Runtime::Javascript => "verify.js",
            Runtime::Python => "verify.py",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Runtime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "javascript" | "js" | "node" => Ok(Runtime::Javascript),
            "python" | "py" => Ok(Runtime::Python),
            other => Err(Error::Validation(format!("unknown runtime '{}'", other))),
        }
    }
}

/// Verification mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestMode {
    /// Boolean match / no-match against examples.
    Match,
    /// Extracted group values against expected values.
    Capture,
    /// Generated code against expected outputs.
    Code,
}

impl TestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestMode::Match => "match",
            TestMode::Capture => "capture",
            TestMode::Code => "code",
        }
    }
}

/// Examples that must and must not match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRequest {
    pub description: String,
    #[serde(default)]
    pub should_match: Vec<String>,
    #[serde(default)]
    pub should_not_match: Vec<String>,
}

/// One capture-mode test case.
///
/// `expected_groups` excludes the full match; `None` entries are groups that
/// must not participate in the match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureTest {
    pub input: String,
    pub expected_groups: Vec<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_named_groups: Option<BTreeMap<String, Option<String>>>,
}

/// Inputs with the group values a candidate must extract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    pub description: String,
    pub capture_tests: Vec<CaptureTest>,
}

/// A natural-language pattern request with its examples.
///
/// Exactly one shape per request; the serialized form is tagged by `mode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RegexRequest {
    Match(MatchRequest),
    Capture(CaptureRequest),
}

impl RegexRequest {
    /// Builds a match-mode request.
    pub fn matching(
        description: impl Into<String>,
        should_match: Vec<String>,
        should_not_match: Vec<String>,
    ) -> Self {
        RegexRequest::Match(MatchRequest {
            description: description.into(),
            should_match,
            should_not_match,
        })
    }

    /// Builds a capture-mode request.
    pub fn capturing(description: impl Into<String>, capture_tests: Vec<CaptureTest>) -> Self {
        RegexRequest::Capture(CaptureRequest {
            description: description.into(),
            capture_tests,
        })
    }

    pub fn description(&self) -> &str {
        match self {
            RegexRequest::Match(m) => &m.description,
            RegexRequest::Capture(c) => &c.description,
        }
    }

    pub fn test_mode(&self) -> TestMode {
        match self {
            RegexRequest::Match(_) => TestMode::Match,
            RegexRequest::Capture(_) => TestMode::Capture,
        }
    }

    /// Number of test cases the request will produce.
    pub fn case_count(&self) -> usize {
        match self {
            RegexRequest::Match(m) => m.should_match.len() + m.should_not_match.len(),
            RegexRequest::Capture(c) => c.capture_tests.len(),
        }
    }

    /// Rejects requests without any examples.
    pub fn validate(&self) -> Result<()> {
        match self {
            RegexRequest::Match(m) if m.should_match.is_empty() && m.should_not_match.is_empty() => {
                Err(Error::Validation(
                    "match request needs at least one example in shouldMatch or shouldNotMatch"
                        .to_string(),
                ))
            }
            RegexRequest::Capture(c) if c.capture_tests.is_empty() => Err(Error::Validation(
                "capture request needs at least one capture test".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// One input/expected-output pair for generated code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeTestCase {
    pub input: String,
    pub expected: serde_json::Value,
}

/// A code-fallback task: free-form extraction logic verified against cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeTask {
    pub description: String,
    pub test_cases: Vec<CodeTestCase>,
}

impl CodeTask {
    pub fn validate(&self) -> Result<()> {
        if self.test_cases.is_empty() {
            return Err(Error::Validation(
                "code task needs at least one test case".to_string(),
            ));
        }
        Ok(())
    }
}
