//! Candidate generation.
//!
//! Prompts are built deterministically from the request and history, so
//! identical inputs always produce identical prompts. Generation output must
//! match the candidate schema exactly; anything else is an
//! [`Error::Schema`] for that iteration.

use std::fmt::Write as _;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::abort;
use crate::error::{Error, Result};
use crate::request::{CodeTask, RegexRequest, Runtime};
use crate::result::{CaseResult, CodeCandidate, IterationResult, RegexCandidate, TokenUsage};
use crate::runner::{GenerationRequest, GenerationService, ResponseSchema};

/// Schema every regex candidate reply must match.
pub fn candidate_schema() -> ResponseSchema {
    ResponseSchema::new("regex_candidate", &["reasoning", "pattern", "flags"])
}

/// Schema every code candidate reply must match.
pub fn code_schema() -> ResponseSchema {
    ResponseSchema::new("code_candidate", &["reasoning", "code"])
}

/// Turns a request plus prior attempts into a candidate.
pub struct CandidateGenerator {
    service: Arc<dyn GenerationService>,
}

impl CandidateGenerator {
    pub fn new(service: Arc<dyn GenerationService>) -> Self {
        Self { service }
    }

    /// Generates one regex candidate. Never retries.
    pub async fn generate(
        &self,
        request: &RegexRequest,
        history: &[IterationResult],
        runtime: Runtime,
        cancel: &CancellationToken,
    ) -> Result<(RegexCandidate, TokenUsage)> {
        let call = GenerationRequest {
            system_prompt: regex_system_prompt(runtime),
            user_prompt: regex_user_prompt(request, history),
            response_schema: Some(candidate_schema()),
        };

        let generation = abort::race(cancel, self.service.generate(call)).await?;
        let fields = candidate_schema().parse(&generation.text)?;

        let candidate = RegexCandidate {
            pattern: string_field(&fields, "pattern")?,
            flags: string_field(&fields, "flags")?,
            reasoning: Some(string_field(&fields, "reasoning")?),
        };

        tracing::debug!(
            service = self.service.name(),
            pattern = %candidate.pattern,
            flags = %candidate.flags,
            "generated candidate"
        );

        Ok((candidate, generation.usage))
    }

    /// Generates one code candidate defining `solve(input)`. Never retries.
    pub async fn generate_code(
        &self,
        task: &CodeTask,
        runtime: Runtime,
        cancel: &CancellationToken,
    ) -> Result<(CodeCandidate, TokenUsage)> {
        let call = GenerationRequest {
            system_prompt: code_system_prompt(runtime),
            user_prompt: code_user_prompt(task),
            response_schema: Some(code_schema()),
        };

        let generation = abort::race(cancel, self.service.generate(call)).await?;
        let fields = code_schema().parse(&generation.text)?;

        Ok((
            CodeCandidate {
                reasoning: string_field(&fields, "reasoning")?,
                code: string_field(&fields, "code")?,
            },
            generation.usage,
        ))
    }
}

fn string_field(fields: &serde_json::Map<String, Value>, name: &str) -> Result<String> {
    fields
        .get(name)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Schema(format!("missing string field '{}'", name)))
}

fn dialect(runtime: Runtime) -> &'static str {
    match runtime {
        Runtime::Javascript => "JavaScript (ECMAScript RegExp; flags from \"dgimsuvy\")",
        Runtime::Python => "Python (the re module; flags from \"imsxa\")",
    }
}

fn regex_system_prompt(runtime: Runtime) -> String {
    format!(
        "You write regular expressions for the {} dialect. \
         Candidates are tested against the user's examples in a sandbox. \
         Return the pattern without delimiters and the flags as a string, \
         empty if none.",
        dialect(runtime)
    )
}

/// Renders the request and the compacted history.
pub fn regex_user_prompt(request: &RegexRequest, history: &[IterationResult]) -> String {
    let mut prompt = format!("Task: {}\n", request.description());

    match request {
        RegexRequest::Match(m) => {
            prompt.push_str("\nMust match:\n");
            for example in &m.should_match {
                let _ = writeln!(prompt, "- {:?}", example);
            }
            prompt.push_str("\nMust NOT match:\n");
            for example in &m.should_not_match {
                let _ = writeln!(prompt, "- {:?}", example);
            }
        }
        RegexRequest::Capture(c) => {
            prompt.push_str("\nCapture tests (groups exclude the full match, null = group must not participate):\n");
            for test in &c.capture_tests {
                let groups = serde_json::to_string(&test.expected_groups).unwrap_or_default();
                let _ = write!(prompt, "- input {:?} -> groups {}", test.input, groups);
                if let Some(named) = &test.expected_named_groups {
                    let named = serde_json::to_string(named).unwrap_or_default();
                    let _ = write!(prompt, ", named {}", named);
                }
                prompt.push('\n');
            }
        }
    }

    if !history.is_empty() {
        prompt.push_str("\nPrevious attempts that failed:\n");
        for (index, attempt) in history.iter().enumerate() {
            let results = &attempt.test_results;
            let _ = writeln!(
                prompt,
                "\nAttempt {}: /{}/{}",
                index + 1,
                attempt.candidate.pattern,
                attempt.candidate.flags
            );
            match &results.compile_error {
                Some(error) => {
                    let _ = writeln!(prompt, "Error: {}", error);
                }
                None => {
                    let _ = writeln!(prompt, "Passed {}/{}", results.passed_count, results.total);
                    for case in results.failing_cases() {
                        let _ = writeln!(prompt, "  failed: {}", describe_case(case));
                    }
                }
            }
            let _ = writeln!(prompt, "Diagnosis: {}", attempt.reflection);
        }
    }

    prompt
}

/// One-line summary of a failing case.
pub(crate) fn describe_case(case: &CaseResult) -> String {
    match case {
        CaseResult::Match(m) => format!(
            "{:?} expected {} but {}",
            m.input,
            if m.expected { "match" } else { "no match" },
            if m.actual { "matched" } else { "did not match" }
        ),
        CaseResult::Capture(c) => format!(
            "{:?} expected {} got {}",
            c.input,
            serde_json::to_string(&c.expected).unwrap_or_default(),
            serde_json::to_string(&c.actual).unwrap_or_default()
        ),
        CaseResult::Code(c) => match &c.error {
            Some(error) => format!("{:?} raised {}", c.input, error),
            None => format!("{:?} expected {} got {}", c.input, c.expected, c.actual),
        },
    }
}

fn code_system_prompt(runtime: Runtime) -> String {
    let language = match runtime {
        Runtime::Javascript => "JavaScript",
        Runtime::Python => "Python 3",
    };
    format!(
        "A regular expression cannot express this task, so write {} code instead. \
         Define a function named solve that takes the input string and returns a \
         JSON-serialisable value. Use only the standard library; the code runs \
         in a sandbox with no network access.",
        language
    )
}

fn code_user_prompt(task: &CodeTask) -> String {
    let mut prompt = format!("Task: {}\n\nTest cases:\n", task.description);
    for case in &task.test_cases {
        let _ = writeln!(prompt, "- solve({:?}) == {}", case.input, case.expected);
    }
    prompt
}
