//! Failure diagnosis for the next generation attempt.

use std::fmt::Write as _;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::abort;
use crate::error::Result;
use crate::generator::describe_case;
use crate::request::{RegexRequest, Runtime};
use crate::result::{RegexCandidate, TestResult, TokenUsage};
use crate::runner::{GenerationRequest, GenerationService};

/// Failing cases shown to the service; the rest are summarised by count.
const MAX_LISTED_FAILURES: usize = 10;

/// Asks the generation service why a candidate failed.
pub struct Reflector {
    service: Arc<dyn GenerationService>,
}

impl Reflector {
    pub fn new(service: Arc<dyn GenerationService>) -> Self {
        Self { service }
    }

    /// Returns a short free-text diagnosis. Never retries.
    pub async fn reflect(
        &self,
        request: &RegexRequest,
        candidate: &RegexCandidate,
        test_results: &TestResult,
        runtime: Runtime,
        cancel: &CancellationToken,
    ) -> Result<(String, TokenUsage)> {
        let call = GenerationRequest {
            system_prompt: format!(
                "You review failed {} regular expressions. In two or three sentences, \
                 explain why the pattern fails the listed cases and what to change. \
                 Do not write a new pattern.",
                runtime
            ),
            user_prompt: reflection_prompt(request, candidate, test_results),
            response_schema: None,
        };

        let generation = abort::race(cancel, self.service.generate(call)).await?;
        let reflection = generation.text.trim().to_string();

        tracing::debug!(chars = reflection.len(), "reflection complete");

        Ok((reflection, generation.usage))
    }
}

fn reflection_prompt(
    request: &RegexRequest,
    candidate: &RegexCandidate,
    test_results: &TestResult,
) -> String {
    let mut prompt = format!(
        "Task: {}\nPattern: /{}/{}\n",
        request.description(),
        candidate.pattern,
        candidate.flags
    );

    if let Some(error) = &test_results.compile_error {
        let _ = writeln!(prompt, "The pattern could not be tested: {}", error);
        return prompt;
    }

    let _ = writeln!(
        prompt,
        "Passed {} of {} cases. Failures:",
        test_results.passed_count, test_results.total
    );
    for case in test_results.failing_cases().take(MAX_LISTED_FAILURES) {
        let _ = writeln!(prompt, "- {}", describe_case(case));
    }
    if test_results.failed_count > MAX_LISTED_FAILURES {
        let _ = writeln!(
            prompt,
            "- ... and {} more",
            test_results.failed_count - MAX_LISTED_FAILURES
        );
    }

    prompt
}
