//! Code fallback: generate code, get it approved, then verify it.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalGate, ApprovalOutcome, ApprovalRequest, ApprovalState, ApprovalTicket};
use crate::error::Result;
use crate::generator::CandidateGenerator;
use crate::request::{CodeTask, Runtime};
use crate::result::{CodeCandidate, TestResult, TokenUsage};
use crate::runner::GenerationService;
use crate::sandbox::{ReplacementCallback, Sandbox, SandboxLifecycleManager};
use crate::verify::{VerificationExecutor, VerifyOptions};

/// Terminal outcome of one code attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CodeOutcome {
    /// Approved and verified.
    Executed {
        candidate: CodeCandidate,
        test_results: TestResult,
    },
    /// The operator refused; nothing ran.
    Denied { candidate: CodeCandidate },
    /// Cancelled before execution finished; any candidate is discarded.
    Aborted,
}

/// Result of [`CodeFallback::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct CodeRunResult {
    pub outcome: CodeOutcome,
    /// Final approval state.
    pub state: ApprovalState,
    pub usage: TokenUsage,
}

/// Generator + approval gate + executor for tasks a regex cannot express.
pub struct CodeFallback {
    generator: CandidateGenerator,
    executor: VerificationExecutor,
    gate: Arc<ApprovalGate>,
    on_replaced: Option<ReplacementCallback>,
}

impl CodeFallback {
    pub fn new(
        service: Arc<dyn GenerationService>,
        sandboxes: Arc<SandboxLifecycleManager>,
        gate: Arc<ApprovalGate>,
    ) -> Self {
        Self {
            generator: CandidateGenerator::new(service),
            executor: VerificationExecutor::new(sandboxes),
            gate,
            on_replaced: None,
        }
    }

    /// Notified when the sandbox is recreated during verification.
    pub fn with_replacement_callback(mut self, callback: ReplacementCallback) -> Self {
        self.on_replaced = Some(callback);
        self
    }

    /// Runs one attempt. A denied or aborted attempt ends only this attempt;
    /// the same tool call id may be run again.
    pub async fn run(
        &self,
        tool_call_id: &str,
        task: &CodeTask,
        runtime: Runtime,
        sandbox: &mut Sandbox,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<CodeRunResult> {
        task.validate()?;

        let mut ticket = ApprovalTicket::new(tool_call_id);
        let mut usage = TokenUsage::default();

        let candidate = match self.generator.generate_code(task, runtime, cancel).await {
            Ok((candidate, generation_usage)) => {
                usage += generation_usage;
                candidate
            }
            Err(e) if e.is_abort() => return aborted(ticket, usage),
            Err(e) => return Err(e),
        };

        ticket.advance(ApprovalState::ApprovalRequested)?;
        let request = ApprovalRequest::for_candidate(tool_call_id, task, runtime, &candidate);

        match self.gate.request(request, cancel).await? {
            ApprovalOutcome::Aborted => return aborted(ticket, usage),
            ApprovalOutcome::Denied => {
                ticket.advance(ApprovalState::Denied)?;
                return Ok(CodeRunResult {
                    outcome: CodeOutcome::Denied { candidate },
                    state: ticket.state(),
                    usage,
                });
            }
            ApprovalOutcome::Approved => ticket.advance(ApprovalState::Approved)?,
        }

        let options = VerifyOptions::new(runtime, cancel.clone())
            .with_timeout(timeout)
            .with_replacement_callback(self.on_replaced.clone());
        let test_results = match self
            .executor
            .execute_code_test(sandbox, &candidate, task, &options)
            .await
        {
            Ok(results) => results,
            Err(e) if e.is_abort() => return aborted(ticket, usage),
            Err(e) => return Err(e),
        };

        ticket.advance(ApprovalState::Executed)?;
        tracing::info!(
            tool_call_id = %tool_call_id,
            passed = test_results.passed_count,
            total = test_results.total,
            "generated code executed"
        );

        Ok(CodeRunResult {
            outcome: CodeOutcome::Executed {
                candidate,
                test_results,
            },
            state: ticket.state(),
            usage,
        })
    }
}

fn aborted(mut ticket: ApprovalTicket, usage: TokenUsage) -> Result<CodeRunResult> {
    ticket.advance(ApprovalState::Aborted)?;
    Ok(CodeRunResult {
        outcome: CodeOutcome::Aborted,
        state: ticket.state(),
        usage,
    })
}
