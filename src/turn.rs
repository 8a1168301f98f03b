//! Routes generation tool calls to the regex loop or the code fallback and
//! keeps the session's books.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::abort;
use crate::approval::ApprovalGate;
use crate::error::Result;
use crate::fallback::{CodeFallback, CodeRunResult};
use crate::history::DEFAULT_HISTORY_WINDOW;
use crate::request::{CodeTask, RegexRequest, Runtime};
use crate::result::RegexGenerationResult;
use crate::runner::{GenerationService, MeteredService, UsageMeter};
use crate::sandbox::{ReplacementCallback, Sandbox, SandboxLifecycleManager};
use crate::session::SessionLifecycleManager;
use crate::synthesis::{StatusEvent, SynthesisLoop, SynthesisOptions, DEFAULT_MAX_ITERATIONS};
use crate::verify::DEFAULT_EXECUTION_TIMEOUT;

/// A tool invocation from the conversational layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    #[serde(rename_all = "camelCase")]
    GenerateRegex {
        tool_call_id: String,
        request: RegexRequest,
        #[serde(default)]
        runtime: Runtime,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    GenerateCode {
        tool_call_id: String,
        task: CodeTask,
        #[serde(default)]
        runtime: Runtime,
    },
}

impl ToolCall {
    pub fn tool_call_id(&self) -> &str {
        match self {
            ToolCall::GenerateRegex { tool_call_id, .. } => tool_call_id,
            ToolCall::GenerateCode { tool_call_id, .. } => tool_call_id,
        }
    }
}

/// What a handled tool call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutput {
    Regex(RegexGenerationResult),
    Code(CodeRunResult),
}

/// Per-session tool dispatch.
pub struct TurnHandler {
    service: Arc<dyn GenerationService>,
    sessions: SessionLifecycleManager,
    sandboxes: Arc<SandboxLifecycleManager>,
    gate: Arc<ApprovalGate>,
    history_window: usize,
    execution_timeout: Duration,
    default_max_iterations: u32,
}

impl TurnHandler {
    pub fn new(
        service: Arc<dyn GenerationService>,
        sandboxes: Arc<SandboxLifecycleManager>,
        sessions: SessionLifecycleManager,
        gate: Arc<ApprovalGate>,
    ) -> Self {
        Self {
            service,
            sandboxes,
            sessions,
            gate,
            history_window: DEFAULT_HISTORY_WINDOW,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Iteration budget used when a call does not name one.
    pub fn with_default_max_iterations(mut self, max_iterations: u32) -> Self {
        self.default_max_iterations = max_iterations;
        self
    }

    pub fn sessions(&self) -> &SessionLifecycleManager {
        &self.sessions
    }

    /// Handles one tool call for `session_id`.
    ///
    /// Fails with [`crate::Error::BudgetExhausted`] before doing any work once the
    /// session's token budget is spent. Every generation call the turn makes
    /// is charged to the session, whether the turn succeeds or fails, and
    /// sandbox replacements reach the session as they happen.
    pub async fn handle(
        &self,
        session_id: &str,
        call: ToolCall,
        cancel: &CancellationToken,
        events: Option<mpsc::Sender<StatusEvent>>,
    ) -> Result<TurnOutput> {
        let state = self.sessions.begin_turn(session_id).await?;
        tracing::info!(
            session_id = %session_id,
            tool_call_id = %call.tool_call_id(),
            "handling tool call"
        );

        let meter = UsageMeter::default();
        let service: Arc<dyn GenerationService> =
            Arc::new(MeteredService::new(self.service.clone(), meter.clone()));
        let replacements = ReplacementForwarder::spawn(self.sessions.clone(), session_id);

        let outcome = match call {
            ToolCall::GenerateRegex {
                request,
                runtime,
                max_iterations,
                ..
            } => {
                let mut options = SynthesisOptions::new(runtime)
                    .with_max_iterations(max_iterations.unwrap_or(self.default_max_iterations))
                    .with_sandbox_id(state.sandbox_id)
                    .with_cancel(cancel.clone())
                    .with_history_window(self.history_window)
                    .with_execution_timeout(self.execution_timeout)
                    .with_include_history(false)
                    .with_replacement_callback(replacements.callback());
                if let Some(events) = events {
                    options = options.with_events(events);
                }

                SynthesisLoop::new(service, self.sandboxes.clone())
                    .run(&request, &options)
                    .await
                    .map(TurnOutput::Regex)
            }
            ToolCall::GenerateCode {
                tool_call_id,
                task,
                runtime,
            } => {
                let fallback = CodeFallback::new(service, self.sandboxes.clone(), self.gate.clone())
                    .with_replacement_callback(replacements.callback());
                let existing = state.sandbox_id.as_deref();
                async {
                    task.validate()?;
                    let mut sandbox =
                        abort::race(cancel, self.sandboxes.get_or_create(runtime, existing)).await?;
                    if existing != Some(sandbox.id.as_str()) {
                        replacements.record(&sandbox);
                    }
                    fallback
                        .run(&tool_call_id, &task, runtime, &mut sandbox, cancel, self.execution_timeout)
                        .await
                }
                .await
                .map(TurnOutput::Code)
            }
        };

        let replaced = replacements.finish().await;
        let sandbox_id = match &outcome {
            Ok(TurnOutput::Regex(result)) => result.sandbox_id.clone().or(replaced),
            _ => replaced,
        };
        let usage = meter.total();
        let recorded = self.sessions.complete_turn(session_id, usage, sandbox_id).await;

        if let Err(e) = &outcome {
            tracing::warn!(session_id = %session_id, error = %e, tokens = usage.total, "tool call failed");
        }
        let output = outcome?;
        recorded?;
        Ok(output)
    }
}

/// Passes sandbox replacements on to the session in the order they happen.
///
/// Callbacks run synchronously inside sandbox execution, so ids are queued
/// and a background task applies them. [`ReplacementForwarder::finish`]
/// waits for the queue to drain and returns the last id seen.
struct ReplacementForwarder {
    tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<Option<String>>,
}

impl ReplacementForwarder {
    fn spawn(sessions: SessionLifecycleManager, session_id: &str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let session_id = session_id.to_string();
        let task = tokio::spawn(async move {
            let mut latest = None;
            while let Some(sandbox_id) = rx.recv().await {
                if let Err(e) = sessions.update_sandbox(&session_id, &sandbox_id).await {
                    tracing::warn!(session_id = %session_id, sandbox_id = %sandbox_id, error = %e, "failed to record sandbox replacement");
                }
                latest = Some(sandbox_id);
            }
            latest
        });
        Self { tx, task }
    }

    fn record(&self, sandbox: &Sandbox) {
        let _ = self.tx.send(sandbox.id.clone());
    }

    fn callback(&self) -> ReplacementCallback {
        let tx = self.tx.clone();
        Arc::new(move |sandbox: &Sandbox| {
            let _ = tx.send(sandbox.id.clone());
        })
    }

    /// Every callback handed out must be dropped first.
    async fn finish(self) -> Option<String> {
        drop(self.tx);
        self.task.await.unwrap_or_default()
    }
}
