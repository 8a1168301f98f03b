//! Human approval before running generated code.
//!
//! A code candidate moves through
//! `Generated → ApprovalRequested → {Approved → Executed | Denied} | Aborted`.
//! Nothing runs until an explicit decision arrives. Each request resolves
//! exactly once; later responses for the same id are no-ops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::request::{CodeTask, CodeTestCase, Runtime};
use crate::result::CodeCandidate;

/// Lifecycle of one code candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Generated,
    ApprovalRequested,
    Approved,
    Executed,
    Denied,
    Aborted,
}

impl ApprovalState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApprovalState::Executed | ApprovalState::Denied | ApprovalState::Aborted
        )
    }

    pub fn can_transition_to(&self, next: ApprovalState) -> bool {
        use ApprovalState::*;
        matches!(
            (*self, next),
            (Generated, ApprovalRequested)
                | (Generated, Aborted)
                | (ApprovalRequested, Approved)
                | (ApprovalRequested, Denied)
                | (ApprovalRequested, Aborted)
                | (Approved, Executed)
                | (Approved, Aborted)
        )
    }
}

/// Tracks the state of one candidate and rejects illegal transitions.
#[derive(Debug, Clone)]
pub struct ApprovalTicket {
    tool_call_id: String,
    state: ApprovalState,
}

impl ApprovalTicket {
    pub fn new(tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            state: ApprovalState::Generated,
        }
    }

    pub fn state(&self) -> ApprovalState {
        self.state
    }

    pub fn tool_call_id(&self) -> &str {
        &self.tool_call_id
    }

    pub fn advance(&mut self, next: ApprovalState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Approval(format!(
                "tool call {} cannot move from {:?} to {:?}",
                self.tool_call_id, self.state, next
            )));
        }
        tracing::debug!(tool_call_id = %self.tool_call_id, from = ?self.state, to = ?next, "approval transition");
        self.state = next;
        Ok(())
    }
}

/// An operator's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

/// How a request resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Denied,
    Aborted,
}

/// What the operator is asked to approve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub tool_call_id: String,
    /// Plain-language summary of what will run.
    pub description: String,
    pub proposed_runtime: Runtime,
    pub test_cases: Vec<CodeTestCase>,
    pub code: String,
}

impl ApprovalRequest {
    pub fn for_candidate(
        tool_call_id: impl Into<String>,
        task: &CodeTask,
        runtime: Runtime,
        candidate: &CodeCandidate,
    ) -> Self {
        let description = format!(
            "Run generated {} code against {} test case{} in an isolated sandbox with no network access. Task: {}",
            runtime,
            task.test_cases.len(),
            if task.test_cases.len() == 1 { "" } else { "s" },
            task.description
        );
        Self {
            tool_call_id: tool_call_id.into(),
            description,
            proposed_runtime: runtime,
            test_cases: task.test_cases.clone(),
            code: candidate.code.clone(),
        }
    }
}

/// Suspends callers until an operator approves or denies.
///
/// Requests are delivered to the transport over an mpsc channel; decisions
/// come back through [`ApprovalGate::respond`].
pub struct ApprovalGate {
    pending: StdMutex<HashMap<String, Pending>>,
    next_ticket: AtomicU64,
    notify: mpsc::Sender<ApprovalRequest>,
}

struct Pending {
    ticket: u64,
    sender: oneshot::Sender<ApprovalDecision>,
}

/// Removes its own pending entry when the waiting request goes away,
/// however it ends.
struct PendingGuard<'a> {
    gate: &'a ApprovalGate,
    id: String,
    ticket: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.gate.pending();
        if pending.get(&self.id).is_some_and(|p| p.ticket == self.ticket) {
            pending.remove(&self.id);
        }
    }
}

impl ApprovalGate {
    pub fn new(notify: mpsc::Sender<ApprovalRequest>) -> Self {
        Self {
            pending: StdMutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
            notify,
        }
    }

    /// Creates a gate and the receiver the transport reads requests from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ApprovalRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers `request` and waits for a decision or cancellation.
    ///
    /// A tool call id may be requested again once its previous request has
    /// resolved. Dropping the returned future withdraws the request.
    pub async fn request(
        &self,
        request: ApprovalRequest,
        cancel: &CancellationToken,
    ) -> Result<ApprovalOutcome> {
        if cancel.is_cancelled() {
            return Ok(ApprovalOutcome::Aborted);
        }

        let id = request.tool_call_id.clone();
        let (tx, rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.pending();
            if pending.contains_key(&id) {
                return Err(Error::Approval(format!(
                    "tool call {} is already awaiting approval",
                    id
                )));
            }
            pending.insert(id.clone(), Pending { ticket, sender: tx });
        }
        let _guard = PendingGuard {
            gate: self,
            id: id.clone(),
            ticket,
        };

        tracing::info!(tool_call_id = %id, "requesting approval to run generated code");

        let delivered = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            sent = self.notify.send(request) => Some(sent),
        };
        match delivered {
            None => return Ok(ApprovalOutcome::Aborted),
            Some(Err(_)) => return Err(Error::Approval("approval channel closed".to_string())),
            Some(Ok(())) => {}
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => ApprovalOutcome::Aborted,
            decision = rx => match decision {
                Ok(ApprovalDecision::Approve) => ApprovalOutcome::Approved,
                Ok(ApprovalDecision::Deny) => ApprovalOutcome::Denied,
                Err(_) => ApprovalOutcome::Aborted,
            },
        };

        tracing::info!(tool_call_id = %id, outcome = ?outcome, "approval resolved");
        Ok(outcome)
    }

    /// Resolves a pending request. Returns false, doing nothing, if no
    /// request with this id is waiting.
    pub async fn respond(&self, tool_call_id: &str, decision: ApprovalDecision) -> bool {
        let entry = self.pending().remove(tool_call_id);
        match entry {
            Some(entry) => entry.sender.send(decision).is_ok(),
            None => {
                tracing::debug!(tool_call_id = %tool_call_id, "ignoring response for unknown or resolved approval");
                false
            }
        }
    }

    pub async fn is_pending(&self, tool_call_id: &str) -> bool {
        self.pending().contains_key(tool_call_id)
    }
}
