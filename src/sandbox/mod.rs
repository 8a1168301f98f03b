//! Sandboxes for running verification scripts.
//!
//! This module provides the [`SandboxBackend`] trait, the
//! [`SandboxLifecycleManager`] that reuses and transparently recreates
//! sandboxes, and the [`ProcessBackend`] implementation using local,
//! network-isolated child processes.

mod lifecycle;
mod process;
mod provider;

pub use lifecycle::{
    is_sandbox_unavailable, ExecuteOptions, ExecutionOutcome, ReplacementCallback,
    SandboxLifecycleManager, DEFAULT_AUTO_STOP_MINUTES,
};
pub use process::{ProcessBackend, ARTIFACTS_DIR};
pub use provider::{Artifact, CreateOptions, RunOutput, Sandbox, SandboxBackend};
