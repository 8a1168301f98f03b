//! Sandbox backend trait and types.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::request::Runtime;

/// Handle to an externally-owned, ephemeral execution environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sandbox {
    /// Opaque backend identifier.
    pub id: String,
    /// Runtime the sandbox was created for.
    pub runtime: Runtime,
    /// Whether outbound network access is blocked.
    pub network_blocked: bool,
    /// Whether the backend discards the sandbox when the session ends.
    pub ephemeral: bool,
}

/// Options for creating a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    pub runtime: Runtime,
    pub network_block_all: bool,
    pub ephemeral: bool,
    /// Backend-side idle stop interval, independent of session cleanup.
    pub auto_stop_minutes: u32,
}

impl CreateOptions {
    /// Options every sandbox created by this crate uses.
    pub fn isolated(runtime: Runtime, auto_stop_minutes: u32) -> Self {
        Self {
            runtime,
            network_block_all: true,
            ephemeral: true,
            auto_stop_minutes,
        }
    }
}

/// A file produced by a sandboxed script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub content: Vec<u8>,
}

/// Raw output of one script run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub artifacts: Vec<Artifact>,
}

/// Backend that creates and runs sandboxes.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Creates a new sandbox.
    async fn create(&self, options: CreateOptions) -> Result<Sandbox>;

    /// Fetches an existing sandbox by id.
    async fn get(&self, id: &str) -> Result<Sandbox>;

    /// Deletes a sandbox and everything in it.
    async fn delete(&self, sandbox: &Sandbox) -> Result<()>;

    /// Runs a script to completion inside the sandbox.
    async fn run(&self, sandbox: &Sandbox, script: &str, timeout: Duration) -> Result<RunOutput>;

    /// Returns the name of this backend.
    fn name(&self) -> &str;
}
