//! Local process sandbox backend.
//!
//! Each sandbox is a private working directory. Scripts run with the runtime's
//! interpreter behind an isolation prefix (by default
//! `unshare --net --map-root-user`, which gives the child an empty network
//! namespace).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{Error, Result};

use super::provider::{Artifact, CreateOptions, RunOutput, Sandbox, SandboxBackend};

/// Directory, relative to the sandbox root, whose files are returned as
/// artifacts.
pub const ARTIFACTS_DIR: &str = "artifacts";

const DEFAULT_ISOLATION: &[&str] = &["unshare", "--net", "--map-root-user"];

struct Entry {
    sandbox: Sandbox,
    dir: PathBuf,
    last_used: Instant,
    auto_stop: Option<Duration>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.auto_stop
            .is_some_and(|limit| now.duration_since(self.last_used) >= limit)
    }
}

/// Sandbox backend that runs interpreters as local child processes.
pub struct ProcessBackend {
    /// Parent directory for sandbox working directories.
    base_dir: PathBuf,
    /// Command prefix that isolates the interpreter. Empty means none.
    isolation: Vec<String>,
    sandboxes: Mutex<HashMap<String, Entry>>,
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessBackend {
    /// Creates a backend rooted in the system temp directory.
    pub fn new() -> Self {
        Self::with_base_dir(std::env::temp_dir().join("regex-forge-sandboxes"))
    }

    /// Creates a backend rooted in `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            isolation: DEFAULT_ISOLATION.iter().map(|s| s.to_string()).collect(),
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the isolation prefix.
    pub fn with_isolation(mut self, prefix: Vec<String>) -> Self {
        self.isolation = prefix;
        self
    }

    /// Drops the isolation prefix. Such a backend refuses to create sandboxes
    /// that require network blocking.
    pub fn without_network_isolation(mut self) -> Self {
        self.isolation.clear();
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn build_command(&self, interpreter: &str, script_path: &Path, dir: &Path) -> Command {
        let mut command = match self.isolation.split_first() {
            Some((program, rest)) => {
                let mut command = Command::new(program);
                command.args(rest).arg(interpreter);
                command
            }
            None => Command::new(interpreter),
        };
        command
            .arg(script_path)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Looks up a live entry, evicting it if it has expired.
    async fn live_dir(&self, id: &str) -> Result<(Sandbox, PathBuf)> {
        let mut sandboxes = self.sandboxes.lock().await;
        let now = Instant::now();

        let expired = match sandboxes.get(id) {
            None => return Err(Error::SandboxNotFound(id.to_string())),
            Some(entry) => entry.expired(now),
        };

        if expired {
            if let Some(entry) = sandboxes.remove(id) {
                remove_dir(&entry.dir).await;
            }
            tracing::info!(sandbox_id = %id, "sandbox expired after idle period");
            return Err(Error::SandboxExecution(format!("sandbox {} expired", id)));
        }

        match sandboxes.get_mut(id) {
            Some(entry) => {
                entry.last_used = now;
                Ok((entry.sandbox.clone(), entry.dir.clone()))
            }
            None => Err(Error::SandboxNotFound(id.to_string())),
        }
    }
}

async fn remove_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        tracing::warn!(error = %e, path = ?dir, "failed to remove sandbox directory");
    }
}

async fn collect_artifacts(dir: &Path) -> Result<Vec<Artifact>> {
    let artifacts_dir = dir.join(ARTIFACTS_DIR);
    let mut entries = match tokio::fs::read_dir(&artifacts_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut artifacts = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        artifacts.push(Artifact {
            name: entry.file_name().to_string_lossy().into_owned(),
            content: tokio::fs::read(entry.path()).await?,
        });
    }
    artifacts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(artifacts)
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    async fn create(&self, options: CreateOptions) -> Result<Sandbox> {
        if options.network_block_all && self.isolation.is_empty() {
            return Err(Error::SandboxCreation(
                "network blocking requested but no isolation prefix is configured".to_string(),
            ));
        }

        let id = format!("sbx-{}", uuid::Uuid::new_v4());
        let dir = self.base_dir.join(&id);
        tokio::fs::create_dir_all(dir.join(ARTIFACTS_DIR))
            .await
            .map_err(|e| Error::SandboxCreation(format!("{}: {}", dir.display(), e)))?;

        let sandbox = Sandbox {
            id: id.clone(),
            runtime: options.runtime,
            network_blocked: options.network_block_all,
            ephemeral: options.ephemeral,
        };

        let auto_stop = (options.auto_stop_minutes > 0)
            .then(|| Duration::from_secs(u64::from(options.auto_stop_minutes) * 60));

        self.sandboxes.lock().await.insert(
            id.clone(),
            Entry {
                sandbox: sandbox.clone(),
                dir: dir.clone(),
                last_used: Instant::now(),
                auto_stop,
            },
        );

        tracing::debug!(sandbox_id = %id, path = ?dir, "created process sandbox");

        Ok(sandbox)
    }

    async fn get(&self, id: &str) -> Result<Sandbox> {
        self.live_dir(id).await.map(|(sandbox, _)| sandbox)
    }

    async fn delete(&self, sandbox: &Sandbox) -> Result<()> {
        let entry = self.sandboxes.lock().await.remove(&sandbox.id);
        match entry {
            Some(entry) => {
                remove_dir(&entry.dir).await;
                Ok(())
            }
            None => Err(Error::SandboxNotFound(sandbox.id.clone())),
        }
    }

    async fn run(&self, sandbox: &Sandbox, script: &str, timeout: Duration) -> Result<RunOutput> {
        let (live, dir) = self.live_dir(&sandbox.id).await?;

        let script_path = dir.join(live.runtime.script_file_name());
        tokio::fs::write(&script_path, script).await?;

        let command_output = self
            .build_command(live.runtime.interpreter(), &script_path, &dir)
            .output();

        let output = match tokio::time::timeout(timeout, command_output).await {
            Ok(output) => output.map_err(|e| {
                Error::SandboxExecution(format!(
                    "failed to start {}: {}",
                    live.runtime.interpreter(),
                    e
                ))
            })?,
            Err(_) => return Err(Error::timeout(timeout)),
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if exit_code != 0 {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                stdout.push_str(stderr.trim_end());
            }
        }

        Ok(RunOutput {
            exit_code,
            stdout,
            artifacts: collect_artifacts(&dir).await?,
        })
    }

    fn name(&self) -> &str {
        "process"
    }
}

impl Drop for ProcessBackend {
    fn drop(&mut self) {
        for (id, entry) in self.sandboxes.get_mut().drain() {
            if let Err(e) = std::fs::remove_dir_all(&entry.dir) {
                tracing::error!(error = %e, sandbox_id = %id, "failed to clean up sandbox on drop");
            }
        }
    }
}
