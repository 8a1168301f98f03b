//! Sandbox acquisition, reuse, and transparent recreation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::abort;
use crate::error::{Error, Result};
use crate::request::Runtime;

use super::provider::{Artifact, CreateOptions, Sandbox, SandboxBackend};

/// Default backend-side idle stop interval.
pub const DEFAULT_AUTO_STOP_MINUTES: u32 = 15;

/// Called with the replacement whenever a sandbox is recreated.
pub type ReplacementCallback = Arc<dyn Fn(&Sandbox) + Send + Sync>;

/// Options for a single execution.
#[derive(Clone)]
pub struct ExecuteOptions {
    /// Per-execution timeout.
    pub timeout: Duration,
    /// Runtime to recreate the sandbox with. Without it, unavailability is
    /// not recovered.
    pub runtime: Option<Runtime>,
    /// Cancellation token.
    pub cancel: CancellationToken,
    /// Notified when the sandbox is replaced.
    pub on_replaced: Option<ReplacementCallback>,
}

impl ExecuteOptions {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            timeout,
            runtime: None,
            cancel,
            on_replaced: None,
        }
    }

    /// Enables recreate-and-retry for this runtime.
    pub fn with_runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_replacement_callback(mut self, callback: Option<ReplacementCallback>) -> Self {
        self.on_replaced = callback;
        self
    }
}

/// Output of an execution, plus the replacement sandbox if one was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub artifacts: Vec<Artifact>,
    pub recreated_sandbox: Option<Sandbox>,
}

/// Best-effort check for "the sandbox is gone" failures.
///
/// Backends report these only through error messages, so this is a narrow
/// string heuristic: the message mentions "unavailable", "not found",
/// "expired", "does not exist", or both "sandbox" and "error". It can
/// misclassify; callers get at most one extra retry from a false positive.
pub fn is_sandbox_unavailable(error: &Error) -> bool {
    if error.is_abort() {
        return false;
    }
    if matches!(error, Error::SandboxNotFound(_)) {
        return true;
    }

    let message = match error {
        Error::SandboxExecution(m) | Error::SandboxCreation(m) => m.to_lowercase(),
        other => other.to_string().to_lowercase(),
    };
    const MARKERS: &[&str] = &["unavailable", "not found", "expired", "does not exist"];
    MARKERS.iter().any(|m| message.contains(m))
        || (message.contains("sandbox") && message.contains("error"))
}

/// Creates, reuses, and recreates sandboxes on a backend.
///
/// Runtime-agnostic: it never interprets script output.
pub struct SandboxLifecycleManager {
    backend: Arc<dyn SandboxBackend>,
    auto_stop_minutes: u32,
}

impl SandboxLifecycleManager {
    pub fn new(backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            backend,
            auto_stop_minutes: DEFAULT_AUTO_STOP_MINUTES,
        }
    }

    /// Sets the backend-side idle stop interval for new sandboxes.
    pub fn with_auto_stop_minutes(mut self, minutes: u32) -> Self {
        self.auto_stop_minutes = minutes;
        self
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    /// Reuses `existing_id` when it is still alive, network-isolated and
    /// set up for `runtime`, otherwise creates a fresh sandbox.
    ///
    /// A live sandbox for a different runtime is deleted before the new one
    /// is created.
    pub async fn get_or_create(&self, runtime: Runtime, existing_id: Option<&str>) -> Result<Sandbox> {
        if let Some(id) = existing_id {
            match self.backend.get(id).await {
                Ok(sandbox) if sandbox.network_blocked && sandbox.runtime == runtime => {
                    tracing::debug!(sandbox_id = %id, "reusing sandbox");
                    return Ok(sandbox);
                }
                Ok(sandbox) if sandbox.runtime != runtime => {
                    tracing::info!(
                        sandbox_id = %id,
                        existing = %sandbox.runtime,
                        requested = %runtime,
                        "existing sandbox has a different runtime, creating a new one"
                    );
                    if let Err(e) = self.backend.delete(&sandbox).await {
                        tracing::warn!(sandbox_id = %id, error = %e, "failed to delete mismatched sandbox");
                    }
                }
                Ok(_) => {
                    tracing::warn!(
                        sandbox_id = %id,
                        "existing sandbox allows network egress, creating a new one"
                    );
                }
                Err(e) => {
                    tracing::info!(sandbox_id = %id, error = %e, "existing sandbox unavailable, creating a new one");
                }
            }
        }

        self.create(runtime).await
    }

    async fn create(&self, runtime: Runtime) -> Result<Sandbox> {
        let sandbox = self
            .backend
            .create(CreateOptions::isolated(runtime, self.auto_stop_minutes))
            .await?;

        tracing::info!(
            sandbox_id = %sandbox.id,
            runtime = %runtime,
            backend = self.backend.name(),
            "created sandbox"
        );

        Ok(sandbox)
    }

    /// Runs `script` in `sandbox`.
    ///
    /// On a sandbox-unavailable failure with a runtime hint, creates exactly
    /// one replacement, stores it in `sandbox`, notifies the callback, and
    /// retries once. Aborts are never retried.
    pub async fn execute(
        &self,
        sandbox: &mut Sandbox,
        script: &str,
        options: &ExecuteOptions,
    ) -> Result<ExecutionOutcome> {
        let first = abort::race(
            &options.cancel,
            self.backend.run(sandbox, script, options.timeout),
        )
        .await;

        let error = match first {
            Ok(output) => {
                return Ok(ExecutionOutcome {
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    artifacts: output.artifacts,
                    recreated_sandbox: None,
                })
            }
            Err(e) => e,
        };

        let runtime = match options.runtime {
            Some(runtime) if is_sandbox_unavailable(&error) => runtime,
            _ => return Err(error),
        };

        tracing::warn!(
            sandbox_id = %sandbox.id,
            error = %error,
            "sandbox unavailable, recreating and retrying once"
        );

        let replacement = abort::race(&options.cancel, self.create(runtime)).await?;
        *sandbox = replacement.clone();
        if let Some(callback) = &options.on_replaced {
            callback(&replacement);
        }

        let output = abort::race(
            &options.cancel,
            self.backend.run(sandbox, script, options.timeout),
        )
        .await?;

        Ok(ExecutionOutcome {
            exit_code: output.exit_code,
            stdout: output.stdout,
            artifacts: output.artifacts,
            recreated_sandbox: Some(replacement),
        })
    }

    /// Deletes the sandbox with `id`, if it still exists.
    pub async fn release(&self, id: &str) -> Result<()> {
        let sandbox = match self.backend.get(id).await {
            Ok(sandbox) => sandbox,
            Err(e) if is_sandbox_unavailable(&e) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.backend.delete(&sandbox).await?;
        tracing::info!(sandbox_id = %id, "released sandbox");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRun, MockSandboxBackend};
    use std::sync::Mutex;

    fn manager(backend: &Arc<MockSandboxBackend>) -> SandboxLifecycleManager {
        SandboxLifecycleManager::new(backend.clone())
    }

    fn options() -> ExecuteOptions {
        ExecuteOptions::new(Duration::from_secs(5), CancellationToken::new())
    }

    #[test]
    fn unavailability_heuristic_matches_known_messages() {
        assert!(is_sandbox_unavailable(&Error::SandboxNotFound("x".into())));
        assert!(is_sandbox_unavailable(&Error::SandboxExecution(
            "sandbox sbx-1 expired".into()
        )));
        assert!(is_sandbox_unavailable(&Error::SandboxExecution(
            "Service Unavailable".into()
        )));
        assert!(is_sandbox_unavailable(&Error::SandboxExecution(
            "workspace does not exist".into()
        )));
        assert!(is_sandbox_unavailable(&Error::SandboxCreation(
            "Sandbox error: container gone".into()
        )));
    }

    #[test]
    fn unavailability_heuristic_ignores_other_failures() {
        assert!(!is_sandbox_unavailable(&Error::Aborted));
        assert!(!is_sandbox_unavailable(&Error::Timeout(10)));
        assert!(!is_sandbox_unavailable(&Error::Generation(
            "rate limited".into()
        )));
        assert!(!is_sandbox_unavailable(&Error::SandboxExecution(
            "interpreter crashed".into()
        )));
    }

    #[tokio::test]
    async fn get_or_create_reuses_live_isolated_sandbox() {
        let backend = Arc::new(MockSandboxBackend::new());
        let existing = backend.insert_sandbox(Runtime::Javascript, true).await;

        let sandbox = manager(&backend)
            .get_or_create(Runtime::Javascript, Some(&existing.id))
            .await
            .unwrap();

        assert_eq!(sandbox.id, existing.id);
        assert_eq!(backend.create_count(), 0);
    }

    #[tokio::test]
    async fn get_or_create_replaces_missing_sandbox() {
        let backend = Arc::new(MockSandboxBackend::new());

        let sandbox = manager(&backend)
            .get_or_create(Runtime::Python, Some("gone"))
            .await
            .unwrap();

        assert_ne!(sandbox.id, "gone");
        assert!(sandbox.network_blocked);
        assert!(sandbox.ephemeral);
        assert_eq!(backend.create_count(), 1);
    }

    #[tokio::test]
    async fn get_or_create_replaces_sandbox_with_network_access() {
        let backend = Arc::new(MockSandboxBackend::new());
        let open = backend.insert_sandbox(Runtime::Javascript, false).await;

        let sandbox = manager(&backend)
            .get_or_create(Runtime::Javascript, Some(&open.id))
            .await
            .unwrap();

        assert_ne!(sandbox.id, open.id);
        assert_eq!(backend.create_count(), 1);
    }

    #[tokio::test]
    async fn get_or_create_replaces_sandbox_for_other_runtime() {
        let backend = Arc::new(MockSandboxBackend::new());
        let node = backend.insert_sandbox(Runtime::Javascript, true).await;

        let sandbox = manager(&backend)
            .get_or_create(Runtime::Python, Some(&node.id))
            .await
            .unwrap();

        assert_ne!(sandbox.id, node.id);
        assert_eq!(sandbox.runtime, Runtime::Python);
        assert_eq!(backend.create_count(), 1);
        assert_eq!(backend.live_count().await, 1);
    }

    #[tokio::test]
    async fn new_sandboxes_use_configured_auto_stop() {
        let backend = Arc::new(MockSandboxBackend::new());
        manager(&backend)
            .with_auto_stop_minutes(7)
            .get_or_create(Runtime::Javascript, None)
            .await
            .unwrap();

        let options = backend.created_options().await;
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].auto_stop_minutes, 7);
        assert!(options[0].network_block_all);
    }

    #[tokio::test]
    async fn execute_recreates_once_on_unavailable() {
        let backend = Arc::new(MockSandboxBackend::new());
        backend.push_run(MockRun::Unavailable).await;
        backend.push_run(MockRun::stdout("{}")).await;

        let manager = manager(&backend);
        let mut sandbox = manager.get_or_create(Runtime::Javascript, None).await.unwrap();
        let original_id = sandbox.id.clone();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ReplacementCallback = Arc::new(move |s: &Sandbox| {
            sink.lock().unwrap().push(s.id.clone());
        });
        let options = options()
            .with_runtime(Runtime::Javascript)
            .with_replacement_callback(Some(callback));

        let outcome = manager.execute(&mut sandbox, "script", &options).await.unwrap();

        assert_eq!(outcome.stdout, "{}");
        let replacement = outcome.recreated_sandbox.unwrap();
        assert_ne!(replacement.id, original_id);
        assert_eq!(sandbox.id, replacement.id);
        assert_eq!(*seen.lock().unwrap(), vec![replacement.id.clone()]);
        assert_eq!(backend.run_count(), 2);
        assert_eq!(backend.create_count(), 2);
    }

    #[tokio::test]
    async fn execute_propagates_second_unavailability() {
        let backend = Arc::new(MockSandboxBackend::new());
        backend.push_run(MockRun::Unavailable).await;
        backend.push_run(MockRun::Unavailable).await;

        let manager = manager(&backend);
        let mut sandbox = manager.get_or_create(Runtime::Javascript, None).await.unwrap();
        let options = options().with_runtime(Runtime::Javascript);

        let err = manager.execute(&mut sandbox, "script", &options).await.unwrap_err();

        assert!(is_sandbox_unavailable(&err));
        assert_eq!(backend.run_count(), 2);
        assert_eq!(backend.create_count(), 2);
    }

    #[tokio::test]
    async fn execute_without_runtime_hint_does_not_retry() {
        let backend = Arc::new(MockSandboxBackend::new());
        backend.push_run(MockRun::Unavailable).await;

        let manager = manager(&backend);
        let mut sandbox = manager.get_or_create(Runtime::Javascript, None).await.unwrap();

        let err = manager.execute(&mut sandbox, "script", &options()).await.unwrap_err();

        assert!(is_sandbox_unavailable(&err));
        assert_eq!(backend.run_count(), 1);
        assert_eq!(backend.create_count(), 1);
    }

    #[tokio::test]
    async fn execute_does_not_retry_other_failures() {
        let backend = Arc::new(MockSandboxBackend::new());
        backend.push_run(MockRun::Timeout).await;

        let manager = manager(&backend);
        let mut sandbox = manager.get_or_create(Runtime::Javascript, None).await.unwrap();
        let options = options().with_runtime(Runtime::Javascript);

        let err = manager.execute(&mut sandbox, "script", &options).await.unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(backend.run_count(), 1);
    }

    #[tokio::test]
    async fn execute_rejects_when_already_aborted() {
        let backend = Arc::new(MockSandboxBackend::new());
        let manager = manager(&backend);
        let mut sandbox = manager.get_or_create(Runtime::Javascript, None).await.unwrap();

        let options = options().with_runtime(Runtime::Javascript);
        options.cancel.cancel();

        let err = manager.execute(&mut sandbox, "script", &options).await.unwrap_err();

        assert!(err.is_abort());
        assert_eq!(backend.run_count(), 0);
    }

    #[tokio::test]
    async fn release_deletes_and_ignores_missing() {
        let backend = Arc::new(MockSandboxBackend::new());
        let manager = manager(&backend);
        let sandbox = manager.get_or_create(Runtime::Javascript, None).await.unwrap();

        manager.release(&sandbox.id).await.unwrap();
        assert!(backend.get(&sandbox.id).await.is_err());

        manager.release(&sandbox.id).await.unwrap();
    }
}
