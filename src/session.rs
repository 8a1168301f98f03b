//! Per-conversation state, token budget, and inactivity teardown.
//!
//! Each session has at most one pending cleanup timer. A turn (re)arms the
//! inactivity timer; the last connection closing arms the shorter grace timer
//! instead. Timers carry the session's timer generation at scheduling time
//! and do nothing if it has since moved on.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::result::TokenUsage;
use crate::sandbox::SandboxLifecycleManager;

/// Default inactivity timeout.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Default grace period after the last connection closes.
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(5 * 60);

/// Default cumulative token budget.
pub const DEFAULT_TOKEN_BUDGET: u64 = 250_000;

/// The persisted part of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub token_usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
}

/// Persistence for session state.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>>;
    async fn save(&self, session_id: &str, state: &SessionState) -> Result<()>;
    async fn clear(&self, session_id: &str) -> Result<()>;
}

/// Keeps state in memory only.
#[derive(Default)]
pub struct MemorySessionStore {
    states: Mutex<HashMap<String, SessionState>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        Ok(self.states.lock().await.get(session_id).cloned())
    }

    async fn save(&self, session_id: &str, state: &SessionState) -> Result<()> {
        self.states
            .lock()
            .await
            .insert(session_id.to_string(), state.clone());
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.states.lock().await.remove(session_id);
        Ok(())
    }
}

/// Stores one JSON file per session.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, session_id: &str) -> Result<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::Validation(format!(
                "session id '{}' may only contain letters, digits, '-' and '_'",
                session_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", session_id)))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        let path = self.path(session_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, session_id: &str, state: &SessionState) -> Result<()> {
        let path = self.path(session_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, serde_json::to_vec_pretty(state)?).await?;
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        let path = self.path(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Timeouts and budget for sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub inactivity_timeout: Duration,
    pub disconnect_grace: Duration,
    pub token_budget: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            token_budget: DEFAULT_TOKEN_BUDGET,
        }
    }
}

struct SessionEntry {
    state: SessionState,
    connections: usize,
    cleanup: Option<JoinHandle<()>>,
    timer_generation: u64,
}

impl SessionEntry {
    fn new(state: SessionState) -> Self {
        Self {
            state,
            connections: 0,
            cleanup: None,
            timer_generation: 0,
        }
    }

    fn cancel_cleanup(&mut self) {
        self.timer_generation += 1;
        if let Some(handle) = self.cleanup.take() {
            handle.abort();
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum TimerKind {
    Inactivity,
    Grace,
}

/// Owns every live session's state.
#[derive(Clone)]
pub struct SessionLifecycleManager {
    sessions: Arc<Mutex<HashMap<String, SessionEntry>>>,
    store: Arc<dyn SessionStore>,
    sandboxes: Option<Arc<SandboxLifecycleManager>>,
    config: SessionConfig,
}

impl SessionLifecycleManager {
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            store,
            sandboxes: None,
            config,
        }
    }

    /// Releases each session's sandbox on teardown.
    pub fn with_sandboxes(mut self, sandboxes: Arc<SandboxLifecycleManager>) -> Self {
        self.sandboxes = Some(sandboxes);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Runs `f` on the session's entry, loading it from the store first if
    /// it is not live. The store is never called with the map locked.
    async fn with_entry<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionEntry) -> Result<T>,
    ) -> Result<T> {
        let live = self.sessions.lock().await.contains_key(session_id);
        let loaded = if live {
            None
        } else {
            self.store.load(session_id).await?
        };

        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry::new(loaded.unwrap_or_default()));
        f(entry)
    }

    /// Registers a connection, cancelling any pending teardown.
    pub async fn connect(&self, session_id: &str) -> Result<SessionState> {
        self.with_entry(session_id, |entry| {
            entry.connections += 1;
            entry.cancel_cleanup();
            tracing::debug!(session_id = %session_id, connections = entry.connections, "session connected");
            Ok(entry.state.clone())
        })
        .await
    }

    /// Drops a connection; the last one arms the grace timer.
    pub async fn disconnect(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        let Some(entry) = sessions.get_mut(session_id) else {
            return;
        };
        entry.connections = entry.connections.saturating_sub(1);
        tracing::debug!(session_id = %session_id, connections = entry.connections, "session disconnected");
        if entry.connections == 0 {
            self.schedule(entry, session_id, TimerKind::Grace);
        }
    }

    /// Checks the token budget and re-arms the inactivity timer.
    pub async fn begin_turn(&self, session_id: &str) -> Result<SessionState> {
        self.with_entry(session_id, |entry| {
            let used = entry.state.token_usage.total;
            if used >= self.config.token_budget {
                tracing::warn!(session_id = %session_id, used, budget = self.config.token_budget, "token budget exhausted");
                return Err(Error::BudgetExhausted {
                    used,
                    budget: self.config.token_budget,
                });
            }

            self.schedule(entry, session_id, TimerKind::Inactivity);
            Ok(entry.state.clone())
        })
        .await
    }

    /// Records a finished turn's usage and sandbox, and persists the state.
    pub async fn complete_turn(
        &self,
        session_id: &str,
        usage: TokenUsage,
        sandbox_id: Option<String>,
    ) -> Result<SessionState> {
        let state = self
            .with_entry(session_id, |entry| {
                entry.state.token_usage += usage;
                if sandbox_id.is_some() {
                    entry.state.sandbox_id = sandbox_id;
                }
                Ok(entry.state.clone())
            })
            .await?;
        self.store.save(session_id, &state).await?;
        Ok(state)
    }

    /// Records a sandbox replacement.
    pub async fn update_sandbox(&self, session_id: &str, sandbox_id: &str) -> Result<()> {
        let state = self
            .with_entry(session_id, |entry| {
                entry.state.sandbox_id = Some(sandbox_id.to_string());
                Ok(entry.state.clone())
            })
            .await?;
        self.store.save(session_id, &state).await
    }

    /// Clears the token counters so generation may resume.
    pub async fn reset(&self, session_id: &str) -> Result<SessionState> {
        let state = self
            .with_entry(session_id, |entry| {
                entry.state.token_usage = TokenUsage::default();
                Ok(entry.state.clone())
            })
            .await?;
        self.store.save(session_id, &state).await?;
        tracing::info!(session_id = %session_id, "session token usage reset");
        Ok(state)
    }

    /// Removes all state for the session and releases its sandbox.
    pub async fn teardown(&self, session_id: &str) -> Result<()> {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(session_id)
        };
        let sandbox_id = match removed {
            Some(mut entry) => {
                entry.cancel_cleanup();
                entry.state.sandbox_id
            }
            None => self
                .store
                .load(session_id)
                .await?
                .and_then(|state| state.sandbox_id),
        };
        self.release(session_id, sandbox_id).await
    }

    pub async fn state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|entry| entry.state.clone())
    }

    pub async fn has_pending_cleanup(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .is_some_and(|entry| entry.cleanup.is_some())
    }

    pub async fn connection_count(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map_or(0, |entry| entry.connections)
    }

    fn schedule(&self, entry: &mut SessionEntry, session_id: &str, kind: TimerKind) {
        entry.cancel_cleanup();
        let generation = entry.timer_generation;
        let delay = match kind {
            TimerKind::Inactivity => self.config.inactivity_timeout,
            TimerKind::Grace => self.config.disconnect_grace,
        };

        let manager = self.clone();
        let session_id = session_id.to_string();
        entry.cleanup = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.fire(&session_id, generation, kind).await;
        }));
    }

    async fn fire(&self, session_id: &str, generation: u64, kind: TimerKind) {
        let sandbox_id = {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(session_id) else {
                return;
            };
            if entry.timer_generation != generation {
                return;
            }
            entry.cleanup = None;
            if entry.connections > 0 {
                tracing::debug!(session_id = %session_id, timer = ?kind, "session still connected, keeping state");
                return;
            }
            sessions.remove(session_id).and_then(|entry| entry.state.sandbox_id)
        };

        tracing::info!(session_id = %session_id, timer = ?kind, "tearing down idle session");
        if let Err(e) = self.release(session_id, sandbox_id).await {
            tracing::warn!(session_id = %session_id, error = %e, "session teardown incomplete");
        }
    }

    async fn release(&self, session_id: &str, sandbox_id: Option<String>) -> Result<()> {
        if let (Some(sandboxes), Some(id)) = (&self.sandboxes, sandbox_id.as_deref()) {
            if let Err(e) = sandboxes.release(id).await {
                tracing::warn!(session_id = %session_id, sandbox_id = %id, error = %e, "failed to release sandbox");
            }
        }
        self.store.clear(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSandboxBackend;
    use crate::request::Runtime;
    use tempfile::TempDir;

    fn manager() -> SessionLifecycleManager {
        SessionLifecycleManager::new(Arc::new(MemorySessionStore::new()), SessionConfig::default())
    }

    #[test]
    fn session_config_has_sensible_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.inactivity_timeout, Duration::from_secs(3600));
        assert_eq!(config.disconnect_grace, Duration::from_secs(300));
        assert_eq!(config.token_budget, 250_000);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_timer_tears_down_after_last_disconnect() {
        let manager = manager();
        manager.connect("s1").await.unwrap();
        manager.disconnect("s1").await;
        assert!(manager.has_pending_cleanup("s1").await);

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(manager.state("s1").await.is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(manager.state("s1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_cancels_teardown() {
        let manager = manager();
        manager.connect("s1").await.unwrap();
        manager.disconnect("s1").await;

        tokio::time::sleep(Duration::from_secs(100)).await;
        manager.connect("s1").await.unwrap();
        assert!(!manager.has_pending_cleanup("s1").await);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(manager.state("s1").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_timer_spares_connected_sessions() {
        let manager = manager();
        manager.connect("s1").await.unwrap();
        manager.begin_turn("s1").await.unwrap();

        tokio::time::sleep(Duration::from_secs(3601)).await;
        assert!(manager.state("s1").await.is_some());
        assert!(!manager.has_pending_cleanup("s1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_timer_tears_down_unconnected_sessions() {
        let manager = manager();
        manager.begin_turn("s1").await.unwrap();

        tokio::time::sleep(Duration::from_secs(3601)).await;
        assert!(manager.state("s1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn each_turn_rearms_the_inactivity_timer() {
        let manager = manager();
        manager.begin_turn("s1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1800)).await;
        manager.begin_turn("s1").await.unwrap();

        tokio::time::sleep(Duration::from_secs(1900)).await;
        assert!(manager.state("s1").await.is_some());

        tokio::time::sleep(Duration::from_secs(1800)).await;
        assert!(manager.state("s1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_timer_generation_is_ignored() {
        let manager = manager();
        manager.begin_turn("s1").await.unwrap();
        {
            let mut sessions = manager.sessions.lock().await;
            sessions.get_mut("s1").unwrap().timer_generation += 1;
        }

        manager.fire("s1", 1, TimerKind::Inactivity).await;
        assert!(manager.state("s1").await.is_some());
    }

    #[tokio::test]
    async fn budget_blocks_turns_until_reset() {
        let manager = manager();
        manager
            .complete_turn("s1", TokenUsage::new(200_000, 50_000), None)
            .await
            .unwrap();

        let err = manager.begin_turn("s1").await.unwrap_err();
        assert!(matches!(err, Error::BudgetExhausted { used: 250_000, budget: 250_000 }));

        manager.reset("s1").await.unwrap();
        assert!(manager.begin_turn("s1").await.is_ok());
    }

    #[tokio::test]
    async fn complete_turn_accumulates_and_keeps_sandbox() {
        let manager = manager();
        manager
            .complete_turn("s1", TokenUsage::new(10, 5), Some("sbx-1".to_string()))
            .await
            .unwrap();
        let state = manager
            .complete_turn("s1", TokenUsage::new(1, 1), None)
            .await
            .unwrap();

        assert_eq!(state.token_usage.total, 17);
        assert_eq!(state.sandbox_id.as_deref(), Some("sbx-1"));

        manager.update_sandbox("s1", "sbx-2").await.unwrap();
        assert_eq!(manager.state("s1").await.unwrap().sandbox_id.as_deref(), Some("sbx-2"));
    }

    /// Holds every save until released.
    #[derive(Default)]
    struct HeldStore {
        inner: MemorySessionStore,
        saving: std::sync::atomic::AtomicUsize,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl SessionStore for HeldStore {
        async fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
            self.inner.load(session_id).await
        }

        async fn save(&self, session_id: &str, state: &SessionState) -> Result<()> {
            self.saving.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.release.notified().await;
            self.inner.save(session_id, state).await
        }

        async fn clear(&self, session_id: &str) -> Result<()> {
            self.inner.clear(session_id).await
        }
    }

    #[tokio::test]
    async fn slow_save_does_not_block_other_sessions() {
        let store = Arc::new(HeldStore::default());
        let manager = SessionLifecycleManager::new(store.clone(), SessionConfig::default());

        let saving = tokio::spawn({
            let manager = manager.clone();
            async move {
                manager
                    .complete_turn("s1", TokenUsage::new(10, 5), None)
                    .await
            }
        });
        while store.saving.load(std::sync::atomic::Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let other = tokio::time::timeout(Duration::from_secs(5), manager.connect("s2"))
            .await
            .expect("session map stayed locked during save")
            .unwrap();
        assert_eq!(other.token_usage.total, 0);
        assert_eq!(manager.state("s1").await.unwrap().token_usage.total, 15);

        store.release.notify_one();
        let state = saving.await.unwrap().unwrap();
        assert_eq!(state.token_usage.total, 15);
        assert_eq!(store.load("s1").await.unwrap().unwrap().token_usage.total, 15);
    }

    #[tokio::test]
    async fn state_survives_manager_restart_with_file_store() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FileSessionStore::new(temp.path()));

        let first = SessionLifecycleManager::new(store.clone(), SessionConfig::default());
        first
            .complete_turn("s1", TokenUsage::new(100, 20), Some("sbx-9".to_string()))
            .await
            .unwrap();

        let second = SessionLifecycleManager::new(store, SessionConfig::default());
        let state = second.connect("s1").await.unwrap();
        assert_eq!(state.token_usage.total, 120);
        assert_eq!(state.sandbox_id.as_deref(), Some("sbx-9"));
    }

    #[tokio::test]
    async fn file_store_rejects_path_like_ids() {
        let temp = TempDir::new().unwrap();
        let store = FileSessionStore::new(temp.path());
        assert!(store.load("../etc/passwd").await.is_err());
        assert!(store.load("").await.is_err());
        assert!(store.load("ok-id_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn teardown_releases_sandbox_and_clears_store() {
        let backend = Arc::new(MockSandboxBackend::new());
        let sandboxes = Arc::new(SandboxLifecycleManager::new(backend.clone()));
        let sandbox = sandboxes.get_or_create(Runtime::Javascript, None).await.unwrap();
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionLifecycleManager::new(store.clone(), SessionConfig::default())
            .with_sandboxes(sandboxes);

        manager
            .complete_turn("s1", TokenUsage::new(1, 1), Some(sandbox.id.clone()))
            .await
            .unwrap();
        manager.teardown("s1").await.unwrap();

        assert_eq!(backend.live_count().await, 0);
        assert!(store.load("s1").await.unwrap().is_none());
        assert!(manager.state("s1").await.is_none());
    }
}
