//! In-memory generation service and sandbox backend.
//!
//! Both replay queued responses and record what they were asked to do, so
//! tests and demos can drive the engine without any external service.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::request::Runtime;
use crate::result::{TestResult, TokenUsage};
use crate::runner::{Generation, GenerationRequest, GenerationService};
use crate::sandbox::{CreateOptions, RunOutput, Sandbox, SandboxBackend};

/// One queued generation reply.
#[derive(Debug, Clone)]
enum MockReply {
    Text(String),
    Error(String),
}

/// Generation service that replays queued replies in order.
pub struct MockGenerationService {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<GenerationRequest>>,
    calls: AtomicUsize,
    usage: TokenUsage,
    delay: Option<Duration>,
}

impl Default for MockGenerationService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGenerationService {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            usage: TokenUsage::new(10, 5),
            delay: None,
        }
    }

    /// Usage reported for every successful call.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Sleeps before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues a raw text reply.
    pub async fn push_text(&self, text: impl Into<String>) {
        self.replies.lock().await.push_back(MockReply::Text(text.into()));
    }

    /// Queues a schema-conforming regex candidate reply.
    pub async fn push_candidate(&self, pattern: &str, flags: &str) {
        let text = serde_json::json!({
            "reasoning": format!("try {}", pattern),
            "pattern": pattern,
            "flags": flags,
        })
        .to_string();
        self.push_text(text).await;
    }

    /// Queues a schema-conforming code candidate reply.
    pub async fn push_code(&self, code: &str) {
        let text = serde_json::json!({
            "reasoning": "direct implementation",
            "code": code,
        })
        .to_string();
        self.push_text(text).await;
    }

    /// Queues a failed call.
    pub async fn push_error(&self, message: impl Into<String>) {
        self.replies.lock().await.push_back(MockReply::Error(message.into()));
    }

    /// Requests received so far, in order.
    pub async fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().await.clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationService for MockGenerationService {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.replies.lock().await.pop_front() {
            Some(MockReply::Text(text)) => Ok(Generation {
                text,
                usage: self.usage,
            }),
            Some(MockReply::Error(message)) => Err(Error::Generation(message)),
            None => Err(Error::Generation("no mock reply queued".to_string())),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// One queued sandbox run outcome.
#[derive(Debug, Clone)]
pub enum MockRun {
    /// The script ran and produced this output.
    Output(RunOutput),
    /// The sandbox has gone away.
    Unavailable,
    /// The run exceeded its timeout.
    Timeout,
    /// The run failed with a generic execution error.
    Error(String),
    /// The run never completes.
    Hang,
}

impl MockRun {
    /// A successful run printing `stdout`.
    pub fn stdout(stdout: impl Into<String>) -> Self {
        MockRun::Output(RunOutput {
            exit_code: 0,
            stdout: stdout.into(),
            artifacts: Vec::new(),
        })
    }

    /// A successful run printing `result` as the verification report.
    pub fn report(result: &TestResult) -> Self {
        Self::stdout(serde_json::to_string(result).unwrap_or_default())
    }

    /// A run that exited with `code`.
    pub fn exit(code: i32, stdout: impl Into<String>) -> Self {
        MockRun::Output(RunOutput {
            exit_code: code,
            stdout: stdout.into(),
            artifacts: Vec::new(),
        })
    }
}

/// Sandbox backend that keeps sandboxes in memory and replays queued runs.
///
/// With an empty queue, a run exits 0 with no output.
pub struct MockSandboxBackend {
    sandboxes: Mutex<HashMap<String, Sandbox>>,
    runs: Mutex<VecDeque<MockRun>>,
    scripts: Mutex<Vec<String>>,
    created: Mutex<Vec<CreateOptions>>,
    create_count: AtomicUsize,
    run_count: AtomicUsize,
    next_id: AtomicUsize,
}

impl Default for MockSandboxBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSandboxBackend {
    pub fn new() -> Self {
        Self {
            sandboxes: Mutex::new(HashMap::new()),
            runs: Mutex::new(VecDeque::new()),
            scripts: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            create_count: AtomicUsize::new(0),
            run_count: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    fn allocate_id(&self) -> String {
        format!("mock-sbx-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Registers a sandbox without counting it as created.
    pub async fn insert_sandbox(&self, runtime: Runtime, network_blocked: bool) -> Sandbox {
        let sandbox = Sandbox {
            id: self.allocate_id(),
            runtime,
            network_blocked,
            ephemeral: true,
        };
        self.sandboxes
            .lock()
            .await
            .insert(sandbox.id.clone(), sandbox.clone());
        sandbox
    }

    /// Removes a sandbox as if the backend had reclaimed it.
    pub async fn expire(&self, id: &str) {
        self.sandboxes.lock().await.remove(id);
    }

    pub async fn push_run(&self, run: MockRun) {
        self.runs.lock().await.push_back(run);
    }

    /// Scripts received by `run`, in order.
    pub async fn scripts(&self) -> Vec<String> {
        self.scripts.lock().await.clone()
    }

    /// Options passed to `create`, in order.
    pub async fn created_options(&self) -> Vec<CreateOptions> {
        self.created.lock().await.clone()
    }

    pub async fn live_count(&self) -> usize {
        self.sandboxes.lock().await.len()
    }

    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    pub fn run_count(&self) -> usize {
        self.run_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxBackend for MockSandboxBackend {
    async fn create(&self, options: CreateOptions) -> Result<Sandbox> {
        self.create_count.fetch_add(1, Ordering::SeqCst);
        let sandbox = Sandbox {
            id: self.allocate_id(),
            runtime: options.runtime,
            network_blocked: options.network_block_all,
            ephemeral: options.ephemeral,
        };
        self.created.lock().await.push(options);
        self.sandboxes
            .lock()
            .await
            .insert(sandbox.id.clone(), sandbox.clone());
        Ok(sandbox)
    }

    async fn get(&self, id: &str) -> Result<Sandbox> {
        self.sandboxes
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SandboxNotFound(id.to_string()))
    }

    async fn delete(&self, sandbox: &Sandbox) -> Result<()> {
        self.sandboxes
            .lock()
            .await
            .remove(&sandbox.id)
            .map(|_| ())
            .ok_or_else(|| Error::SandboxNotFound(sandbox.id.clone()))
    }

    async fn run(&self, sandbox: &Sandbox, script: &str, timeout: Duration) -> Result<RunOutput> {
        self.run_count.fetch_add(1, Ordering::SeqCst);
        self.scripts.lock().await.push(script.to_string());

        let next = self.runs.lock().await.pop_front();
        match next {
            None => Ok(RunOutput::default()),
            Some(MockRun::Output(output)) => Ok(output),
            Some(MockRun::Unavailable) => Err(Error::SandboxExecution(format!(
                "sandbox {} is unavailable",
                sandbox.id
            ))),
            Some(MockRun::Timeout) => Err(Error::timeout(timeout)),
            Some(MockRun::Error(message)) => Err(Error::SandboxExecution(message)),
            Some(MockRun::Hang) => {
                std::future::pending::<()>().await;
                Ok(RunOutput::default())
            }
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
