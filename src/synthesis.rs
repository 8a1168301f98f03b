//! The generate → execute → reflect loop.
//!
//! Each iteration calls the generator exactly once and the executor exactly
//! once per candidate. Reflection only runs for failing iterations. The
//! cancellation token is checked before every state and after every
//! suspension point; an observed abort always wins over failure or
//! exhaustion.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::abort;
use crate::error::{Error, Result};
use crate::generator::CandidateGenerator;
use crate::history::{self, DEFAULT_HISTORY_WINDOW};
use crate::reflector::Reflector;
use crate::request::{RegexRequest, Runtime};
use crate::result::{IterationResult, RegexCandidate, RegexGenerationResult, TestResult, TokenUsage};
use crate::runner::GenerationService;
use crate::sandbox::{ReplacementCallback, Sandbox, SandboxLifecycleManager};
use crate::verify::{VerificationExecutor, VerifyOptions, DEFAULT_EXECUTION_TIMEOUT};

/// Default iteration budget.
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// Pattern returned when a run is aborted before any candidate exists.
/// It never matches anything.
pub const PLACEHOLDER_PATTERN: &str = "(?!)";

/// Loop states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisState {
    Validating,
    AcquiringSandbox,
    Generating,
    Executing,
    Reflecting,
    Done,
    Exhausted,
    Aborted,
}

/// Progress notifications for a status sink.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    StateChanged { state: SynthesisState, iteration: u32 },
    CandidateGenerated { iteration: u32, candidate: RegexCandidate },
    TestsCompleted { iteration: u32, test_results: TestResult },
    SandboxReplaced { sandbox_id: String },
}

/// Options for one loop run.
#[derive(Clone)]
pub struct SynthesisOptions {
    pub max_iterations: u32,
    pub runtime: Runtime,
    /// Sandbox to reuse, if it is still alive.
    pub sandbox_id: Option<String>,
    pub cancel: CancellationToken,
    /// Status sink. Events are dropped rather than awaited when it is full.
    pub events: Option<mpsc::Sender<StatusEvent>>,
    pub history_window: usize,
    pub execution_timeout: Duration,
    /// Whether the result carries the iteration history.
    pub include_history: bool,
    /// Called whenever the sandbox is replaced.
    pub on_sandbox_replaced: Option<ReplacementCallback>,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            runtime: Runtime::default(),
            sandbox_id: None,
            cancel: CancellationToken::new(),
            events: None,
            history_window: DEFAULT_HISTORY_WINDOW,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            include_history: true,
            on_sandbox_replaced: None,
        }
    }
}

impl SynthesisOptions {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            ..Self::default()
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_sandbox_id(mut self, sandbox_id: Option<String>) -> Self {
        self.sandbox_id = sandbox_id;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<StatusEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_include_history(mut self, include: bool) -> Self {
        self.include_history = include;
        self
    }

    pub fn with_replacement_callback(mut self, callback: ReplacementCallback) -> Self {
        self.on_sandbox_replaced = Some(callback);
        self
    }

    fn emit(&self, event: StatusEvent) {
        if let Some(events) = &self.events {
            // A full or closed sink must not add a suspension point.
            let _ = events.try_send(event);
        }
    }

    fn enter(&self, state: SynthesisState, iteration: u32) {
        tracing::debug!(state = ?state, iteration, "synthesis state");
        self.emit(StatusEvent::StateChanged { state, iteration });
    }

    /// Wraps the caller's callback so replacements also reach the sink.
    fn replacement_callback(&self) -> ReplacementCallback {
        let events = self.events.clone();
        let inner = self.on_sandbox_replaced.clone();
        Arc::new(move |sandbox: &Sandbox| {
            if let Some(events) = &events {
                let _ = events.try_send(StatusEvent::SandboxReplaced {
                    sandbox_id: sandbox.id.clone(),
                });
            }
            if let Some(inner) = &inner {
                inner(sandbox);
            }
        })
    }
}

/// Everything a run has produced so far.
struct Progress {
    runtime: Runtime,
    include_history: bool,
    history: Vec<IterationResult>,
    latest: Option<RegexCandidate>,
    latest_results: Option<TestResult>,
    usage: TokenUsage,
    sandbox_id: Option<String>,
}

impl Progress {
    fn new(options: &SynthesisOptions) -> Self {
        Self {
            runtime: options.runtime,
            include_history: options.include_history,
            history: Vec::new(),
            latest: None,
            latest_results: None,
            usage: TokenUsage::default(),
            sandbox_id: options.sandbox_id.clone(),
        }
    }

    fn result(
        self,
        candidate: Option<RegexCandidate>,
        test_results: Option<TestResult>,
        success: bool,
        aborted: bool,
        iterations: u32,
        error: Option<String>,
    ) -> RegexGenerationResult {
        let (pattern, flags) = match candidate {
            Some(c) => (c.pattern, c.flags),
            None => (PLACEHOLDER_PATTERN.to_string(), String::new()),
        };
        RegexGenerationResult {
            pattern,
            flags,
            success,
            aborted,
            error,
            iterations,
            sandbox_id: self.sandbox_id,
            runtime: self.runtime,
            history: (self.include_history || aborted).then_some(self.history),
            test_results,
            token_usage: self.usage,
        }
    }

    /// The history entry with the most passing cases (latest wins ties),
    /// else the latest generated candidate.
    fn best(&self) -> (Option<RegexCandidate>, Option<TestResult>) {
        let best = self
            .history
            .iter()
            .enumerate()
            .max_by_key(|(index, entry)| (entry.test_results.passed_count, *index))
            .map(|(_, entry)| entry);

        match best {
            Some(entry) => (Some(entry.candidate.clone()), Some(entry.test_results.clone())),
            None => (self.latest.clone(), self.latest_results.clone()),
        }
    }

    fn aborted(self) -> RegexGenerationResult {
        let (candidate, test_results) = self.best();
        let iterations = self.history.len() as u32;
        tracing::info!(iterations, "synthesis aborted");
        self.result(candidate, test_results, false, true, iterations, None)
    }
}

/// Drives generator, executor, and reflector across bounded iterations.
pub struct SynthesisLoop {
    generator: CandidateGenerator,
    reflector: Reflector,
    executor: VerificationExecutor,
    sandboxes: Arc<SandboxLifecycleManager>,
}

impl SynthesisLoop {
    pub fn new(service: Arc<dyn GenerationService>, sandboxes: Arc<SandboxLifecycleManager>) -> Self {
        Self {
            generator: CandidateGenerator::new(service.clone()),
            reflector: Reflector::new(service),
            executor: VerificationExecutor::new(sandboxes.clone()),
            sandboxes,
        }
    }

    /// Runs the loop to success, exhaustion, or abort.
    ///
    /// Returns `Err` only for invalid requests and fatal generation or
    /// infrastructure failures.
    pub async fn run(
        &self,
        request: &RegexRequest,
        options: &SynthesisOptions,
    ) -> Result<RegexGenerationResult> {
        options.enter(SynthesisState::Validating, 0);
        request.validate()?;
        if options.max_iterations == 0 {
            return Err(Error::Validation(
                "max_iterations must be at least 1".to_string(),
            ));
        }

        let cancel = &options.cancel;
        let mut progress = Progress::new(options);

        if abort::check(cancel).is_err() {
            options.enter(SynthesisState::Aborted, 0);
            return Ok(progress.aborted());
        }

        options.enter(SynthesisState::AcquiringSandbox, 0);
        let acquired = abort::race(
            cancel,
            self.sandboxes
                .get_or_create(options.runtime, options.sandbox_id.as_deref()),
        )
        .await;
        let mut sandbox = match acquired {
            Ok(sandbox) => sandbox,
            Err(e) if e.is_abort() || cancel.is_cancelled() => {
                options.enter(SynthesisState::Aborted, 0);
                return Ok(progress.aborted());
            }
            Err(e) => return Err(e),
        };

        let on_replaced = options.replacement_callback();
        if options.sandbox_id.as_deref().is_some_and(|id| id != sandbox.id) {
            on_replaced(&sandbox);
        }
        progress.sandbox_id = Some(sandbox.id.clone());

        let verify = VerifyOptions::new(options.runtime, cancel.clone())
            .with_timeout(options.execution_timeout)
            .with_replacement_callback(Some(on_replaced));

        let mut last: Option<(RegexCandidate, TestResult)> = None;

        for index in 0..options.max_iterations {
            let iteration = index + 1;

            macro_rules! abort_on {
                ($result:expr) => {
                    match $result {
                        Ok(value) => value,
                        Err(e) if e.is_abort() || cancel.is_cancelled() => {
                            options.enter(SynthesisState::Aborted, iteration);
                            return Ok(progress.aborted());
                        }
                        Err(e) => return Err(e),
                    }
                };
            }

            abort_on!(abort::check(cancel));
            options.enter(SynthesisState::Generating, iteration);
            let window = history::compact(&progress.history, options.history_window);
            let (candidate, usage) = abort_on!(
                self.generator
                    .generate(request, window, options.runtime, cancel)
                    .await
            );
            progress.usage += usage;
            progress.latest = Some(candidate.clone());
            progress.latest_results = None;
            options.emit(StatusEvent::CandidateGenerated {
                iteration,
                candidate: candidate.clone(),
            });

            abort_on!(abort::check(cancel));
            options.enter(SynthesisState::Executing, iteration);
            let test_results = abort_on!(
                self.executor
                    .execute_regex_test(&mut sandbox, &candidate, request, &verify)
                    .await
            );
            progress.sandbox_id = Some(sandbox.id.clone());
            progress.latest_results = Some(test_results.clone());
            options.emit(StatusEvent::TestsCompleted {
                iteration,
                test_results: test_results.clone(),
            });

            abort_on!(abort::check(cancel));
            if test_results.passed {
                options.enter(SynthesisState::Done, iteration);
                tracing::info!(
                    iterations = iteration,
                    pattern = %candidate.pattern,
                    sandbox_id = %sandbox.id,
                    "synthesis succeeded"
                );
                return Ok(progress.result(
                    Some(candidate),
                    Some(test_results),
                    true,
                    false,
                    iteration,
                    None,
                ));
            }

            options.enter(SynthesisState::Reflecting, iteration);
            let (reflection, usage) = abort_on!(
                self.reflector
                    .reflect(request, &candidate, &test_results, options.runtime, cancel)
                    .await
            );
            progress.usage += usage;
            progress.history.push(IterationResult {
                candidate: candidate.clone(),
                test_results: test_results.clone(),
                reflection,
            });
            last = Some((candidate, test_results));
        }

        options.enter(SynthesisState::Exhausted, options.max_iterations);
        tracing::info!(
            iterations = options.max_iterations,
            sandbox_id = %sandbox.id,
            "synthesis exhausted its iteration budget"
        );

        let (candidate, test_results) = match last {
            Some((candidate, results)) => (Some(candidate), Some(results)),
            None => (None, None),
        };
        let error = format!(
            "no candidate passed every test within {} iterations",
            options.max_iterations
        );
        Ok(progress.result(
            candidate,
            test_results,
            false,
            false,
            options.max_iterations,
            Some(error),
        ))
    }
}
