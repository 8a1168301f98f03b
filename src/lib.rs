//! Regex Forge - synthesizes regular expressions from examples
//!
//! This library drives a generation service through a bounded
//! generate → execute → reflect loop, verifying every candidate against the
//! caller's examples inside a network-isolated sandbox before returning it.

pub mod abort;
pub mod api;
pub mod approval;
pub mod config;
pub mod error;
pub mod fallback;
pub mod generator;
pub mod history;
pub mod mock;
pub mod reflector;
pub mod request;
pub mod result;
pub mod runner;
pub mod sandbox;
pub mod session;
pub mod synthesis;
pub mod turn;
pub mod verify;

pub use error::{Error, Result};

pub use api::{ApiError, ApiErrorCode, VerificationEndpoint, VerifyRequest, VerifyResponse};
pub use approval::{
    ApprovalDecision, ApprovalGate, ApprovalOutcome, ApprovalRequest, ApprovalState,
    ApprovalTicket,
};
pub use config::{EngineConfig, Validate, ValidationResult};
pub use fallback::{CodeFallback, CodeOutcome, CodeRunResult};
pub use generator::CandidateGenerator;
pub use history::compact as compact_history;
pub use reflector::Reflector;
pub use request::{
    CaptureRequest, CaptureTest, CodeTask, CodeTestCase, MatchRequest, RegexRequest, Runtime,
    TestMode,
};
pub use result::{
    CaseResult, CodeCandidate, ErrorKind, IterationResult, RegexCandidate,
    RegexGenerationResult, TestResult, TokenUsage,
};
pub use runner::{
    ClaudeService, GeminiService, Generation, GenerationRequest, GenerationService,
    MeteredService, ResponseSchema, UsageMeter,
};
pub use sandbox::{ProcessBackend, Sandbox, SandboxBackend, SandboxLifecycleManager};
pub use session::{
    FileSessionStore, MemorySessionStore, SessionConfig, SessionLifecycleManager, SessionState,
    SessionStore,
};
pub use synthesis::{StatusEvent, SynthesisLoop, SynthesisOptions, SynthesisState};
pub use turn::{ToolCall, TurnHandler, TurnOutput};
pub use verify::VerificationExecutor;
