//! Error types for regex synthesis and verification.

use thiserror::Error;

/// Top-level error type.
///
/// Compile errors and failing test cases are not errors: they are carried as
/// data on [`crate::result::TestResult`] and drive the reflect-and-retry cycle.
#[derive(Error, Debug)]
pub enum Error {
    /// The caller supplied a malformed request.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The generation service call failed.
    #[error("generation failed: {0}")]
    Generation(String),

    /// The generation service returned output that does not match the schema.
    #[error("generation output did not match schema: {0}")]
    Schema(String),

    /// Failed to create a sandbox.
    #[error("failed to create sandbox: {0}")]
    SandboxCreation(String),

    /// The sandbox does not exist on the backend.
    #[error("sandbox {0} not found")]
    SandboxNotFound(String),

    /// Running a script in the sandbox failed.
    #[error("sandbox execution failed: {0}")]
    SandboxExecution(String),

    /// A single sandbox execution exceeded its timeout.
    #[error("execution timed out after {0} seconds")]
    Timeout(u64),

    /// The operation was cancelled through its cancellation token.
    #[error("operation aborted")]
    Aborted,

    /// The session has used up its token budget.
    #[error("token budget exhausted: {used} of {budget} tokens used")]
    BudgetExhausted { used: u64, budget: u64 },

    /// Approval gate misuse.
    #[error("approval error: {0}")]
    Approval(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns true if this error is the result of cancellation.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Aborted)
    }

    /// Timeout error for `limit`, in whole seconds rounded up.
    pub fn timeout(limit: std::time::Duration) -> Self {
        Error::Timeout(limit.as_secs() + u64::from(limit.subsec_nanos() > 0))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
