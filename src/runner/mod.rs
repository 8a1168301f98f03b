//! Generation service boundary.
//!
//! A generation service turns a system prompt + user prompt (and optionally a
//! response schema) into text. The core treats it as a black box and never
//! retries it. Headless CLI implementations for Claude Code and Gemini CLI
//! are provided.

mod claude;
mod gemini;

pub use claude::ClaudeService;
pub use gemini::GeminiService;

use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::result::TokenUsage;

/// Known generation service identifiers.
pub const KNOWN_PROVIDERS: &[&str] = &["claude-code", "gemini-cli"];

/// Schema for a flat object of required string fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSchema {
    /// Name of the structured output.
    pub name: String,
    /// Required string fields, in prompt order.
    pub fields: Vec<String>,
}

impl ResponseSchema {
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Renders the schema as a JSON Schema document.
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .fields
            .iter()
            .map(|f| (f.clone(), json!({ "type": "string" })))
            .collect();
        json!({
            "title": self.name,
            "type": "object",
            "properties": properties,
            "required": self.fields,
            "additionalProperties": false,
        })
    }

    /// Parses `text` and checks it is an object with exactly the declared
    /// string fields.
    ///
    /// A surrounding markdown code fence is tolerated; nothing else is.
    pub fn parse(&self, text: &str) -> Result<Map<String, Value>> {
        let body = strip_code_fence(text);
        let value: Value = serde_json::from_str(body)
            .map_err(|e| Error::Schema(format!("{} is not valid JSON: {}", self.name, e)))?;

        let Value::Object(object) = value else {
            return Err(Error::Schema(format!("{} must be a JSON object", self.name)));
        };

        for field in &self.fields {
            match object.get(field) {
                Some(Value::String(_)) => {}
                Some(_) => {
                    return Err(Error::Schema(format!(
                        "{}.{} must be a string",
                        self.name, field
                    )))
                }
                None => {
                    return Err(Error::Schema(format!(
                        "{} is missing field '{}'",
                        self.name, field
                    )))
                }
            }
        }

        if let Some(extra) = object.keys().find(|k| !self.fields.contains(k)) {
            return Err(Error::Schema(format!(
                "{} has unexpected field '{}'",
                self.name, extra
            )));
        }

        Ok(object)
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// A single call to the generation service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    /// When set, the response must be a JSON object matching the schema.
    pub response_schema: Option<ResponseSchema>,
}

impl GenerationRequest {
    /// Folds the schema requirement into the system prompt for services
    /// without native structured output.
    pub fn effective_system_prompt(&self) -> String {
        match &self.response_schema {
            Some(schema) => format!(
                "{}\n\nRespond with a single JSON object and nothing else. It must match this JSON Schema:\n{}",
                self.system_prompt,
                schema.to_json_schema()
            ),
            None => self.system_prompt.clone(),
        }
    }
}

/// Output of a generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
}

/// Trait for text-generation services.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Performs one generation call. Implementations never retry.
    async fn generate(&self, request: GenerationRequest) -> Result<Generation>;

    /// Returns the name of this service.
    fn name(&self) -> &str;
}

/// Running total of the usage reported by generation calls.
///
/// Clones share the same total.
#[derive(Debug, Clone, Default)]
pub struct UsageMeter(Arc<Mutex<TokenUsage>>);

impl UsageMeter {
    pub fn record(&self, usage: TokenUsage) {
        *self.lock() += usage;
    }

    pub fn total(&self) -> TokenUsage {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, TokenUsage> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Records the usage of every call that returns, before the caller looks
/// at the text. Output that later fails to parse is still counted.
pub struct MeteredService {
    inner: Arc<dyn GenerationService>,
    meter: UsageMeter,
}

impl MeteredService {
    pub fn new(inner: Arc<dyn GenerationService>, meter: UsageMeter) -> Self {
        Self { inner, meter }
    }
}

#[async_trait]
impl GenerationService for MeteredService {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation> {
        let generation = self.inner.generate(request).await?;
        self.meter.record(generation.usage);
        Ok(generation)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Runs a headless CLI to completion and returns its stdout.
///
/// The child is killed if the returned future is dropped, which is how
/// cancellation reaches the external process.
pub(crate) async fn run_cli(cli_path: &str, args: &[String]) -> Result<String> {
    tracing::debug!(cli = %cli_path, arg_count = args.len(), "invoking generation CLI");

    let output = Command::new(cli_path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::Generation(format!("failed to run {}: {}", cli_path, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Generation(format!(
            "{} exited with {}: {}",
            cli_path,
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
