//! Claude Code CLI generation service.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::result::TokenUsage;

use super::{run_cli, Generation, GenerationRequest, GenerationService};

/// Generation service backed by `claude --print`.
pub struct ClaudeService {
    /// Path to the claude CLI binary.
    cli_path: String,
    /// Model alias (e.g., "sonnet", "haiku").
    model: Option<String>,
}

impl Default for ClaudeService {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeService {
    /// Creates a service using the default `claude` command.
    pub fn new() -> Self {
        Self {
            cli_path: "claude".to_string(),
            model: None,
        }
    }

    /// Creates a service with a custom CLI path.
    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
            model: None,
        }
    }

    /// Sets the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Builds the command arguments for one generation call.
    fn build_args(&self, request: &GenerationRequest) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
            "--system-prompt".to_string(),
            request.effective_system_prompt(),
        ];

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.push("-p".to_string());
        args.push(request.user_prompt.clone());

        args
    }

    /// Extracts the response text and usage from the `--output-format json`
    /// envelope.
    fn parse_envelope(&self, stdout: &str) -> Result<Generation> {
        let envelope: Value = serde_json::from_str(stdout.trim())
            .map_err(|e| Error::Generation(format!("unreadable claude output: {}", e)))?;

        if envelope.get("is_error").and_then(|v| v.as_bool()) == Some(true) {
            let message = envelope
                .get("result")
                .and_then(|r| r.as_str())
                .unwrap_or("unknown error");
            return Err(Error::Generation(format!("claude reported an error: {}", message)));
        }

        let text = envelope
            .get("result")
            .and_then(|r| r.as_str())
            .ok_or_else(|| Error::Generation("claude output has no result".to_string()))?
            .to_string();

        let usage = envelope
            .get("usage")
            .map(|u| {
                let field = |name: &str| u.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
                let prompt = field("input_tokens")
                    + field("cache_creation_input_tokens")
                    + field("cache_read_input_tokens");
                TokenUsage::new(prompt, field("output_tokens"))
            })
            .unwrap_or_default();

        Ok(Generation { text, usage })
    }
}

#[async_trait]
impl GenerationService for ClaudeService {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation> {
        let args = self.build_args(&request);

        tracing::info!(cli = %self.cli_path, model = ?self.model, "calling Claude CLI");

        let stdout = run_cli(&self.cli_path, &args).await?;
        let generation = self.parse_envelope(&stdout)?;

        tracing::debug!(
            tokens = generation.usage.total,
            chars = generation.text.len(),
            "claude generation complete"
        );

        Ok(generation)
    }

    fn name(&self) -> &str {
        "claude-code"
    }
}
