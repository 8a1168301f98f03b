//! Gemini CLI generation service.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::result::TokenUsage;

use super::{run_cli, Generation, GenerationRequest, GenerationService};

/// Generation service backed by `gemini --output-format json`.
pub struct GeminiService {
    /// Path to the gemini CLI binary.
    cli_path: String,
    /// Model name (e.g., "gemini-2.5-pro").
    model: Option<String>,
}

impl Default for GeminiService {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiService {
    /// Creates a service using the default `gemini` command.
    pub fn new() -> Self {
        Self {
            cli_path: "gemini".to_string(),
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
    ///
    /// Gemini CLI has no system prompt flag, so both prompts travel in
    /// `--prompt`.
    fn build_args(&self, request: &GenerationRequest) -> Vec<String> {
        let mut args = vec!["--output-format".to_string(), "json".to_string()];

        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.push("--prompt".to_string());
        args.push(format!(
            "{}\n\n---\n\n{}",
            request.effective_system_prompt(),
            request.user_prompt
        ));

        args
    }

    /// Extracts the response text and usage from the JSON envelope.
    ///
    /// Token stats are summed over every model the CLI reports.
    fn parse_envelope(&self, stdout: &str) -> Result<Generation> {
        let envelope: Value = serde_json::from_str(stdout.trim())
            .map_err(|e| Error::Generation(format!("unreadable gemini output: {}", e)))?;

        if let Some(error) = envelope.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(Error::Generation(format!("gemini reported an error: {}", message)));
        }

        let text = envelope
            .get("response")
            .and_then(|r| r.as_str())
            .ok_or_else(|| Error::Generation("gemini output has no response".to_string()))?
            .to_string();

        let mut usage = TokenUsage::default();
        if let Some(models) = envelope
            .pointer("/stats/models")
            .and_then(|m| m.as_object())
        {
            for model in models.values() {
                let field = |name: &str| {
                    model
                        .pointer(&format!("/tokens/{}", name))
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0)
                };
                usage += TokenUsage::new(field("prompt"), field("candidates"));
            }
        }

        Ok(Generation { text, usage })
    }
}

#[async_trait]
impl GenerationService for GeminiService {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation> {
        let args = self.build_args(&request);

        tracing::info!(cli = %self.cli_path, model = ?self.model, "calling Gemini CLI");

        let stdout = run_cli(&self.cli_path, &args).await?;
        self.parse_envelope(&stdout)
    }

    fn name(&self) -> &str {
        "gemini-cli"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            system_prompt: "system".to_string(),
            user_prompt: "match digits".to_string(),
            response_schema: None,
        }
    }

    #[test]
    fn gemini_service_folds_prompts_together() {
        let service = GeminiService::new();
        let args = service.build_args(&request());

        assert!(args.contains(&"--prompt".to_string()));
        let prompt = args.last().unwrap();
        assert!(prompt.starts_with("system"));
        assert!(prompt.ends_with("match digits"));
    }

    #[test]
    fn gemini_service_includes_model_in_args() {
        let service = GeminiService::new().with_model("gemini-2.5-pro");
        let args = service.build_args(&request());

        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"gemini-2.5-pro".to_string()));
    }

    #[test]
    fn gemini_service_sums_usage_across_models() {
        let service = GeminiService::new();
        let stdout = r#"{
            "response": "looks like an anchoring problem",
            "stats": {"models": {
                "gemini-2.5-pro": {"tokens": {"prompt": 100, "candidates": 20}},
                "gemini-2.5-flash": {"tokens": {"prompt": 10, "candidates": 2}}
            }}
        }"#;

        let generation = service.parse_envelope(stdout).unwrap();
        assert_eq!(generation.text, "looks like an anchoring problem");
        assert_eq!(generation.usage, TokenUsage::new(110, 22));
    }

    #[test]
    fn gemini_service_surfaces_reported_errors() {
        let service = GeminiService::new();
        let stdout = r#"{"error": {"type": "ApiError", "message": "quota exceeded"}}"#;

        let err = service.parse_envelope(stdout).unwrap_err();
        assert!(matches!(err, Error::Generation(msg) if msg.contains("quota exceeded")));
    }

    #[test]
    fn gemini_service_has_correct_name() {
        assert_eq!(GeminiService::new().name(), "gemini-cli");
    }

    #[test]
    fn gemini_service_with_custom_path() {
        let service = GeminiService::with_cli_path("/usr/local/bin/gemini");
        assert_eq!(service.cli_path, "/usr/local/bin/gemini");
    }
}
