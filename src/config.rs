//! Engine configuration and its validation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::request::Runtime;
use crate::runner::{ClaudeService, GeminiService, GenerationService, KNOWN_PROVIDERS};
use crate::session::SessionConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "REGEX_FORGE_CONFIG";

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Fatal issues.
    pub errors: Vec<String>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    fn validate(&self) -> ValidationResult;
}

/// The `[synthesis]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Failed iterations shown to the generator.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default)]
    pub runtime: Runtime,
}

fn default_max_iterations() -> u32 {
    5
}

fn default_history_window() -> usize {
    3
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            history_window: default_history_window(),
            runtime: Runtime::default(),
        }
    }
}

impl Validate for SynthesisConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.max_iterations == 0 {
            result.add_error("synthesis.max_iterations must be at least 1");
        }
        if self.max_iterations > 20 {
            result.add_warning("synthesis.max_iterations over 20 may spend a large token budget");
        }
        if self.history_window == 0 {
            result.add_error("synthesis.history_window must be at least 1");
        }

        result
    }
}

/// The `[sandbox]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,
    /// Idle minutes before the backend stops a sandbox.
    #[serde(default = "default_auto_stop_minutes")]
    pub auto_stop_minutes: u32,
    /// Command prefix that isolates sandbox processes from the network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<Vec<String>>,
}

fn default_execution_timeout() -> u64 {
    10
}

fn default_auto_stop_minutes() -> u32 {
    15
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: default_execution_timeout(),
            auto_stop_minutes: default_auto_stop_minutes(),
            isolation: None,
        }
    }
}

impl SandboxConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.execution_timeout_secs == 0 {
            result.add_error("sandbox.execution_timeout_secs must be at least 1");
        }
        if self.execution_timeout_secs > 60 {
            result.add_warning("sandbox.execution_timeout_secs over 60 slows down every failing iteration");
        }
        if self.auto_stop_minutes == 0 {
            result.add_error("sandbox.auto_stop_minutes must be at least 1");
        }
        if self.isolation.as_ref().is_some_and(|prefix| prefix.is_empty()) {
            result.add_warning("sandbox.isolation is empty; sandboxes will not be network-isolated");
        }

        result
    }
}

/// The `[session]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_disconnect_grace")]
    pub disconnect_grace_secs: u64,
    #[serde(default = "default_token_budget")]
    pub token_budget: u64,
}

fn default_inactivity_timeout() -> u64 {
    3600
}

fn default_disconnect_grace() -> u64 {
    300
}

fn default_token_budget() -> u64 {
    250_000
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_timeout(),
            disconnect_grace_secs: default_disconnect_grace(),
            token_budget: default_token_budget(),
        }
    }
}

impl SessionSection {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
            disconnect_grace: Duration::from_secs(self.disconnect_grace_secs),
            token_budget: self.token_budget,
        }
    }
}

impl Validate for SessionSection {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.disconnect_grace_secs >= self.inactivity_timeout_secs {
            result.add_error("session.disconnect_grace_secs must be less than session.inactivity_timeout_secs");
        }
        if self.token_budget == 0 {
            result.add_error("session.token_budget must be at least 1");
        }

        result
    }
}

/// The `[generation]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Overrides the provider's CLI binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<String>,
}

fn default_provider() -> String {
    "claude-code".to_string()
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            cli_path: None,
        }
    }
}

impl GenerationConfig {
    /// Builds the configured generation service.
    pub fn service(&self) -> Result<Arc<dyn GenerationService>> {
        let service: Arc<dyn GenerationService> = match self.provider.as_str() {
            "claude-code" => {
                let mut service = match &self.cli_path {
                    Some(path) => ClaudeService::with_cli_path(path),
                    None => ClaudeService::new(),
                };
                if let Some(model) = &self.model {
                    service = service.with_model(model);
                }
                Arc::new(service)
            }
            "gemini-cli" => {
                let mut service = match &self.cli_path {
                    Some(path) => GeminiService::with_cli_path(path),
                    None => GeminiService::new(),
                };
                if let Some(model) = &self.model {
                    service = service.with_model(model);
                }
                Arc::new(service)
            }
            other => {
                return Err(Error::Config(format!(
                    "unknown generation provider '{}'",
                    other
                )))
            }
        };
        Ok(service)
    }
}

impl Validate for GenerationConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if !KNOWN_PROVIDERS.contains(&self.provider.as_str()) {
            result.add_error(format!(
                "unknown generation provider '{}', expected one of: {}",
                self.provider,
                KNOWN_PROVIDERS.join(", ")
            ));
        }

        result
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub generation: GenerationConfig,
}

impl EngineConfig {
    /// Reads and validates a TOML config file. Warnings are logged.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid config: {}", e)))?;
        for warning in config.validate().into_result()? {
            tracing::warn!(warning = %warning, "configuration warning");
        }
        Ok(config)
    }

    /// Loads the file named by `REGEX_FORGE_CONFIG`, or the defaults when it
    /// is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

impl Validate for EngineConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = self.synthesis.validate();
        result.merge(self.sandbox.validate());
        result.merge(self.session.validate());
        result.merge(self.generation.validate());
        result
    }
}
