//! Configuration loading, validation, and management for tiller.
//!
//! Loads configuration from `~/.tiller/config.toml` (or `$TILLER_HOME/config.toml`)
//! with environment variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tiller_core::ToolSettings;

/// The root configuration structure.
///
/// Maps directly to `~/.tiller/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Alias (or name) of the model used for new sessions
    #[serde(default = "default_active_model")]
    pub active_model: String,

    /// Stream model output token by token
    #[serde(default = "default_true")]
    pub enable_streaming: bool,

    /// Connect and idle-read timeout for backend calls
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: f64,

    /// Context size (tokens) at which the conversation is compacted
    #[serde(default = "default_auto_compact_threshold")]
    pub auto_compact_threshold: u32,

    /// Warn the model once the context reaches half the compaction threshold
    #[serde(default)]
    pub context_warnings: bool,

    /// Stop after this many backend calls in one session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,

    /// Stop once the session cost (USD) exceeds this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<f64>,

    /// Working directory the file tools are confined to (defaults to cwd)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,

    /// Replaces the built-in system prompt preamble
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Paths the file tools must never touch
    #[serde(default = "default_forbidden_paths")]
    pub forbidden_paths: Vec<String>,

    /// Session logging configuration
    #[serde(default)]
    pub session_logging: SessionLoggingConfig,

    /// Per-tool permission and pattern overrides
    #[serde(default)]
    pub tools: HashMap<String, ToolSettings>,

    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,

    #[serde(default = "default_models")]
    pub models: Vec<ModelConfig>,
}

fn default_active_model() -> String {
    "devstral-medium".into()
}
fn default_true() -> bool {
    true
}
fn default_api_timeout() -> f64 {
    720.0
}
fn default_auto_compact_threshold() -> u32 {
    200_000
}
fn default_forbidden_paths() -> Vec<String> {
    vec!["~/.ssh".into(), "~/.gnupg".into(), "~/.aws".into()]
}

/// Which adapter shape talks to a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// OpenAI-style REST + SSE
    #[default]
    Generic,
    /// Native Anthropic Messages client
    Anthropic,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,

    pub api_base: String,

    /// Environment variable holding the API key; empty for keyless local servers
    #[serde(default)]
    pub api_key_env_var: String,

    /// Inline API key, takes precedence over the environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default)]
    pub backend: BackendKind,
}

impl ProviderConfig {
    /// The API key from config or environment, if any.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            if self.api_key_env_var.is_empty() {
                None
            } else {
                std::env::var(&self.api_key_env_var).ok().filter(|k| !k.is_empty())
            }
        })
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("api_base", &self.api_base)
            .field("api_key_env_var", &self.api_key_env_var)
            .field("api_key", &redact(&self.api_key))
            .field("backend", &self.backend)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider-side model identifier
    pub name: String,

    /// Name of an entry in `providers`
    pub provider: String,

    /// Short name used in `active_model`; defaults to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// USD per million prompt tokens
    #[serde(default)]
    pub input_price: f64,

    /// USD per million completion tokens
    #[serde(default)]
    pub output_price: f64,
}

fn default_temperature() -> f32 {
    0.2
}

impl ModelConfig {
    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLoggingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Defaults to `<config dir>/logs/session`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_dir: Option<PathBuf>,

    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
}

fn default_session_prefix() -> String {
    "session".into()
}

impl Default for SessionLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            save_dir: None,
            session_prefix: default_session_prefix(),
        }
    }
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            name: "mistral".into(),
            api_base: "https://api.mistral.ai/v1".into(),
            api_key_env_var: "MISTRAL_API_KEY".into(),
            api_key: None,
            backend: BackendKind::Generic,
        },
        ProviderConfig {
            name: "anthropic".into(),
            api_base: "https://api.anthropic.com/v1".into(),
            api_key_env_var: "ANTHROPIC_API_KEY".into(),
            api_key: None,
            backend: BackendKind::Anthropic,
        },
        ProviderConfig {
            name: "llamacpp".into(),
            api_base: "http://127.0.0.1:8080/v1".into(),
            api_key_env_var: String::new(),
            api_key: None,
            backend: BackendKind::Generic,
        },
    ]
}

fn default_models() -> Vec<ModelConfig> {
    vec![
        ModelConfig {
            name: "devstral-medium-latest".into(),
            provider: "mistral".into(),
            alias: Some("devstral-medium".into()),
            temperature: default_temperature(),
            input_price: 0.4,
            output_price: 2.0,
        },
        ModelConfig {
            name: "devstral-small-latest".into(),
            provider: "mistral".into(),
            alias: Some("devstral-small".into()),
            temperature: default_temperature(),
            input_price: 0.1,
            output_price: 0.3,
        },
        ModelConfig {
            name: "claude-sonnet-4-5".into(),
            provider: "anthropic".into(),
            alias: Some("sonnet".into()),
            temperature: default_temperature(),
            input_price: 3.0,
            output_price: 15.0,
        },
        ModelConfig {
            name: "devstral".into(),
            provider: "llamacpp".into(),
            alias: Some("local".into()),
            temperature: default_temperature(),
            input_price: 0.0,
            output_price: 0.0,
        },
    ]
}

impl AppConfig {
    /// Load configuration from the default path (`~/.tiller/config.toml`).
    ///
    /// Environment overrides, applied after the file:
    /// - `TILLER_ACTIVE_MODEL`
    /// - `TILLER_STREAMING` (`true`/`false`)
    /// - `TILLER_AUTO_COMPACT_THRESHOLD`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply `TILLER_*` overrides through `lookup`.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(model) = lookup("TILLER_ACTIVE_MODEL") {
            self.active_model = model;
        }

        if let Some(streaming) = lookup("TILLER_STREAMING") {
            self.enable_streaming = streaming.parse().map_err(|_| {
                ConfigError::ValidationError(format!("TILLER_STREAMING must be true or false, got '{streaming}'"))
            })?;
        }

        if let Some(threshold) = lookup("TILLER_AUTO_COMPACT_THRESHOLD") {
            self.auto_compact_threshold = threshold.parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "TILLER_AUTO_COMPACT_THRESHOLD must be a positive integer, got '{threshold}'"
                ))
            })?;
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        std::env::var("TILLER_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| dirs_home().join(".tiller"))
    }

    /// Directory session logs are written to.
    pub fn session_dir(&self) -> PathBuf {
        self.session_logging
            .save_dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("logs").join("session"))
    }

    /// Working directory for tools, falling back to the process cwd.
    pub fn effective_workdir(&self) -> PathBuf {
        self.workdir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_timeout_secs <= 0.0 {
            return Err(ConfigError::ValidationError("api_timeout_secs must be > 0".into()));
        }

        if self.auto_compact_threshold == 0 {
            return Err(ConfigError::ValidationError("auto_compact_threshold must be > 0".into()));
        }

        for model in &self.models {
            if !(0.0..=2.0).contains(&model.temperature) {
                return Err(ConfigError::ValidationError(format!(
                    "model '{}': temperature must be between 0.0 and 2.0",
                    model.alias()
                )));
            }
            if !self.providers.iter().any(|p| p.name == model.provider) {
                return Err(ConfigError::ValidationError(format!(
                    "model '{}' references unknown provider '{}'",
                    model.alias(),
                    model.provider
                )));
            }
        }

        self.active_model()?;
        Ok(())
    }

    /// The model selected by `active_model`, matched by alias first, then name.
    pub fn active_model(&self) -> Result<&ModelConfig, ConfigError> {
        self.models
            .iter()
            .find(|m| m.alias() == self.active_model)
            .or_else(|| self.models.iter().find(|m| m.name == self.active_model))
            .ok_or_else(|| ConfigError::UnknownModel(self.active_model.clone()))
    }

    pub fn provider_for(&self, model: &ModelConfig) -> Result<&ProviderConfig, ConfigError> {
        self.providers
            .iter()
            .find(|p| p.name == model.provider)
            .ok_or_else(|| ConfigError::UnknownProvider(model.provider.clone()))
    }

    /// Configuration as JSON for session metadata, inline keys removed.
    pub fn redacted_snapshot(&self) -> serde_json::Value {
        let mut redacted = self.clone();
        for provider in &mut redacted.providers {
            provider.api_key = None;
        }
        serde_json::to_value(&redacted).unwrap_or(serde_json::Value::Null)
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            active_model: default_active_model(),
            enable_streaming: true,
            api_timeout_secs: default_api_timeout(),
            auto_compact_threshold: default_auto_compact_threshold(),
            context_warnings: false,
            max_turns: None,
            max_price: None,
            workdir: None,
            system_prompt: None,
            forbidden_paths: default_forbidden_paths(),
            session_logging: SessionLoggingConfig::default(),
            tools: HashMap::new(),
            providers: default_providers(),
            models: default_models(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Active model '{0}' is not configured")]
    UnknownModel(String),

    #[error("Provider '{0}' is not configured")]
    UnknownProvider(String),
}

impl From<ConfigError> for tiller_core::Error {
    fn from(err: ConfigError) -> Self {
        tiller_core::Error::Config { message: err.to_string() }
    }
}
