#![deny(unsafe_code)]

//! Configuration loading and validation for Colloquy.
//!
//! Loads TOML configuration files and validates them against expected shapes.
//! Provides [`AppConfig`] as the central configuration structure and
//! [`ProviderConfig`] as the per-backend credential shape consumed by the
//! provider client cache.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("provider {0} is not configured")]
    ProviderNotConfigured(ProviderKind),

    #[error("environment variable {0} is not set")]
    MissingEnvVar(String),
}

/// A named LLM backend with its own credential shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Anthropic Messages API (hosted).
    Anthropic,
    /// OpenAI Chat Completions API (hosted).
    #[serde(rename = "openai")]
    OpenAi,
    /// Ollama server, OpenAI-compatible wire format (self-hosted).
    Ollama,
}

impl ProviderKind {
    /// Stable identifier used in config tables and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Ollama => "ollama",
        }
    }

    /// Whether this backend is a hosted API requiring an API key.
    /// Self-hosted backends authenticate by network reachability alone.
    pub fn is_hosted(&self) -> bool {
        match self {
            ProviderKind::Anthropic | ProviderKind::OpenAi => true,
            ProviderKind::Ollama => false,
        }
    }

    /// Endpoint used when the config does not override `api_url`.
    pub fn default_api_url(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Ollama => "http://localhost:11434/v1",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An API key, zeroized on drop and redacted in debug output.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key, for building request headers.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(redacted)")
    }
}

// Full-value equality: a changed key must read as a different config so the
// client cache discards its slot.
impl PartialEq for ApiKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for ApiKey {}

/// The resolved configuration for one provider.
///
/// Validity is shape-dependent: hosted backends need a non-blank URL *and*
/// key; self-hosted backends need only a non-blank URL. Equality is by full
/// value (URL and key included), which is what the client cache keys on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderConfig {
    /// A hosted cloud API.
    Standard {
        provider: ProviderKind,
        api_url: String,
        api_key: Option<ApiKey>,
    },
    /// A self-hosted server reachable by URL alone.
    Local {
        provider: ProviderKind,
        api_url: String,
    },
}

impl ProviderConfig {
    pub fn provider(&self) -> ProviderKind {
        match self {
            ProviderConfig::Standard { provider, .. } | ProviderConfig::Local { provider, .. } => {
                *provider
            }
        }
    }

    pub fn api_url(&self) -> &str {
        match self {
            ProviderConfig::Standard { api_url, .. } | ProviderConfig::Local { api_url, .. } => {
                api_url
            }
        }
    }

    pub fn api_key(&self) -> Option<&ApiKey> {
        match self {
            ProviderConfig::Standard { api_key, .. } => api_key.as_ref(),
            ProviderConfig::Local { .. } => None,
        }
    }

    /// Shape-dependent validity check, used before committing a candidate
    /// configuration and before handing it to the client cache.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            ProviderConfig::Standard {
                provider,
                api_url,
                api_key,
            } => {
                if api_url.trim().is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "providers.{provider}.api_url must not be blank"
                    )));
                }
                match api_key {
                    Some(key) if !key.is_blank() => Ok(()),
                    _ => Err(ConfigError::Validation(format!(
                        "providers.{provider} requires an api_key"
                    ))),
                }
            }
            ProviderConfig::Local { provider, api_url } => {
                if api_url.trim().is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "providers.{provider}.api_url must not be blank"
                    )));
                }
                Ok(())
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Active conversation defaults.
    #[serde(default)]
    pub chat: ChatConfig,

    /// Per-provider connection entries, keyed by provider id.
    #[serde(default)]
    pub providers: BTreeMap<ProviderKind, ProviderEntry>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which provider and model new conversations use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Active provider id.
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,

    /// Active model id (provider-specific).
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
        }
    }
}

fn default_provider() -> ProviderKind {
    ProviderKind::Anthropic
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

/// One `[providers.<id>]` table as written in TOML.
///
/// The key may be given inline (`api_key`) or sourced from an environment
/// variable (`api_key_env`); the inline form wins when both are present.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Endpoint override. Defaults per provider when absent.
    #[serde(default)]
    pub api_url: Option<String>,

    /// Inline API key. Avoid in shared config files.
    #[serde(default)]
    pub api_key: Option<ApiKey>,

    /// Environment variable to read the key from.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Key presence is *not* checked here — env-sourced keys are resolved at
    /// [`AppConfig::provider_config`] time, after the process environment is
    /// known.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chat.model.trim().is_empty() {
            return Err(ConfigError::Validation(
                "chat.model must not be empty".to_string(),
            ));
        }
        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }
        for (provider, entry) in &self.providers {
            if let Some(url) = &entry.api_url {
                if url.trim().is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "providers.{provider}.api_url must not be blank"
                    )));
                }
            }
            if let Some(var) = &entry.api_key_env {
                if var.trim().is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "providers.{provider}.api_key_env must not be blank"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve the [`ProviderConfig`] for one provider, sourcing env-based
    /// keys and applying default endpoints.
    pub fn provider_config(&self, provider: ProviderKind) -> Result<ProviderConfig, ConfigError> {
        let entry = self
            .providers
            .get(&provider)
            .cloned()
            .or_else(|| (!provider.is_hosted()).then(ProviderEntry::default))
            .ok_or(ConfigError::ProviderNotConfigured(provider))?;

        let api_url = entry
            .api_url
            .unwrap_or_else(|| provider.default_api_url().to_string());

        let config = if provider.is_hosted() {
            let api_key = match (entry.api_key, entry.api_key_env) {
                (Some(key), _) => Some(key),
                (None, Some(var)) => Some(ApiKey::new(
                    std::env::var(&var).map_err(|_| ConfigError::MissingEnvVar(var))?,
                )),
                (None, None) => None,
            };
            ProviderConfig::Standard {
                provider,
                api_url,
                api_key,
            }
        } else {
            ProviderConfig::Local { provider, api_url }
        };

        config.validate()?;
        tracing::debug!(provider = %provider, url = %config.api_url(), "resolved provider configuration");
        Ok(config)
    }

    /// Resolve the active provider's configuration.
    pub fn active_provider_config(&self) -> Result<ProviderConfig, ConfigError> {
        self.provider_config(self.chat.provider)
    }
}
