//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use colloquy_config::{ApiKey, AppConfig, ProviderEntry, ProviderKind};

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .active(ProviderKind::Ollama, "llama3")
///     .provider_key(ProviderKind::Anthropic, "sk-test")
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    /// Set the active provider and model.
    pub fn active(mut self, provider: ProviderKind, model: &str) -> Self {
        self.config.chat.provider = provider;
        self.config.chat.model = model.to_string();
        self
    }

    /// Register a provider with an inline API key.
    pub fn provider_key(mut self, provider: ProviderKind, key: &str) -> Self {
        self.config.providers.entry(provider).or_default().api_key = Some(ApiKey::new(key));
        self
    }

    /// Register a provider with an endpoint override.
    pub fn provider_url(mut self, provider: ProviderKind, url: &str) -> Self {
        let entry = self
            .config
            .providers
            .entry(provider)
            .or_insert_with(ProviderEntry::default);
        entry.api_url = Some(url.to_string());
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
