//! Provider client cache — an arena of one.
//!
//! Client objects hold connection state and credentials, so they are
//! constructed lazily and memoized against the configuration that produced
//! them. The single cached slot is replaced wholesale whenever the incoming
//! configuration differs *by full value* — a changed API key or URL counts
//! as a different configuration even when the provider id is unchanged.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use colloquy_config::{ProviderConfig, ProviderKind};

use crate::BoxFuture;

use super::{AnthropicClient, OpenAiCompatClient, ProviderClient};

/// Source of provider client pairs. The coordinator resolves clients through
/// this trait so tests can substitute scripted backends.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, config: &ProviderConfig) -> BoxFuture<'_, ProviderClient>;
}

/// Memoizing constructor for provider client pairs.
///
/// `get` may be called concurrently by different conversations resolving
/// different providers; the slot is protected by a mutex.
#[derive(Default)]
pub struct ClientCache {
    slot: Mutex<Option<(ProviderConfig, ProviderClient)>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached pair for `config`, constructing and replacing the
    /// slot on any full-value mismatch.
    pub async fn get(&self, config: &ProviderConfig) -> ProviderClient {
        let mut slot = self.slot.lock().await;
        if let Some((cached_config, client)) = slot.as_ref() {
            if cached_config == config {
                return client.clone();
            }
            debug!(provider = %config.provider(), "configuration changed, rebuilding client");
        }
        let client = Self::build(config);
        *slot = Some((config.clone(), client.clone()));
        client
    }

    /// Construct a fresh pair, bypassing and not affecting the cache. Used
    /// to validate a candidate configuration before committing it.
    pub fn create_uncached(config: &ProviderConfig) -> ProviderClient {
        Self::build(config)
    }

    // Precondition: the configuration shape has been validated
    // (`ProviderConfig::validate`). A hosted provider without a key here is
    // a caller bug, not a runtime condition.
    fn build(config: &ProviderConfig) -> ProviderClient {
        match config.provider() {
            ProviderKind::Anthropic => {
                let key = config
                    .api_key()
                    .expect("anthropic config without api_key; validate before constructing");
                let client = Arc::new(AnthropicClient::new(
                    config.api_url(),
                    key.expose(),
                ));
                ProviderClient {
                    models: client.clone(),
                    chat: client,
                }
            }
            ProviderKind::OpenAi => {
                let key = config
                    .api_key()
                    .expect("openai config without api_key; validate before constructing");
                let client = Arc::new(OpenAiCompatClient::new(
                    ProviderKind::OpenAi,
                    config.api_url(),
                    Some(key.expose().to_string()),
                ));
                ProviderClient {
                    models: client.clone(),
                    chat: client,
                }
            }
            ProviderKind::Ollama => {
                let client = Arc::new(OpenAiCompatClient::new(
                    ProviderKind::Ollama,
                    config.api_url(),
                    None,
                ));
                ProviderClient {
                    models: client.clone(),
                    chat: client,
                }
            }
        }
    }
}

impl ClientFactory for ClientCache {
    fn client_for(&self, config: &ProviderConfig) -> BoxFuture<'_, ProviderClient> {
        let config = config.clone();
        Box::pin(async move { self.get(&config).await })
    }
}
