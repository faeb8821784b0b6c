//! Conversation and store fixtures.

use std::sync::Arc;

use colloquy_config::{ProviderConfig, ProviderKind};
use colloquy_core::{Conversation, ConversationId, Model, StaticProviderStore};

pub const TEST_MODEL_ID: &str = "test-model";

/// A conversation pointed at the self-hosted test provider.
pub fn conversation(id: &str) -> Conversation {
    Conversation {
        id: ConversationId::new(id),
        title: "Test conversation".to_string(),
        provider: ProviderKind::Ollama,
        model_id: TEST_MODEL_ID.to_string(),
    }
}

/// A provider store with the test provider registered and one model offered.
pub async fn provider_store() -> Arc<StaticProviderStore> {
    let store = Arc::new(StaticProviderStore::new());
    store
        .register(
            ProviderConfig::Local {
                provider: ProviderKind::Ollama,
                api_url: "http://localhost:11434/v1".to_string(),
            },
            vec![Model::new(TEST_MODEL_ID, ProviderKind::Ollama)],
        )
        .await;
    store
}
