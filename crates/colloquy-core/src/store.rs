//! Message and provider store traits plus in-memory implementations.
//!
//! Durability is delegated to whatever implements [`MessageStore`]; the
//! coordinator only relies on the trait contract. The important call is
//! `upsert_streaming`: create-or-extend keyed by message id, additive
//! content, so a streamed answer is built row-by-row and a late write from
//! a superseded task cannot corrupt anything it does not own.

use std::collections::HashMap;

use tokio::sync::{watch, Mutex};
use tracing::debug;

use colloquy_config::{ProviderConfig, ProviderKind};

use crate::classify::ErrorKind;
use crate::message::{
    AssistantMessage, ConversationId, FinishReason, Message, MessageContent, MessageId,
};
use crate::model::Model;
use crate::BoxFuture;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("message {0} is not an assistant message")]
    NotAssistant(MessageId),

    #[error("provider {0} is not registered")]
    ProviderNotRegistered(ProviderKind),
}

/// Durable conversation history.
pub trait MessageStore: Send + Sync {
    /// Observe the ordered message list of one conversation. The receiver
    /// holds the current list immediately and every mutation after.
    fn observe(
        &self,
        conversation: &ConversationId,
    ) -> BoxFuture<'_, watch::Receiver<Vec<Message>>>;

    /// The ordered message list of one conversation.
    fn list(&self, conversation: &ConversationId)
        -> BoxFuture<'_, Result<Vec<Message>, StoreError>>;

    /// Append a message at the end of a conversation.
    fn append(
        &self,
        conversation: &ConversationId,
        message: Message,
    ) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Create-or-extend the assistant message with the given id: the chunk is
    /// appended to its content, and finish reason / error are set when given.
    fn upsert_streaming(
        &self,
        message_id: MessageId,
        conversation: ConversationId,
        chunk: String,
        finish_reason: Option<FinishReason>,
        error: Option<ErrorKind>,
    ) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Look up a single message by id.
    fn get(&self, message_id: &MessageId) -> BoxFuture<'_, Result<Option<Message>, StoreError>>;

    /// Delete the given message and everything chronologically after it.
    /// Absent ids are a no-op.
    fn delete_from(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
    ) -> BoxFuture<'_, Result<(), StoreError>>;
}

/// Model catalogs and active provider configuration.
pub trait ProviderStore: Send + Sync {
    /// The models the given provider currently offers.
    fn get_models(
        &self,
        provider: ProviderKind,
    ) -> BoxFuture<'_, Result<Vec<Model>, StoreError>>;

    /// The active configuration for the given provider.
    fn active_config(
        &self,
        provider: ProviderKind,
    ) -> BoxFuture<'_, Result<ProviderConfig, StoreError>>;

    /// Observe configuration changes for the given provider.
    fn observe_config(
        &self,
        provider: ProviderKind,
    ) -> BoxFuture<'_, Result<watch::Receiver<ProviderConfig>, StoreError>>;
}

// ── In-memory message store ─────────────────────────────────────────────

#[derive(Default)]
struct MemoryStoreInner {
    conversations: HashMap<ConversationId, Vec<Message>>,
    watchers: HashMap<ConversationId, watch::Sender<Vec<Message>>>,
}

impl MemoryStoreInner {
    fn notify(&self, conversation: &ConversationId) {
        if let Some(tx) = self.watchers.get(conversation) {
            let list = self
                .conversations
                .get(conversation)
                .cloned()
                .unwrap_or_default();
            let _ = tx.send(list);
        }
    }
}

/// In-process [`MessageStore`]. Process-lifetime history only; durable
/// storage is an external concern.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryStore {
    fn observe(
        &self,
        conversation: &ConversationId,
    ) -> BoxFuture<'_, watch::Receiver<Vec<Message>>> {
        let conversation = conversation.clone();
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let current = inner
                .conversations
                .get(&conversation)
                .cloned()
                .unwrap_or_default();
            inner
                .watchers
                .entry(conversation)
                .or_insert_with(|| watch::channel(current).0)
                .subscribe()
        })
    }

    fn list(
        &self,
        conversation: &ConversationId,
    ) -> BoxFuture<'_, Result<Vec<Message>, StoreError>> {
        let conversation = conversation.clone();
        Box::pin(async move {
            let inner = self.inner.lock().await;
            Ok(inner
                .conversations
                .get(&conversation)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn append(
        &self,
        conversation: &ConversationId,
        message: Message,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let conversation = conversation.clone();
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            inner
                .conversations
                .entry(conversation.clone())
                .or_default()
                .push(message);
            inner.notify(&conversation);
            Ok(())
        })
    }

    fn upsert_streaming(
        &self,
        message_id: MessageId,
        conversation: ConversationId,
        chunk: String,
        finish_reason: Option<FinishReason>,
        error: Option<ErrorKind>,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let messages = inner.conversations.entry(conversation.clone()).or_default();

            match messages.iter_mut().find(|m| *m.id() == message_id) {
                Some(Message::Assistant(existing)) => {
                    if let MessageContent::Text(text) = &mut existing.content {
                        text.push_str(&chunk);
                    }
                    if finish_reason.is_some() {
                        existing.finish_reason = finish_reason;
                    }
                    if error.is_some() {
                        existing.error = error;
                    }
                }
                Some(Message::User(_)) => {
                    return Err(StoreError::NotAssistant(message_id));
                }
                None => {
                    messages.push(Message::Assistant(AssistantMessage {
                        id: message_id,
                        content: MessageContent::Text(chunk),
                        attachments: Vec::new(),
                        finish_reason,
                        error,
                    }));
                }
            }

            inner.notify(&conversation);
            Ok(())
        })
    }

    fn get(&self, message_id: &MessageId) -> BoxFuture<'_, Result<Option<Message>, StoreError>> {
        let message_id = message_id.clone();
        Box::pin(async move {
            let inner = self.inner.lock().await;
            Ok(inner
                .conversations
                .values()
                .flatten()
                .find(|m| *m.id() == message_id)
                .cloned())
        })
    }

    fn delete_from(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let conversation = conversation.clone();
        let message_id = message_id.clone();
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            if let Some(messages) = inner.conversations.get_mut(&conversation) {
                // Last occurrence wins, mirroring lookup order elsewhere.
                if let Some(idx) = messages.iter().rposition(|m| *m.id() == message_id) {
                    messages.truncate(idx);
                    inner.notify(&conversation);
                } else {
                    debug!(%conversation, %message_id, "delete_from target absent, nothing to do");
                }
            }
            Ok(())
        })
    }
}

// ── In-memory provider store ────────────────────────────────────────────

struct ProviderEntry {
    config: watch::Sender<ProviderConfig>,
    models: Vec<Model>,
}

/// Config-backed [`ProviderStore`]: fixed model catalogs, updatable
/// configuration.
#[derive(Default)]
pub struct StaticProviderStore {
    entries: Mutex<HashMap<ProviderKind, ProviderEntry>>,
}

impl StaticProviderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider with its configuration and model catalog.
    pub async fn register(&self, config: ProviderConfig, models: Vec<Model>) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            config.provider(),
            ProviderEntry {
                config: watch::channel(config).0,
                models,
            },
        );
    }

    /// Replace a registered provider's configuration, notifying observers.
    pub async fn set_config(&self, config: ProviderConfig) -> Result<(), StoreError> {
        let entries = self.entries.lock().await;
        let entry = entries
            .get(&config.provider())
            .ok_or(StoreError::ProviderNotRegistered(config.provider()))?;
        let _ = entry.config.send(config);
        Ok(())
    }
}

impl ProviderStore for StaticProviderStore {
    fn get_models(
        &self,
        provider: ProviderKind,
    ) -> BoxFuture<'_, Result<Vec<Model>, StoreError>> {
        Box::pin(async move {
            let entries = self.entries.lock().await;
            entries
                .get(&provider)
                .map(|entry| entry.models.clone())
                .ok_or(StoreError::ProviderNotRegistered(provider))
        })
    }

    fn active_config(
        &self,
        provider: ProviderKind,
    ) -> BoxFuture<'_, Result<ProviderConfig, StoreError>> {
        Box::pin(async move {
            let entries = self.entries.lock().await;
            entries
                .get(&provider)
                .map(|entry| entry.config.borrow().clone())
                .ok_or(StoreError::ProviderNotRegistered(provider))
        })
    }

    fn observe_config(
        &self,
        provider: ProviderKind,
    ) -> BoxFuture<'_, Result<watch::Receiver<ProviderConfig>, StoreError>> {
        Box::pin(async move {
            let entries = self.entries.lock().await;
            entries
                .get(&provider)
                .map(|entry| entry.config.subscribe())
                .ok_or(StoreError::ProviderNotRegistered(provider))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::UserMessage;
    use colloquy_config::ApiKey;
    use pretty_assertions::assert_eq;

    fn conv() -> ConversationId {
        ConversationId::new("c1")
    }

    #[tokio::test]
    async fn test_append_and_list() {
        let store = MemoryStore::new();
        store
            .append(
                &conv(),
                Message::User(UserMessage::text(MessageId::new("u1"), "hi")),
            )
            .await
            .unwrap();

        let messages = store.list(&conv()).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id().as_str(), "u1");
    }

    #[tokio::test]
    async fn test_list_unknown_conversation_is_empty() {
        let store = MemoryStore::new();
        assert!(store.list(&conv()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_creates_then_extends() {
        let store = MemoryStore::new();
        let id = MessageId::new("m1");

        store
            .upsert_streaming(id.clone(), conv(), "Hello ".to_string(), None, None)
            .await
            .unwrap();
        store
            .upsert_streaming(id.clone(), conv(), "World".to_string(), None, None)
            .await
            .unwrap();
        store
            .upsert_streaming(
                id.clone(),
                conv(),
                String::new(),
                Some(FinishReason::Stop),
                None,
            )
            .await
            .unwrap();

        let messages = store.list(&conv()).await.unwrap();
        assert_eq!(messages.len(), 1);
        let assistant = messages[0].as_assistant().unwrap();
        assert_eq!(assistant.content.as_text(), "Hello World");
        assert_eq!(assistant.finish_reason, Some(FinishReason::Stop));
        assert!(assistant.is_settled());
    }

    #[tokio::test]
    async fn test_upsert_attaches_error() {
        let store = MemoryStore::new();
        let id = MessageId::new("m1");

        store
            .upsert_streaming(id.clone(), conv(), "Partial".to_string(), None, None)
            .await
            .unwrap();
        store
            .upsert_streaming(
                id.clone(),
                conv(),
                String::new(),
                None,
                Some(ErrorKind::Timeout),
            )
            .await
            .unwrap();

        let message = store.get(&id).await.unwrap().unwrap();
        let assistant = message.as_assistant().unwrap();
        assert_eq!(assistant.content.as_text(), "Partial");
        assert_eq!(assistant.error, Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_upsert_rejects_user_target() {
        let store = MemoryStore::new();
        store
            .append(
                &conv(),
                Message::User(UserMessage::text(MessageId::new("u1"), "hi")),
            )
            .await
            .unwrap();

        let err = store
            .upsert_streaming(MessageId::new("u1"), conv(), "x".to_string(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotAssistant(_)));
    }

    #[tokio::test]
    async fn test_delete_from_truncates() {
        let store = MemoryStore::new();
        for id in ["u1", "a1", "u2", "a2"] {
            store
                .append(
                    &conv(),
                    Message::User(UserMessage::text(MessageId::new(id), id)),
                )
                .await
                .unwrap();
        }

        store.delete_from(&conv(), &MessageId::new("u2")).await.unwrap();
        let messages = store.list(&conv()).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].id().as_str(), "a1");
    }

    #[tokio::test]
    async fn test_delete_from_absent_is_noop() {
        let store = MemoryStore::new();
        store
            .append(
                &conv(),
                Message::User(UserMessage::text(MessageId::new("u1"), "hi")),
            )
            .await
            .unwrap();

        store
            .delete_from(&conv(), &MessageId::new("missing"))
            .await
            .unwrap();
        assert_eq!(store.list(&conv()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_observe_sees_mutations() {
        let store = MemoryStore::new();
        let mut rx = store.observe(&conv()).await;
        assert!(rx.borrow().is_empty());

        store
            .append(
                &conv(),
                Message::User(UserMessage::text(MessageId::new("u1"), "hi")),
            )
            .await
            .unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().len(), 1);
    }

    // ── Provider store ────────────────────────────────────────────────

    fn ollama_config() -> ProviderConfig {
        ProviderConfig::Local {
            provider: ProviderKind::Ollama,
            api_url: "http://localhost:11434/v1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_provider_store_round_trip() {
        let store = StaticProviderStore::new();
        store
            .register(
                ollama_config(),
                vec![Model::new("llama3", ProviderKind::Ollama)],
            )
            .await;

        let models = store.get_models(ProviderKind::Ollama).await.unwrap();
        assert_eq!(models.len(), 1);
        let config = store.active_config(ProviderKind::Ollama).await.unwrap();
        assert_eq!(config, ollama_config());
    }

    #[tokio::test]
    async fn test_provider_store_unregistered() {
        let store = StaticProviderStore::new();
        assert!(store.get_models(ProviderKind::OpenAi).await.is_err());
        assert!(store.active_config(ProviderKind::OpenAi).await.is_err());
    }

    #[tokio::test]
    async fn test_provider_store_config_updates_observed() {
        let store = StaticProviderStore::new();
        store
            .register(
                ProviderConfig::Standard {
                    provider: ProviderKind::Anthropic,
                    api_url: "https://api.anthropic.com".to_string(),
                    api_key: Some(ApiKey::new("key-1")),
                },
                Vec::new(),
            )
            .await;

        let mut rx = store.observe_config(ProviderKind::Anthropic).await.unwrap();
        store
            .set_config(ProviderConfig::Standard {
                provider: ProviderKind::Anthropic,
                api_url: "https://api.anthropic.com".to_string(),
                api_key: Some(ApiKey::new("key-2")),
            })
            .await
            .unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().api_key().unwrap().expose(), "key-2");
    }
}
