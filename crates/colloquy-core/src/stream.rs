//! Stream assembly — provider frames to store upserts.
//!
//! One assembler per in-flight streaming call. The only state carried across
//! frames is the message id established by the first `Append`; every store
//! write is otherwise self-contained, which is what makes late writes from a
//! superseded task harmless.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::classify::ErrorKind;
use crate::client::StreamFrame;
use crate::message::{ConversationId, FinishReason, MessageId};
use crate::store::{MessageStore, StoreError};

/// Where a pipeline failure ended up.
#[derive(Debug, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Attached to the partially streamed message; the partial answer stays
    /// visible with a per-message error affordance.
    AttachedToMessage,
    /// No partial message exists; the caller must emit a conversation-wide
    /// error event instead.
    ConversationWide,
}

/// Assembles one provider stream into message-store upserts.
pub struct StreamAssembler {
    store: Arc<dyn MessageStore>,
    conversation: ConversationId,
    message_id: Option<MessageId>,
}

impl StreamAssembler {
    pub fn new(store: Arc<dyn MessageStore>, conversation: ConversationId) -> Self {
        Self {
            store,
            conversation,
            message_id: None,
        }
    }

    /// The id the stream is being assembled under, once established.
    pub fn message_id(&self) -> Option<&MessageId> {
        self.message_id.as_ref()
    }

    /// Apply one frame in arrival order. Returns `true` once the stream has
    /// settled and no further frames are expected.
    pub async fn apply(&mut self, frame: StreamFrame) -> Result<bool, StoreError> {
        match frame {
            StreamFrame::Append { message_id, text } => {
                let id = self.message_id.get_or_insert(message_id).clone();
                self.store
                    .upsert_streaming(id, self.conversation.clone(), text, None, None)
                    .await?;
                Ok(false)
            }
            StreamFrame::End { finish_reason } => {
                let Some(id) = self.message_id.clone() else {
                    warn!(conversation = %self.conversation, "stream ended before any content");
                    return Ok(true);
                };
                let reason = finish_reason
                    .as_deref()
                    .map(FinishReason::from_raw)
                    .unwrap_or(FinishReason::Stop);
                self.store
                    .upsert_streaming(
                        id,
                        self.conversation.clone(),
                        String::new(),
                        Some(reason),
                        None,
                    )
                    .await?;
                Ok(true)
            }
            StreamFrame::ToolCall { name, .. } => {
                // Pass-through only; nothing to assemble.
                debug!(conversation = %self.conversation, tool = %name, "tool call frame ignored");
                Ok(false)
            }
        }
    }

    /// Record a pipeline failure. With partial content the error settles the
    /// streamed message; without, it is the caller's to broadcast.
    pub async fn fail(&mut self, kind: ErrorKind) -> Result<ErrorDisposition, StoreError> {
        match self.message_id.clone() {
            Some(id) => {
                self.store
                    .upsert_streaming(
                        id,
                        self.conversation.clone(),
                        String::new(),
                        None,
                        Some(kind),
                    )
                    .await?;
                Ok(ErrorDisposition::AttachedToMessage)
            }
            None => Ok(ErrorDisposition::ConversationWide),
        }
    }

    /// Settle an interrupted stream as an ordinary stop. Used when the
    /// underlying call reports cancellation, which is user-initiated and
    /// must not surface as an error.
    pub async fn settle_interrupted(&mut self) -> Result<(), StoreError> {
        if let Some(id) = self.message_id.clone() {
            self.store
                .upsert_streaming(
                    id,
                    self.conversation.clone(),
                    String::new(),
                    Some(FinishReason::Stop),
                    None,
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn frame(text: &str) -> StreamFrame {
        StreamFrame::Append {
            message_id: MessageId::new("m1"),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_assembles_appends_and_end() {
        let store = Arc::new(MemoryStore::new());
        let conv = ConversationId::new("c1");
        let mut assembler = StreamAssembler::new(store.clone(), conv.clone());

        assert!(!assembler.apply(frame("Hello ")).await.unwrap());
        assert!(!assembler.apply(frame("World")).await.unwrap());
        assert!(assembler
            .apply(StreamFrame::End {
                finish_reason: Some("stop".to_string()),
            })
            .await
            .unwrap());

        let messages = store.list(&conv).await.unwrap();
        assert_eq!(messages.len(), 1);
        let assistant = messages[0].as_assistant().unwrap();
        assert_eq!(assistant.content.as_text(), "Hello World");
        assert_eq!(assistant.finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn test_first_frame_establishes_id() {
        let store = Arc::new(MemoryStore::new());
        let mut assembler = StreamAssembler::new(store.clone(), ConversationId::new("c1"));
        assert!(assembler.message_id().is_none());

        assembler.apply(frame("x")).await.unwrap();
        assert_eq!(assembler.message_id().unwrap().as_str(), "m1");

        // A divergent id on a later frame does not re-key the stream.
        assembler
            .apply(StreamFrame::Append {
                message_id: MessageId::new("m2"),
                text: "y".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(assembler.message_id().unwrap().as_str(), "m1");
    }

    #[tokio::test]
    async fn test_end_without_reason_settles_as_stop() {
        let store = Arc::new(MemoryStore::new());
        let conv = ConversationId::new("c1");
        let mut assembler = StreamAssembler::new(store.clone(), conv.clone());

        assembler.apply(frame("x")).await.unwrap();
        assembler
            .apply(StreamFrame::End {
                finish_reason: None,
            })
            .await
            .unwrap();

        let messages = store.list(&conv).await.unwrap();
        assert_eq!(
            messages[0].as_assistant().unwrap().finish_reason,
            Some(FinishReason::Stop)
        );
    }

    #[tokio::test]
    async fn test_unknown_reason_preserved() {
        let store = Arc::new(MemoryStore::new());
        let conv = ConversationId::new("c1");
        let mut assembler = StreamAssembler::new(store.clone(), conv.clone());

        assembler.apply(frame("x")).await.unwrap();
        assembler
            .apply(StreamFrame::End {
                finish_reason: Some("galaxy_brain".to_string()),
            })
            .await
            .unwrap();

        let messages = store.list(&conv).await.unwrap();
        assert_eq!(
            messages[0].as_assistant().unwrap().finish_reason,
            Some(FinishReason::Unknown("galaxy_brain".to_string()))
        );
    }

    #[tokio::test]
    async fn test_error_after_chunk_attaches() {
        let store = Arc::new(MemoryStore::new());
        let conv = ConversationId::new("c1");
        let mut assembler = StreamAssembler::new(store.clone(), conv.clone());

        assembler.apply(frame("Partial")).await.unwrap();
        let disposition = assembler.fail(ErrorKind::Timeout).await.unwrap();
        assert_eq!(disposition, ErrorDisposition::AttachedToMessage);

        let messages = store.list(&conv).await.unwrap();
        let assistant = messages[0].as_assistant().unwrap();
        assert_eq!(assistant.content.as_text(), "Partial");
        assert_eq!(assistant.error, Some(ErrorKind::Timeout));
        assert!(assistant.is_settled());
    }

    #[tokio::test]
    async fn test_error_before_chunk_is_conversation_wide() {
        let store = Arc::new(MemoryStore::new());
        let conv = ConversationId::new("c1");
        let mut assembler = StreamAssembler::new(store.clone(), conv.clone());

        let disposition = assembler
            .fail(ErrorKind::ConnectionIssue)
            .await
            .unwrap();
        assert_eq!(disposition, ErrorDisposition::ConversationWide);
        assert!(store.list(&conv).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_settles_established_stream_as_stop() {
        let store = Arc::new(MemoryStore::new());
        let conv = ConversationId::new("c1");
        let mut assembler = StreamAssembler::new(store.clone(), conv.clone());

        assembler.apply(frame("Partial")).await.unwrap();
        assembler.settle_interrupted().await.unwrap();

        let messages = store.list(&conv).await.unwrap();
        let assistant = messages[0].as_assistant().unwrap();
        assert_eq!(assistant.finish_reason, Some(FinishReason::Stop));
        assert!(assistant.error.is_none());
    }

    #[tokio::test]
    async fn test_cancel_without_content_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let conv = ConversationId::new("c1");
        let mut assembler = StreamAssembler::new(store.clone(), conv.clone());

        assembler.settle_interrupted().await.unwrap();
        assert!(store.list(&conv).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tool_call_frames_pass_through() {
        let store = Arc::new(MemoryStore::new());
        let conv = ConversationId::new("c1");
        let mut assembler = StreamAssembler::new(store.clone(), conv.clone());

        let finished = assembler
            .apply(StreamFrame::ToolCall {
                id: "call_1".to_string(),
                name: "search".to_string(),
                arguments: serde_json::Value::Null,
            })
            .await
            .unwrap();
        assert!(!finished);
        assert!(store.list(&conv).await.unwrap().is_empty());
    }
}
