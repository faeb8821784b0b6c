//! Conversation and message types.
//!
//! Messages form a tagged union so every consumer handles both roles
//! exhaustively; assistant messages carry optional finish-reason and error
//! state. An assistant message is *settled* once either is present — no
//! further stream frames will extend it.

use std::fmt;

use serde::{Deserialize, Serialize};

use colloquy_config::ProviderKind;

use crate::classify::ErrorKind;

/// Opaque conversation key. One live generation task per id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque message key. Streamed assistant messages are built up under a
/// single id across many store upserts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A chat room: the unit of generation serialization. Carries the provider
/// and model every new turn resolves against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub provider: ProviderKind,
    pub model_id: String,
}

/// Message body. Text prompts stream; anything else goes through the
/// single-shot path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageContent {
    Text(String),
    Audio(AudioClip),
}

impl MessageContent {
    pub fn text(s: impl Into<String>) -> Self {
        MessageContent::Text(s.into())
    }

    /// The textual content, empty for non-text bodies.
    pub fn as_text(&self) -> &str {
        match self {
            MessageContent::Text(s) => s,
            MessageContent::Audio(_) => "",
        }
    }
}

/// A recorded audio prompt, already base64-encoded by the capture layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioClip {
    /// Base64 payload.
    pub data: String,
    /// Container format, e.g. "wav" or "mp3".
    pub format: String,
}

/// A file referenced by a message. Storage is handled elsewhere; this is
/// pass-through metadata only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
}

/// A message authored by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub id: MessageId,
    pub content: MessageContent,
    pub attachments: Vec<Attachment>,
}

impl UserMessage {
    pub fn text(id: MessageId, content: impl Into<String>) -> Self {
        Self {
            id,
            content: MessageContent::Text(content.into()),
            attachments: Vec::new(),
        }
    }
}

/// A message authored by the model.
///
/// Until settled (`finish_reason` or `error` present) this represents an
/// in-progress stream and may still be extended by upserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantMessage {
    pub id: MessageId,
    pub content: MessageContent,
    pub attachments: Vec<Attachment>,
    pub finish_reason: Option<FinishReason>,
    pub error: Option<ErrorKind>,
}

impl AssistantMessage {
    pub fn text(id: MessageId, content: impl Into<String>, finish_reason: FinishReason) -> Self {
        Self {
            id,
            content: MessageContent::Text(content.into()),
            attachments: Vec::new(),
            finish_reason: Some(finish_reason),
            error: None,
        }
    }

    /// Whether this message is final. No stream frames extend a settled
    /// message; it is immutable except for delete-and-regenerate.
    pub fn is_settled(&self) -> bool {
        self.finish_reason.is_some() || self.error.is_some()
    }
}

/// A message in a conversation, by author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
}

impl Message {
    pub fn id(&self) -> &MessageId {
        match self {
            Message::User(m) => &m.id,
            Message::Assistant(m) => &m.id,
        }
    }

    pub fn content(&self) -> &MessageContent {
        match self {
            Message::User(m) => &m.content,
            Message::Assistant(m) => &m.content,
        }
    }

    pub fn as_user(&self) -> Option<&UserMessage> {
        match self {
            Message::User(m) => Some(m),
            Message::Assistant(_) => None,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Message::Assistant(m) => Some(m),
            Message::User(_) => None,
        }
    }
}

/// Why a provider stopped generating.
///
/// Closed over the reasons providers actually emit, with `Unknown` carrying
/// the raw provider string so new reasons survive a round-trip instead of
/// failing to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    FunctionCall,
    PauseTurn,
    StopSequence,
    Language,
    Unknown(String),
}

impl FinishReason {
    /// Parse a provider's raw finish-reason string. Never fails; unmatched
    /// input is preserved verbatim in `Unknown`.
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            "tool_calls" => FinishReason::ToolCalls,
            "function_call" => FinishReason::FunctionCall,
            "pause_turn" => FinishReason::PauseTurn,
            "stop_sequence" => FinishReason::StopSequence,
            "language" => FinishReason::Language,
            other => FinishReason::Unknown(other.to_string()),
        }
    }

    /// The raw wire string for this reason.
    pub fn as_raw(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::FunctionCall => "function_call",
            FinishReason::PauseTurn => "pause_turn",
            FinishReason::StopSequence => "stop_sequence",
            FinishReason::Language => "language",
            FinishReason::Unknown(raw) => raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_finish_reason_round_trip_named() {
        let named = [
            FinishReason::Stop,
            FinishReason::Length,
            FinishReason::ContentFilter,
            FinishReason::ToolCalls,
            FinishReason::FunctionCall,
            FinishReason::PauseTurn,
            FinishReason::StopSequence,
            FinishReason::Language,
        ];
        for reason in named {
            assert_eq!(FinishReason::from_raw(reason.as_raw()), reason);
        }
    }

    #[test]
    fn test_finish_reason_unknown_preserves_raw() {
        let reason = FinishReason::from_raw("galaxy_brain");
        assert_eq!(reason, FinishReason::Unknown("galaxy_brain".to_string()));
        assert_eq!(reason.as_raw(), "galaxy_brain");
    }

    #[test]
    fn test_assistant_message_settled() {
        let mut msg = AssistantMessage {
            id: MessageId::new("m1"),
            content: MessageContent::text("partial"),
            attachments: Vec::new(),
            finish_reason: None,
            error: None,
        };
        assert!(!msg.is_settled());

        msg.finish_reason = Some(FinishReason::Stop);
        assert!(msg.is_settled());

        msg.finish_reason = None;
        msg.error = Some(ErrorKind::Timeout);
        assert!(msg.is_settled());
    }

    #[test]
    fn test_message_accessors() {
        let user = Message::User(UserMessage::text(MessageId::new("u1"), "hi"));
        assert_eq!(user.id().as_str(), "u1");
        assert!(user.as_user().is_some());
        assert!(user.as_assistant().is_none());
        assert_eq!(user.content().as_text(), "hi");
    }

    #[test]
    fn test_generated_ids_unique() {
        assert_ne!(MessageId::generate(), MessageId::generate());
    }
}
