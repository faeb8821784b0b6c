//! Provider clients — the capability pair every backend exposes.
//!
//! Each backend implements [`ModelLister`] (catalog) and [`ChatBackend`]
//! (prompt execution, blocking and streaming). The coordinator only ever
//! talks to these traits; concrete adapters live in [`anthropic`] and
//! [`openai`], and the [`cache`] module memoizes the constructed pair per
//! active configuration.
//!
//! ```text
//! ┌─────────────┐     ┌───────────────────────────┐
//! │ Coordinator │────▶│ ChatBackend + ModelLister │  (traits)
//! └─────────────┘     └─────────────┬─────────────┘
//!                                   │
//!                     ┌─────────────┴─────────────┐
//!                     ▼                           ▼
//!            ┌────────────────┐         ┌──────────────────┐
//!            │   Anthropic    │         │ OpenAI-compatible │
//!            │ (Messages API) │         │ (hosted or local) │
//!            └────────────────┘         └──────────────────┘
//! ```

pub mod anthropic;
pub mod cache;
pub mod openai;

pub use anthropic::AnthropicClient;
pub use cache::ClientCache;
pub use openai::OpenAiCompatClient;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::message::{AssistantMessage, Message, MessageId};
use crate::model::Model;
use crate::BoxFuture;

/// Errors from provider calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("timeout")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("provider error: {status} - {message}")]
    Provider { status: u16, message: String },

    #[error("provider stream error: {0}")]
    Stream(String),

    #[error("response parse error: {0}")]
    Parse(String),

    #[error("{0} is not supported by this backend")]
    Unsupported(String),

    #[error("request cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else if err.is_decode() {
            BackendError::Parse(err.to_string())
        } else {
            BackendError::Network(err.to_string())
        }
    }
}

/// One unit of provider streaming output.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    /// A text delta. The first frame of a stream establishes the id the
    /// whole answer is assembled under.
    Append { message_id: MessageId, text: String },
    /// End of stream, with the provider's raw finish reason when it sent one.
    End { finish_reason: Option<String> },
    /// A tool invocation requested by the model. Passed through unassembled.
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
}

/// Catalog capability: what models does this backend offer.
pub trait ModelLister: Send + Sync {
    fn list_models(&self) -> BoxFuture<'_, Result<Vec<Model>, BackendError>>;
}

/// Prompt-execution capability.
///
/// Implementations must be `Send + Sync`; `BoxFuture` keeps the trait
/// object-safe for `Arc<dyn ChatBackend>`.
pub trait ChatBackend: Send + Sync {
    /// Backend display name (e.g. "Anthropic").
    fn name(&self) -> &str;

    /// Perform a single blocking completion over the full prompt.
    fn send_once(
        &self,
        prompt: &[Message],
        model: &Model,
    ) -> BoxFuture<'_, Result<AssistantMessage, BackendError>>;

    /// Perform a streaming completion over the full prompt.
    ///
    /// Returns a channel receiver that yields frames in arrival order. The
    /// channel closing without an `End` frame means the transport finished;
    /// callers decide how to settle.
    fn send_streaming(
        &self,
        prompt: &[Message],
        model: &Model,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<Result<StreamFrame, BackendError>>, BackendError>>;
}

/// The memoized capability pair handed out by the cache.
#[derive(Clone)]
pub struct ProviderClient {
    pub models: Arc<dyn ModelLister>,
    pub chat: Arc<dyn ChatBackend>,
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request timeout for single-shot calls. Streaming calls carry no total
/// timeout — a stalled stream is only terminated by explicit cancellation.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared HTTP client construction: connect timeout only, so long streams
/// are not cut off mid-flight.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .expect("reqwest client construction only fails on TLS misconfiguration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::Provider {
            status: 401,
            message: "api key not valid".to_string(),
        };
        assert_eq!(err.to_string(), "provider error: 401 - api key not valid");
    }

    #[test]
    fn test_stream_error_display() {
        let err = BackendError::Stream("Overloaded".to_string());
        assert_eq!(err.to_string(), "provider stream error: Overloaded");
    }
}
