//! Anthropic Messages API client.
//!
//! Implements the [`ChatBackend`] and [`ModelLister`] capabilities against
//! the `/v1/messages` and `/v1/models` endpoints, including server-sent-event
//! streaming.

use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use colloquy_config::ProviderKind;

use crate::message::{AssistantMessage, FinishReason, Message, MessageContent, MessageId};
use crate::model::{Capability, Model};
use crate::BoxFuture;

use super::{http_client, BackendError, ChatBackend, ModelLister, StreamFrame, REQUEST_TIMEOUT};

const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic Claude client.
pub struct AnthropicClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicClient {
    /// Create a new client against the given base URL.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    fn build_request_body(
        &self,
        prompt: &[Message],
        model: &Model,
        stream: bool,
    ) -> Result<AnthropicRequest, BackendError> {
        let mut messages = Vec::with_capacity(prompt.len());
        for message in prompt {
            let (role, content) = match message {
                Message::User(m) => ("user", &m.content),
                Message::Assistant(m) => ("assistant", &m.content),
            };
            let text = match content {
                MessageContent::Text(text) => text.clone(),
                MessageContent::Audio(_) => {
                    return Err(BackendError::Unsupported("audio input".to_string()));
                }
            };
            // Errored assistant turns may carry no content at all; the API
            // rejects empty blocks.
            if text.is_empty() {
                continue;
            }
            messages.push(AnthropicMessage {
                role: role.to_string(),
                content: text,
            });
        }

        Ok(AnthropicRequest {
            model: model.id.clone(),
            max_tokens: model.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            stream: stream.then_some(true),
        })
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BackendError::Provider { status, message });
        }
        Ok(resp)
    }
}

/// Map Anthropic stop reasons onto the shared raw finish-reason vocabulary.
/// Unrecognized reasons pass through untouched.
fn map_stop_reason(raw: &str) -> &str {
    match raw {
        "end_turn" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "refusal" => "content_filter",
        other => other,
    }
}

impl ModelLister for AnthropicClient {
    fn list_models(&self) -> BoxFuture<'_, Result<Vec<Model>, BackendError>> {
        Box::pin(async move {
            let resp = self
                .client
                .get(format!("{}/v1/models", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_API_VERSION)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await?;
            let resp = Self::check_status(resp).await?;

            let listing: AnthropicModelList = resp.json().await?;
            Ok(listing
                .data
                .into_iter()
                .map(|entry| {
                    Model::new(entry.id, ProviderKind::Anthropic)
                        .with_name(entry.display_name)
                        .with_capabilities([
                            Capability::Temperature,
                            Capability::Tools,
                            Capability::ToolChoice,
                            Capability::VisionImage,
                            Capability::Document,
                        ])
                        .with_context_length(200_000)
                })
                .collect())
        })
    }
}

impl ChatBackend for AnthropicClient {
    fn name(&self) -> &str {
        "Anthropic"
    }

    fn send_once(
        &self,
        prompt: &[Message],
        model: &Model,
    ) -> BoxFuture<'_, Result<AssistantMessage, BackendError>> {
        let body = self.build_request_body(prompt, model, false);
        Box::pin(async move {
            let body = body?;
            debug!(model = %body.model, "Anthropic completion request");

            let resp = self
                .client
                .post(self.messages_url())
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_API_VERSION)
                .header("content-type", "application/json")
                .timeout(REQUEST_TIMEOUT)
                .json(&body)
                .send()
                .await?;
            let resp = Self::check_status(resp).await?;

            let api_resp: AnthropicResponse = resp.json().await?;
            let text = api_resp
                .content
                .iter()
                .filter_map(|block| match block {
                    AnthropicBlock::Text { text } => Some(text.as_str()),
                    AnthropicBlock::Other => None,
                })
                .collect::<Vec<_>>()
                .join("");

            let finish_reason = api_resp
                .stop_reason
                .as_deref()
                .map(|raw| FinishReason::from_raw(map_stop_reason(raw)))
                .unwrap_or(FinishReason::Stop);

            Ok(AssistantMessage {
                id: MessageId::new(api_resp.id),
                content: MessageContent::Text(text),
                attachments: Vec::new(),
                finish_reason: Some(finish_reason),
                error: None,
            })
        })
    }

    fn send_streaming(
        &self,
        prompt: &[Message],
        model: &Model,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<Result<StreamFrame, BackendError>>, BackendError>>
    {
        let body = self.build_request_body(prompt, model, true);
        Box::pin(async move {
            let body = body?;
            debug!(model = %body.model, "Anthropic streaming request");

            let resp = self
                .client
                .post(self.messages_url())
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_API_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await?;
            let resp = Self::check_status(resp).await?;

            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(pump_events(resp, tx));
            Ok(rx)
        })
    }
}

/// Read the SSE body line by line and translate events into frames.
async fn pump_events(resp: reqwest::Response, tx: mpsc::Sender<Result<StreamFrame, BackendError>>) {
    let mut body = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    let mut message_id: Option<MessageId> = None;
    let mut stop_reason: Option<String> = None;

    while let Some(chunk) = body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tx.send(Err(err.into())).await;
                return;
            }
        };
        buf.extend_from_slice(&bytes);

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };

            let event: AnthropicEvent = match serde_json::from_str(data.trim()) {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "unparseable stream event, skipping");
                    continue;
                }
            };

            match event {
                AnthropicEvent::MessageStart { message } => {
                    message_id = Some(MessageId::new(message.id));
                }
                AnthropicEvent::ContentBlockDelta { delta } => {
                    if let Some(text) = delta.text {
                        let id = message_id
                            .get_or_insert_with(MessageId::generate)
                            .clone();
                        if tx
                            .send(Ok(StreamFrame::Append {
                                message_id: id,
                                text,
                            }))
                            .await
                            .is_err()
                        {
                            return; // consumer went away
                        }
                    }
                }
                AnthropicEvent::ContentBlockStart { content_block } => {
                    if content_block.kind == "tool_use" {
                        let frame = StreamFrame::ToolCall {
                            id: content_block.id.unwrap_or_default(),
                            name: content_block.name.unwrap_or_default(),
                            arguments: serde_json::Value::Null,
                        };
                        if tx.send(Ok(frame)).await.is_err() {
                            return;
                        }
                    }
                }
                AnthropicEvent::MessageDelta { delta } => {
                    if let Some(raw) = delta.stop_reason {
                        stop_reason = Some(map_stop_reason(&raw).to_string());
                    }
                }
                AnthropicEvent::MessageStop => {
                    let _ = tx
                        .send(Ok(StreamFrame::End {
                            finish_reason: stop_reason.take(),
                        }))
                        .await;
                    return;
                }
                AnthropicEvent::Error { error } => {
                    let _ = tx.send(Err(BackendError::Stream(error.message))).await;
                    return;
                }
                AnthropicEvent::Other => {}
            }
        }
    }
}

// ── Anthropic API types (private) ───────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    content: Vec<AnthropicBlock>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicModelList {
    data: Vec<AnthropicModelEntry>,
}

#[derive(Debug, Deserialize)]
struct AnthropicModelEntry {
    id: String,
    display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageStartBody },
    #[serde(rename = "content_block_start")]
    ContentBlockStart { content_block: ContentBlockBody },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: DeltaBody },
    #[serde(rename = "message_delta")]
    MessageDelta { delta: MessageDeltaBody },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "error")]
    Error { error: StreamErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageStartBody {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ContentBlockBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaBody {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    message: String,
}
