//! OpenAI-compatible Chat Completions client.
//!
//! Serves hosted OpenAI and any server that follows the same wire format
//! (Ollama, vLLM, LM Studio) via the base-URL override. Self-hosted servers
//! are constructed without an API key.

use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use colloquy_config::ProviderKind;

use crate::message::{AssistantMessage, FinishReason, Message, MessageContent, MessageId};
use crate::model::{Capability, Model};
use crate::BoxFuture;

use super::{http_client, BackendError, ChatBackend, ModelLister, StreamFrame, REQUEST_TIMEOUT};

/// OpenAI-compatible client; the provider kind tags listed models.
pub struct OpenAiCompatClient {
    client: Client,
    provider: ProviderKind,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatClient {
    /// Create a new client. Hosted deployments pass a key; self-hosted
    /// servers pass `None`.
    pub fn new(
        provider: ProviderKind,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client: http_client(),
            provider,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("authorization", format!("Bearer {key}")),
            None => builder,
        }
    }

    fn build_request_body(&self, prompt: &[Message], model: &Model, stream: bool) -> OpenAiRequest {
        let messages = prompt
            .iter()
            .filter_map(|message| {
                let (role, content) = match message {
                    Message::User(m) => ("user", &m.content),
                    Message::Assistant(m) => ("assistant", &m.content),
                };
                let content = match content {
                    MessageContent::Text(text) if text.is_empty() => return None,
                    MessageContent::Text(text) => json!(text),
                    MessageContent::Audio(clip) => json!([{
                        "type": "input_audio",
                        "input_audio": {"data": clip.data, "format": clip.format},
                    }]),
                };
                Some(OpenAiMessage {
                    role: role.to_string(),
                    content,
                })
            })
            .collect();

        OpenAiRequest {
            model: model.id.clone(),
            messages,
            max_tokens: model.max_output_tokens,
            stream: stream.then_some(true),
        }
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

impl ModelLister for OpenAiCompatClient {
    fn list_models(&self) -> BoxFuture<'_, Result<Vec<Model>, BackendError>> {
        Box::pin(async move {
            let resp = self
                .request(self.client.get(format!("{}/models", self.base_url)))
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await?;
            let resp = Self::check_status(resp).await?;

            let listing: OpenAiModelList = resp.json().await?;
            Ok(listing
                .data
                .into_iter()
                .map(|entry| {
                    Model::new(entry.id, self.provider)
                        .with_capabilities([Capability::Temperature, Capability::Completion])
                })
                .collect())
        })
    }
}

impl ChatBackend for OpenAiCompatClient {
    fn name(&self) -> &str {
        match self.provider {
            ProviderKind::Ollama => "Ollama",
            _ => "OpenAI",
        }
    }

    fn send_once(
        &self,
        prompt: &[Message],
        model: &Model,
    ) -> BoxFuture<'_, Result<AssistantMessage, BackendError>> {
        let body = self.build_request_body(prompt, model, false);
        Box::pin(async move {
            debug!(model = %body.model, provider = %self.provider, "completion request");

            let resp = self
                .request(self.client.post(format!("{}/chat/completions", self.base_url)))
                .header("content-type", "application/json")
                .timeout(REQUEST_TIMEOUT)
                .json(&body)
                .send()
                .await?;
            let resp = Self::check_status(resp).await?;

            let api_resp: OpenAiResponse = resp.json().await?;
            let choice = api_resp
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| BackendError::Parse("no choices in response".to_string()))?;

            let finish_reason = choice
                .finish_reason
                .as_deref()
                .map(FinishReason::from_raw)
                .unwrap_or(FinishReason::Stop);

            Ok(AssistantMessage {
                id: MessageId::new(api_resp.id),
                content: MessageContent::Text(choice.message.content.unwrap_or_default()),
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
            debug!(model = %body.model, provider = %self.provider, "streaming request");

            let resp = self
                .request(self.client.post(format!("{}/chat/completions", self.base_url)))
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await?;
            let resp = Self::check_status(resp).await?;

            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(pump_chunks(resp, tx));
            Ok(rx)
        })
    }
}

/// Read the SSE body line by line and translate chunks into frames.
async fn pump_chunks(resp: reqwest::Response, tx: mpsc::Sender<Result<StreamFrame, BackendError>>) {
    let mut body = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    let mut finish_reason: Option<String> = None;

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
            let data = data.trim();

            if data == "[DONE]" {
                let _ = tx
                    .send(Ok(StreamFrame::End {
                        finish_reason: finish_reason.take(),
                    }))
                    .await;
                return;
            }

            let chunk: OpenAiStreamChunk = match serde_json::from_str(data) {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(error = %err, "unparseable stream chunk, skipping");
                    continue;
                }
            };

            let Some(choice) = chunk.choices.into_iter().next() else {
                continue;
            };
            if let Some(raw) = choice.finish_reason {
                finish_reason = Some(raw);
            }
            if let Some(text) = choice.delta.content {
                if !text.is_empty()
                    && tx
                        .send(Ok(StreamFrame::Append {
                            message_id: MessageId::new(chunk.id.clone()),
                            text,
                        }))
                        .await
                        .is_err()
                {
                    return; // consumer went away
                }
            }
        }
    }

    // Transport closed without [DONE]; report what we know.
    let _ = tx
        .send(Ok(StreamFrame::End {
            finish_reason: finish_reason.take(),
        }))
        .await;
}

// ── OpenAI API types (private) ──────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    id: String,
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    id: String,
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModelList {
    data: Vec<OpenAiModelEntry>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModelEntry {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AudioClip, UserMessage};
    use pretty_assertions::assert_eq;

    fn model() -> Model {
        Model::new("gpt-4o", ProviderKind::OpenAi).with_max_output_tokens(2048)
    }

    #[test]
    fn test_build_simple_request() {
        let client =
            OpenAiCompatClient::new(ProviderKind::OpenAi, "https://api.openai.com/v1", None);
        let prompt = vec![Message::User(UserMessage::text(
            MessageId::new("u1"),
            "Hello!",
        ))];

        let body = client.build_request_body(&prompt, &model(), true);
        assert_eq!(body.model, "gpt-4o");
        assert_eq!(body.max_tokens, Some(2048));
        assert_eq!(body.stream, Some(true));
        assert_eq!(body.messages.len(), 1);
        assert_eq!(body.messages[0].content, json!("Hello!"));
    }

    #[test]
    fn test_build_audio_request() {
        let client =
            OpenAiCompatClient::new(ProviderKind::OpenAi, "https://api.openai.com/v1", None);
        let prompt = vec![Message::User(UserMessage {
            id: MessageId::new("u1"),
            content: MessageContent::Audio(AudioClip {
                data: "AAAA".to_string(),
                format: "wav".to_string(),
            }),
            attachments: Vec::new(),
        })];

        let body = client.build_request_body(&prompt, &model(), false);
        assert_eq!(body.messages.len(), 1);
        let parts = body.messages[0].content.as_array().unwrap();
        assert_eq!(parts[0]["type"], "input_audio");
        assert_eq!(parts[0]["input_audio"]["format"], "wav");
    }

    #[test]
    fn test_parse_stream_chunk() {
        let chunk: OpenAiStreamChunk = serde_json::from_str(
            r#"{"id":"chatcmpl-1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.id, "chatcmpl-1");
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hi"));
    }

    #[test]
    fn test_parse_completion_response() {
        let resp: OpenAiResponse = serde_json::from_str(
            r#"{
                "id": "chatcmpl-2",
                "choices": [{
                    "message": {"role": "assistant", "content": "Hello!"},
                    "finish_reason": "stop"
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(resp.id, "chatcmpl-2");
        assert_eq!(
            resp.choices[0].message.content.as_deref(),
            Some("Hello!")
        );
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_name_by_provider() {
        let ollama = OpenAiCompatClient::new(ProviderKind::Ollama, "http://localhost:11434/v1", None);
        assert_eq!(ollama.name(), "Ollama");
        let openai =
            OpenAiCompatClient::new(ProviderKind::OpenAi, "https://api.openai.com/v1", None);
        assert_eq!(openai.name(), "OpenAI");
    }
}
