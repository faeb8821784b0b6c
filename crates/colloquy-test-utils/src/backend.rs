//! Scripted provider backend for coordinator tests.
//!
//! Each expected provider call consumes one [`Script`] in FIFO order; an
//! unscripted call panics, so tests fail loudly when the coordinator makes
//! more calls than expected.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use colloquy_config::ProviderConfig;
use colloquy_core::client::cache::ClientFactory;
use colloquy_core::{
    AssistantMessage, BackendError, BoxFuture, ChatBackend, Message, Model, ModelLister,
    ProviderClient, StreamFrame,
};

/// One step of a scripted stream.
pub enum StreamStep {
    /// Emit a frame.
    Frame(StreamFrame),
    /// Emit a pipeline error.
    Fail(BackendError),
    /// Pause before the next step — opens a window for cancellation races.
    Wait(Duration),
}

/// The scripted response to one provider call.
pub enum Script {
    /// `send_streaming` succeeds and plays these steps.
    Stream(Vec<StreamStep>),
    /// `send_streaming` fails up front, before any frame.
    RefuseStream(BackendError),
    /// `send_once` resolves to this result.
    Once(Result<AssistantMessage, BackendError>),
}

/// A [`ChatBackend`] + [`ModelLister`] that replays scripts.
#[derive(Default)]
pub struct ScriptedBackend {
    models: Vec<Model>,
    scripts: Mutex<VecDeque<Script>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(mut self, models: Vec<Model>) -> Self {
        self.models = models;
        self
    }

    /// Queue the response for the next provider call.
    pub fn push(&self, script: Script) {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(script);
    }

    fn pop(&self) -> Script {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .expect("provider call without a queued script")
    }

    /// Package a backend as the capability pair the coordinator consumes.
    pub fn pair(backend: &Arc<Self>) -> ProviderClient {
        ProviderClient {
            models: Arc::clone(backend) as Arc<dyn ModelLister>,
            chat: Arc::clone(backend) as Arc<dyn ChatBackend>,
        }
    }
}

impl ModelLister for ScriptedBackend {
    fn list_models(&self) -> BoxFuture<'_, Result<Vec<Model>, BackendError>> {
        let models = self.models.clone();
        Box::pin(async move { Ok(models) })
    }
}

impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "Scripted"
    }

    fn send_once(
        &self,
        _prompt: &[Message],
        _model: &Model,
    ) -> BoxFuture<'_, Result<AssistantMessage, BackendError>> {
        let script = self.pop();
        Box::pin(async move {
            match script {
                Script::Once(result) => result,
                _ => panic!("send_once called but the queued script is a stream"),
            }
        })
    }

    fn send_streaming(
        &self,
        _prompt: &[Message],
        _model: &Model,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<Result<StreamFrame, BackendError>>, BackendError>>
    {
        let script = self.pop();
        Box::pin(async move {
            match script {
                Script::RefuseStream(err) => Err(err),
                Script::Stream(steps) => {
                    let (tx, rx) = mpsc::channel(16);
                    tokio::spawn(async move {
                        for step in steps {
                            match step {
                                StreamStep::Frame(frame) => {
                                    if tx.send(Ok(frame)).await.is_err() {
                                        return; // consumer cancelled
                                    }
                                }
                                StreamStep::Fail(err) => {
                                    let _ = tx.send(Err(err)).await;
                                    return;
                                }
                                StreamStep::Wait(duration) => {
                                    tokio::time::sleep(duration).await;
                                }
                            }
                        }
                    });
                    Ok(rx)
                }
                Script::Once(_) => {
                    panic!("send_streaming called but the queued script is single-shot")
                }
            }
        })
    }
}

/// A [`ClientFactory`] that hands out one scripted pair for every config.
pub struct ScriptedClientFactory {
    client: ProviderClient,
}

impl ScriptedClientFactory {
    pub fn new(backend: &Arc<ScriptedBackend>) -> Self {
        Self {
            client: ScriptedBackend::pair(backend),
        }
    }
}

impl ClientFactory for ScriptedClientFactory {
    fn client_for(&self, _config: &ProviderConfig) -> BoxFuture<'_, ProviderClient> {
        let client = self.client.clone();
        Box::pin(async move { client })
    }
}
