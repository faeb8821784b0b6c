//! The generation coordinator — one cancellable task per conversation.
//!
//! Starting a new generation always wins over an older one: the prior task
//! handle is aborted (signal-and-forget, no teardown join) and replaced
//! under a single lock, so concurrent callers cannot lose a cancellation.
//! Each task carries an epoch so its completion hook only clears state it
//! still owns; a superseded task cleaning up late cannot clobber its
//! replacement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::classify::{classify, ErrorKind};
use crate::client::cache::ClientFactory;
use crate::client::{BackendError, ClientCache, ProviderClient};
use crate::message::{Conversation, ConversationId, Message, MessageContent, MessageId, UserMessage};
use crate::model::Model;
use crate::store::{MessageStore, ProviderStore};
use crate::stream::{ErrorDisposition, StreamAssembler};

/// A conversation-wide error event: a failure with no partial message to
/// attach itself to.
#[derive(Debug, Clone)]
pub struct ConversationError {
    pub conversation: ConversationId,
    pub kind: ErrorKind,
}

struct TaskEntry {
    handle: JoinHandle<()>,
    epoch: u64,
}

#[derive(Default)]
struct CoordinatorState {
    tasks: HashMap<ConversationId, TaskEntry>,
    generating: HashMap<ConversationId, watch::Sender<bool>>,
    next_epoch: u64,
}

impl CoordinatorState {
    fn set_generating(&mut self, conversation: &ConversationId, value: bool) {
        self.generating
            .entry(conversation.clone())
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(value);
    }

    fn abort_task(&mut self, conversation: &ConversationId) {
        if let Some(entry) = self.tasks.remove(conversation) {
            debug!(%conversation, "superseding in-flight generation task");
            entry.handle.abort();
        }
    }
}

/// Clears task-map and generating state when the owning task ends, however
/// it ends — success, failure, panic, or abort all drop the task future and
/// run this. Gated on the epoch so only the current owner cleans up.
struct CompletionGuard {
    state: Arc<Mutex<CoordinatorState>>,
    conversation: ConversationId,
    epoch: u64,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let owns = state
            .tasks
            .get(&self.conversation)
            .is_some_and(|entry| entry.epoch == self.epoch);
        if owns {
            state.tasks.remove(&self.conversation);
            state.set_generating(&self.conversation, false);
        }
    }
}

/// Orchestrates LLM generation across conversations.
///
/// Cheap to clone; all state is shared. The task map and generating set are
/// only ever mutated from within these methods, behind one lock.
#[derive(Clone)]
pub struct GenerationCoordinator {
    store: Arc<dyn MessageStore>,
    providers: Arc<dyn ProviderStore>,
    clients: Arc<dyn ClientFactory>,
    state: Arc<Mutex<CoordinatorState>>,
    errors_tx: broadcast::Sender<ConversationError>,
}

impl GenerationCoordinator {
    pub fn new(store: Arc<dyn MessageStore>, providers: Arc<dyn ProviderStore>) -> Self {
        Self::with_client_factory(store, providers, Arc::new(ClientCache::new()))
    }

    /// Construct with a custom client source (tests inject scripted
    /// backends through this).
    pub fn with_client_factory(
        store: Arc<dyn MessageStore>,
        providers: Arc<dyn ProviderStore>,
        clients: Arc<dyn ClientFactory>,
    ) -> Self {
        let (errors_tx, _) = broadcast::channel(64);
        Self {
            store,
            providers,
            clients,
            state: Arc::new(Mutex::new(CoordinatorState::default())),
            errors_tx,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start generating an answer to `user_message`, superseding any task
    /// already running for this conversation. Fire-and-forget; effects are
    /// observed through the store and the status/error streams.
    pub fn generate(&self, user_message: UserMessage, conversation: &Conversation) {
        let conversation = conversation.clone();
        let mut state = self.lock_state();

        state.abort_task(&conversation.id);
        let epoch = state.next_epoch;
        state.next_epoch += 1;
        state.set_generating(&conversation.id, true);

        let guard = CompletionGuard {
            state: Arc::clone(&self.state),
            conversation: conversation.id.clone(),
            epoch,
        };
        let this = self.clone();
        let conversation_id = conversation.id.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            this.run_generation(user_message, conversation).await;
        });
        state.tasks.insert(conversation_id, TaskEntry { handle, epoch });
    }

    /// Throw away the answer with the given id and everything after it, then
    /// re-run generation from the user message it answered.
    ///
    /// Missing target or a non-user predecessor are caller bugs, not runtime
    /// conditions: logged and ignored, never surfaced as user errors.
    pub async fn regenerate(&self, assistant_message_id: &MessageId, conversation: &Conversation) {
        self.lock_state().abort_task(&conversation.id);

        match self.recover_user_turn(assistant_message_id, conversation).await {
            Some(user_message) => self.generate(user_message, conversation),
            // No new task was started; the aborted one no longer owns the
            // generating flag, so clear it here.
            None => self
                .lock_state()
                .set_generating(&conversation.id, false),
        }
    }

    /// Locate the regeneration target, validate its user predecessor, and
    /// delete the turn from the store. `None` means the operation no-ops.
    async fn recover_user_turn(
        &self,
        assistant_message_id: &MessageId,
        conversation: &Conversation,
    ) -> Option<UserMessage> {
        let messages = match self.store.list(&conversation.id).await {
            Ok(messages) => messages,
            Err(err) => {
                error!(conversation = %conversation.id, error = %err, "history read failed");
                return None;
            }
        };

        let Some(idx) = messages
            .iter()
            .rposition(|m| m.id() == assistant_message_id)
        else {
            warn!(
                conversation = %conversation.id,
                message = %assistant_message_id,
                "regenerate target not found, ignoring"
            );
            return None;
        };
        let Some(user_message) = idx
            .checked_sub(1)
            .and_then(|i| messages.get(i))
            .and_then(Message::as_user)
            .cloned()
        else {
            warn!(
                conversation = %conversation.id,
                message = %assistant_message_id,
                "regenerate target is not preceded by a user message, ignoring"
            );
            return None;
        };

        // Drop the recovered user turn as well: generate() re-appends it with
        // its original content and attachments.
        if let Err(err) = self
            .store
            .delete_from(&conversation.id, &user_message.id)
            .await
        {
            error!(conversation = %conversation.id, error = %err, "delete failed");
            return None;
        }

        Some(user_message)
    }

    /// Cancel one conversation's task, or every task when `None` (the
    /// provider-switch path). Cancelling a conversation with no task still
    /// clears its generating flag.
    pub fn cancel(&self, conversation: Option<&ConversationId>) {
        let mut state = self.lock_state();
        match conversation {
            Some(id) => {
                state.abort_task(id);
                state.set_generating(id, false);
            }
            None => {
                for (id, entry) in state.tasks.drain().collect::<Vec<_>>() {
                    debug!(conversation = %id, "cancelling task on provider switch");
                    entry.handle.abort();
                }
                let ids: Vec<ConversationId> = state.generating.keys().cloned().collect();
                for id in ids {
                    state.set_generating(&id, false);
                }
            }
        }
    }

    /// The ordered message list of a conversation, live.
    pub async fn observe_messages(
        &self,
        conversation: &ConversationId,
    ) -> watch::Receiver<Vec<Message>> {
        self.store.observe(conversation).await
    }

    /// Whether a conversation has a generation in flight, live.
    pub fn observe_generating(&self, conversation: &ConversationId) -> watch::Receiver<bool> {
        self.lock_state()
            .generating
            .entry(conversation.clone())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Conversation-wide errors for one conversation. Per-message errors are
    /// observed through the message list instead.
    pub fn observe_errors(&self, conversation: &ConversationId) -> mpsc::Receiver<ErrorKind> {
        let mut events = self.errors_tx.subscribe();
        let (tx, rx) = mpsc::channel(16);
        let conversation = conversation.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.conversation == conversation => {
                        if tx.send(event.kind).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "error observer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }

    /// All conversation-wide error events, unfiltered.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ConversationError> {
        self.errors_tx.subscribe()
    }

    fn emit_error(&self, conversation: &ConversationId, kind: ErrorKind) {
        warn!(%conversation, %kind, "generation failed");
        let _ = self.errors_tx.send(ConversationError {
            conversation: conversation.clone(),
            kind,
        });
    }

    // ── Task body ───────────────────────────────────────────────────────

    async fn run_generation(&self, user_message: UserMessage, conversation: Conversation) {
        let history = match self.store.list(&conversation.id).await {
            Ok(history) => history,
            Err(err) => {
                self.emit_error(&conversation.id, ErrorKind::Unknown(err.to_string()));
                return;
            }
        };

        if let Err(err) = self
            .store
            .append(&conversation.id, Message::User(user_message.clone()))
            .await
        {
            self.emit_error(&conversation.id, ErrorKind::Unknown(err.to_string()));
            return;
        }

        let model = self.resolve_model(&conversation).await;

        let config = match self.providers.active_config(conversation.provider).await {
            Ok(config) => config,
            Err(err) => {
                self.emit_error(&conversation.id, ErrorKind::Unknown(err.to_string()));
                return;
            }
        };
        let client = self.clients.client_for(&config).await;

        let mut prompt = history;
        let streaming = matches!(user_message.content, MessageContent::Text(_));
        prompt.push(Message::User(user_message));

        if streaming {
            self.run_streaming(client, prompt, model, &conversation.id)
                .await;
        } else {
            self.run_single_shot(client, prompt, model, &conversation.id)
                .await;
        }
    }

    /// Resolve the conversation's model from its provider's catalog.
    ///
    /// Absence is a violated internal invariant — the conversation references
    /// a model its provider does not offer — and masking it would silently
    /// corrupt conversation state, so it raises instead of reporting.
    async fn resolve_model(&self, conversation: &Conversation) -> Model {
        let models = match self.providers.get_models(conversation.provider).await {
            Ok(models) => models,
            Err(err) => panic!(
                "model catalog unavailable for provider {}: {err}",
                conversation.provider
            ),
        };
        match models.into_iter().find(|m| m.id == conversation.model_id) {
            Some(model) => model,
            None => panic!(
                "conversation {} references model {} not offered by provider {}",
                conversation.id, conversation.model_id, conversation.provider
            ),
        }
    }

    async fn run_streaming(
        &self,
        client: ProviderClient,
        prompt: Vec<Message>,
        model: Model,
        conversation: &ConversationId,
    ) {
        let mut assembler = StreamAssembler::new(Arc::clone(&self.store), conversation.clone());

        let mut frames = match client.chat.send_streaming(&prompt, &model).await {
            Ok(frames) => frames,
            Err(BackendError::Cancelled) => return,
            Err(err) => {
                self.emit_error(conversation, classify(&err));
                return;
            }
        };

        let mut settled = false;
        while let Some(item) = frames.recv().await {
            match item {
                Ok(frame) => match assembler.apply(frame).await {
                    Ok(finished) => {
                        if finished {
                            settled = true;
                            break;
                        }
                    }
                    Err(err) => {
                        self.emit_error(conversation, ErrorKind::Unknown(err.to_string()));
                        return;
                    }
                },
                Err(BackendError::Cancelled) => {
                    // User-initiated; settle quietly, never as an error.
                    if let Err(err) = assembler.settle_interrupted().await {
                        warn!(%conversation, error = %err, "failed to settle cancelled stream");
                    }
                    return;
                }
                Err(err) => {
                    let kind = classify(&err);
                    match assembler.fail(kind.clone()).await {
                        Ok(ErrorDisposition::AttachedToMessage) => {}
                        Ok(ErrorDisposition::ConversationWide) => {
                            self.emit_error(conversation, kind);
                        }
                        Err(store_err) => {
                            warn!(%conversation, error = %store_err, "failed to record stream error");
                            self.emit_error(conversation, kind);
                        }
                    }
                    return;
                }
            }
        }

        // Transport closed without an End frame: the established message is
        // settled as an ordinary stop rather than left dangling.
        if !settled {
            if let Err(err) = assembler.settle_interrupted().await {
                warn!(%conversation, error = %err, "failed to settle interrupted stream");
            }
        }
    }

    async fn run_single_shot(
        &self,
        client: ProviderClient,
        prompt: Vec<Message>,
        model: Model,
        conversation: &ConversationId,
    ) {
        match client.chat.send_once(&prompt, &model).await {
            Ok(assistant) => {
                if let Err(err) = self
                    .store
                    .append(conversation, Message::Assistant(assistant))
                    .await
                {
                    self.emit_error(conversation, ErrorKind::Unknown(err.to_string()));
                }
            }
            Err(BackendError::Cancelled) => {}
            Err(err) => self.emit_error(conversation, classify(&err)),
        }
    }
}

// Full generation flows are covered in tests/generation_flow.rs against
// scripted backends; these cover the coordinator's own bookkeeping.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StaticProviderStore};

    fn coordinator() -> GenerationCoordinator {
        GenerationCoordinator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(StaticProviderStore::new()),
        )
    }

    #[tokio::test]
    async fn test_generating_defaults_to_false() {
        let coordinator = coordinator();
        let rx = coordinator.observe_generating(&ConversationId::new("c1"));
        assert!(!*rx.borrow());
    }

    #[tokio::test]
    async fn test_cancel_without_task_is_noop() {
        let coordinator = coordinator();
        let id = ConversationId::new("c1");
        coordinator.cancel(Some(&id));
        coordinator.cancel(None);
        assert!(!*coordinator.observe_generating(&id).borrow());
    }

    #[tokio::test]
    async fn test_clones_share_status_channels() {
        let first = coordinator();
        let second = first.clone();
        let id = ConversationId::new("c1");

        let rx = first.observe_generating(&id);
        let rx_clone = second.observe_generating(&id);
        assert_eq!(*rx.borrow(), *rx_clone.borrow());
    }

    #[tokio::test]
    async fn test_no_errors_until_emitted() {
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe_errors();
        assert!(rx.try_recv().is_err());
    }
}
