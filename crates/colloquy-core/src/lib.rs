#![deny(unsafe_code)]

//! Colloquy core — generation orchestration for multi-provider LLM chat.
//!
//! The centrepiece is the [`GenerationCoordinator`]: one cancellable task per
//! conversation, streaming output assembled into message-store upserts, and a
//! closed error taxonomy for everything that can go wrong between the user
//! and a provider. Provider clients are constructed lazily and memoized by
//! the [`ClientCache`], keyed on full configuration equality.

use std::future::Future;
use std::pin::Pin;

/// A boxed, `Send`-safe future — the return type of async methods on the
/// object-safe traits in this crate ([`ChatBackend`], [`MessageStore`], ...).
///
/// Native `async fn` in traits produces opaque return types that cannot be
/// called through `Arc<dyn Trait>`; a concrete `Pin<Box<dyn Future>>` can.
/// This alias keeps those signatures readable.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Failure taxonomy and the free-text error classifier.
pub mod classify;
/// Provider clients: capability traits, concrete adapters, and the client cache.
pub mod client;
/// The generation coordinator — one task per conversation.
pub mod coordinator;
/// Conversation, message, and finish-reason types.
pub mod message;
/// Model descriptors and capability flags.
pub mod model;
/// Message and provider store traits plus in-memory implementations.
pub mod store;
/// Stream assembly — provider frames to store upserts.
pub mod stream;

pub use classify::{classify, classify_text, ErrorKind};
pub use client::cache::ClientFactory;
pub use client::{BackendError, ChatBackend, ClientCache, ModelLister, ProviderClient, StreamFrame};
pub use coordinator::{ConversationError, GenerationCoordinator};
pub use message::{
    AssistantMessage, Attachment, AudioClip, Conversation, ConversationId, FinishReason, Message,
    MessageContent, MessageId, UserMessage,
};
pub use model::{Capability, Model};
pub use store::{MemoryStore, MessageStore, ProviderStore, StaticProviderStore, StoreError};
pub use stream::{ErrorDisposition, StreamAssembler};
