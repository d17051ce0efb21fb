//! Collaborator contracts consumed by the chat engine.
//!
//! Generation (model invocation plus the push channel) and persistence are
//! separate traits so either can be swapped or faked on its own.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::protocol::{Conversation, ConversationId, GenerationRequest, Message, StreamEvent};

/// Push channel handed to the generation backend for one request.
///
/// Sending never blocks; a send after the engine went away is dropped.
#[derive(Clone, Debug)]
pub struct StreamSender {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamSender {
    pub fn new(tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self { tx }
    }

    /// Returns false once the receiving side is closed.
    pub fn send(&self, event: StreamEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Fire a generation. `Ok` is the acknowledgement; text then arrives on
    /// `events`, tagged with the request's session id, and ends with a
    /// `Complete` (or `Failed`) event.
    async fn request_generation(
        &self,
        request: GenerationRequest,
        events: StreamSender,
    ) -> Result<(), BackendError>;

    /// Best-effort, fire-and-forget.
    fn cancel_generation(&self, conversation_id: ConversationId);

    async fn list_models(&self) -> Result<Vec<String>, BackendError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Save a message. `author_model` is set for assistant messages only.
    /// Returns the durable record with its id and timestamp.
    async fn persist_message(
        &self,
        conversation_id: ConversationId,
        content: String,
        author_model: Option<String>,
    ) -> Result<Message, BackendError>;

    /// Ordered history of a conversation.
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, BackendError>;

    /// Delete `message_id` and every later message of the conversation,
    /// returning the remaining ordered history.
    async fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: i64,
    ) -> Result<Vec<Message>, BackendError>;

    async fn create_conversation(&self, name: String) -> Result<Conversation, BackendError>;

    /// All conversations, newest first.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, BackendError>;

    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<(), BackendError>;
}
