//! In-memory collaborators for engine tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::backend::{GenerationBackend, MessageRepository, StreamSender};
use crate::chat_manager::ChatManager;
use crate::error::BackendError;
use crate::events::{EventSink, NoticePayload, UiEvent};
use crate::protocol::{
    AuthorKind, Conversation, ConversationId, GenerationRequest, Message, MessageId, StreamEvent,
};

/// Drain the manager's queue until spawned calls stop producing events.
pub async fn settle(manager: &mut ChatManager) {
    let mut quiet_rounds = 0;
    while quiet_rounds < 8 {
        tokio::task::yield_now().await;
        let mut handled = false;
        while let Some(event) = manager.try_next_event() {
            manager.handle_event(event);
            handled = true;
        }
        if handled {
            quiet_rounds = 0;
        } else {
            quiet_rounds += 1;
        }
    }
}

/// Records generate calls and lets the test push stream events.
#[derive(Default)]
pub struct FakeGenerator {
    requests: Mutex<Vec<(GenerationRequest, StreamSender)>>,
    cancelled: Mutex<Vec<ConversationId>>,
    fail: AtomicBool,
}

impl FakeGenerator {
    pub fn fail_requests(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn cancelled(&self) -> Vec<ConversationId> {
        self.cancelled.lock().clone()
    }

    /// Push on the channel of the most recent request.
    pub fn push(&self, event: StreamEvent) {
        if let Some((_, sender)) = self.requests.lock().last() {
            sender.send(event);
        }
    }
}

#[async_trait]
impl GenerationBackend for FakeGenerator {
    async fn request_generation(
        &self,
        request: GenerationRequest,
        events: StreamSender,
    ) -> Result<(), BackendError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BackendError::Request("connection refused".into()));
        }
        self.requests.lock().push((request, events));
        Ok(())
    }

    fn cancel_generation(&self, conversation_id: ConversationId) {
        self.cancelled.lock().push(conversation_id);
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        Ok(vec!["llama3".into(), "mistral".into()])
    }
}

#[derive(Default)]
struct RepoState {
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    next_id: i64,
}

impl RepoState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn history(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub struct FakeRepository {
    state: Mutex<RepoState>,
    fail_assistant: AtomicBool,
    fail_user: AtomicBool,
}

impl FakeRepository {
    pub fn fail_assistant_persist(&self, fail: bool) {
        self.fail_assistant.store(fail, Ordering::SeqCst);
    }

    pub fn fail_user_persist(&self, fail: bool) {
        self.fail_user.store(fail, Ordering::SeqCst);
    }

    pub fn seed_conversation(&self, name: &str) -> Conversation {
        let mut state = self.state.lock();
        let conversation = Conversation {
            id: state.next_id(),
            display_name: name.to_string(),
            created_at: Utc::now(),
        };
        state.conversations.push(conversation.clone());
        conversation
    }

    pub fn seed_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
        author_model: Option<&str>,
    ) -> Message {
        let mut state = self.state.lock();
        let message = Message {
            id: MessageId::Durable(state.next_id()),
            conversation_id,
            author_kind: if author_model.is_some() {
                AuthorKind::Assistant
            } else {
                AuthorKind::User
            },
            author_model: author_model.map(str::to_string),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        state.messages.push(message.clone());
        message
    }

    pub fn conversation_name(&self, conversation_id: ConversationId) -> Option<String> {
        self.state
            .lock()
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .map(|c| c.display_name.clone())
    }

    pub fn assistant_messages(&self, conversation_id: ConversationId) -> usize {
        self.state
            .lock()
            .history(conversation_id)
            .iter()
            .filter(|m| m.author_kind == AuthorKind::Assistant)
            .count()
    }
}

#[async_trait]
impl MessageRepository for FakeRepository {
    async fn persist_message(
        &self,
        conversation_id: ConversationId,
        content: String,
        author_model: Option<String>,
    ) -> Result<Message, BackendError> {
        if author_model.is_some() && self.fail_assistant.load(Ordering::SeqCst) {
            return Err(BackendError::Database("disk full".into()));
        }
        if author_model.is_none() && self.fail_user.load(Ordering::SeqCst) {
            return Err(BackendError::NotFound);
        }
        let model = author_model.as_deref();
        Ok(self.seed_message(conversation_id, &content, model))
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, BackendError> {
        Ok(self.state.lock().history(conversation_id))
    }

    async fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: i64,
    ) -> Result<Vec<Message>, BackendError> {
        let mut state = self.state.lock();
        state.messages.retain(|m| {
            m.conversation_id != conversation_id
                || m.id.durable().is_some_and(|id| id < message_id)
        });
        Ok(state.history(conversation_id))
    }

    async fn create_conversation(&self, name: String) -> Result<Conversation, BackendError> {
        Ok(self.seed_conversation(&name))
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, BackendError> {
        let mut conversations = self.state.lock().conversations.clone();
        conversations.reverse();
        Ok(conversations)
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.conversations.retain(|c| c.id != conversation_id);
        state.messages.retain(|m| m.conversation_id != conversation_id);
        Ok(())
    }
}

/// Sink that keeps every event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<UiEvent>>,
}

impl RecordingSink {
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(UiEvent::name).collect()
    }

    pub fn notices(&self) -> Vec<NoticePayload> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                UiEvent::Notice(n) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: UiEvent) {
        self.events.lock().push(event);
    }
}
