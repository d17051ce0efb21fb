use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::backend::{GenerationBackend, MessageRepository, StreamSender};
use crate::context_switch::{ContextSwitchController, PendingSend};
use crate::conversation_store::generate_title;
use crate::error::{BackendError, ChatError};
use crate::events::{
    ConversationChangedPayload, ConversationsChangedPayload, EventSink, MessagesChangedPayload,
    NoticePayload, SessionStatePayload, StreamClearedPayload, StreamUpdatePayload, UiEvent,
};
use crate::generation_session::{GenerationSession, SessionPhase, StreamEnd};
use crate::message_store::MessageStore;
use crate::protocol::{
    Conversation, ConversationId, GenerationRequest, Message, MessageId, SessionId, StreamEvent,
    StreamEventKind,
};
use crate::reasoning_parser::{SegmentedView, Segmenter};

/// Prompt and model of a send typed on the landing screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LandingSend {
    pub prompt: String,
    pub model: String,
}

/// Everything that can wake the manager up, all delivered through one queue.
/// Resolutions of async calls carry the session or switch epoch they were
/// issued for.
#[derive(Debug)]
pub enum EngineEvent {
    Stream(StreamEvent),
    UserMessageSaved {
        session_id: SessionId,
        conversation_id: ConversationId,
        pending: MessageId,
        result: Result<Message, BackendError>,
    },
    GenerationRequested {
        session_id: SessionId,
        result: Result<(), BackendError>,
    },
    CommitResolved {
        session_id: SessionId,
        conversation_id: ConversationId,
        result: Result<Message, BackendError>,
    },
    HistoryLoaded {
        epoch: u64,
        conversation_id: ConversationId,
        result: Result<Vec<Message>, BackendError>,
    },
    MessagesDeleted {
        epoch: u64,
        conversation_id: ConversationId,
        result: Result<Vec<Message>, BackendError>,
    },
    ConversationCreated {
        send: Option<LandingSend>,
        result: Result<Conversation, BackendError>,
    },
    ConversationDeleted {
        conversation_id: ConversationId,
        result: Result<(), BackendError>,
    },
}

/// Whether an event changed anything. Stale events are dropped silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    Stale,
}

/// Point-in-time view of the engine for a freshly attached UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatSnapshot {
    pub conversation_id: Option<ConversationId>,
    pub messages: Vec<Message>,
    pub phase: SessionPhase,
    pub author_model: Option<String>,
    pub live: Option<SegmentedView>,
    pub selected_model: Option<String>,
    /// A switch away now would cancel and drop the response.
    pub is_responding: bool,
}

/// The single owner of generation state.
///
/// All mutation happens on `&mut self`, one event at a time; backend calls
/// are spawned and report back through the event queue.
pub struct ChatManager {
    session: GenerationSession,
    store: MessageStore,
    context: ContextSwitchController,
    generator: Arc<dyn GenerationBackend>,
    repository: Arc<dyn MessageRepository>,
    sink: Arc<dyn EventSink>,
    selected_model: Option<String>,
    next_local_id: u64,
    generation_task: Option<AbortHandle>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    stream_tx: mpsc::UnboundedSender<StreamEvent>,
    stream_rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl ChatManager {
    pub fn new(
        generator: Arc<dyn GenerationBackend>,
        repository: Arc<dyn MessageRepository>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        Self {
            session: GenerationSession::new(Segmenter::new()),
            store: MessageStore::new(),
            context: ContextSwitchController::new(),
            generator,
            repository,
            sink,
            selected_model: None,
            next_local_id: 0,
            generation_task: None,
            events_tx,
            events_rx,
            stream_tx,
            stream_rx,
        }
    }

    pub fn with_selected_model(mut self, model: Option<String>) -> Self {
        self.selected_model = model;
        self
    }

    pub fn generator(&self) -> Arc<dyn GenerationBackend> {
        self.generator.clone()
    }

    pub fn repository(&self) -> Arc<dyn MessageRepository> {
        self.repository.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.context.active_conversation()
    }

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn live_view(&self) -> Option<SegmentedView> {
        self.session
            .live_view()
            .filter(|_| self.session_is_shown())
    }

    pub fn selected_model(&self) -> Option<&str> {
        self.selected_model.as_deref()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        let phase = self.session.phase();
        ChatSnapshot {
            conversation_id: self.context.active_conversation(),
            messages: self.store.messages().to_vec(),
            phase,
            author_model: self.session.active().map(|a| a.author_model.clone()),
            live: self.live_view(),
            selected_model: self.selected_model.clone(),
            is_responding: phase != SessionPhase::Idle && self.session_is_shown(),
        }
    }

    /// The live session belongs to the open conversation.
    fn session_is_shown(&self) -> bool {
        self.session.active().is_some_and(|a| {
            self.context.active_conversation() == Some(a.conversation_id)
        })
    }

    /// Change the globally selected model. Running sessions keep theirs.
    pub fn select_model(&mut self, model: Option<String>) {
        self.selected_model = model.filter(|m| !m.trim().is_empty());
    }

    fn resolve_model(&self, model: Option<String>) -> Result<String, ChatError> {
        model
            .filter(|m| !m.trim().is_empty())
            .or_else(|| self.selected_model.clone())
            .ok_or(ChatError::NoModelSelected)
    }

    // === Session operations ===

    /// Send `prompt` in the open conversation.
    ///
    /// The user's message is shown immediately with a pending id; it is then
    /// saved and, once saved, the generate call is issued.
    pub fn start(
        &mut self,
        prompt: String,
        model: Option<String>,
        conversation_id: ConversationId,
    ) -> Result<SessionId, ChatError> {
        if !self.session.is_idle() {
            return Err(ChatError::AlreadyActive);
        }
        if prompt.trim().is_empty() {
            return Err(ChatError::EmptyPrompt);
        }
        let model = self.resolve_model(model)?;
        match self.context.active_conversation() {
            None => return Err(ChatError::NoActiveConversation),
            Some(active) if active != conversation_id => {
                return Err(ChatError::ConversationNotActive(conversation_id))
            }
            Some(_) => {}
        }

        self.next_local_id += 1;
        let pending = Message::pending_user(self.next_local_id, conversation_id, prompt.clone());
        let session = self
            .session
            .begin(conversation_id, prompt.clone(), model, pending.id)?;
        info!(
            session = %session.id,
            conversation = conversation_id,
            model = %session.author_model,
            "starting generation"
        );

        self.store.push_optimistic(pending.clone());
        self.emit_messages();
        self.emit_session_state();

        let repository = self.repository.clone();
        let session_id = session.id;
        self.spawn_call(async move {
            let result = repository
                .persist_message(conversation_id, prompt, None)
                .await;
            EngineEvent::UserMessageSaved {
                session_id,
                conversation_id,
                pending: pending.id,
                result,
            }
        });
        Ok(session_id)
    }

    /// Cancel the live session. Returns false if there was nothing to cancel.
    pub fn cancel(&mut self) -> bool {
        let Some(session) = self.session.cancel() else {
            return false;
        };
        info!(session = %session.id, conversation = session.conversation_id, "generation cancelled");

        self.generator.cancel_generation(session.conversation_id);
        if let Some(task) = self.generation_task.take() {
            task.abort();
        }
        self.emit(UiEvent::StreamCleared(StreamClearedPayload {
            conversation_id: session.conversation_id,
            session_id: session.id,
        }));
        self.emit_session_state();
        true
    }

    // === Conversation operations ===

    /// Make `target` the open conversation (`None` for the landing screen).
    ///
    /// Cancels any live session, empties the list, re-subscribes and loads
    /// the new history. Opening the already-open conversation does nothing.
    pub fn open_conversation(&mut self, target: Option<ConversationId>) -> bool {
        if !self.context.is_change(target) {
            return false;
        }
        self.cancel();
        if let Some(session) = self.session.detach() {
            self.emit(UiEvent::StreamCleared(StreamClearedPayload {
                conversation_id: session.conversation_id,
                session_id: session.id,
            }));
        }
        self.store.reset(target);
        let subscription = self.context.activate(target);
        info!(conversation = ?target, "conversation switched");

        self.emit(UiEvent::ConversationChanged(ConversationChangedPayload {
            conversation_id: target,
        }));
        self.emit_messages();

        if let Some(subscription) = subscription {
            let repository = self.repository.clone();
            self.spawn_call(async move {
                let result = repository
                    .fetch_messages(subscription.conversation_id)
                    .await;
                EngineEvent::HistoryLoaded {
                    epoch: subscription.epoch,
                    conversation_id: subscription.conversation_id,
                    result,
                }
            });
        }
        true
    }

    /// Send from the landing screen: create a conversation titled after the
    /// prompt, open it, and replay the send once it is ready.
    pub fn send_from_landing(
        &mut self,
        prompt: String,
        model: Option<String>,
    ) -> Result<(), ChatError> {
        if !self.session.is_idle() {
            return Err(ChatError::AlreadyActive);
        }
        if prompt.trim().is_empty() {
            return Err(ChatError::EmptyPrompt);
        }
        let model = self.resolve_model(model)?;

        let title = generate_title(&prompt);
        let repository = self.repository.clone();
        self.spawn_call(async move {
            let result = repository.create_conversation(title).await;
            EngineEvent::ConversationCreated {
                send: Some(LandingSend { prompt, model }),
                result,
            }
        });
        Ok(())
    }

    pub fn create_conversation(&mut self, name: String) -> Result<(), ChatError> {
        if name.trim().is_empty() {
            return Err(ChatError::EmptyPrompt);
        }
        let repository = self.repository.clone();
        self.spawn_call(async move {
            let result = repository.create_conversation(name.trim().to_string()).await;
            EngineEvent::ConversationCreated { send: None, result }
        });
        Ok(())
    }

    pub fn delete_conversation(&mut self, conversation_id: ConversationId) {
        if self.context.active_conversation() == Some(conversation_id) {
            self.open_conversation(None);
        }
        let repository = self.repository.clone();
        self.spawn_call(async move {
            let result = repository.delete_conversation(conversation_id).await;
            EngineEvent::ConversationDeleted {
                conversation_id,
                result,
            }
        });
    }

    /// Delete a message and everything after it in the open conversation.
    pub fn delete_message(&mut self, message_id: MessageId) -> Result<(), ChatError> {
        if !self.session.is_idle() {
            return Err(ChatError::AlreadyActive);
        }
        let subscription = self
            .context
            .active()
            .ok_or(ChatError::NoActiveConversation)?;
        let durable = message_id.durable().ok_or(ChatError::MessageNotCommitted)?;

        let repository = self.repository.clone();
        self.spawn_call(async move {
            let result = repository
                .delete_message(subscription.conversation_id, durable)
                .await;
            EngineEvent::MessagesDeleted {
                epoch: subscription.epoch,
                conversation_id: subscription.conversation_id,
                result,
            }
        });
        Ok(())
    }

    // === Event loop ===

    /// Wait for the next queued event.
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        tokio::select! {
            Some(event) = self.events_rx.recv() => Some(event),
            Some(event) = self.stream_rx.recv() => Some(EngineEvent::Stream(event)),
            else => None,
        }
    }

    /// Take a queued event without waiting.
    pub fn try_next_event(&mut self) -> Option<EngineEvent> {
        self.events_rx
            .try_recv()
            .ok()
            .or_else(|| self.stream_rx.try_recv().ok().map(EngineEvent::Stream))
    }

    pub fn handle_event(&mut self, event: EngineEvent) -> EventOutcome {
        let outcome = match event {
            EngineEvent::Stream(event) => self.on_stream_event(event),
            EngineEvent::UserMessageSaved {
                session_id,
                conversation_id,
                pending,
                result,
            } => self.on_user_message_saved(session_id, conversation_id, pending, result),
            EngineEvent::GenerationRequested { session_id, result } => {
                self.on_generation_requested(session_id, result)
            }
            EngineEvent::CommitResolved {
                session_id,
                conversation_id,
                result,
            } => self.on_commit_resolved(session_id, conversation_id, result),
            EngineEvent::HistoryLoaded {
                epoch,
                conversation_id,
                result,
            } => self.on_history_loaded(epoch, conversation_id, result),
            EngineEvent::MessagesDeleted {
                epoch,
                conversation_id,
                result,
            } => self.on_messages_deleted(epoch, conversation_id, result),
            EngineEvent::ConversationCreated { send, result } => {
                self.on_conversation_created(send, result)
            }
            EngineEvent::ConversationDeleted {
                conversation_id,
                result,
            } => self.on_conversation_deleted(conversation_id, result),
        };
        if outcome == EventOutcome::Stale {
            debug!("dropped stale event");
        }
        outcome
    }

    fn on_stream_event(&mut self, event: StreamEvent) -> EventOutcome {
        if !self.context.accepts(event.conversation_id) {
            return EventOutcome::Stale;
        }
        let StreamEvent {
            session_id,
            conversation_id,
            kind,
        } = event;

        match kind {
            StreamEventKind::Fragment(chunk) => {
                let before = self.session.phase();
                let Some(view) = self
                    .session
                    .accept_fragment(session_id, conversation_id, &chunk)
                else {
                    return EventOutcome::Stale;
                };
                debug!(session = %session_id, len = chunk.len(), "fragment applied");
                if before != self.session.phase() {
                    self.emit_session_state();
                }
                self.emit(UiEvent::StreamUpdate(StreamUpdatePayload {
                    conversation_id,
                    session_id,
                    view,
                }));
                EventOutcome::Applied
            }
            StreamEventKind::Complete => match self.session.end_stream(session_id) {
                None => EventOutcome::Stale,
                Some(StreamEnd::Empty(session)) => {
                    info!(session = %session.id, "stream ended without an answer");
                    self.finish_stream(session.id, session.conversation_id);
                    EventOutcome::Applied
                }
                Some(StreamEnd::Commit(commit)) => {
                    info!(session = %session_id, len = commit.content.len(), "stream complete, committing");
                    self.emit_session_state();
                    let repository = self.repository.clone();
                    self.spawn_call(async move {
                        let result = repository
                            .persist_message(
                                commit.conversation_id,
                                commit.content,
                                Some(commit.author_model),
                            )
                            .await;
                        EngineEvent::CommitResolved {
                            session_id: commit.session_id,
                            conversation_id: commit.conversation_id,
                            result,
                        }
                    });
                    EventOutcome::Applied
                }
            },
            StreamEventKind::Failed(error) => match self.session.fail_stream(session_id) {
                None => EventOutcome::Stale,
                Some(session) => {
                    warn!(session = %session.id, %error, "stream failed");
                    self.notice(
                        Some(session.conversation_id),
                        ChatError::BackendUnavailable(error),
                    );
                    self.finish_stream(session.id, session.conversation_id);
                    EventOutcome::Applied
                }
            },
        }
    }

    fn on_user_message_saved(
        &mut self,
        session_id: SessionId,
        conversation_id: ConversationId,
        pending: MessageId,
        result: Result<Message, BackendError>,
    ) -> EventOutcome {
        let mut outcome = EventOutcome::Stale;
        if self.store.conversation_id() == Some(conversation_id) {
            let changed = match &result {
                Ok(message) => self.store.confirm(pending, message.clone()),
                Err(_) => self.store.discard_pending(pending),
            };
            if changed {
                self.emit_messages();
                outcome = EventOutcome::Applied;
            }
        }

        let awaiting = self.session.phase() == SessionPhase::AwaitingStart
            && self.session.active().map(|a| a.id) == Some(session_id);
        if !awaiting {
            return outcome;
        }

        match result {
            Ok(message) => {
                self.session.confirm_user_message(session_id, message.id);
                self.request_generation(session_id);
            }
            Err(error) => {
                warn!(session = %session_id, %error, "failed to save user message");
                self.session.fail_start(session_id);
                self.notice(
                    Some(conversation_id),
                    ChatError::PersistenceFailure(error.to_string()),
                );
                self.emit_session_state();
                self.replay_pending_send();
            }
        }
        EventOutcome::Applied
    }

    fn request_generation(&mut self, session_id: SessionId) {
        let Some(session) = self.session.active() else {
            return;
        };
        let request = GenerationRequest {
            session_id,
            conversation_id: session.conversation_id,
            prompt: session.prompt.clone(),
            model: session.author_model.clone(),
        };
        let generator = self.generator.clone();
        let events = StreamSender::new(self.stream_tx.clone());
        let task = self.spawn_call(async move {
            let result = generator.request_generation(request, events).await;
            EngineEvent::GenerationRequested { session_id, result }
        });
        self.generation_task = Some(task);
    }

    fn on_generation_requested(
        &mut self,
        session_id: SessionId,
        result: Result<(), BackendError>,
    ) -> EventOutcome {
        let owned = self.session.active().map(|a| a.id) == Some(session_id);
        if owned {
            self.generation_task = None;
        }
        match result {
            Ok(()) => {
                let before = self.session.phase();
                if !self.session.acknowledge(session_id) {
                    return EventOutcome::Stale;
                }
                if before != self.session.phase() {
                    self.emit_session_state();
                }
                EventOutcome::Applied
            }
            Err(error) => {
                let Some(session) = self.session.fail_start(session_id) else {
                    return EventOutcome::Stale;
                };
                warn!(session = %session_id, %error, "generation request failed");
                self.notice(
                    Some(session.conversation_id),
                    ChatError::BackendUnavailable(error.to_string()),
                );
                self.emit_session_state();
                self.replay_pending_send();
                EventOutcome::Applied
            }
        }
    }

    fn on_commit_resolved(
        &mut self,
        session_id: SessionId,
        conversation_id: ConversationId,
        result: Result<Message, BackendError>,
    ) -> EventOutcome {
        if self.session.finish_commit(session_id).is_none() {
            return EventOutcome::Stale;
        }
        match result {
            Ok(message) => {
                if self.store.conversation_id() == Some(conversation_id) {
                    self.store.append_committed(message);
                    self.emit_messages();
                }
            }
            Err(error) => {
                warn!(session = %session_id, %error, "failed to save assistant message");
                self.notice(
                    Some(conversation_id),
                    ChatError::PersistenceFailure(error.to_string()),
                );
            }
        }
        self.emit(UiEvent::StreamCleared(StreamClearedPayload {
            conversation_id,
            session_id,
        }));
        self.emit_session_state();
        self.replay_pending_send();
        EventOutcome::Applied
    }

    fn on_history_loaded(
        &mut self,
        epoch: u64,
        conversation_id: ConversationId,
        result: Result<Vec<Message>, BackendError>,
    ) -> EventOutcome {
        if !self.context.is_current(epoch) {
            return EventOutcome::Stale;
        }
        match result {
            Ok(messages) => {
                debug!(conversation = conversation_id, count = messages.len(), "history loaded");
                self.store.replace_all(messages);
                self.emit_messages();
            }
            Err(error) => {
                warn!(conversation = conversation_id, %error, "failed to load history");
                self.notice(
                    Some(conversation_id),
                    ChatError::BackendUnavailable(error.to_string()),
                );
            }
        }
        self.context.mark_history_loaded(epoch);
        self.replay_pending_send();
        EventOutcome::Applied
    }

    fn on_messages_deleted(
        &mut self,
        epoch: u64,
        conversation_id: ConversationId,
        result: Result<Vec<Message>, BackendError>,
    ) -> EventOutcome {
        if !self.context.is_current(epoch) {
            return EventOutcome::Stale;
        }
        match result {
            Ok(remaining) => {
                self.store.apply_deletion(remaining);
                self.emit_messages();
            }
            Err(error) => {
                warn!(conversation = conversation_id, %error, "failed to delete message");
                self.notice(
                    Some(conversation_id),
                    ChatError::PersistenceFailure(error.to_string()),
                );
            }
        }
        EventOutcome::Applied
    }

    fn on_conversation_created(
        &mut self,
        send: Option<LandingSend>,
        result: Result<Conversation, BackendError>,
    ) -> EventOutcome {
        let conversation = match result {
            Ok(conversation) => conversation,
            Err(error) => {
                warn!(%error, "failed to create conversation");
                self.notice(None, ChatError::PersistenceFailure(error.to_string()));
                return EventOutcome::Applied;
            }
        };
        info!(conversation = conversation.id, name = %conversation.display_name, "conversation created");
        let conversation_id = conversation.id;
        self.emit(UiEvent::ConversationsChanged(ConversationsChangedPayload {
            created: Some(conversation),
            deleted: None,
        }));

        if let Some(LandingSend { prompt, model }) = send {
            self.context.arm_pending_send(PendingSend {
                conversation_id,
                prompt,
                model,
            });
            self.open_conversation(Some(conversation_id));
        }
        EventOutcome::Applied
    }

    fn on_conversation_deleted(
        &mut self,
        conversation_id: ConversationId,
        result: Result<(), BackendError>,
    ) -> EventOutcome {
        match result {
            Ok(()) => self.emit(UiEvent::ConversationsChanged(ConversationsChangedPayload {
                created: None,
                deleted: Some(conversation_id),
            })),
            Err(error) => {
                warn!(conversation = conversation_id, %error, "failed to delete conversation");
                self.notice(None, ChatError::PersistenceFailure(error.to_string()));
            }
        }
        EventOutcome::Applied
    }

    /// Replay an armed landing-screen send, at most once.
    fn replay_pending_send(&mut self) {
        let Some(send) = self.context.take_ready_send(self.session.is_idle()) else {
            return;
        };
        debug!(conversation = send.conversation_id, "replaying landing send");
        if let Err(error) = self.start(send.prompt, Some(send.model), send.conversation_id) {
            self.notice(Some(send.conversation_id), error);
        }
    }

    fn finish_stream(&mut self, session_id: SessionId, conversation_id: ConversationId) {
        self.emit(UiEvent::StreamCleared(StreamClearedPayload {
            conversation_id,
            session_id,
        }));
        self.emit_session_state();
        self.replay_pending_send();
    }

    fn spawn_call<F>(&self, call: F) -> AbortHandle
    where
        F: Future<Output = EngineEvent> + Send + 'static,
    {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let event = call.await;
            let _ = tx.send(event);
        })
        .abort_handle()
    }

    // === Publishing ===

    fn emit(&self, event: UiEvent) {
        self.sink.emit(event);
    }

    fn emit_messages(&self) {
        self.emit(UiEvent::MessagesChanged(MessagesChangedPayload {
            conversation_id: self.store.conversation_id(),
            messages: self.store.messages().to_vec(),
        }));
    }

    fn emit_session_state(&self) {
        let active = self.session.active();
        self.emit(UiEvent::SessionState(SessionStatePayload {
            phase: self.session.phase(),
            conversation_id: active.map(|a| a.conversation_id),
            author_model: active.map(|a| a.author_model.clone()),
        }));
    }

    fn notice(&self, conversation_id: Option<ConversationId>, error: ChatError) {
        self.emit(UiEvent::Notice(NoticePayload {
            conversation_id,
            message: error.to_string(),
            error,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AuthorKind;
    use crate::test_support::{settle, FakeGenerator, FakeRepository, RecordingSink};

    struct Harness {
        manager: ChatManager,
        generator: Arc<FakeGenerator>,
        repository: Arc<FakeRepository>,
        sink: Arc<RecordingSink>,
    }

    impl Harness {
        fn new() -> Self {
            let generator = Arc::new(FakeGenerator::default());
            let repository = Arc::new(FakeRepository::default());
            let sink = Arc::new(RecordingSink::default());
            let manager = ChatManager::new(generator.clone(), repository.clone(), sink.clone())
                .with_selected_model(Some("llama3".to_string()));
            Self {
                manager,
                generator,
                repository,
                sink,
            }
        }

        async fn open(&mut self, name: &str) -> ConversationId {
            let conversation = self.repository.seed_conversation(name);
            self.manager.open_conversation(Some(conversation.id));
            settle(&mut self.manager).await;
            conversation.id
        }

        async fn send(&mut self, conversation_id: ConversationId, prompt: &str) -> SessionId {
            let session = self
                .manager
                .start(prompt.to_string(), None, conversation_id)
                .unwrap();
            settle(&mut self.manager).await;
            session
        }

        async fn push(&mut self, session_id: SessionId, conversation_id: ConversationId, chunk: &str) {
            self.generator
                .push(StreamEvent::fragment(session_id, conversation_id, chunk));
            settle(&mut self.manager).await;
        }

        async fn complete(&mut self, session_id: SessionId, conversation_id: ConversationId) {
            self.generator
                .push(StreamEvent::complete(session_id, conversation_id));
            settle(&mut self.manager).await;
        }
    }

    #[tokio::test]
    async fn test_full_generation_commits_answer() {
        let mut h = Harness::new();
        let chat = h.open("chat").await;
        let session = h.send(chat, "why?").await;

        assert_eq!(h.generator.requests().len(), 1);
        assert_eq!(h.manager.phase(), SessionPhase::Streaming);

        for chunk in ["<think>", "reasoning", "</think>", "Hello"] {
            h.push(session, chat, chunk).await;
        }
        let live = h.manager.live_view().unwrap();
        assert_eq!(live.reasoning_text, "reasoning");
        assert_eq!(live.answer_text, "Hello");
        assert!(!live.is_reasoning);

        h.complete(session, chat).await;
        assert_eq!(h.manager.phase(), SessionPhase::Idle);
        let messages = h.manager.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "why?");
        assert!(messages[0].is_user());
        assert_eq!(messages[1].author_kind, AuthorKind::Assistant);
        assert_eq!(messages[1].content, "Hello");
        assert_eq!(messages[1].author_model.as_deref(), Some("llama3"));
        assert!(messages.iter().all(|m| !m.id.is_pending()));
        assert!(h.manager.live_view().is_none());

        let names = h.sink.names();
        assert!(names.contains(&"stream-update"));
        assert_eq!(names.last(), Some(&"session-state"));
    }

    #[tokio::test]
    async fn test_user_message_is_shown_before_it_is_saved() {
        let mut h = Harness::new();
        let chat = h.open("chat").await;
        h.manager.start("hi".into(), None, chat).unwrap();

        assert_eq!(h.manager.messages().len(), 1);
        assert!(h.manager.messages()[0].id.is_pending());
        assert_eq!(h.manager.phase(), SessionPhase::AwaitingStart);
        assert!(h.generator.requests().is_empty());

        settle(&mut h.manager).await;
        assert!(!h.manager.messages()[0].id.is_pending());
        assert_eq!(h.generator.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_start_while_active_is_rejected() {
        let mut h = Harness::new();
        let chat = h.open("chat").await;
        let session = h.send(chat, "first").await;
        h.push(session, chat, "partial").await;

        let second = h.manager.start("second".into(), None, chat);
        assert_eq!(second, Err(ChatError::AlreadyActive));
        settle(&mut h.manager).await;

        assert_eq!(h.generator.requests().len(), 1);
        assert_eq!(h.manager.live_view().unwrap().answer_text, "partial");
        assert_eq!(h.manager.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_first_fragment() {
        let mut h = Harness::new();
        let chat = h.open("chat").await;
        let session = h.send(chat, "hello").await;

        assert!(h.manager.cancel());
        assert_eq!(h.manager.phase(), SessionPhase::Idle);
        assert_eq!(h.generator.cancelled(), vec![chat]);

        h.complete(session, chat).await;
        assert_eq!(h.manager.messages().len(), 1);
        assert!(h.manager.messages()[0].is_user());
        assert_eq!(h.repository.assistant_messages(chat), 0);
    }

    #[tokio::test]
    async fn test_fragments_after_cancel_are_ignored() {
        let mut h = Harness::new();
        let chat = h.open("chat").await;
        let session = h.send(chat, "hello").await;
        h.push(session, chat, "Hel").await;
        h.manager.cancel();
        let events_before = h.sink.len();

        let outcome = h
            .manager
            .handle_event(EngineEvent::Stream(StreamEvent::fragment(session, chat, "lo")));
        assert_eq!(outcome, EventOutcome::Stale);
        assert!(h.manager.live_view().is_none());
        assert_eq!(h.manager.messages().len(), 1);
        assert_eq!(h.sink.len(), events_before);
    }

    #[tokio::test]
    async fn test_cancel_while_saving_user_message_skips_generation() {
        let mut h = Harness::new();
        let chat = h.open("chat").await;
        h.manager.start("hello".into(), None, chat).unwrap();
        h.manager.cancel();
        settle(&mut h.manager).await;

        assert!(h.generator.requests().is_empty());
        assert_eq!(h.manager.messages().len(), 1);
        assert!(!h.manager.messages()[0].id.is_pending());
    }

    #[tokio::test]
    async fn test_switch_while_streaming() {
        let mut h = Harness::new();
        let first = h.open("first").await;
        let other = h.repository.seed_conversation("second");
        h.repository.seed_message(other.id, "old question", None);
        h.repository.seed_message(other.id, "old answer", Some("mistral"));

        let session = h.send(first, "hello").await;
        h.push(session, first, "partial").await;

        h.manager.open_conversation(Some(other.id));
        assert_eq!(h.manager.phase(), SessionPhase::Idle);
        assert!(h.manager.messages().is_empty());
        assert_eq!(h.generator.cancelled(), vec![first]);

        settle(&mut h.manager).await;
        let contents: Vec<&str> = h.manager.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["old question", "old answer"]);

        h.push(session, first, " late").await;
        h.complete(session, first).await;
        assert_eq!(h.manager.messages().len(), 2);
        assert!(h.manager.live_view().is_none());
        assert_eq!(h.repository.assistant_messages(first), 0);
    }

    #[tokio::test]
    async fn test_switch_while_committing_keeps_answer_out_of_new_chat() {
        let mut h = Harness::new();
        let first = h.open("first").await;
        let other = h.repository.seed_conversation("second");
        h.repository.seed_message(other.id, "old question", None);

        let session = h.send(first, "hello").await;
        h.push(session, first, "answer for first").await;
        h.manager
            .handle_event(EngineEvent::Stream(StreamEvent::complete(session, first)));
        assert_eq!(h.manager.phase(), SessionPhase::Committing);

        h.manager.open_conversation(Some(other.id));
        let snapshot = h.manager.snapshot();
        assert_eq!(snapshot.conversation_id, Some(other.id));
        assert!(snapshot.live.is_none());
        assert!(!snapshot.is_responding);
        assert!(h.manager.live_view().is_none());

        settle(&mut h.manager).await;
        assert_eq!(h.manager.phase(), SessionPhase::Idle);
        let contents: Vec<&str> = h.manager.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["old question"]);
        assert_eq!(h.repository.assistant_messages(first), 1);
        assert_eq!(h.repository.assistant_messages(other.id), 0);
    }

    #[tokio::test]
    async fn test_failed_user_save_drops_placeholder() {
        let mut h = Harness::new();
        let chat = h.open("chat").await;
        h.repository.fail_user_persist(true);
        h.manager.start("lost".into(), None, chat).unwrap();
        assert_eq!(h.manager.messages().len(), 1);

        settle(&mut h.manager).await;
        assert_eq!(h.manager.phase(), SessionPhase::Idle);
        assert!(h.manager.messages().is_empty());
        assert!(h.generator.requests().is_empty());
        assert!(h.sink.notices().iter().any(|n| matches!(n.error, ChatError::PersistenceFailure(_))));

        h.repository.fail_user_persist(false);
        h.send(chat, "again").await;
        let messages = h.manager.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "again");
        assert!(!messages[0].id.is_pending());
    }

    #[tokio::test]
    async fn test_failed_user_save_after_cancel_drops_placeholder() {
        let mut h = Harness::new();
        let chat = h.open("chat").await;
        h.repository.fail_user_persist(true);
        h.manager.start("lost".into(), None, chat).unwrap();
        h.manager.cancel();

        settle(&mut h.manager).await;
        assert!(h.manager.messages().is_empty());
        assert!(h.generator.requests().is_empty());
    }

    #[tokio::test]
    async fn test_reopening_same_conversation_is_noop() {
        let mut h = Harness::new();
        let chat = h.open("chat").await;
        let session = h.send(chat, "hello").await;

        assert!(!h.manager.open_conversation(Some(chat)));
        assert_eq!(h.manager.phase(), SessionPhase::Streaming);
        h.push(session, chat, "still here").await;
        assert_eq!(h.manager.live_view().unwrap().answer_text, "still here");
    }

    #[tokio::test]
    async fn test_history_for_abandoned_switch_is_ignored() {
        let mut h = Harness::new();
        let a = h.repository.seed_conversation("a");
        let b = h.repository.seed_conversation("b");
        h.repository.seed_message(a.id, "from a", None);

        h.manager.open_conversation(Some(a.id));
        h.manager.open_conversation(Some(b.id));
        settle(&mut h.manager).await;

        assert_eq!(h.manager.active_conversation(), Some(b.id));
        assert!(h.manager.messages().is_empty());
    }

    #[tokio::test]
    async fn test_commit_failure_discards_answer() {
        let mut h = Harness::new();
        let chat = h.open("chat").await;
        let session = h.send(chat, "hello").await;
        h.push(session, chat, "answer").await;

        h.repository.fail_assistant_persist(true);
        h.complete(session, chat).await;

        assert_eq!(h.manager.phase(), SessionPhase::Idle);
        assert_eq!(h.manager.messages().len(), 1);
        assert!(h.manager.live_view().is_none());
        assert!(h.sink.notices().iter().any(|n| matches!(n.error, ChatError::PersistenceFailure(_))));
    }

    #[tokio::test]
    async fn test_backend_unavailable_leaves_user_message() {
        let mut h = Harness::new();
        let chat = h.open("chat").await;
        h.generator.fail_requests(true);
        h.send(chat, "hello").await;

        assert_eq!(h.manager.phase(), SessionPhase::Idle);
        assert_eq!(h.manager.messages().len(), 1);
        assert!(h.sink.notices().iter().any(|n| matches!(n.error, ChatError::BackendUnavailable(_))));

        h.generator.fail_requests(false);
        assert!(h.manager.start("retry".into(), None, chat).is_ok());
    }

    #[tokio::test]
    async fn test_stream_failure_discards_text() {
        let mut h = Harness::new();
        let chat = h.open("chat").await;
        let session = h.send(chat, "hello").await;
        h.push(session, chat, "half an ans").await;

        h.generator
            .push(StreamEvent::failed(session, chat, "connection reset"));
        settle(&mut h.manager).await;

        assert_eq!(h.manager.phase(), SessionPhase::Idle);
        assert_eq!(h.manager.messages().len(), 1);
        assert_eq!(h.repository.assistant_messages(chat), 0);
    }

    #[tokio::test]
    async fn test_author_model_is_captured_at_start() {
        let mut h = Harness::new();
        let chat = h.open("chat").await;
        let session = h.send(chat, "hello").await;
        h.manager.select_model(Some("mistral".into()));
        h.push(session, chat, "hi").await;
        h.complete(session, chat).await;

        assert_eq!(h.generator.requests()[0].model, "llama3");
        assert_eq!(h.manager.messages()[1].author_model.as_deref(), Some("llama3"));
        assert_eq!(h.manager.selected_model(), Some("mistral"));
    }

    #[tokio::test]
    async fn test_start_validation() {
        let mut h = Harness::new();
        assert_eq!(
            h.manager.start("hi".into(), None, 1),
            Err(ChatError::NoActiveConversation)
        );

        let chat = h.open("chat").await;
        assert_eq!(
            h.manager.start("   ".into(), None, chat),
            Err(ChatError::EmptyPrompt)
        );
        assert_eq!(
            h.manager.start("hi".into(), None, chat + 100),
            Err(ChatError::ConversationNotActive(chat + 100))
        );

        h.manager.select_model(None);
        assert_eq!(
            h.manager.start("hi".into(), None, chat),
            Err(ChatError::NoModelSelected)
        );
        assert!(h.manager.messages().is_empty());
    }

    #[tokio::test]
    async fn test_send_from_landing_replays_once() {
        let mut h = Harness::new();
        h.manager
            .send_from_landing("What is Rust?".into(), None)
            .unwrap();
        settle(&mut h.manager).await;

        let chat = h.manager.active_conversation().unwrap();
        assert_eq!(h.repository.conversation_name(chat).as_deref(), Some("What is Rust?"));
        assert_eq!(h.generator.requests().len(), 1);
        assert_eq!(h.manager.messages().len(), 1);
        assert_eq!(h.manager.messages()[0].content, "What is Rust?");

        assert!(!h.manager.open_conversation(Some(chat)));
        settle(&mut h.manager).await;
        assert_eq!(h.generator.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_message_truncates() {
        let mut h = Harness::new();
        let chat = h.repository.seed_conversation("chat");
        h.repository.seed_message(chat.id, "one", None);
        let two = h.repository.seed_message(chat.id, "two", Some("llama3"));
        h.repository.seed_message(chat.id, "three", None);
        h.manager.open_conversation(Some(chat.id));
        settle(&mut h.manager).await;

        h.manager.delete_message(two.id).unwrap();
        settle(&mut h.manager).await;
        let contents: Vec<&str> = h.manager.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one"]);
    }

    #[tokio::test]
    async fn test_delete_message_rejected_while_generating() {
        let mut h = Harness::new();
        let chat = h.open("chat").await;
        h.send(chat, "hello").await;
        let id = h.manager.messages()[0].id;
        assert_eq!(h.manager.delete_message(id), Err(ChatError::AlreadyActive));

        h.manager.cancel();
        assert_eq!(
            h.manager.delete_message(MessageId::Pending(42)),
            Err(ChatError::MessageNotCommitted)
        );
    }

    #[tokio::test]
    async fn test_deleting_open_conversation_closes_it() {
        let mut h = Harness::new();
        let chat = h.open("chat").await;
        h.manager.delete_conversation(chat);
        settle(&mut h.manager).await;

        assert_eq!(h.manager.active_conversation(), None);
        assert!(h.repository.conversation_name(chat).is_none());
    }

    #[tokio::test]
    async fn test_snapshot_reports_responding() {
        let mut h = Harness::new();
        let chat = h.open("chat").await;
        assert!(!h.manager.snapshot().is_responding);

        let session = h.send(chat, "hello").await;
        h.push(session, chat, "<think>hmm").await;
        let snapshot = h.manager.snapshot();
        assert!(snapshot.is_responding);
        assert_eq!(snapshot.author_model.as_deref(), Some("llama3"));
        assert!(snapshot.live.unwrap().is_reasoning);
    }
}
