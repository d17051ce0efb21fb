//! Generation session state machine.
//!
//! Tracks one request-to-completion lifecycle. The machine itself performs
//! no I/O: every method is a transition that either applies (and tells the
//! caller what to do next) or is refused because the event does not belong
//! to the live session. The `ChatManager` owns the only instance.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ChatError;
use crate::protocol::{ConversationId, MessageId, SessionId};
use crate::reasoning_parser::{SegmentedView, Segmenter};
use crate::stream_buffer::StreamBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    AwaitingStart,
    Streaming,
    Committing,
    Cancelled,
}

/// What a live session was launched for.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSession {
    pub id: SessionId,
    pub conversation_id: ConversationId,
    /// Captured at start; later model selection changes do not affect it.
    pub author_model: String,
    pub prompt: String,
    /// The user message this session answers.
    pub user_message: MessageId,
}

/// Final answer ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRequest {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub author_model: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    /// Session is now `Committing`; persist this.
    Commit(CommitRequest),
    /// Nothing to commit; session went straight back to `Idle`.
    Empty(ActiveSession),
}

pub struct GenerationSession {
    phase: SessionPhase,
    active: Option<ActiveSession>,
    buffer: StreamBuffer,
}

impl Default for GenerationSession {
    fn default() -> Self {
        Self::new(Segmenter::new())
    }
}

impl GenerationSession {
    pub fn new(segmenter: Segmenter) -> Self {
        Self {
            phase: SessionPhase::Idle,
            active: None,
            buffer: StreamBuffer::new(segmenter),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.phase == SessionPhase::Idle
    }

    /// Live view of the in-flight text, if any. A detached session has none.
    pub fn live_view(&self) -> Option<SegmentedView> {
        match self.phase {
            SessionPhase::Streaming | SessionPhase::Committing
                if self.buffer.conversation_id().is_some() =>
            {
                Some(self.buffer.view())
            }
            _ => None,
        }
    }

    pub fn buffer(&self) -> &StreamBuffer {
        &self.buffer
    }

    /// Idle → AwaitingStart. Refused without side effects otherwise.
    pub fn begin(
        &mut self,
        conversation_id: ConversationId,
        prompt: String,
        author_model: String,
        user_message: MessageId,
    ) -> Result<ActiveSession, ChatError> {
        if self.phase != SessionPhase::Idle {
            return Err(ChatError::AlreadyActive);
        }

        let session = ActiveSession {
            id: SessionId::new(),
            conversation_id,
            author_model,
            prompt,
            user_message,
        };
        self.buffer.reset(Some(conversation_id));
        self.active = Some(session.clone());
        self.transition(SessionPhase::AwaitingStart);
        Ok(session)
    }

    /// Record the repository id of the user message once it is saved.
    pub fn confirm_user_message(&mut self, session_id: SessionId, id: MessageId) {
        if let Some(active) = self.active.as_mut().filter(|a| a.id == session_id) {
            active.user_message = id;
        }
    }

    /// Backend acknowledged the generate call.
    pub fn acknowledge(&mut self, session_id: SessionId) -> bool {
        if !self.owns(session_id) {
            return false;
        }
        match self.phase {
            SessionPhase::AwaitingStart => {
                self.transition(SessionPhase::Streaming);
                true
            }
            SessionPhase::Streaming => true,
            _ => false,
        }
    }

    /// The generate call failed before any stream started.
    pub fn fail_start(&mut self, session_id: SessionId) -> Option<ActiveSession> {
        if !self.owns(session_id) || self.phase != SessionPhase::AwaitingStart {
            return None;
        }
        self.finish()
    }

    /// Append a pushed fragment. Returns the new view, or `None` when the
    /// fragment does not belong to the live session.
    pub fn accept_fragment(
        &mut self,
        session_id: SessionId,
        conversation_id: ConversationId,
        chunk: &str,
    ) -> Option<SegmentedView> {
        if !self.owns(session_id) || self.buffer.conversation_id() != Some(conversation_id) {
            return None;
        }
        match self.phase {
            SessionPhase::AwaitingStart => self.transition(SessionPhase::Streaming),
            SessionPhase::Streaming => {}
            _ => return None,
        }
        Some(self.buffer.append(chunk))
    }

    /// The backend signalled the end of the stream.
    pub fn end_stream(&mut self, session_id: SessionId) -> Option<StreamEnd> {
        if !self.owns(session_id)
            || !matches!(
                self.phase,
                SessionPhase::AwaitingStart | SessionPhase::Streaming
            )
        {
            return None;
        }

        let content = self.buffer.view().committed_answer();
        let active = self.active.clone()?;
        if content.trim().is_empty() {
            return self.finish().map(StreamEnd::Empty);
        }

        self.transition(SessionPhase::Committing);
        Some(StreamEnd::Commit(CommitRequest {
            session_id,
            conversation_id: active.conversation_id,
            content,
            author_model: active.author_model,
        }))
    }

    /// The stream broke mid-way; in-flight text is discarded.
    pub fn fail_stream(&mut self, session_id: SessionId) -> Option<ActiveSession> {
        if !self.owns(session_id)
            || !matches!(
                self.phase,
                SessionPhase::AwaitingStart | SessionPhase::Streaming
            )
        {
            return None;
        }
        self.finish()
    }

    /// Persistence of the final message resolved, successfully or not.
    pub fn finish_commit(&mut self, session_id: SessionId) -> Option<ActiveSession> {
        if !self.owns(session_id) || self.phase != SessionPhase::Committing {
            return None;
        }
        self.finish()
    }

    /// AwaitingStart/Streaming → Cancelled → Idle. Any other phase is a no-op.
    pub fn cancel(&mut self) -> Option<ActiveSession> {
        if !matches!(
            self.phase,
            SessionPhase::AwaitingStart | SessionPhase::Streaming
        ) {
            return None;
        }
        self.transition(SessionPhase::Cancelled);
        self.finish()
    }

    /// Unbind a committing session from its conversation's view.
    ///
    /// The save already holds the final text, so only the buffer is dropped;
    /// the session stays `Committing` until `finish_commit`.
    pub fn detach(&mut self) -> Option<ActiveSession> {
        if self.phase != SessionPhase::Committing || self.buffer.conversation_id().is_none() {
            return None;
        }
        debug!(session = ?self.active.as_ref().map(|a| a.id), "committing session detached");
        self.buffer.reset(None);
        self.active.clone()
    }

    fn owns(&self, session_id: SessionId) -> bool {
        self.active.as_ref().map(|a| a.id) == Some(session_id)
    }

    fn finish(&mut self) -> Option<ActiveSession> {
        self.buffer.reset(None);
        self.transition(SessionPhase::Idle);
        self.active.take()
    }

    fn transition(&mut self, next: SessionPhase) {
        debug!(
            session = ?self.active.as_ref().map(|a| a.id),
            from = ?self.phase,
            to = ?next,
            "session transition"
        );
        self.phase = next;
    }
}
