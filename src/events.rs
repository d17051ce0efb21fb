/// UI events published by the chat engine
///
/// This module defines the event contract between the engine and whatever view
/// renders it (the Tauri webview, the terminal front-end, tests).
/// Events flow in one direction: engine → view.
/// View → engine communication goes through `ChatHandle` commands instead.
use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::generation_session::SessionPhase;
use crate::protocol::{Conversation, ConversationId, Message, SessionId};
use crate::reasoning_parser::SegmentedView;

/// Event names as constants to prevent typos
pub mod event_names {
    /// Live reasoning/answer split of the response being streamed
    pub const STREAM_UPDATE: &str = "stream-update";

    /// The in-flight response was committed, cancelled or discarded
    pub const STREAM_CLEARED: &str = "stream-cleared";

    /// The durable message list of the open conversation changed
    pub const MESSAGES_CHANGED: &str = "messages-changed";

    /// Generation session moved to another phase
    pub const SESSION_STATE: &str = "session-state";

    /// Non-fatal error notice for inline display
    pub const CHAT_NOTICE: &str = "chat-notice";

    /// A different conversation (or none) is now open
    pub const CONVERSATION_CHANGED: &str = "conversation-changed";

    /// A conversation was created or deleted
    pub const CONVERSATIONS_CHANGED: &str = "conversations-changed";
}

/// Payload for stream-update event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamUpdatePayload {
    pub conversation_id: ConversationId,
    pub session_id: SessionId,
    pub view: SegmentedView,
}

/// Payload for stream-cleared event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamClearedPayload {
    pub conversation_id: ConversationId,
    pub session_id: SessionId,
}

/// Payload for messages-changed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesChangedPayload {
    pub conversation_id: Option<ConversationId>,
    pub messages: Vec<Message>,
}

/// Payload for session-state event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatePayload {
    pub phase: SessionPhase,
    pub conversation_id: Option<ConversationId>,
    pub author_model: Option<String>,
}

/// Payload for chat-notice event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoticePayload {
    pub conversation_id: Option<ConversationId>,
    pub error: ChatError,
    pub message: String,
}

/// Payload for conversation-changed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationChangedPayload {
    pub conversation_id: Option<ConversationId>,
}

/// Payload for conversations-changed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationsChangedPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<Conversation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<ConversationId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    StreamUpdate(StreamUpdatePayload),
    StreamCleared(StreamClearedPayload),
    MessagesChanged(MessagesChangedPayload),
    SessionState(SessionStatePayload),
    Notice(NoticePayload),
    ConversationChanged(ConversationChangedPayload),
    ConversationsChanged(ConversationsChangedPayload),
}

impl UiEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UiEvent::StreamUpdate(_) => event_names::STREAM_UPDATE,
            UiEvent::StreamCleared(_) => event_names::STREAM_CLEARED,
            UiEvent::MessagesChanged(_) => event_names::MESSAGES_CHANGED,
            UiEvent::SessionState(_) => event_names::SESSION_STATE,
            UiEvent::Notice(_) => event_names::CHAT_NOTICE,
            UiEvent::ConversationChanged(_) => event_names::CONVERSATION_CHANGED,
            UiEvent::ConversationsChanged(_) => event_names::CONVERSATIONS_CHANGED,
        }
    }

    /// JSON payload as emitted over the wire.
    pub fn payload(&self) -> serde_json::Value {
        let value = match self {
            UiEvent::StreamUpdate(p) => serde_json::to_value(p),
            UiEvent::StreamCleared(p) => serde_json::to_value(p),
            UiEvent::MessagesChanged(p) => serde_json::to_value(p),
            UiEvent::SessionState(p) => serde_json::to_value(p),
            UiEvent::Notice(p) => serde_json::to_value(p),
            UiEvent::ConversationChanged(p) => serde_json::to_value(p),
            UiEvent::ConversationsChanged(p) => serde_json::to_value(p),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

/// Where the engine publishes view updates.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: UiEvent);
}

/// Sink that drops everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: UiEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_update_payload_shape() {
        let session_id = SessionId::new();
        let event = UiEvent::StreamUpdate(StreamUpdatePayload {
            conversation_id: 2,
            session_id,
            view: SegmentedView {
                reasoning_text: "r".into(),
                answer_text: "a".into(),
                is_reasoning: false,
            },
        });

        assert_eq!(event.name(), "stream-update");
        let payload = event.payload();
        assert_eq!(payload["conversation_id"], 2);
        assert_eq!(payload["session_id"], session_id.to_string());
        assert_eq!(payload["view"]["answer_text"], "a");
        assert_eq!(payload["view"]["is_reasoning"], false);
    }

    #[test]
    fn test_notice_payload_carries_error_kind() {
        let event = UiEvent::Notice(NoticePayload {
            conversation_id: Some(1),
            error: ChatError::PersistenceFailure("disk full".into()),
            message: "failed to save message: disk full".into(),
        });
        let payload = event.payload();
        assert_eq!(payload["error"]["kind"], "persistence_failure");
        assert_eq!(payload["error"]["detail"], "disk full");
    }
}
