use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Row id of a conversation in the message repository.
pub type ConversationId = i64;

/// Identifier of a message as seen by the client.
///
/// `Pending` is a local-only placeholder for a message that was submitted
/// but not yet acknowledged by the repository.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageId {
    Durable(i64),
    Pending(u64),
}

impl MessageId {
    pub fn is_pending(&self) -> bool {
        matches!(self, MessageId::Pending(_))
    }

    pub fn durable(&self) -> Option<i64> {
        match self {
            MessageId::Durable(id) => Some(*id),
            MessageId::Pending(_) => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorKind {
    User,
    Assistant,
}

impl AuthorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorKind::User => "user",
            AuthorKind::Assistant => "assistant",
        }
    }
}

/// A chat message. Immutable once committed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub author_kind: AuthorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_model: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Optimistic user message shown before the repository assigns an id.
    pub fn pending_user(local_id: u64, conversation_id: ConversationId, content: String) -> Self {
        Self {
            id: MessageId::Pending(local_id),
            conversation_id,
            author_kind: AuthorKind::User,
            author_model: None,
            content,
            created_at: Utc::now(),
        }
    }

    pub fn is_user(&self) -> bool {
        self.author_kind == AuthorKind::User
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// Correlation tag for one generation session.
///
/// Every backend call and stream event belonging to a session carries it,
/// so a late resolution for an abandoned session can be recognised.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload of `GenerationBackend::request_generation`.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub prompt: String,
    pub model: String,
}

/// One push from the generation backend.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamEvent {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub kind: StreamEventKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEventKind {
    /// Incremental text chunk, in arrival order.
    Fragment(String),
    /// The backend finished producing this response.
    Complete,
    /// The stream broke after the request was acknowledged.
    Failed(String),
}

impl StreamEvent {
    pub fn fragment(
        session_id: SessionId,
        conversation_id: ConversationId,
        chunk: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            conversation_id,
            kind: StreamEventKind::Fragment(chunk.into()),
        }
    }

    pub fn complete(session_id: SessionId, conversation_id: ConversationId) -> Self {
        Self {
            session_id,
            conversation_id,
            kind: StreamEventKind::Complete,
        }
    }

    pub fn failed(
        session_id: SessionId,
        conversation_id: ConversationId,
        error: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            conversation_id,
            kind: StreamEventKind::Failed(error.into()),
        }
    }
}
