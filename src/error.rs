//! Error types for the chat engine and its collaborators.

use serde::Serialize;
use thiserror::Error;

use crate::protocol::ConversationId;

/// Failures returned by a backend collaborator (generation or persistence).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The request never reached the backend or the connection broke.
    #[error("request failed: {0}")]
    Request(String),

    /// The backend answered with a non-success status.
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A database error occurred.
    #[error("database error: {0}")]
    Database(String),

    /// The requested record was not found.
    #[error("record not found")]
    NotFound,
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BackendError::Decode(e.to_string())
        } else {
            BackendError::Request(e.to_string())
        }
    }
}

impl From<rusqlite::Error> for BackendError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => BackendError::NotFound,
            other => BackendError::Database(other.to_string()),
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::Decode(e.to_string())
    }
}

/// Errors surfaced to the user by the chat engine. None of them is fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ChatError {
    /// `start` was called while another session is live.
    #[error("a response is already being generated")]
    AlreadyActive,

    /// The generation request failed.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A message could not be saved.
    #[error("failed to save message: {0}")]
    PersistenceFailure(String),

    #[error("please select a model first")]
    NoModelSelected,

    #[error("message is empty")]
    EmptyPrompt,

    #[error("no conversation is open")]
    NoActiveConversation,

    #[error("conversation {0} is not the open conversation")]
    ConversationNotActive(ConversationId),

    /// The message has no repository id yet.
    #[error("message has not been saved yet")]
    MessageNotCommitted,

    #[error("chat engine is not running")]
    EngineStopped,
}
