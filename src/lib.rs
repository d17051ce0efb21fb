pub mod backend;
pub mod chat_manager;
pub mod chat_orchestrator;
pub mod cli;
pub mod config;
pub mod context_switch;
pub mod conversation_store;
#[cfg(feature = "desktop")]
pub mod desktop;
pub mod error;
pub mod events;
pub mod generation_session;
pub mod logging;
pub mod message_store;
pub mod models;
pub mod protocol;
pub mod reasoning_parser;
pub mod stream_buffer;

#[cfg(test)]
mod test_support;

pub use chat_manager::{ChatManager, ChatSnapshot, EngineEvent, EventOutcome};
pub use chat_orchestrator::{start_engine, ChatHandle};
pub use error::{BackendError, ChatError};
