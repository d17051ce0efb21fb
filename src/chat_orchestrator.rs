//! Runs a `ChatManager` on its own task and exposes it through a cloneable
//! handle. Commands and engine events are interleaved by one select loop, so
//! the manager never needs a lock.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::backend::{GenerationBackend, MessageRepository};
use crate::chat_manager::{ChatManager, ChatSnapshot};
use crate::error::ChatError;
use crate::protocol::{Conversation, ConversationId, MessageId, SessionId};

type Reply<T> = oneshot::Sender<T>;

enum Command {
    SendMessage {
        prompt: String,
        model: Option<String>,
        conversation_id: ConversationId,
        reply: Reply<Result<SessionId, ChatError>>,
    },
    SendFromLanding {
        prompt: String,
        model: Option<String>,
        reply: Reply<Result<(), ChatError>>,
    },
    Cancel {
        reply: Reply<bool>,
    },
    OpenConversation {
        conversation_id: Option<ConversationId>,
        reply: Reply<bool>,
    },
    CreateConversation {
        name: String,
        reply: Reply<Result<(), ChatError>>,
    },
    DeleteConversation {
        conversation_id: ConversationId,
    },
    DeleteMessage {
        message_id: MessageId,
        reply: Reply<Result<(), ChatError>>,
    },
    SelectModel {
        model: Option<String>,
    },
    Snapshot {
        reply: Reply<ChatSnapshot>,
    },
    Shutdown,
}

/// Cheap to clone; every clone talks to the same engine task.
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::UnboundedSender<Command>,
    generator: Arc<dyn GenerationBackend>,
    repository: Arc<dyn MessageRepository>,
}

/// Build the handle and the engine loop. The caller decides where the loop
/// runs (`tokio::spawn`, the Tauri async runtime, a test).
pub fn start_engine(manager: ChatManager) -> (ChatHandle, impl Future<Output = ()> + Send) {
    let (commands, rx) = mpsc::unbounded_channel();
    let handle = ChatHandle {
        commands,
        generator: manager.generator(),
        repository: manager.repository(),
    };
    (handle, run(manager, rx))
}

async fn run(mut manager: ChatManager, mut commands: mpsc::UnboundedReceiver<Command>) {
    info!("chat engine started");
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => apply(&mut manager, command),
            },
            Some(event) = manager.next_event() => {
                manager.handle_event(event);
            }
        }
    }
    manager.cancel();
    info!("chat engine stopped");
}

fn apply(manager: &mut ChatManager, command: Command) {
    match command {
        Command::SendMessage {
            prompt,
            model,
            conversation_id,
            reply,
        } => {
            let _ = reply.send(manager.start(prompt, model, conversation_id));
        }
        Command::SendFromLanding {
            prompt,
            model,
            reply,
        } => {
            let _ = reply.send(manager.send_from_landing(prompt, model));
        }
        Command::Cancel { reply } => {
            let _ = reply.send(manager.cancel());
        }
        Command::OpenConversation {
            conversation_id,
            reply,
        } => {
            let _ = reply.send(manager.open_conversation(conversation_id));
        }
        Command::CreateConversation { name, reply } => {
            let _ = reply.send(manager.create_conversation(name));
        }
        Command::DeleteConversation { conversation_id } => {
            manager.delete_conversation(conversation_id);
        }
        Command::DeleteMessage { message_id, reply } => {
            let _ = reply.send(manager.delete_message(message_id));
        }
        Command::SelectModel { model } => {
            debug!(?model, "model selected");
            manager.select_model(model);
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(manager.snapshot());
        }
        Command::Shutdown => {}
    }
}

impl ChatHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| ChatError::EngineStopped)?;
        rx.await.map_err(|_| ChatError::EngineStopped)
    }

    fn post(&self, command: Command) -> Result<(), ChatError> {
        self.commands
            .send(command)
            .map_err(|_| ChatError::EngineStopped)
    }

    pub async fn send_message(
        &self,
        prompt: String,
        model: Option<String>,
        conversation_id: ConversationId,
    ) -> Result<SessionId, ChatError> {
        self.request(|reply| Command::SendMessage {
            prompt,
            model,
            conversation_id,
            reply,
        })
        .await?
    }

    pub async fn send_from_landing(
        &self,
        prompt: String,
        model: Option<String>,
    ) -> Result<(), ChatError> {
        self.request(|reply| Command::SendFromLanding {
            prompt,
            model,
            reply,
        })
        .await?
    }

    /// Returns whether a live session was cancelled.
    pub async fn cancel(&self) -> Result<bool, ChatError> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    pub async fn open_conversation(
        &self,
        conversation_id: Option<ConversationId>,
    ) -> Result<bool, ChatError> {
        self.request(|reply| Command::OpenConversation {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn create_conversation(&self, name: String) -> Result<(), ChatError> {
        self.request(|reply| Command::CreateConversation { name, reply })
            .await?
    }

    pub fn delete_conversation(&self, conversation_id: ConversationId) -> Result<(), ChatError> {
        self.post(Command::DeleteConversation { conversation_id })
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<(), ChatError> {
        self.request(|reply| Command::DeleteMessage { message_id, reply })
            .await?
    }

    pub fn select_model(&self, model: Option<String>) -> Result<(), ChatError> {
        self.post(Command::SelectModel { model })
    }

    pub async fn snapshot(&self) -> Result<ChatSnapshot, ChatError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub async fn list_models(&self) -> Result<Vec<String>, ChatError> {
        self.generator
            .list_models()
            .await
            .map_err(|e| ChatError::BackendUnavailable(e.to_string()))
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        self.repository
            .list_conversations()
            .await
            .map_err(|e| ChatError::PersistenceFailure(e.to_string()))
    }
}
