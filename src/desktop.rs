//! Tauri shell: commands invoked by the webview and the sink that forwards
//! engine events to it.

use std::path::PathBuf;
use std::process::Child;
use std::sync::Arc;

use parking_lot::Mutex;
use tauri::{AppHandle, Emitter, Manager, Runtime, State};
use tracing::{info, warn};

use crate::chat_manager::{ChatManager, ChatSnapshot};
use crate::chat_orchestrator::{start_engine, ChatHandle};
use crate::config::{self, AppConfig};
use crate::conversation_store::ConversationStore;
use crate::events::{EventSink, UiEvent};
use crate::logging::init_tracing;
use crate::models::{ollama, OllamaClient};
use crate::protocol::{Conversation, ConversationId, MessageId, SessionId};

pub struct AppState {
    pub chat: ChatHandle,
    pub config: Mutex<AppConfig>,
    pub config_path: PathBuf,
    pub ollama_server: Mutex<Option<Child>>,
}

/// Emits every engine event on the app handle under its event name.
pub struct TauriSink<R: Runtime> {
    app: AppHandle<R>,
}

impl<R: Runtime> EventSink for TauriSink<R> {
    fn emit(&self, event: UiEvent) {
        if let Err(e) = self.app.emit(event.name(), event.payload()) {
            warn!(event = event.name(), error = %e, "failed to emit event");
        }
    }
}

fn build_state<R: Runtime>(app: &AppHandle<R>) -> Result<AppState, Box<dyn std::error::Error>> {
    let config_path = config::default_config_path();
    let cfg = config::load_effective(&config_path);
    init_tracing(&cfg.log_filter);

    let ollama_server = if cfg.launch_ollama {
        match ollama::launch_server() {
            Ok(child) => Some(child),
            Err(e) => {
                warn!(error = %e, "could not start ollama serve");
                None
            }
        }
    } else {
        None
    };

    let store = Arc::new(ConversationStore::open(cfg.database_path())?);
    let client = Arc::new(OllamaClient::new(cfg.ollama_url.clone(), store.clone())?);
    let sink = Arc::new(TauriSink { app: app.clone() });
    let manager =
        ChatManager::new(client, store, sink).with_selected_model(cfg.selected_model.clone());

    let (chat, engine) = start_engine(manager);
    tauri::async_runtime::spawn(engine);
    info!(url = %cfg.ollama_url, "desktop app ready");

    Ok(AppState {
        chat,
        config: Mutex::new(cfg),
        config_path,
        ollama_server: Mutex::new(ollama_server),
    })
}

#[tauri::command]
async fn get_models(state: State<'_, AppState>) -> Result<Vec<String>, String> {
    state.chat.list_models().await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn get_chats(state: State<'_, AppState>) -> Result<Vec<Conversation>, String> {
    state.chat.list_conversations().await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn create_chat(name: String, state: State<'_, AppState>) -> Result<(), String> {
    state
        .chat
        .create_conversation(name)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
fn delete_chat(chat_id: ConversationId, state: State<'_, AppState>) -> Result<(), String> {
    state
        .chat
        .delete_conversation(chat_id)
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn open_chat(chat_id: ConversationId, state: State<'_, AppState>) -> Result<bool, String> {
    state
        .chat
        .open_conversation(Some(chat_id))
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn close_chat(state: State<'_, AppState>) -> Result<bool, String> {
    state
        .chat
        .open_conversation(None)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn send_message(
    message: String,
    chat_id: ConversationId,
    model: Option<String>,
    state: State<'_, AppState>,
) -> Result<SessionId, String> {
    state
        .chat
        .send_message(message, model, chat_id)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn send_from_landing(
    message: String,
    model: Option<String>,
    state: State<'_, AppState>,
) -> Result<(), String> {
    state
        .chat
        .send_from_landing(message, model)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn cancel_chat_response(state: State<'_, AppState>) -> Result<bool, String> {
    state.chat.cancel().await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn delete_message(msg_id: i64, state: State<'_, AppState>) -> Result<(), String> {
    state
        .chat
        .delete_message(MessageId::Durable(msg_id))
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
fn select_model(model: Option<String>, state: State<'_, AppState>) -> Result<(), String> {
    {
        let mut cfg = state.config.lock();
        cfg.selected_model = model.clone();
        config::save_config(&state.config_path, &cfg)?;
    }
    state.chat.select_model(model).map_err(|e| e.to_string())
}

#[tauri::command]
async fn get_chat_state(state: State<'_, AppState>) -> Result<ChatSnapshot, String> {
    state.chat.snapshot().await.map_err(|e| e.to_string())
}

pub fn run() {
    let app = tauri::Builder::default()
        .plugin(tauri_plugin_opener::init())
        .setup(|app| {
            let state = build_state(app.handle())?;
            app.manage(state);
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            get_models,
            get_chats,
            create_chat,
            delete_chat,
            open_chat,
            close_chat,
            send_message,
            send_from_landing,
            cancel_chat_response,
            delete_message,
            select_model,
            get_chat_state,
        ])
        .build(tauri::generate_context!());

    let app = match app {
        Ok(app) => app,
        Err(e) => {
            eprintln!("error while building tauri application: {e}");
            std::process::exit(1);
        }
    };

    app.run(|handle, event| {
        if let tauri::RunEvent::Exit = event {
            if let Some(state) = handle.try_state::<AppState>() {
                state.chat.shutdown();
                if let Some(mut child) = state.ollama_server.lock().take() {
                    let _ = child.kill();
                }
            }
        }
    });
}
