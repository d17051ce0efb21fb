use std::path::PathBuf;
use std::process::Child;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use offline_ai_lib::chat_manager::ChatManager;
use offline_ai_lib::chat_orchestrator::{start_engine, ChatHandle};
use offline_ai_lib::cli::{parse_line, ReplCommand, TerminalSink, HELP};
use offline_ai_lib::config::{self, AppConfig};
use offline_ai_lib::conversation_store::ConversationStore;
use offline_ai_lib::error::ChatError;
use offline_ai_lib::logging::init_tracing;
use offline_ai_lib::models::{ollama, OllamaClient};
use offline_ai_lib::protocol::AuthorKind;

/// Chat with a local Ollama model from the terminal.
#[derive(Parser, Debug)]
#[command(name = "offline-ai", version, about)]
struct Args {
    /// Ollama server URL
    #[arg(long)]
    ollama_url: Option<String>,

    /// Model to answer with
    #[arg(short, long)]
    model: Option<String>,

    /// Chat to open on start
    #[arg(short, long)]
    chat: Option<i64>,

    /// History database file
    #[arg(long)]
    db: Option<PathBuf>,

    /// Config file (defaults to the per-user location)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print installed models and exit
    #[arg(long)]
    list_models: bool,

    /// Print chats and exit
    #[arg(long)]
    list_chats: bool,

    /// Do not start `ollama serve`
    #[arg(long)]
    no_launch: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let mut cfg = config::load_effective(&config_path);
    apply_args(&mut cfg, &args);

    let filter = if args.debug {
        "offline_ai_lib=debug,offline_ai=debug,info"
    } else {
        cfg.log_filter.as_str()
    };
    init_tracing(filter);

    let store = Arc::new(ConversationStore::open(cfg.database_path())?);
    let client = Arc::new(OllamaClient::new(cfg.ollama_url.clone(), store.clone())?);
    let server = ensure_server(&client, cfg.launch_ollama).await;

    let manager = ChatManager::new(client, store, Arc::new(TerminalSink::new()))
        .with_selected_model(cfg.selected_model.clone());
    let (handle, engine) = start_engine(manager);
    let engine = tokio::spawn(engine);

    let result: Result<(), Box<dyn std::error::Error>> = if args.list_models {
        print_models(&handle).await.map_err(Into::into)
    } else if args.list_chats {
        print_chats(&handle).await.map_err(Into::into)
    } else {
        repl(&handle, args.chat, &config_path, &mut cfg).await
    };

    handle.shutdown();
    let _ = engine.await;
    if let Some(mut server) = server {
        let _ = server.kill();
    }
    result
}

fn apply_args(cfg: &mut AppConfig, args: &Args) {
    if let Some(url) = &args.ollama_url {
        cfg.ollama_url = url.clone();
    }
    if let Some(model) = &args.model {
        cfg.selected_model = Some(model.clone());
    }
    if let Some(db) = &args.db {
        cfg.database_path = Some(db.clone());
    }
    if args.no_launch {
        cfg.launch_ollama = false;
    }
}

/// Start `ollama serve` when nothing answers. Returns the child we spawned.
async fn ensure_server(client: &OllamaClient, launch: bool) -> Option<Child> {
    if client.ping().await.is_ok() || !launch {
        return None;
    }
    match ollama::launch_server() {
        Ok(child) => {
            info!(url = client.base_url(), "started ollama serve");
            Some(child)
        }
        Err(e) => {
            warn!(error = %e, "could not start ollama serve");
            None
        }
    }
}

async fn print_models(handle: &ChatHandle) -> Result<(), ChatError> {
    for model in handle.list_models().await? {
        println!("{model}");
    }
    Ok(())
}

async fn print_chats(handle: &ChatHandle) -> Result<(), ChatError> {
    for chat in handle.list_conversations().await? {
        println!(
            "{:>5}  {}  {}",
            chat.id,
            chat.created_at.format("%Y-%m-%d %H:%M"),
            chat.display_name
        );
    }
    Ok(())
}

async fn print_history(handle: &ChatHandle) -> Result<(), ChatError> {
    let snapshot = handle.snapshot().await?;
    if snapshot.conversation_id.is_none() {
        println!("no chat open");
    }
    for message in snapshot.messages {
        let author = match message.author_kind {
            AuthorKind::User => "you".to_string(),
            AuthorKind::Assistant => message.author_model.unwrap_or_else(|| "assistant".into()),
        };
        let id = message.id.durable().map_or_else(|| "...".to_string(), |id| id.to_string());
        println!("[{id}] {author}: {}", message.content);
    }
    Ok(())
}

async fn repl(
    handle: &ChatHandle,
    chat: Option<i64>,
    config_path: &std::path::Path,
    cfg: &mut AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(chat) = chat {
        handle.open_conversation(Some(chat)).await?;
    }
    println!("type /help for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                if !handle.cancel().await? {
                    break;
                }
                println!("(cancelled)");
                continue;
            }
        };
        let Some(line) = line else {
            break;
        };

        let outcome = match parse_line(&line) {
            ReplCommand::Empty => Ok(()),
            ReplCommand::Quit => break,
            ReplCommand::Help => {
                println!("{HELP}");
                Ok(())
            }
            ReplCommand::Invalid(reason) => {
                println!("! {reason}");
                Ok(())
            }
            ReplCommand::Send(prompt) => match handle.snapshot().await?.conversation_id {
                Some(id) => handle.send_message(prompt, None, id).await.map(|_| ()),
                None => handle.send_from_landing(prompt, None).await,
            },
            ReplCommand::Cancel => handle.cancel().await.map(|cancelled| {
                if cancelled {
                    println!("(cancelled)");
                }
            }),
            ReplCommand::Model(model) => {
                cfg.selected_model = model.clone();
                if let Err(e) = config::save_config(config_path, cfg) {
                    warn!(error = %e, "failed to save config");
                }
                handle.select_model(model)
            }
            ReplCommand::Models => print_models(handle).await,
            ReplCommand::Chats => print_chats(handle).await,
            ReplCommand::Open(id) => handle.open_conversation(Some(id)).await.map(|_| ()),
            ReplCommand::Close => handle.open_conversation(None).await.map(|_| ()),
            ReplCommand::New(name) => handle.create_conversation(name).await,
            ReplCommand::DeleteChat(id) => handle.delete_conversation(id),
            ReplCommand::DeleteMessage(id) => handle.delete_message(id).await,
            ReplCommand::History => print_history(handle).await,
        };
        if let Err(e) = outcome {
            println!("! {e}");
        }
    }
    Ok(())
}
