use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::backend::{GenerationBackend, MessageRepository, StreamSender};
use crate::error::BackendError;
use crate::protocol::{
    AuthorKind, ConversationId, GenerationRequest, Message, SessionId, StreamEvent,
};

const CACHE_TTL: Duration = Duration::from_secs(300);
const MAX_RETRIES: u32 = 2;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModelTag>,
}

#[derive(Deserialize)]
struct OllamaModelTag {
    name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct OllamaMessage {
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

struct ModelCache {
    models: Vec<String>,
    last_fetch: Instant,
}

type StreamTable = Arc<Mutex<HashMap<ConversationId, (SessionId, AbortHandle)>>>;

/// Generation backend talking to a local Ollama server.
///
/// Each accepted request gets a pump task that turns the NDJSON body of
/// `/api/chat` into stream events. Cancelling aborts the pump, which drops
/// the connection and stops the server-side generation.
pub struct OllamaClient {
    base_url: String,
    http: reqwest::Client,
    history: Arc<dyn MessageRepository>,
    streams: StreamTable,
    cache: Mutex<Option<ModelCache>>,
    fetch_lock: tokio::sync::Mutex<()>,
}

impl OllamaClient {
    pub fn new(
        base_url: impl Into<String>,
        history: Arc<dyn MessageRepository>,
    ) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            history,
            streams: Arc::new(Mutex::new(HashMap::new())),
            cache: Mutex::new(None),
            fetch_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check that the server answers.
    pub async fn ping(&self) -> Result<(), BackendError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.http.get(&url).timeout(CONNECT_TIMEOUT).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(BackendError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    fn cached_models(&self, allow_expired: bool) -> Option<Vec<String>> {
        self.cache
            .lock()
            .as_ref()
            .filter(|c| allow_expired || c.last_fetch.elapsed() < CACHE_TTL)
            .map(|c| c.models.clone())
    }

    async fn fetch_models_from_server(&self) -> Result<Vec<String>, BackendError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.http.get(&url).timeout(CONNECT_TIMEOUT).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let tags: OllamaTagsResponse = serde_json::from_str(&text).map_err(|e| {
            warn!(error = %e, preview = %text.chars().take(1000).collect::<String>(), "failed to decode model list");
            BackendError::from(e)
        })?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    fn forget_stream(streams: &StreamTable, conversation_id: ConversationId, session_id: SessionId) {
        let mut streams = streams.lock();
        if streams
            .get(&conversation_id)
            .is_some_and(|(owner, _)| *owner == session_id)
        {
            streams.remove(&conversation_id);
        }
    }
}

#[async_trait]
impl GenerationBackend for OllamaClient {
    async fn request_generation(
        &self,
        request: GenerationRequest,
        events: StreamSender,
    ) -> Result<(), BackendError> {
        let history = self.history.fetch_messages(request.conversation_id).await?;
        let body = OllamaChatRequest {
            model: request.model.clone(),
            messages: build_chat_messages(&history, &request.prompt),
            stream: true,
        };

        let url = format!("{}/api/chat", self.base_url);
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        info!(
            session = %request.session_id,
            conversation = request.conversation_id,
            model = %request.model,
            "ollama accepted generation"
        );

        let session_id = request.session_id;
        let conversation_id = request.conversation_id;
        let streams = self.streams.clone();

        // Held across spawn so the pump cannot deregister before it is registered.
        let mut table = self.streams.lock();
        let pump = tokio::spawn(async move {
            pump_stream(response, session_id, conversation_id, &events).await;
            Self::forget_stream(&streams, conversation_id, session_id);
        });
        if let Some((_, previous)) = table.insert(conversation_id, (session_id, pump.abort_handle())) {
            previous.abort();
        }
        Ok(())
    }

    fn cancel_generation(&self, conversation_id: ConversationId) {
        if let Some((session_id, pump)) = self.streams.lock().remove(&conversation_id) {
            debug!(session = %session_id, conversation = conversation_id, "aborting ollama stream");
            pump.abort();
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        if let Some(models) = self.cached_models(false) {
            return Ok(models);
        }

        let _lock = self.fetch_lock.lock().await;
        if let Some(models) = self.cached_models(false) {
            return Ok(models);
        }

        let mut retry_count = 0;
        let last_error = loop {
            match self.fetch_models_from_server().await {
                Ok(models) => {
                    info!(count = models.len(), url = %self.base_url, "fetched models");
                    *self.cache.lock() = Some(ModelCache {
                        models: models.clone(),
                        last_fetch: Instant::now(),
                    });
                    return Ok(models);
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count > MAX_RETRIES {
                        warn!(url = %self.base_url, retries = MAX_RETRIES, error = %e, "model list unavailable");
                        break e;
                    }
                    let delay = Duration::from_millis(500 * (1 << (retry_count - 1)));
                    debug!(attempt = retry_count, error = %e, ?delay, "retrying model list");
                    tokio::time::sleep(delay).await;
                }
            }
        };

        match self.cached_models(true) {
            Some(models) => {
                warn!("using expired model cache as fallback");
                Ok(models)
            }
            None => Err(last_error),
        }
    }
}

async fn pump_stream(
    response: reqwest::Response,
    session_id: SessionId,
    conversation_id: ConversationId,
    events: &StreamSender,
) {
    let mut body = response.bytes_stream();
    let mut decoder = NdjsonDecoder::default();

    while let Some(chunk) = body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                events.send(StreamEvent::failed(
                    session_id,
                    conversation_id,
                    format!("ollama stream error: {e}"),
                ));
                return;
            }
        };
        for line in decoder.push(&bytes) {
            if apply_line(&line, session_id, conversation_id, events) {
                return;
            }
        }
        if events.is_closed() {
            return;
        }
    }

    if let Some(line) = decoder.finish() {
        if apply_line(&line, session_id, conversation_id, events) {
            return;
        }
    }
    // Body ended without a done marker.
    events.send(StreamEvent::complete(session_id, conversation_id));
}

/// Forward one NDJSON line. Returns true once the stream is over.
fn apply_line(
    line: &str,
    session_id: SessionId,
    conversation_id: ConversationId,
    events: &StreamSender,
) -> bool {
    let parsed: OllamaChatChunk = match serde_json::from_str(line) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(error = %e, "failed to parse ollama chunk");
            return false;
        }
    };

    if let Some(error) = parsed.error {
        events.send(StreamEvent::failed(
            session_id,
            conversation_id,
            format!("ollama error: {error}"),
        ));
        return true;
    }
    if let Some(message) = parsed.message {
        if !message.content.is_empty() {
            events.send(StreamEvent::fragment(
                session_id,
                conversation_id,
                message.content,
            ));
        }
    }
    if parsed.done.unwrap_or(false) {
        events.send(StreamEvent::complete(session_id, conversation_id));
        return true;
    }
    false
}

/// Splits a byte stream into lines without breaking multi-byte characters
/// that straddle chunk boundaries.
#[derive(Default)]
pub struct NdjsonDecoder {
    pending: Vec<u8>,
}

impl NdjsonDecoder {
    /// Feed bytes; returns every complete, non-blank line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(idx) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=idx).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Whatever is left once the body ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

/// Rebuild the model-side chat history from stored messages.
///
/// The prompt is appended unless the history already ends with it.
fn build_chat_messages(history: &[Message], prompt: &str) -> Vec<OllamaMessage> {
    let mut messages: Vec<OllamaMessage> = history
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| OllamaMessage {
            role: m.author_kind.as_str().to_string(),
            content: m.content.clone(),
        })
        .collect();

    let ends_with_prompt = messages
        .last()
        .is_some_and(|m| m.role == AuthorKind::User.as_str() && m.content == prompt);
    if !ends_with_prompt {
        messages.push(OllamaMessage {
            role: AuthorKind::User.as_str().to_string(),
            content: prompt.to_string(),
        });
    }
    messages
}

/// Start `ollama serve` in the background. A server that is already running
/// makes the new process exit on its own.
pub fn launch_server() -> std::io::Result<Child> {
    info!("launching ollama serve");
    Command::new("ollama")
        .arg("serve")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
}
