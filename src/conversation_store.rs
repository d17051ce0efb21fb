use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::backend::MessageRepository;
use crate::error::BackendError;
use crate::protocol::{AuthorKind, Conversation, ConversationId, Message, MessageId};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS chats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        chat_id INTEGER NOT NULL,
        author_model TEXT,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY (chat_id) REFERENCES chats(id)
    );

    CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, id);
";

/// SQLite-backed conversation and message history.
///
/// A message with an `author_model` is an assistant message; user messages
/// leave it NULL. Ids grow monotonically, so id order is conversation order.
///
/// Clones share one connection. The async repository methods run each query
/// on the blocking pool.
#[derive(Clone)]
pub struct ConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl ConversationStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!(path = %path.display(), "opening history database");
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, BackendError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, BackendError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&ConversationStore) -> Result<T, BackendError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || work(&store))
            .await
            .map_err(|e| BackendError::Database(format!("database task failed: {e}")))?
    }

    pub fn create_chat(&self, name: &str) -> Result<Conversation, BackendError> {
        let conn = self.conn.lock();
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO chats (name, created_at) VALUES (?1, ?2)",
            params![name, created_at],
        )?;
        Ok(Conversation {
            id: conn.last_insert_rowid(),
            display_name: name.to_string(),
            created_at,
        })
    }

    /// All chats, newest first.
    pub fn chats(&self) -> Result<Vec<Conversation>, BackendError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, created_at FROM chats ORDER BY id DESC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Conversation {
                id: row.get(0)?,
                display_name: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Remove a chat together with its messages.
    pub fn delete_chat(&self, chat_id: ConversationId) -> Result<(), BackendError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE chat_id = ?1", params![chat_id])?;
        let removed = tx.execute("DELETE FROM chats WHERE id = ?1", params![chat_id])?;
        tx.commit()?;
        if removed == 0 {
            return Err(BackendError::NotFound);
        }
        Ok(())
    }

    pub fn insert_message(
        &self,
        chat_id: ConversationId,
        content: &str,
        author_model: Option<&str>,
    ) -> Result<Message, BackendError> {
        let conn = self.conn.lock();
        let exists = conn
            .query_row("SELECT 1 FROM chats WHERE id = ?1", params![chat_id], |_| Ok(()))
            .optional()?;
        if exists.is_none() {
            return Err(BackendError::NotFound);
        }

        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO messages (chat_id, author_model, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![chat_id, author_model, content, created_at],
        )?;
        let id = conn.last_insert_rowid();
        Ok(message_from_parts(
            id,
            chat_id,
            author_model.map(str::to_string),
            content.to_string(),
            created_at,
        ))
    }

    /// Ordered history of a chat.
    pub fn messages(&self, chat_id: ConversationId) -> Result<Vec<Message>, BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, author_model, content, created_at FROM messages
             WHERE chat_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![chat_id], message_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete `message_id` and everything after it in the chat.
    pub fn truncate_from(
        &self,
        chat_id: ConversationId,
        message_id: i64,
    ) -> Result<usize, BackendError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM messages WHERE chat_id = ?1 AND id >= ?2",
            params![chat_id, message_id],
        )?;
        debug!(chat = chat_id, from = message_id, removed, "truncated chat");
        Ok(removed)
    }
}

fn message_from_parts(
    id: i64,
    conversation_id: ConversationId,
    author_model: Option<String>,
    content: String,
    created_at: DateTime<Utc>,
) -> Message {
    let author_kind = if author_model.is_some() {
        AuthorKind::Assistant
    } else {
        AuthorKind::User
    };
    Message {
        id: MessageId::Durable(id),
        conversation_id,
        author_kind,
        author_model,
        content,
        created_at,
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(message_from_parts(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

#[async_trait]
impl MessageRepository for ConversationStore {
    async fn persist_message(
        &self,
        conversation_id: ConversationId,
        content: String,
        author_model: Option<String>,
    ) -> Result<Message, BackendError> {
        self.blocking(move |store| {
            store.insert_message(conversation_id, &content, author_model.as_deref())
        })
        .await
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, BackendError> {
        self.blocking(move |store| store.messages(conversation_id))
            .await
    }

    async fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: i64,
    ) -> Result<Vec<Message>, BackendError> {
        self.blocking(move |store| {
            store.truncate_from(conversation_id, message_id)?;
            store.messages(conversation_id)
        })
        .await
    }

    async fn create_conversation(&self, name: String) -> Result<Conversation, BackendError> {
        self.blocking(move |store| store.create_chat(&name)).await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, BackendError> {
        self.blocking(|store| store.chats()).await
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<(), BackendError> {
        self.blocking(move |store| store.delete_chat(conversation_id))
            .await
    }
}

const TITLE_LIMIT: usize = 50;

/// Generate a chat name from the first user message
pub fn generate_title(first_message: &str) -> String {
    let trimmed = first_message.trim();

    // Handle slash commands
    if let Some(without_slash) = trimmed.strip_prefix('/') {
        let mut chars = without_slash.chars();
        return match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        };
    }

    if trimmed.chars().count() <= TITLE_LIMIT {
        return trimmed.to_string();
    }

    // Truncate at a word boundary, never inside a character
    let truncated: String = trimmed.chars().take(TITLE_LIMIT).collect();
    match truncated.rfind(' ') {
        Some(last_space) if last_space > 0 => format!("{}...", &truncated[..last_space]),
        _ => format!("{}...", truncated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConversationStore {
        ConversationStore::in_memory().unwrap()
    }

    #[test]
    fn test_generate_title_short() {
        assert_eq!(generate_title("Hello world"), "Hello world");
    }

    #[test]
    fn test_generate_title_long() {
        let long =
            "This is a very long message that exceeds fifty characters and should be truncated";
        let title = generate_title(long);
        assert!(title.len() <= 53); // 50 + "..."
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_generate_title_slash_command() {
        assert_eq!(generate_title("/fix the bug"), "Fix the bug");
        assert_eq!(generate_title("/help"), "Help");
    }

    #[test]
    fn test_generate_title_multibyte() {
        let title = generate_title(&"é".repeat(80));
        assert_eq!(title.chars().count(), TITLE_LIMIT + 3);
    }

    #[test]
    fn test_messages_keep_insertion_order() {
        let store = store();
        let chat = store.create_chat("chat").unwrap();
        store.insert_message(chat.id, "question", None).unwrap();
        store.insert_message(chat.id, "answer", Some("llama3")).unwrap();

        let messages = store.messages(chat.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].author_kind, AuthorKind::User);
        assert_eq!(messages[1].author_kind, AuthorKind::Assistant);
        assert_eq!(messages[1].author_model.as_deref(), Some("llama3"));
    }

    #[test]
    fn test_insert_into_missing_chat_fails() {
        let store = store();
        assert!(matches!(
            store.insert_message(99, "orphan", None),
            Err(BackendError::NotFound)
        ));
    }

    #[test]
    fn test_truncate_removes_message_and_later() {
        let store = store();
        let chat = store.create_chat("chat").unwrap();
        let other = store.create_chat("other").unwrap();
        store.insert_message(chat.id, "one", None).unwrap();
        let two = store.insert_message(chat.id, "two", Some("m")).unwrap();
        store.insert_message(other.id, "elsewhere", None).unwrap();
        store.insert_message(chat.id, "three", None).unwrap();

        let removed = store.truncate_from(chat.id, two.id.durable().unwrap()).unwrap();
        assert_eq!(removed, 2);
        let left: Vec<String> = store.messages(chat.id).unwrap().into_iter().map(|m| m.content).collect();
        assert_eq!(left, vec!["one"]);
        assert_eq!(store.messages(other.id).unwrap().len(), 1);
    }

    #[test]
    fn test_chats_newest_first_and_delete() {
        let store = store();
        let first = store.create_chat("first").unwrap();
        let second = store.create_chat("second").unwrap();
        store.insert_message(first.id, "hi", None).unwrap();

        let names: Vec<String> = store.chats().unwrap().into_iter().map(|c| c.display_name).collect();
        assert_eq!(names, vec!["second", "first"]);

        store.delete_chat(first.id).unwrap();
        assert!(store.messages(first.id).unwrap().is_empty());
        assert_eq!(store.chats().unwrap()[0].id, second.id);
        assert!(matches!(store.delete_chat(first.id), Err(BackendError::NotFound)));
    }

    #[tokio::test]
    async fn test_repository_calls_share_one_connection() {
        let store = store();
        let repository: Arc<dyn MessageRepository> = Arc::new(store.clone());

        let chat = repository.create_conversation("chat".into()).await.unwrap();
        repository
            .persist_message(chat.id, "question".into(), None)
            .await
            .unwrap();
        let answer = repository
            .persist_message(chat.id, "answer".into(), Some("llama3".into()))
            .await
            .unwrap();
        assert_eq!(store.messages(chat.id).unwrap().len(), 2);

        let left = repository
            .delete_message(chat.id, answer.id.durable().unwrap())
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert!(matches!(
            repository.persist_message(99, "orphan".into(), None).await,
            Err(BackendError::NotFound)
        ));
    }

    #[test]
    fn test_reopen_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");
        {
            let store = ConversationStore::open(&path).unwrap();
            let chat = store.create_chat("kept").unwrap();
            store.insert_message(chat.id, "persisted", None).unwrap();
        }
        let store = ConversationStore::open(&path).unwrap();
        let chat = &store.chats().unwrap()[0];
        assert_eq!(chat.display_name, "kept");
        assert_eq!(store.messages(chat.id).unwrap()[0].content, "persisted");
    }
}
