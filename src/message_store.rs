use crate::protocol::{ConversationId, Message, MessageId};

/// Ordered durable messages of the open conversation.
///
/// Insertion order is the repository's order; the store never re-sorts.
/// Mutated only by optimistic append, commit append, delete (full replace
/// with the repository's answer) and conversation switch/fetch.
#[derive(Debug, Default)]
pub struct MessageStore {
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty the list and bind it to another conversation (or none).
    pub fn reset(&mut self, conversation_id: Option<ConversationId>) {
        self.conversation_id = conversation_id;
        self.messages.clear();
    }

    /// Replace with fetched history.
    ///
    /// Messages added locally while the fetch was in flight and missing from
    /// the fetched list are kept after it.
    pub fn replace_all(&mut self, fetched: Vec<Message>) {
        let local: Vec<Message> = self
            .messages
            .drain(..)
            .filter(|m| !fetched.iter().any(|f| f.id == m.id))
            .collect();
        self.messages = fetched;
        self.messages.extend(local);
    }

    /// Replace with the repository's answer to a delete. Placeholders still
    /// waiting for their id are kept at the end.
    pub fn apply_deletion(&mut self, remaining: Vec<Message>) {
        let pending: Vec<Message> = self
            .messages
            .drain(..)
            .filter(|m| m.id.is_pending())
            .collect();
        self.messages = remaining;
        self.messages.extend(pending);
    }

    /// Add the user's message before the repository acknowledges it.
    pub fn push_optimistic(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Swap a pending placeholder for its durable record. Returns false if
    /// the placeholder is no longer present.
    ///
    /// A history fetch may already have delivered the durable record; the
    /// placeholder is then dropped instead.
    pub fn confirm(&mut self, pending: MessageId, durable: Message) -> bool {
        let Some(idx) = self.messages.iter().position(|m| m.id == pending) else {
            return false;
        };
        if self.messages.iter().any(|m| m.id == durable.id) {
            self.messages.remove(idx);
        } else {
            self.messages[idx] = durable;
        }
        true
    }

    /// Drop a placeholder whose save failed. Returns false if it is gone.
    pub fn discard_pending(&mut self, pending: MessageId) -> bool {
        if !pending.is_pending() {
            return false;
        }
        let before = self.messages.len();
        self.messages.retain(|m| m.id != pending);
        self.messages.len() != before
    }

    /// Append a committed assistant message.
    pub fn append_committed(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
