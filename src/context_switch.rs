//! Tracks which conversation is open and scopes push-channel events to it.

use crate::protocol::ConversationId;

/// Subscription of the push-channel listener to one conversation.
///
/// `epoch` changes on every switch, so a fetch that resolves after the user
/// moved on can be recognised even if they came back to the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub conversation_id: ConversationId,
    pub epoch: u64,
}

/// A send typed before its conversation existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub conversation_id: ConversationId,
    pub prompt: String,
    pub model: String,
}

#[derive(Debug, Default)]
pub struct ContextSwitchController {
    active: Option<Subscription>,
    next_epoch: u64,
    history_loaded: bool,
    pending_send: Option<PendingSend>,
}

impl ContextSwitchController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<Subscription> {
        self.active
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.active.map(|s| s.conversation_id)
    }

    /// Whether opening `target` is a change of active conversation.
    pub fn is_change(&self, target: Option<ConversationId>) -> bool {
        self.active_conversation() != target
    }

    /// Re-subscribe to `conversation_id` (or unsubscribe with `None`).
    pub fn activate(&mut self, conversation_id: Option<ConversationId>) -> Option<Subscription> {
        self.history_loaded = false;
        self.active = conversation_id.map(|conversation_id| {
            self.next_epoch += 1;
            Subscription {
                conversation_id,
                epoch: self.next_epoch,
            }
        });
        if self
            .pending_send
            .as_ref()
            .is_some_and(|p| Some(p.conversation_id) != conversation_id)
        {
            self.pending_send = None;
        }
        self.active
    }

    /// Push-channel events are applied only for the subscribed conversation.
    pub fn accepts(&self, conversation_id: ConversationId) -> bool {
        self.active_conversation() == Some(conversation_id)
    }

    /// Whether a resolution tagged with `epoch` still belongs to the open view.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.active.is_some_and(|s| s.epoch == epoch)
    }

    pub fn mark_history_loaded(&mut self, epoch: u64) -> bool {
        if self.is_current(epoch) {
            self.history_loaded = true;
        }
        self.history_loaded
    }

    pub fn history_loaded(&self) -> bool {
        self.history_loaded
    }

    /// Arm the one-shot replay of a landing-screen send.
    pub fn arm_pending_send(&mut self, send: PendingSend) {
        self.pending_send = Some(send);
    }

    pub fn has_pending_send(&self) -> bool {
        self.pending_send.is_some()
    }

    /// Take the armed send once its conversation is open, its history has
    /// loaded and no session is live. Yields it at most once.
    pub fn take_ready_send(&mut self, session_idle: bool) -> Option<PendingSend> {
        let ready = session_idle
            && self.history_loaded
            && self
                .pending_send
                .as_ref()
                .is_some_and(|p| self.accepts(p.conversation_id));
        if ready {
            self.pending_send.take()
        } else {
            None
        }
    }
}
