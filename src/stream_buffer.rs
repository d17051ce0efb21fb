//! Accumulator for the text of the generation currently in flight.

use crate::protocol::ConversationId;
use crate::reasoning_parser::{segment_classified, Classification, SegmentedView, Segmenter};

/// Append-only text buffer for one generation.
///
/// The reasoning classification is decided once, on the first append that
/// makes it decidable, and then reused for every later view.
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    conversation_id: Option<ConversationId>,
    raw_text: String,
    classification: Classification,
    segmenter: Segmenter,
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new(Segmenter::new())
    }
}

impl StreamBuffer {
    pub fn new(segmenter: Segmenter) -> Self {
        Self {
            conversation_id: None,
            raw_text: String::new(),
            classification: Classification::Undecided,
            segmenter,
        }
    }

    /// Clear the buffer and bind it to `conversation_id`.
    pub fn reset(&mut self, conversation_id: Option<ConversationId>) {
        self.conversation_id = conversation_id;
        self.raw_text.clear();
        self.classification = Classification::Undecided;
    }

    /// Append one fragment in arrival order and return the updated view.
    pub fn append(&mut self, fragment: &str) -> SegmentedView {
        self.raw_text.push_str(fragment);
        if !self.classification.is_decided() {
            self.classification = self.segmenter.classify(&self.raw_text);
        }
        self.view()
    }

    pub fn view(&self) -> SegmentedView {
        segment_classified(&self.raw_text, self.classification)
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.conversation_id
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn is_empty(&self) -> bool {
        self.raw_text.is_empty()
    }
}
