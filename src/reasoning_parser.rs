//! Reasoning Segmenter
//!
//! Splits the accumulated text of one in-flight response into the model's
//! reasoning trace and the user-visible answer.
//!
//! ## Supported Formats
//! - `<think>...</think>` (DeepSeek R1, Qwen QwQ, MiniMax)
//! - `<thinking>...</thinking>` (Alternative format)
//!
//! A response has reasoning only when its text *begins* with an opening tag.
//! The split is always recomputed from the full text, so the same input
//! yields the same view no matter how it was chunked.

use serde::{Deserialize, Serialize};

/// Supported reasoning tag formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningFormat {
    /// `<think>...</think>` - DeepSeek, Qwen, MiniMax
    Think,
    /// `<thinking>...</thinking>` - Alternative format
    Thinking,
}

impl ReasoningFormat {
    pub const ALL: [ReasoningFormat; 2] = [ReasoningFormat::Think, ReasoningFormat::Thinking];

    /// Returns the opening tag for this format
    pub fn open_tag(&self) -> &'static str {
        match self {
            ReasoningFormat::Think => "<think>",
            ReasoningFormat::Thinking => "<thinking>",
        }
    }

    /// Returns the closing tag for this format
    pub fn close_tag(&self) -> &'static str {
        match self {
            ReasoningFormat::Think => "</think>",
            ReasoningFormat::Thinking => "</thinking>",
        }
    }
}

/// Whether a buffer carries a reasoning block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The text so far is a strict prefix of an opening tag; not decided yet.
    Undecided,
    /// The text began with the opening tag of this format.
    Reasoning(ReasoningFormat),
    /// No reasoning block; everything is answer text.
    Plain,
}

impl Classification {
    pub fn is_decided(&self) -> bool {
        !matches!(self, Classification::Undecided)
    }
}

/// Derived reasoning/answer split. Never stored, always recomputed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentedView {
    pub reasoning_text: String,
    pub answer_text: String,
    pub is_reasoning: bool,
}

impl SegmentedView {
    fn passthrough(raw: &str) -> Self {
        Self {
            reasoning_text: String::new(),
            answer_text: raw.to_string(),
            is_reasoning: false,
        }
    }

    /// Answer text as it gets committed: no marker token left anywhere.
    pub fn committed_answer(&self) -> String {
        ReasoningFormat::ALL
            .iter()
            .fold(self.answer_text.clone(), |text, format| {
                strip_markers(&text, *format)
            })
    }
}

/// Stateless segmenter over a set of reasoning formats.
#[derive(Debug, Clone)]
pub struct Segmenter {
    /// Formats to check (in priority order)
    formats: Vec<ReasoningFormat>,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Segmenter {
    /// Create a segmenter recognising every supported format
    pub fn new() -> Self {
        Self {
            formats: ReasoningFormat::ALL.to_vec(),
        }
    }

    /// Create a segmenter with specific formats
    pub fn with_formats(formats: Vec<ReasoningFormat>) -> Self {
        Self { formats }
    }

    /// Decide whether `raw` opens a reasoning block.
    ///
    /// Stays `Undecided` only while `raw` could still grow into an opening tag.
    pub fn classify(&self, raw: &str) -> Classification {
        if let Some(format) = self
            .formats
            .iter()
            .find(|format| raw.starts_with(format.open_tag()))
        {
            return Classification::Reasoning(*format);
        }

        let could_open = self
            .formats
            .iter()
            .any(|format| format.open_tag().starts_with(raw));
        if could_open {
            Classification::Undecided
        } else {
            Classification::Plain
        }
    }

    /// Split `raw` from scratch.
    pub fn segment(&self, raw: &str) -> SegmentedView {
        segment_classified(raw, self.classify(raw))
    }
}

/// Split `raw` under a classification that was already decided.
///
/// An undecided buffer is shown as plain text; it cannot contain a complete
/// marker yet.
pub fn segment_classified(raw: &str, classification: Classification) -> SegmentedView {
    let format = match classification {
        Classification::Reasoning(format) => format,
        Classification::Undecided | Classification::Plain => {
            return SegmentedView::passthrough(raw)
        }
    };

    match raw.find(format.close_tag()) {
        None => SegmentedView {
            reasoning_text: strip_markers(raw, format),
            answer_text: String::new(),
            is_reasoning: true,
        },
        Some(idx) => {
            let boundary = idx + format.close_tag().len();
            SegmentedView {
                reasoning_text: strip_markers(&raw[..boundary], format),
                answer_text: strip_markers(&raw[boundary..], format),
                is_reasoning: false,
            }
        }
    }
}

/// Split `raw` with the default formats.
pub fn segment(raw: &str) -> SegmentedView {
    Segmenter::new().segment(raw)
}

/// Remove every opening and closing tag of `format`, leaving all other text.
pub fn strip_markers(text: &str, format: ReasoningFormat) -> String {
    text.replace(format.open_tag(), "")
        .replace(format.close_tag(), "")
}
