//! Terminal front-end: renders engine events on stdout and parses REPL input.

use std::io::Write;

use parking_lot::Mutex;

use crate::events::{EventSink, UiEvent};
use crate::protocol::{ConversationId, MessageId};
use crate::reasoning_parser::{ReasoningFormat, SegmentedView};

/// Prints the live response as it grows and every notice as it arrives.
#[derive(Default)]
pub struct TerminalSink {
    printed: Mutex<Printed>,
}

/// How much of the live view is already on screen.
#[derive(Default)]
struct Printed {
    reasoning: usize,
    answer: usize,
    in_reasoning: bool,
    /// Answer text held back at the tail of the last view.
    held: String,
}

impl Printed {
    /// Text to write for `view`. Anything that could still turn into a
    /// marker is held back, since printed text cannot be taken back.
    fn render(&mut self, view: &SegmentedView) -> String {
        let mut out = String::new();
        let reasoning = &view.reasoning_text[..stable_len(&view.reasoning_text)];
        if let Some(new) = reasoning.get(self.reasoning..).filter(|n| !n.is_empty()) {
            if !self.in_reasoning && self.reasoning == 0 {
                out.push_str("[thinking] ");
            }
            self.in_reasoning = true;
            out.push_str(new);
            self.reasoning = reasoning.len();
        }

        let stable = stable_len(&view.answer_text);
        let answer = &view.answer_text[..stable];
        if let Some(new) = answer.get(self.answer..).filter(|n| !n.is_empty()) {
            if self.in_reasoning {
                out.push_str("\n\n");
                self.in_reasoning = false;
            }
            out.push_str(new);
            self.answer = answer.len();
        }
        self.held = view.answer_text.get(self.answer..).unwrap_or_default().to_string();
        out
    }

    /// Text still held when the response ends.
    fn flush(&mut self) -> String {
        let mut out = std::mem::take(&mut self.held);
        if self.reasoning > 0 || self.answer > 0 || !out.is_empty() {
            out.push('\n');
        }
        *self = Printed::default();
        out
    }
}

/// Length of `text` without a trailing partial marker such as `"<thi"`.
fn stable_len(text: &str) -> usize {
    let held = ReasoningFormat::ALL
        .iter()
        .flat_map(|format| [format.open_tag(), format.close_tag()])
        .flat_map(|tag| (1..tag.len()).map(move |n| &tag[..n]))
        .filter(|prefix| text.ends_with(prefix))
        .map(str::len)
        .max()
        .unwrap_or(0);
    text.len() - held
}

impl TerminalSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventSink for TerminalSink {
    fn emit(&self, event: UiEvent) {
        let mut printed = self.printed.lock();
        let mut out = std::io::stdout().lock();
        match event {
            UiEvent::StreamUpdate(update) => {
                let _ = write!(out, "{}", printed.render(&update.view));
                let _ = out.flush();
            }
            UiEvent::StreamCleared(_) => {
                let _ = write!(out, "{}", printed.flush());
            }
            UiEvent::Notice(notice) => {
                let _ = writeln!(out, "\n! {}", notice.message);
            }
            UiEvent::ConversationChanged(change) => match change.conversation_id {
                Some(id) => {
                    let _ = writeln!(out, "-- chat {id} --");
                }
                None => {
                    let _ = writeln!(out, "-- no chat open --");
                }
            },
            UiEvent::ConversationsChanged(change) => {
                if let Some(created) = change.created {
                    let _ = writeln!(out, "created chat {} \"{}\"", created.id, created.display_name);
                }
                if let Some(deleted) = change.deleted {
                    let _ = writeln!(out, "deleted chat {deleted}");
                }
            }
            UiEvent::MessagesChanged(_) | UiEvent::SessionState(_) => {}
        }
    }
}

/// One line of REPL input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Send(String),
    Cancel,
    Model(Option<String>),
    Models,
    Chats,
    Open(ConversationId),
    Close,
    New(String),
    DeleteChat(ConversationId),
    DeleteMessage(MessageId),
    History,
    Help,
    Quit,
    Empty,
    Invalid(String),
}

pub const HELP: &str = "\
/cancel            stop the current response
/model [name]      select a model (no name clears it)
/models            list installed models
/chats             list chats
/open <id>         open a chat
/close             return to the landing screen
/new <name>        create a chat
/delete <id>       delete a chat
/rm <message id>   delete a message and everything after it
/history           print the open chat
/quit              exit
anything else is sent to the model";

pub fn parse_line(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return ReplCommand::Send(line.to_string());
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let id = |arg: &str| arg.parse::<i64>().ok();

    match name {
        "cancel" | "stop" => ReplCommand::Cancel,
        "model" => ReplCommand::Model((!arg.is_empty()).then(|| arg.to_string())),
        "models" => ReplCommand::Models,
        "chats" => ReplCommand::Chats,
        "open" => id(arg).map_or_else(|| invalid("/open needs a chat id"), ReplCommand::Open),
        "close" => ReplCommand::Close,
        "new" if !arg.is_empty() => ReplCommand::New(arg.to_string()),
        "new" => invalid("/new needs a name"),
        "delete" => id(arg).map_or_else(|| invalid("/delete needs a chat id"), ReplCommand::DeleteChat),
        "rm" => id(arg).map_or_else(
            || invalid("/rm needs a message id"),
            |id| ReplCommand::DeleteMessage(MessageId::Durable(id)),
        ),
        "history" => ReplCommand::History,
        "help" => ReplCommand::Help,
        "quit" | "exit" => ReplCommand::Quit,
        other => invalid(&format!("unknown command /{other}")),
    }
}

fn invalid(reason: &str) -> ReplCommand {
    ReplCommand::Invalid(reason.to_string())
}
