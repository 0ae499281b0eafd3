//! Inbound message types and bot command parsing.

use crate::session::ChatId;

/// Who sent an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sender {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_bot: bool,
}

/// A text message delivered by the transport.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Correlates log lines produced while handling this event
    pub trace_id: String,
    pub chat_id: ChatId,
    /// Telegram chat type ("private", "group", ...)
    pub chat_kind: Option<String>,
    pub sender: Option<Sender>,
    pub text: String,
}

impl InboundEvent {
    /// Build an event with a fresh trace id and no chat metadata.
    pub fn text(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            trace_id: relay_common::logging::generate_trace_id(),
            chat_id,
            chat_kind: None,
            sender: None,
            text: text.into(),
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::parse(&self.text)
    }
}

/// Bot commands understood by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a conversation session
    Start,
    /// Close the conversation session
    End,
    /// Alias of `End`
    Stop,
    Help,
    /// Echo the argument back; empty when none was given
    Echo(String),
    Info,
    Unknown(String),
}

impl Command {
    /// Parse a `/command[@botname] [args]` message. Returns `None` for plain text.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim_start();
        let rest = text.strip_prefix('/')?;

        let (head, args) = match rest.find(char::is_whitespace) {
            Some(idx) => (&rest[..idx], rest[idx..].trim()),
            None => (rest, ""),
        };
        let name = head.split('@').next().unwrap_or_default();

        Some(match name {
            "start" => Self::Start,
            "end" => Self::End,
            "stop" => Self::Stop,
            "help" => Self::Help,
            "echo" => Self::Echo(args.to_string()),
            "info" => Self::Info,
            other => Self::Unknown(other.to_string()),
        })
    }
}
