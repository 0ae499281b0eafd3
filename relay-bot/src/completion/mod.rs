//! Chat completion abstraction.
//!
//! The router only needs "send these messages with this credential, give me
//! text back or tell me which kind of failure happened". The concrete HTTP
//! client lives in [`openai`].

pub mod openai;

pub use openai::OpenAiClient;

use crate::credential::Credential;
use crate::session::{Role, Turn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One message of a completion request, in wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role.as_str().into(),
            content: turn.text.clone(),
        }
    }
}

/// Failure class of a completion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionErrorKind {
    Auth,
    RateLimit,
    Other,
}

/// Completion error type.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    /// Credential rejected by the remote service
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Too many requests or quota exhausted
    #[error("Rate limited: {0}")]
    RateLimit(String),

    #[error("Completion failed: {0}")]
    Other(String),
}

impl CompletionError {
    pub const fn kind(&self) -> CompletionErrorKind {
        match self {
            Self::Auth(_) => CompletionErrorKind::Auth,
            Self::RateLimit(_) => CompletionErrorKind::RateLimit,
            Self::Other(_) => CompletionErrorKind::Other,
        }
    }
}

/// Chat completion backend.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        credential: &Credential,
        messages: &[ChatMessage],
    ) -> Result<String, CompletionError>;
}

/// Build the outbound message list: the fixed system instruction followed by
/// the conversation history.
///
/// With a `limit`, only the most recent `limit` turns are sent, and a leading
/// assistant turn left over from the cut is dropped so the window still
/// opens with the user.
pub fn build_messages(system_prompt: &str, history: &[Turn], limit: Option<usize>) -> Vec<ChatMessage> {
    let mut window = match limit {
        Some(n) if history.len() > n => &history[history.len() - n..],
        _ => history,
    };
    if limit.is_some() {
        while let Some((first, rest)) = window.split_first() {
            if first.role == Role::User {
                break;
            }
            window = rest;
        }
    }

    let mut messages = Vec::with_capacity(window.len() + 1);
    messages.push(ChatMessage::system(system_prompt));
    messages.extend(window.iter().map(ChatMessage::from));
    messages
}
