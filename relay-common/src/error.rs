//! Error type for requests rejected at the relay's HTTP edge.
//!
//! Each variant knows the status code it maps to and a short public message.
//! The `Display` form carries detail for logs only.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Webhook secret missing or wrong
    #[error("unauthorized webhook call: {0}")]
    Unauthorized(String),

    /// Rejected by the source trust policy
    #[error("untrusted source: {0}")]
    UntrustedSource(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A required setting is absent, e.g. the bot token
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("malformed update: {0}")]
    MalformedUpdate(#[from] serde_json::Error),

    /// The processor stopped consuming inbound events
    #[error("event queue closed")]
    QueueClosed,

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::UntrustedSource(_) => 403,
            Self::NotFound(_) => 404,
            Self::MalformedUpdate(_) => 400,
            Self::NotConfigured(_) | Self::QueueClosed | Self::Io(_) => 500,
        }
    }

    /// Message safe to hand back to the caller. Never includes detail.
    pub const fn public_message(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "Unauthorized",
            Self::UntrustedSource(_) => "Forbidden",
            Self::NotFound(_) => "Not found",
            Self::MalformedUpdate(_) => "Malformed request body",
            Self::NotConfigured(_) | Self::QueueClosed | Self::Io(_) => "Internal server error",
        }
    }
}
