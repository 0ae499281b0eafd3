//! Per-chat API credentials.
//!
//! A credential lives only in process memory, is zeroed when dropped and
//! never shows up in `Debug` output.

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use zeroize::Zeroize;

/// Required credential prefix.
pub const CREDENTIAL_PREFIX: &str = "sk-";

/// Minimum total credential length, prefix included.
pub const MIN_CREDENTIAL_LEN: usize = 20;

static CREDENTIAL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sk-[A-Za-z0-9_\-]+$").unwrap());

/// Syntactic plausibility check for a pasted API key.
///
/// Surrounding whitespace is ignored.
pub fn looks_like_credential(text: &str) -> bool {
    let candidate = text.trim();
    if candidate.chars().count() < MIN_CREDENTIAL_LEN || !candidate.starts_with(CREDENTIAL_PREFIX) {
        return false;
    }
    CREDENTIAL_PATTERN.is_match(candidate)
}

/// Secret API key supplied by a chat.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap user input, dropping surrounding whitespace.
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_string())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Checks a credential against the remote service before a session goes active.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// Returns `false` both for rejected keys and for transient failures;
    /// implementations log the difference.
    async fn validate(&self, credential: &Credential) -> bool;
}
