//! Ephemeral per-chat conversation sessions.
//!
//! A chat has at most one session. Sessions are created by `/start`, wait
//! for the user to paste an API credential, then hold the running
//! conversation until `/end`, an upstream auth failure, or inactivity.
//!
//! Expiry is checked on every read: a session idle for longer than the
//! expiry window behaves exactly like a missing one, whether or not
//! [`SessionStore::sweep_expired`] has physically removed it yet.
//!
//! Every session carries a generation number unique within the store. Work
//! that awaits the network between reading a session and writing to it uses
//! the `*_if` variants, so a result computed for a session that was ended
//! (and possibly restarted) in the meantime never lands on its successor.

pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use crate::credential::Credential;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default inactivity window after which a session is dead.
pub const DEFAULT_EXPIRY_MINUTES: i64 = 30;

/// Telegram chat identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatId(pub i64);

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ChatId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Wire name used by chat completion APIs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Lifecycle phase of an existing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created by `/start`, no credential accepted yet
    AwaitingCredential,
    /// Credential validated, conversation running
    Active,
}

/// Snapshot of one chat's conversation state.
#[derive(Debug, Clone)]
pub struct Session {
    chat_id: ChatId,
    generation: u64,
    credential: Option<Credential>,
    history: Vec<Turn>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl Session {
    fn new(chat_id: ChatId, generation: u64, now: DateTime<Utc>) -> Self {
        Self {
            chat_id,
            generation,
            credential: None,
            history: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    /// Distinguishes this session from earlier or later ones of the same chat.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `Active` exactly when a validated credential is held.
    pub fn phase(&self) -> SessionPhase {
        if self.credential.is_some() {
            SessionPhase::Active
        } else {
            SessionPhase::AwaitingCredential
        }
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }
}

/// Returned by a successful [`SessionStore::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Created {
    pub chat_id: ChatId,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
}

/// Session store error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session already exists for chat {0}")]
    AlreadyExists(ChatId),

    #[error("no session for chat {0}")]
    NotFound(ChatId),

    #[error("session for chat {0} already holds a credential")]
    AlreadyActive(ChatId),

    /// The chat's session was ended and replaced by a newer one
    #[error("session for chat {0} was replaced")]
    Replaced(ChatId),

    #[error("refusing to activate session for chat {0} with an empty credential")]
    EmptyCredential(ChatId),
}

/// In-memory map of chat id to session.
///
/// Every operation locks only the shard holding the chat's entry, so
/// check-then-act sequences are atomic per chat while different chats
/// proceed independently. No method performs I/O.
pub struct SessionStore {
    sessions: DashMap<ChatId, Session>,
    clock: Arc<dyn Clock>,
    expiry: Duration,
    next_generation: AtomicU64,
}

impl SessionStore {
    /// Create a store with the default 30 minute expiry.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_expiry(clock, Duration::minutes(DEFAULT_EXPIRY_MINUTES))
    }

    pub fn with_expiry(clock: Arc<dyn Clock>, expiry: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            clock,
            expiry,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        now - session.last_activity > self.expiry
    }

    /// Start a new session in `AwaitingCredential`.
    ///
    /// An expired leftover entry is replaced rather than reported as a conflict.
    pub fn create(&self, chat_id: ChatId) -> Result<Created, SessionError> {
        let now = self.clock.now();
        let generation = match self.sessions.entry(chat_id) {
            Entry::Occupied(mut entry) => {
                if !self.is_expired(entry.get(), now) {
                    return Err(SessionError::AlreadyExists(chat_id));
                }
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                entry.insert(Session::new(chat_id, generation, now));
                generation
            }
            Entry::Vacant(entry) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                entry.insert(Session::new(chat_id, generation, now));
                generation
            }
        };

        tracing::debug!(chat_id = %chat_id, generation, "Session created");
        Ok(Created {
            chat_id,
            generation,
            created_at: now,
        })
    }

    /// Live session for a chat, if any.
    pub fn get(&self, chat_id: ChatId) -> Option<Session> {
        let now = self.clock.now();
        let session = self.sessions.get(&chat_id).map(|s| s.value().clone())?;

        if self.is_expired(&session, now) {
            self.sessions
                .remove_if(&chat_id, |_, s| self.is_expired(s, now));
            tracing::debug!(chat_id = %chat_id, "Session expired on read");
            return None;
        }

        Some(session)
    }

    /// Refresh `last_activity`. Returns `false` if there is no live session.
    pub fn touch(&self, chat_id: ChatId) -> bool {
        let now = self.clock.now();
        match self.sessions.get_mut(&chat_id) {
            Some(mut session) if !self.is_expired(&session, now) => {
                session.last_activity = now;
                true
            }
            _ => false,
        }
    }

    /// Live entry for `chat_id`, optionally pinned to one generation.
    fn live_mut(
        &self,
        chat_id: ChatId,
        generation: Option<u64>,
    ) -> Result<RefMut<'_, ChatId, Session>, SessionError> {
        let now = self.clock.now();
        let session = self
            .sessions
            .get_mut(&chat_id)
            .filter(|s| !self.is_expired(s, now))
            .ok_or(SessionError::NotFound(chat_id))?;

        match generation {
            Some(g) if session.generation != g => Err(SessionError::Replaced(chat_id)),
            _ => Ok(session),
        }
    }

    /// Move a session from `AwaitingCredential` to `Active`.
    pub fn set_credential(
        &self,
        chat_id: ChatId,
        credential: Credential,
    ) -> Result<(), SessionError> {
        self.activate(chat_id, None, credential)
    }

    /// [`set_credential`](Self::set_credential), only if the live session is
    /// still `generation`.
    pub fn set_credential_if(
        &self,
        chat_id: ChatId,
        generation: u64,
        credential: Credential,
    ) -> Result<(), SessionError> {
        self.activate(chat_id, Some(generation), credential)
    }

    fn activate(
        &self,
        chat_id: ChatId,
        generation: Option<u64>,
        credential: Credential,
    ) -> Result<(), SessionError> {
        if credential.is_empty() {
            return Err(SessionError::EmptyCredential(chat_id));
        }

        let mut session = self.live_mut(chat_id, generation)?;
        if session.credential.is_some() {
            return Err(SessionError::AlreadyActive(chat_id));
        }

        session.credential = Some(credential);
        tracing::debug!(chat_id = %chat_id, "Session activated");
        Ok(())
    }

    /// Append a turn to the history, returning the new history length.
    ///
    /// Role alternation is not enforced here.
    pub fn append_turn(
        &self,
        chat_id: ChatId,
        role: Role,
        text: impl Into<String>,
    ) -> Result<usize, SessionError> {
        let mut session = self.live_mut(chat_id, None)?;
        session.history.push(Turn {
            role,
            text: text.into(),
        });
        Ok(session.history.len())
    }

    pub fn append_turn_if(
        &self,
        chat_id: ChatId,
        generation: u64,
        role: Role,
        text: impl Into<String>,
    ) -> Result<usize, SessionError> {
        let mut session = self.live_mut(chat_id, Some(generation))?;
        session.history.push(Turn {
            role,
            text: text.into(),
        });
        Ok(session.history.len())
    }

    /// Remove and return the most recent turn.
    pub fn pop_turn(&self, chat_id: ChatId) -> Result<Option<Turn>, SessionError> {
        Ok(self.live_mut(chat_id, None)?.history.pop())
    }

    pub fn pop_turn_if(
        &self,
        chat_id: ChatId,
        generation: u64,
    ) -> Result<Option<Turn>, SessionError> {
        Ok(self.live_mut(chat_id, Some(generation))?.history.pop())
    }

    /// Remove a chat's session. Returns whether anything was removed.
    pub fn delete(&self, chat_id: ChatId) -> bool {
        let removed = self.sessions.remove(&chat_id).is_some();
        if removed {
            tracing::debug!(chat_id = %chat_id, "Session deleted");
        }
        removed
    }

    /// Remove the chat's session only if it is still `generation`.
    pub fn delete_if(&self, chat_id: ChatId, generation: u64) -> bool {
        let removed = self
            .sessions
            .remove_if(&chat_id, |_, s| s.generation == generation)
            .is_some();
        if removed {
            tracing::debug!(chat_id = %chat_id, generation, "Session deleted");
        }
        removed
    }

    /// Drop every session idle for longer than the expiry window as of `now`.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, session| {
            let keep = now - session.last_activity <= self.expiry;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            tracing::info!(removed, remaining = self.sessions.len(), "Swept expired sessions");
        }
        removed
    }

    /// Physical entry count, including expired entries not yet swept.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
