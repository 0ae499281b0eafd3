//! Conversation routing.
//!
//! Decides what to do with each inbound message based on the chat's session
//! phase:
//!
//! - no session: commands are handled, plain text is echoed back
//! - `AwaitingCredential`: the message is treated as an API key
//! - `Active`: the message is a conversation turn sent to the completion API
//!
//! Store operations never span an `.await`. Turns for one chat are
//! serialized by a per-chat async lock so the history keeps alternating
//! User/Assistant even when Telegram delivers messages concurrently.
//!
//! `/start` and `/end` do not take that lock, so `/end` works while a
//! completion is in flight. Writes made after a network call are pinned to
//! the session generation read before it; if the session was ended or
//! replaced meanwhile the result is dropped without a reply.

pub mod replies;

use crate::completion::{build_messages, CompletionClient, CompletionErrorKind};
use crate::credential::{looks_like_credential, Credential, CredentialValidator};
use crate::message::{Command, InboundEvent};
use crate::session::{ChatId, Role, Session, SessionError, SessionPhase, SessionStore, Turn};
use crate::telegram::{split_message, ReplySink, MAX_MESSAGE_LEN};
use dashmap::DashMap;
use relay_common::config::DEFAULT_SYSTEM_PROMPT;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// What the router did with one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// `/start` opened a session in `AwaitingCredential`
    SessionStarted,
    /// `/start` while a live session exists
    AlreadyRunning,
    /// `/end` or `/stop` removed the session
    SessionEnded,
    NothingToEnd,
    Help,
    /// `/echo`, with or without an argument
    Echo,
    Info,
    /// Unrecognized `/command`, no reply sent
    Ignored,
    /// Plain text with no session
    PlainEcho,
    InvalidCredentialFormat,
    CredentialAccepted,
    CredentialRejected,
    /// Completion succeeded and the answer was sent in `chunks` messages
    Answered { chunks: usize },
    UpstreamAuth,
    UpstreamRateLimit,
    UpstreamFailure,
    /// The session ended or expired while the message was being handled
    SessionGone,
}

/// Routes inbound messages to session transitions and replies.
pub struct ConversationRouter {
    store: Arc<SessionStore>,
    completion: Arc<dyn CompletionClient>,
    validator: Arc<dyn CredentialValidator>,
    replies: Arc<dyn ReplySink>,
    system_prompt: String,
    history_limit: Option<usize>,
    turn_locks: DashMap<ChatId, Arc<Mutex<()>>>,
}

impl ConversationRouter {
    pub fn new(
        store: Arc<SessionStore>,
        completion: Arc<dyn CompletionClient>,
        validator: Arc<dyn CredentialValidator>,
        replies: Arc<dyn ReplySink>,
    ) -> Self {
        Self {
            store,
            completion,
            validator,
            replies,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            history_limit: None,
            turn_locks: DashMap::new(),
        }
    }

    /// Set the system instruction prepended to every completion request.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Cap the number of history turns sent per request. Stored history is
    /// never truncated.
    pub fn with_history_limit(mut self, limit: Option<usize>) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Handle one inbound message end to end.
    pub async fn dispatch(&self, event: InboundEvent) -> RouteOutcome {
        let chat_id = event.chat_id;
        let outcome = match event.command() {
            Some(Command::Start) => self.start(chat_id).await,
            Some(Command::End | Command::Stop) => self.end(chat_id).await,
            Some(Command::Help) => {
                let help = replies::help(self.store.expiry().num_minutes());
                self.send(chat_id, &help).await;
                RouteOutcome::Help
            }
            Some(Command::Echo(arg)) => {
                if arg.is_empty() {
                    self.send(chat_id, replies::ECHO_USAGE).await;
                } else {
                    self.send(chat_id, &replies::echo(&arg)).await;
                }
                RouteOutcome::Echo
            }
            Some(Command::Info) => {
                let info = replies::chat_info(
                    chat_id,
                    event.chat_kind.as_deref(),
                    event.sender.as_ref(),
                );
                self.send(chat_id, &info).await;
                RouteOutcome::Info
            }
            Some(Command::Unknown(name)) => {
                tracing::debug!(trace_id = %event.trace_id, command = %name, "Ignoring unknown command");
                RouteOutcome::Ignored
            }
            None => self.text(chat_id, &event.text).await,
        };

        tracing::info!(
            trace_id = %event.trace_id,
            chat_id = %chat_id,
            outcome = ?outcome,
            "Message routed"
        );
        outcome
    }

    async fn start(&self, chat_id: ChatId) -> RouteOutcome {
        match self.store.create(chat_id) {
            Ok(_) => {
                self.send(chat_id, replies::SESSION_STARTED).await;
                RouteOutcome::SessionStarted
            }
            Err(SessionError::AlreadyExists(_)) => {
                self.send(chat_id, replies::SESSION_ALREADY_RUNNING).await;
                RouteOutcome::AlreadyRunning
            }
            Err(e) => {
                tracing::warn!(chat_id = %chat_id, error = %e, "Failed to create session");
                self.send(chat_id, replies::UPSTREAM_OTHER).await;
                RouteOutcome::SessionGone
            }
        }
    }

    async fn end(&self, chat_id: ChatId) -> RouteOutcome {
        if self.store.delete(chat_id) {
            self.send(chat_id, replies::SESSION_ENDED).await;
            RouteOutcome::SessionEnded
        } else {
            self.send(chat_id, replies::NOTHING_TO_END).await;
            RouteOutcome::NothingToEnd
        }
    }

    async fn text(&self, chat_id: ChatId, text: &str) -> RouteOutcome {
        let lock = self.turn_lock(chat_id);
        let _guard = lock.lock().await;

        match self.store.get(chat_id) {
            None => {
                self.send(chat_id, &replies::plain_echo(text)).await;
                RouteOutcome::PlainEcho
            }
            Some(session) => match session.phase() {
                SessionPhase::AwaitingCredential => {
                    self.accept_credential(chat_id, session.generation(), text).await
                }
                SessionPhase::Active => self.converse(chat_id, session, text).await,
            },
        }
    }

    async fn accept_credential(&self, chat_id: ChatId, generation: u64, text: &str) -> RouteOutcome {
        self.store.touch(chat_id);

        if !looks_like_credential(text) {
            self.send(chat_id, replies::CREDENTIAL_FORMAT).await;
            return RouteOutcome::InvalidCredentialFormat;
        }

        let credential = Credential::new(text);
        if !self.validator.validate(&credential).await {
            if !self.store.delete_if(chat_id, generation) {
                tracing::info!(chat_id = %chat_id, "Session ended during validation");
                return RouteOutcome::SessionGone;
            }
            tracing::info!(chat_id = %chat_id, "Credential rejected, session closed");
            self.send(chat_id, replies::CREDENTIAL_REJECTED).await;
            return RouteOutcome::CredentialRejected;
        }

        match self.store.set_credential_if(chat_id, generation, credential) {
            Ok(()) => {
                tracing::info!(chat_id = %chat_id, "Credential accepted, session active");
                self.send(chat_id, replies::CREDENTIAL_ACCEPTED).await;
                RouteOutcome::CredentialAccepted
            }
            Err(e) => {
                tracing::info!(chat_id = %chat_id, error = %e, "Session changed during validation");
                RouteOutcome::SessionGone
            }
        }
    }

    async fn converse(&self, chat_id: ChatId, session: Session, text: &str) -> RouteOutcome {
        self.store.touch(chat_id);

        let generation = session.generation();
        let Some(credential) = session.credential().cloned() else {
            return RouteOutcome::SessionGone;
        };

        // Build the request from the snapshot plus the new turn, then record
        // the turn so the store is never held across the network call.
        let mut history = session.history().to_vec();
        history.push(Turn::user(text));
        if self
            .store
            .append_turn_if(chat_id, generation, Role::User, text)
            .is_err()
        {
            self.send(chat_id, replies::SESSION_GONE).await;
            return RouteOutcome::SessionGone;
        }
        let messages = build_messages(&self.system_prompt, &history, self.history_limit);

        match self.completion.complete(&credential, &messages).await {
            Ok(answer) => {
                if let Err(e) =
                    self.store
                        .append_turn_if(chat_id, generation, Role::Assistant, answer.as_str())
                {
                    tracing::info!(chat_id = %chat_id, error = %e, "Dropping answer for closed session");
                    return RouteOutcome::SessionGone;
                }
                let chunks = self.send(chat_id, &answer).await;
                RouteOutcome::Answered { chunks }
            }
            Err(e) => {
                tracing::warn!(chat_id = %chat_id, error = %e, "Completion failed");
                match e.kind() {
                    CompletionErrorKind::Auth => {
                        if !self.store.delete_if(chat_id, generation) {
                            return RouteOutcome::SessionGone;
                        }
                        self.send(chat_id, replies::UPSTREAM_AUTH).await;
                        RouteOutcome::UpstreamAuth
                    }
                    CompletionErrorKind::RateLimit => {
                        if !self.retract_user_turn(chat_id, generation) {
                            return RouteOutcome::SessionGone;
                        }
                        self.send(chat_id, replies::UPSTREAM_RATE_LIMIT).await;
                        RouteOutcome::UpstreamRateLimit
                    }
                    CompletionErrorKind::Other => {
                        if !self.retract_user_turn(chat_id, generation) {
                            return RouteOutcome::SessionGone;
                        }
                        self.send(chat_id, replies::UPSTREAM_OTHER).await;
                        RouteOutcome::UpstreamFailure
                    }
                }
            }
        }
    }

    /// Undo the user turn of a failed exchange so the user can resend it
    /// without the history holding two consecutive user turns.
    ///
    /// Returns `false` when the session is no longer `generation`.
    fn retract_user_turn(&self, chat_id: ChatId, generation: u64) -> bool {
        match self.store.pop_turn_if(chat_id, generation) {
            Ok(Some(turn)) if turn.role == Role::User => true,
            Ok(Some(turn)) => {
                tracing::warn!(chat_id = %chat_id, "Last turn was not from the user, restoring it");
                if let Err(e) = self.store.append_turn_if(chat_id, generation, turn.role, turn.text) {
                    tracing::warn!(chat_id = %chat_id, error = %e, "Failed to restore turn");
                }
                true
            }
            Ok(None) => true,
            Err(e) => {
                tracing::info!(chat_id = %chat_id, error = %e, "Session ended during completion");
                false
            }
        }
    }

    /// Send `text` as one or more messages, in order. Returns how many were
    /// delivered. Delivery failures are logged and stop the remaining chunks.
    async fn send(&self, chat_id: ChatId, text: &str) -> usize {
        let mut delivered = 0;
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            if let Err(e) = self.replies.reply(chat_id, &chunk).await {
                tracing::warn!(chat_id = %chat_id, error = %e, "Failed to deliver reply");
                break;
            }
            delivered += 1;
        }
        delivered
    }

    fn turn_lock(&self, chat_id: ChatId) -> Arc<Mutex<()>> {
        self.turn_locks.entry(chat_id).or_default().clone()
    }

    /// Sweep expired sessions and drop turn locks nobody is holding for
    /// chats without a session. Returns the number of sessions removed.
    pub fn sweep(&self) -> usize {
        let removed = self.store.sweep_expired(self.store.now());
        self.turn_locks
            .retain(|chat_id, lock| Arc::strong_count(lock) > 1 || self.store.get(*chat_id).is_some());
        removed
    }

    /// Consume inbound events, handling each in its own task.
    pub fn spawn_processor(
        router: Arc<Self>,
        mut rx: mpsc::Receiver<InboundEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Conversation processor started");

            while let Some(event) = rx.recv().await {
                let router = router.clone();
                tokio::spawn(async move {
                    router.dispatch(event).await;
                });
            }

            tracing::info!("Conversation processor stopped");
        })
    }
}
