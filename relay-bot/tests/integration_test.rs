//! Integration tests for Relay Bot.
//!
//! Drives the webhook endpoints and the conversation router with in-memory
//! fakes for Telegram, the credential validator and the completion API.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use relay_bot::completion::ChatMessage;
use relay_bot::session::{Role, SessionPhase};
use relay_bot::telegram::{split_message, ChannelResult, MAX_MESSAGE_LEN};
use relay_bot::{
    build_router, create_state, AllowAll, ChatId, Clock, CompletionClient, CompletionError,
    ConversationRouter, Credential, CredentialValidator, InboundEvent, ManualClock, ReplySink,
    RouteOutcome, SessionStore,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tower::ServiceExt;

const KEY: &str = "sk-validcredential1234567890123456789012";

// ─────────────────────────────────────────────────────────────────────────────
// Fakes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<(ChatId, String)>>,
}

impl RecordingSink {
    fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl ReplySink for RecordingSink {
    async fn reply(&self, chat_id: ChatId, text: &str) -> ChannelResult<()> {
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }
}

struct ScriptedValidator(bool);

#[async_trait]
impl CredentialValidator for ScriptedValidator {
    async fn validate(&self, _credential: &Credential) -> bool {
        self.0
    }
}

/// Parks a completion call until the test lets it through.
#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

/// Pops scripted results; answers "ok" once the script runs out.
struct ScriptedCompletion {
    script: Mutex<VecDeque<Result<String, CompletionError>>>,
    delay: Duration,
    gate: Option<Arc<Gate>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedCompletion {
    fn new(script: Vec<Result<String, CompletionError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            delay: Duration::ZERO,
            gate: None,
            requests: Mutex::default(),
        }
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletion {
    async fn complete(
        &self,
        _credential: &Credential,
        messages: &[ChatMessage],
    ) -> Result<String, CompletionError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok("ok".to_string()))
    }
}

struct Harness {
    router: Arc<ConversationRouter>,
    store: Arc<SessionStore>,
    clock: Arc<ManualClock>,
    sink: Arc<RecordingSink>,
}

fn harness_with(valid: bool, completion: ScriptedCompletion) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(SessionStore::new(clock.clone()));
    let sink = Arc::new(RecordingSink::default());
    let router = Arc::new(ConversationRouter::new(
        store.clone(),
        Arc::new(completion),
        Arc::new(ScriptedValidator(valid)),
        sink.clone(),
    ));
    Harness {
        router,
        store,
        clock,
        sink,
    }
}

fn harness(valid: bool, script: Vec<Result<String, CompletionError>>) -> Harness {
    harness_with(valid, ScriptedCompletion::new(script))
}

async fn say(h: &Harness, chat: i64, text: &str) -> RouteOutcome {
    h.router.dispatch(InboundEvent::text(ChatId(chat), text)).await
}

async fn activate(h: &Harness, chat: i64) {
    assert_eq!(say(h, chat, "/start").await, RouteOutcome::SessionStarted);
    assert_eq!(say(h, chat, KEY).await, RouteOutcome::CredentialAccepted);
}

// ─────────────────────────────────────────────────────────────────────────────
// Session lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn new_session_awaits_credential() {
    let h = harness(true, vec![]);
    h.store.create(ChatId(1)).unwrap();

    let session = h.store.get(ChatId(1)).unwrap();
    assert_eq!(session.phase(), SessionPhase::AwaitingCredential);
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn valid_credential_activates_session() {
    let h = harness(true, vec![]);
    activate(&h, 1).await;

    let session = h.store.get(ChatId(1)).unwrap();
    assert_eq!(session.phase(), SessionPhase::Active);
    assert_eq!(session.credential().unwrap().expose(), KEY);
}

#[tokio::test]
async fn text_without_session_is_echoed() {
    let h = harness(true, vec![]);
    assert_eq!(say(&h, 1, "hello").await, RouteOutcome::PlainEcho);

    assert!(h.sink.texts()[0].contains("You said: \"hello\""));
    assert!(h.store.get(ChatId(1)).is_none());
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn upstream_auth_failure_deletes_session() {
    let h = harness(true, vec![Err(CompletionError::Auth("invalid key".into()))]);
    activate(&h, 1).await;

    assert_eq!(say(&h, 1, "hi").await, RouteOutcome::UpstreamAuth);
    assert!(h.store.get(ChatId(1)).is_none());
    assert_eq!(say(&h, 1, "hi again").await, RouteOutcome::PlainEcho);
}

#[tokio::test]
async fn rate_limit_keeps_history_and_refreshes_activity() {
    let h = harness(
        true,
        vec![
            Ok("first answer".into()),
            Err(CompletionError::RateLimit("429".into())),
        ],
    );
    activate(&h, 1).await;
    assert_eq!(say(&h, 1, "q1").await, RouteOutcome::Answered { chunks: 1 });

    h.clock.advance(chrono::Duration::minutes(10));
    assert_eq!(say(&h, 1, "q2").await, RouteOutcome::UpstreamRateLimit);

    let session = h.store.get(ChatId(1)).unwrap();
    assert_eq!(session.phase(), SessionPhase::Active);
    assert_eq!(session.history().len(), 2);
    assert_eq!(session.last_activity(), h.clock.now());
}

#[tokio::test]
async fn long_answer_is_split_for_telegram() {
    let answer = "x".repeat(9000);
    let h = harness(true, vec![Ok(answer.clone())]);
    activate(&h, 1).await;

    assert_eq!(say(&h, 1, "long").await, RouteOutcome::Answered { chunks: 3 });

    let texts = h.sink.texts();
    let chunks = &texts[texts.len() - 3..];
    assert!(chunks.iter().all(|c| c.chars().count() <= MAX_MESSAGE_LEN));
    assert_eq!(chunks.concat(), answer);
    assert_eq!(split_message(&answer, MAX_MESSAGE_LEN), chunks.to_vec());

    // The stored turn keeps the whole answer
    let session = h.store.get(ChatId(1)).unwrap();
    assert_eq!(session.history()[1].text.len(), 9000);
}

#[tokio::test]
async fn idle_session_expires_after_thirty_minutes() {
    let h = harness(true, vec![]);
    activate(&h, 1).await;

    h.clock.advance(chrono::Duration::minutes(30));
    assert!(h.store.get(ChatId(1)).is_some());

    h.clock.advance(chrono::Duration::seconds(1));
    assert!(h.store.get(ChatId(1)).is_none());
    assert_eq!(say(&h, 1, "anyone?").await, RouteOutcome::PlainEcho);
    assert_eq!(say(&h, 1, "/start").await, RouteOutcome::SessionStarted);
}

#[tokio::test]
async fn sweep_removes_only_idle_sessions() {
    let h = harness(true, vec![]);
    activate(&h, 1).await;
    h.clock.advance(chrono::Duration::minutes(20));
    activate(&h, 2).await;
    h.clock.advance(chrono::Duration::minutes(15));

    assert_eq!(h.router.sweep(), 1);
    assert!(h.store.get(ChatId(1)).is_none());
    assert!(h.store.get(ChatId(2)).is_some());
}

#[tokio::test]
async fn rejected_credential_ends_session() {
    let h = harness(false, vec![]);
    assert_eq!(say(&h, 1, "/start").await, RouteOutcome::SessionStarted);
    assert_eq!(say(&h, 1, KEY).await, RouteOutcome::CredentialRejected);
    assert!(h.store.get(ChatId(1)).is_none());
}

#[tokio::test]
async fn chats_are_independent() {
    let h = harness(true, vec![]);
    activate(&h, 1).await;

    assert_eq!(say(&h, 2, "hello").await, RouteOutcome::PlainEcho);
    assert_eq!(say(&h, 1, "hello").await, RouteOutcome::Answered { chunks: 1 });
    assert!(h.store.get(ChatId(2)).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_turns_keep_history_alternating() {
    let mut completion = ScriptedCompletion::new(vec![]);
    completion.delay = Duration::from_millis(20);
    let h = harness_with(true, completion);
    activate(&h, 1).await;

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let router = h.router.clone();
            tokio::spawn(async move {
                router
                    .dispatch(InboundEvent::text(ChatId(1), format!("msg {i}")))
                    .await
            })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap(), RouteOutcome::Answered { chunks: 1 });
    }

    let session = h.store.get(ChatId(1)).unwrap();
    assert_eq!(session.history().len(), 8);
    for (i, turn) in session.history().iter().enumerate() {
        let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
        assert_eq!(turn.role, expected);
    }
}

/// Activate chat 1, then park a completion for "hi" at the gate.
async fn park_completion(
    answer: Result<String, CompletionError>,
) -> (Harness, Arc<Gate>, tokio::task::JoinHandle<RouteOutcome>) {
    let gate = Arc::new(Gate::default());
    let mut completion = ScriptedCompletion::new(vec![answer]);
    completion.gate = Some(gate.clone());
    let h = harness_with(true, completion);
    activate(&h, 1).await;

    let router = h.router.clone();
    let pending =
        tokio::spawn(async move { router.dispatch(InboundEvent::text(ChatId(1), "hi")).await });
    gate.entered.notified().await;
    (h, gate, pending)
}

#[tokio::test]
async fn end_while_answer_in_flight_sends_nothing_more() {
    let (h, gate, pending) = park_completion(Ok("late answer".into())).await;

    assert_eq!(say(&h, 1, "/end").await, RouteOutcome::SessionEnded);
    gate.release.notify_one();
    assert_eq!(pending.await.unwrap(), RouteOutcome::SessionGone);

    let texts = h.sink.texts();
    assert!(!texts.iter().any(|t| t == "late answer"));
    assert!(texts.last().unwrap().starts_with("Conversation ended"));
    assert!(h.store.get(ChatId(1)).is_none());
}

#[tokio::test]
async fn restart_while_answer_in_flight_keeps_new_session_clean() {
    let (h, gate, pending) = park_completion(Ok("late answer".into())).await;

    say(&h, 1, "/end").await;
    assert_eq!(say(&h, 1, "/start").await, RouteOutcome::SessionStarted);
    gate.release.notify_one();
    assert_eq!(pending.await.unwrap(), RouteOutcome::SessionGone);

    let session = h.store.get(ChatId(1)).unwrap();
    assert_eq!(session.phase(), SessionPhase::AwaitingCredential);
    assert!(session.history().is_empty());
    assert!(!h.sink.texts().iter().any(|t| t == "late answer"));
}

#[tokio::test]
async fn restart_while_auth_failure_in_flight_keeps_new_session() {
    let (h, gate, pending) =
        park_completion(Err(CompletionError::Auth("invalid key".into()))).await;

    say(&h, 1, "/end").await;
    say(&h, 1, "/start").await;
    gate.release.notify_one();
    assert_eq!(pending.await.unwrap(), RouteOutcome::SessionGone);

    assert_eq!(
        h.store.get(ChatId(1)).unwrap().phase(),
        SessionPhase::AwaitingCredential
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Webhook
// ─────────────────────────────────────────────────────────────────────────────

fn create_test_app() -> (axum::Router, tokio::sync::mpsc::Receiver<InboundEvent>) {
    let (state, rx) = create_state(Some("hook-secret".into()), true, Arc::new(AllowAll));
    (build_router(state), rx)
}

async fn request_json(
    app: &axum::Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = if let Some(b) = body {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(&b).unwrap()))
            .unwrap()
    } else {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    (status, json)
}

fn update(chat: i64, text: &str) -> Value {
    json!({
        "update_id": 1,
        "message": {
            "message_id": 10,
            "chat": { "id": chat, "type": "private" },
            "from": { "id": 55, "is_bot": false, "first_name": "Ada" },
            "text": text
        }
    })
}

#[tokio::test]
async fn test_health_check() {
    let (app, _rx) = create_test_app();
    let (status, json) = request_json(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "relay-bot");
}

#[tokio::test]
async fn test_webhook_status_endpoint() {
    let (app, _rx) = create_test_app();

    let (status, json) =
        request_json(&app, Method::GET, "/webhook/telegram/hook-secret", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["token_configured"], true);

    let (status, _) = request_json(&app, Method::GET, "/webhook/telegram/wrong", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_webhook_rejects_bad_token_without_detail() {
    let (app, _rx) = create_test_app();
    let (status, json) =
        request_json(&app, Method::POST, "/webhook/telegram/wrong", Some(update(1, "hi"))).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"], "Unauthorized");
}

#[tokio::test]
async fn test_webhook_to_reply_end_to_end() {
    let (app, rx) = create_test_app();
    let h = harness(true, vec![Ok("Hi Ada!".into())]);
    let processor = ConversationRouter::spawn_processor(h.router.clone(), rx);

    for text in ["/start", KEY, "hello"] {
        let (status, json) = request_json(
            &app,
            Method::POST,
            "/webhook/telegram/hook-secret",
            Some(update(77, text)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], true);

        // Wait for this message's reply before sending the next one
        let expected = h.sink.texts().len() + 1;
        for _ in 0..100 {
            if h.sink.texts().len() >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.sink.texts().len(), expected);
    }

    assert_eq!(h.sink.texts().last().unwrap(), "Hi Ada!");
    let session = h.store.get(ChatId(77)).unwrap();
    assert_eq!(session.history().len(), 2);

    processor.abort();
}
