//! HTTP routes for the relay webhook.
//!
//! - `GET /health`, `GET /ready`
//! - `POST /webhook/telegram/:token` receives Bot API updates
//! - `GET /webhook/telegram/:token` reports webhook status

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use relay_common::util::sanitize_for_log;
use relay_common::Error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::message::{InboundEvent, Sender};
use crate::session::ChatId;
use crate::trust::{client_ip, TrustPolicy};

/// Capacity of the queue between the webhook and the router.
pub const EVENT_QUEUE_CAPACITY: usize = 100;

// ============================================================================
// State
// ============================================================================

/// Shared state for the relay HTTP server.
pub struct RelayState {
    /// Queue feeding the conversation processor
    pub message_tx: mpsc::Sender<InboundEvent>,
    /// Secret path segment Telegram must call the webhook with
    pub webhook_secret: Option<String>,
    /// Whether a bot token is available for sending replies
    pub bot_token_configured: bool,
    pub trust: Arc<dyn TrustPolicy>,
}

// ============================================================================
// Response Types
// ============================================================================

const SERVICE: &str = "relay-bot";

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

impl HealthResponse {
    fn with_status(status: &'static str) -> Self {
        Self {
            status,
            service: SERVICE,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

#[derive(Debug, Serialize)]
struct WebhookAck {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct WebhookStatus {
    status: &'static str,
    endpoint: &'static str,
    token_configured: bool,
    note: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(err: &Error) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    tracing::debug!(status = %status, error = %err, "Rejecting webhook request");
    (
        status,
        Json(ErrorResponse {
            error: err.public_message().to_string(),
        }),
    )
        .into_response()
}

// ============================================================================
// Health Routes
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(HealthResponse::with_status("healthy"))
}

/// Ready while the processor still drains the event queue.
async fn ready(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let (code, status) = match state.message_tx.is_closed() {
        true => (StatusCode::SERVICE_UNAVAILABLE, "not_ready"),
        false => (StatusCode::OK, "ready"),
    };
    (code, Json(HealthResponse::with_status(status)))
}

// ============================================================================
// Telegram Webhook
// ============================================================================

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    from: Option<TelegramUser>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    first_name: Option<String>,
    last_name: Option<String>,
    username: Option<String>,
}

impl From<TelegramUser> for Sender {
    fn from(user: TelegramUser) -> Self {
        Self {
            id: user.id,
            username: user.username,
            first_name: user.first_name,
            last_name: user.last_name,
            is_bot: user.is_bot,
        }
    }
}

fn token_matches(state: &RelayState, token: &str) -> bool {
    state
        .webhook_secret
        .as_deref()
        .is_some_and(|secret| secret == token)
}

async fn telegram_webhook(
    State(state): State<Arc<RelayState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !token_matches(&state, &token) {
        tracing::warn!("Telegram webhook called with an invalid token");
        return error_response(&Error::Unauthorized("webhook token mismatch".into()));
    }

    let ip = client_ip(&headers);
    if !state.trust.is_trusted_source(ip) {
        tracing::warn!(ip = ?ip, "Telegram webhook called from an untrusted source");
        return error_response(&Error::UntrustedSource(format!("{ip:?}")));
    }

    if !state.bot_token_configured {
        tracing::error!("Telegram webhook hit but TELEGRAM_BOT_TOKEN is not configured");
        return error_response(&Error::NotConfigured("TELEGRAM_BOT_TOKEN"));
    }

    tracing::debug!(
        body = %sanitize_for_log(&String::from_utf8_lossy(&body)),
        "Telegram update received"
    );

    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed Telegram update");
            return error_response(&Error::MalformedUpdate(e));
        }
    };

    let Some(msg) = update.message else {
        tracing::debug!(update_id = update.update_id, "Ignoring update without a message");
        return Json(WebhookAck { ok: true }).into_response();
    };
    let Some(text) = msg.text else {
        tracing::debug!(update_id = update.update_id, "Ignoring non-text message");
        return Json(WebhookAck { ok: true }).into_response();
    };

    let mut event = InboundEvent::text(ChatId(msg.chat.id), text);
    event.chat_kind = msg.chat.kind;
    event.sender = msg.from.map(Sender::from);

    if let Err(e) = state.message_tx.send(event).await {
        tracing::error!(error = %e, "Failed to queue Telegram message");
        return error_response(&Error::QueueClosed);
    }

    Json(WebhookAck { ok: true }).into_response()
}

async fn telegram_webhook_status(
    State(state): State<Arc<RelayState>>,
    Path(token): Path<String>,
) -> Response {
    if !token_matches(&state, &token) {
        return error_response(&Error::NotFound("webhook".into()));
    }

    Json(WebhookStatus {
        status: "Telegram webhook endpoint is active",
        endpoint: "/webhook/telegram/:token",
        token_configured: state.bot_token_configured,
        note: "Telegram delivers updates to this endpoint with POST requests",
    })
    .into_response()
}

// ============================================================================
// Router Builder
// ============================================================================

/// Build the relay HTTP router.
pub fn build_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route(
            "/webhook/telegram/:token",
            get(telegram_webhook_status).post(telegram_webhook),
        )
        .with_state(state)
}

/// Create relay state together with the receiving end of the event queue.
pub fn create_state(
    webhook_secret: Option<String>,
    bot_token_configured: bool,
    trust: Arc<dyn TrustPolicy>,
) -> (Arc<RelayState>, mpsc::Receiver<InboundEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

    let state = Arc::new(RelayState {
        message_tx: tx,
        webhook_secret,
        bot_token_configured,
        trust,
    });

    (state, rx)
}

// ============================================================================
// Tests
// ============================================================================
