//! Relay Bot - Telegram webhook bot backed by a chat completion API.
//!
//! Each chat opens a short-lived conversation with `/start`, supplies its own
//! API key, and then talks to the assistant until it sends `/end` or stays
//! idle past the expiry window.
//!
//! ## Architecture
//!
//! ```text
//! Telegram → webhook → queue → ConversationRouter → completion API
//!                                   ↓      ↑
//!                              SessionStore
//!                                   ↓
//! Telegram ←──── sendMessage ←── ReplySink
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod completion;
pub mod credential;
pub mod message;
pub mod router;
pub mod routes;
pub mod session;
pub mod telegram;
pub mod trust;

pub use completion::{CompletionClient, CompletionError, CompletionErrorKind, OpenAiClient};
pub use credential::{Credential, CredentialValidator};
pub use message::{Command, InboundEvent, Sender};
pub use router::{ConversationRouter, RouteOutcome};
pub use routes::{build_router, create_state, RelayState};
pub use session::{ChatId, Clock, ManualClock, Session, SessionPhase, SessionStore, SystemClock};
pub use telegram::{ReplySink, TelegramChannel};
pub use trust::{AllowAll, TrustPolicy};

use relay_common::config::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

/// Largest webhook body accepted.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Everything the server runs: the HTTP router, the conversation router and
/// the receiving end of the event queue between them.
pub struct Relay {
    pub http: axum::Router,
    pub router: Arc<ConversationRouter>,
    pub events: tokio::sync::mpsc::Receiver<InboundEvent>,
}

/// Wire up store, clients, conversation router and HTTP routes from config.
pub fn build_relay(config: &Config) -> anyhow::Result<Relay> {
    let expiry = chrono::Duration::from_std(config.session_expiry())?;
    let store = Arc::new(SessionStore::with_expiry(Arc::new(SystemClock), expiry));

    let bot_token = config.telegram_bot_token().unwrap_or_default().to_string();
    let telegram = Arc::new(
        TelegramChannel::with_api_base(bot_token, config.telegram.api_base.clone())
            .with_timeout(Duration::from_secs(config.telegram.timeout_secs)),
    );
    let openai = Arc::new(OpenAiClient::new(&config.completion));
    tracing::info!(
        model = %openai.model(),
        history_limit = ?config.completion.history_limit,
        "Completion backend configured"
    );

    let router = Arc::new(
        ConversationRouter::new(store, openai.clone(), openai, telegram)
            .with_system_prompt(config.completion.system_prompt.clone())
            .with_history_limit(config.completion.history_limit),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let (state, events) = create_state(
        config.webhook_secret().map(str::to_string),
        config.telegram_configured(),
        Arc::new(AllowAll),
    );
    let http = build_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors);

    Ok(Relay {
        http,
        router,
        events,
    })
}

/// Start the relay HTTP server and background tasks.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        config.network.bind.parse::<std::net::IpAddr>()?,
        config.network.port,
    ));

    if !config.telegram_configured() {
        tracing::warn!("TELEGRAM_BOT_TOKEN is not set; webhook requests will be rejected");
    }
    if config.webhook_secret().is_none() {
        tracing::warn!("WEBHOOK_SECRET_TOKEN is not set; webhook requests will be rejected");
    }

    let Relay {
        http,
        router,
        events,
    } = build_relay(config)?;

    let processor_handle = ConversationRouter::spawn_processor(router.clone(), events);

    let sweep_router = router.clone();
    let sweep_every = Duration::from_secs(config.session.sweep_interval_secs);
    let sweep_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            sweep_router.sweep();
        }
    });

    tracing::info!("Starting Relay Bot on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, http)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweep_handle.abort();
    processor_handle.abort();
    tracing::info!("Relay Bot stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
