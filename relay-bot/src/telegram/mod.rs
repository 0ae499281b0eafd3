//! Telegram Bot API transport.
//!
//! Inbound updates arrive through the webhook in [`crate::routes`]; this
//! module covers the outbound side: sending replies and registering the
//! webhook URL.

pub mod chunk;

pub use chunk::{split_message, MAX_MESSAGE_LEN};

use crate::session::ChatId;
use async_trait::async_trait;
use reqwest::StatusCode;
use relay_common::util::sanitize_for_log;
use std::time::Duration;

/// Bot API request timeout unless configured otherwise.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Channel error type.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Rate limited: retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("Message send failed: {0}")]
    SendFailed(String),
}

/// Outbound half of the chat transport.
///
/// `text` must already fit in one message (see [`split_message`]).
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn reply(&self, chat_id: ChatId, text: &str) -> ChannelResult<()>;
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Telegram channel - sends messages through the Bot API.
pub struct TelegramChannel {
    bot_token: String,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    /// Create a new Telegram channel against the public Bot API.
    pub fn new(bot_token: String) -> Self {
        Self::with_api_base(bot_token, "https://api.telegram.org")
    }

    /// Create a channel against a custom Bot API server.
    pub fn with_api_base(bot_token: String, api_base: impl Into<String>) -> Self {
        Self {
            bot_token,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client: http_client(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        }
    }

    /// Bound every Bot API request by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    /// Verify the bot token by calling `getMe`. Returns the bot username.
    pub async fn verify(&self) -> ChannelResult<String> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::Connection(sanitize_for_log(&e.to_string())))?;

        if !resp.status().is_success() {
            let err = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Auth(format!("Invalid bot token: {err}")));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;

        Ok(data
            .get("result")
            .and_then(|r| r.get("username"))
            .and_then(|u| u.as_str())
            .unwrap_or("unknown")
            .to_string())
    }

    /// Point Telegram at our webhook URL.
    pub async fn set_webhook(&self, url: &str) -> ChannelResult<()> {
        let body = serde_json::json!({
            "url": url,
            "allowed_updates": ["message"]
        });

        let resp = self
            .client
            .post(self.api_url("setWebhook"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Connection(sanitize_for_log(&e.to_string())))?;

        if !resp.status().is_success() {
            let err = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed(format!("setWebhook failed: {err}")));
        }

        tracing::info!("Telegram webhook registered");
        Ok(())
    }
}

#[async_trait]
impl ReplySink for TelegramChannel {
    async fn reply(&self, chat_id: ChatId, text: &str) -> ChannelResult<()> {
        let body = serde_json::json!({
            "chat_id": chat_id.0,
            "text": text
        });

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Connection(sanitize_for_log(&e.to_string())))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let error_text = resp.text().await.unwrap_or_default();
        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = serde_json::from_str::<serde_json::Value>(&error_text)
                    .ok()
                    .and_then(|v| v.pointer("/parameters/retry_after").and_then(|r| r.as_u64()))
                    .unwrap_or(1);
                Err(ChannelError::RateLimited { retry_after_secs })
            }
            StatusCode::UNAUTHORIZED => Err(ChannelError::Auth(error_text)),
            _ => Err(ChannelError::SendFailed(format!(
                "sendMessage returned {status}: {error_text}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn telegram_api_url() {
        let ch = TelegramChannel::new("123:ABC".into());
        assert_eq!(
            ch.api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[test]
    fn custom_api_base_trailing_slash() {
        let ch = TelegramChannel::with_api_base("t".into(), "http://localhost:8081/");
        assert_eq!(ch.api_url("sendMessage"), "http://localhost:8081/bott/sendMessage");
    }

    #[tokio::test]
    async fn reply_posts_send_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendMessage"))
            .and(body_json(json!({"chat_id": 42, "text": "hello"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let ch = TelegramChannel::with_api_base("123:ABC".into(), server.uri());
        ch.reply(ChatId(42), "hello").await.unwrap();
    }

    #[tokio::test]
    async fn reply_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendMessage"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "ok": false,
                "error_code": 429,
                "parameters": {"retry_after": 7}
            })))
            .mount(&server)
            .await;

        let ch = TelegramChannel::with_api_base("123:ABC".into(), server.uri());
        let err = ch.reply(ChatId(42), "hello").await.unwrap_err();
        assert!(matches!(err, ChannelError::RateLimited { retry_after_secs: 7 }));
    }

    #[tokio::test]
    async fn reply_gives_up_on_a_hung_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendMessage"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": true}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let ch = TelegramChannel::with_api_base("123:ABC".into(), server.uri())
            .with_timeout(Duration::from_millis(200));
        let err = ch.reply(ChatId(42), "hello").await.unwrap_err();
        assert!(matches!(err, ChannelError::Connection(_)));
    }

    #[tokio::test]
    async fn verify_returns_username() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bot123:ABC/getMe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": {"id": 1, "is_bot": true, "username": "relay_bot"}
            })))
            .mount(&server)
            .await;

        let ch = TelegramChannel::with_api_base("123:ABC".into(), server.uri());
        assert_eq!(ch.verify().await.unwrap(), "relay_bot");
    }

    #[tokio::test]
    async fn set_webhook_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/setWebhook"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad url"))
            .mount(&server)
            .await;

        let ch = TelegramChannel::with_api_base("123:ABC".into(), server.uri());
        let err = ch.set_webhook("not-a-url").await.unwrap_err();
        assert!(matches!(err, ChannelError::SendFailed(_)));
    }
}
