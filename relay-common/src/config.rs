//! Configuration management for the relay services.
//!
//! The relay reads a single configuration file at `~/.relay/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `TELEGRAM_BOT_TOKEN` → telegram.bot_token
//! - `WEBHOOK_SECRET_TOKEN` → telegram.webhook_secret
//! - `RELAY_BIND_ADDRESS` → network.bind
//! - `RELAY_PORT` → network.port
//! - `RELAY_LOG_LEVEL` → observability.log_level
//! - `RELAY_LOG_FORMAT` → observability.log_format
//! - `OPENAI_BASE_URL` → completion.base_url
//! - `OPENAI_MODEL` → completion.model
//! - `RELAY_SESSION_EXPIRY_MINUTES` → session.expiry_minutes

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".relay"),
        |dirs| dirs.home_dir().join(".relay"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Network Configuration
// ============================================================================

/// Listener configuration.
///
/// Default bind is `127.0.0.1` (local only); put the relay behind a reverse
/// proxy or set `0.0.0.0` to receive Telegram webhooks directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_address")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Public URL used when registering the webhook with Telegram.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_port(),
            public_url: None,
        }
    }
}

// ============================================================================
// Telegram Configuration
// ============================================================================

/// Telegram Bot API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token issued by BotFather
    #[serde(default)]
    pub bot_token: Option<String>,

    /// Secret path segment expected on `/webhook/telegram/:token`
    #[serde(default)]
    pub webhook_secret: Option<String>,

    /// Bot API base URL (overridable for tests and self-hosted API servers)
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,

    /// Per-request timeout for Bot API calls, in seconds
    #[serde(default = "default_telegram_timeout")]
    pub timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            webhook_secret: None,
            api_base: default_telegram_api_base(),
            timeout_secs: default_telegram_timeout(),
        }
    }
}

// ============================================================================
// Completion Configuration
// ============================================================================

/// Chat completion endpoint settings.
///
/// The API key is never configured here: each chat supplies its own
/// credential at the start of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_base_url")]
    pub base_url: String,

    #[serde(default = "default_completion_model")]
    pub model: String,

    /// Fixed instruction prepended to every request
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default)]
    pub max_tokens: Option<i64>,

    #[serde(default)]
    pub temperature: Option<f64>,

    #[serde(default = "default_completion_timeout")]
    pub timeout_secs: u64,

    /// Maximum number of history turns sent per request (unbounded when unset).
    /// The stored history itself is never truncated.
    #[serde(default)]
    pub history_limit: Option<usize>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_completion_base_url(),
            model: default_completion_model(),
            system_prompt: default_system_prompt(),
            max_tokens: None,
            temperature: None,
            timeout_secs: default_completion_timeout(),
            history_limit: None,
        }
    }
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Conversation session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which a session is treated as gone
    #[serde(default = "default_expiry_minutes")]
    pub expiry_minutes: u64,

    /// How often expired sessions are reclaimed from memory
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_minutes: default_expiry_minutes(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub completion: CompletionConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration (default path or explicit override) with environment overrides.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply process environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(token);
        }
        if let Some(secret) = lookup("WEBHOOK_SECRET_TOKEN") {
            self.telegram.webhook_secret = Some(secret);
        }

        if let Some(bind) = lookup("RELAY_BIND_ADDRESS") {
            self.network.bind = bind;
        }
        if let Some(port) = lookup("RELAY_PORT") {
            if let Ok(p) = port.parse() {
                self.network.port = p;
            }
        }

        if let Some(level) = lookup("RELAY_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("RELAY_LOG_FORMAT") {
            self.observability.log_format = format;
        }

        if let Some(url) = lookup("OPENAI_BASE_URL") {
            self.completion.base_url = url;
        }
        if let Some(model) = lookup("OPENAI_MODEL") {
            self.completion.model = model;
        }

        if let Some(minutes) = lookup("RELAY_SESSION_EXPIRY_MINUTES") {
            if let Ok(m) = minutes.parse() {
                self.session.expiry_minutes = m;
            }
        }
    }

    // =========================================================================
    // Convenience accessors
    // =========================================================================

    /// Bot token, treating an empty string as unset.
    pub fn telegram_bot_token(&self) -> Option<&str> {
        self.telegram
            .bot_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
    }

    /// Webhook secret, treating an empty string as unset.
    pub fn webhook_secret(&self) -> Option<&str> {
        self.telegram
            .webhook_secret
            .as_deref()
            .filter(|t| !t.trim().is_empty())
    }

    pub fn telegram_configured(&self) -> bool {
        self.telegram_bot_token().is_some()
    }

    /// Socket address string for the HTTP listener.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.bind, self.network.port)
    }

    pub fn session_expiry(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.session.expiry_minutes.saturating_mul(60))
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    4431
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".into()
}

fn default_telegram_timeout() -> u64 {
    30
}

fn default_completion_base_url() -> String {
    "https://api.openai.com".into()
}

fn default_completion_model() -> String {
    "gpt-4o-mini".into()
}

/// System instruction used when none is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant talking to a user through Telegram. \
     Keep answers concise and use plain text or simple Markdown.";

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.into()
}

fn default_completion_timeout() -> u64 {
    120
}

fn default_expiry_minutes() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}
