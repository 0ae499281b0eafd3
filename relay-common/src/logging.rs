//! Tracing subscriber setup.
//!
//! `RUST_LOG`, when set, wins over the configured level. Otherwise the
//! configured level applies to the relay's own crates while HTTP and TLS
//! plumbing is held at `warn`, since a webhook server otherwise logs every
//! connection.

use std::str::FromStr;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Crates whose logs are capped at `warn` unless `RUST_LOG` says otherwise.
pub const QUIET_CRATES: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "tower_http", "axum"];

/// Log output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, colored
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}', expected 'pretty' or 'json'")),
        }
    }
}

fn directives(level: &str) -> String {
    QUIET_CRATES
        .iter()
        .fold(level.to_string(), |acc, krate| format!("{acc},{krate}=warn"))
}

/// Install the global subscriber. Later calls are no-ops.
///
/// An unknown `format` falls back to pretty output.
pub fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives(level)));
    let format = format.parse().unwrap_or(LogFormat::Pretty);

    let installed = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init(),
    };

    if installed.is_ok() {
        tracing::info!(level = %level, format = ?format, "Logging initialized");
    }
}

/// Fresh id for correlating the log lines of one inbound update.
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
