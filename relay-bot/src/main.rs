//! Relay Bot - Main entry point.

use anyhow::{bail, Result};
use clap::Parser;
use relay_bot::{start_server, TelegramChannel};
use relay_common::config::Config;
use relay_common::logging::init_logging;
use std::path::PathBuf;

/// Telegram webhook bot that relays conversations to a chat completion API.
#[derive(Parser, Debug)]
#[command(name = "relay-bot")]
#[command(version)]
#[command(about = "Telegram webhook bot backed by a chat completion API", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.relay/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Register `<URL>/webhook/telegram/<secret>` with Telegram, then exit.
    /// Without a value, `network.public_url` is used.
    #[arg(long, value_name = "URL", num_args = 0..=1, default_missing_value = "")]
    set_webhook: Option<String>,

    /// Validate the configuration, then exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_and_validate(cli.config.as_deref())?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    if cli.check_config {
        println!("Configuration OK (listening on {})", config.listen_address());
        if !config.telegram_configured() {
            println!("warning: TELEGRAM_BOT_TOKEN is not set");
        }
        if config.webhook_secret().is_none() {
            println!("warning: WEBHOOK_SECRET_TOKEN is not set");
        }
        return Ok(());
    }

    if let Some(url) = cli.set_webhook {
        let base = if url.is_empty() {
            match config.network.public_url.clone() {
                Some(public) => public,
                None => bail!("--set-webhook needs a URL or network.public_url in the config"),
            }
        } else {
            url
        };
        return register_webhook(&config, &base).await;
    }

    tracing::info!("Relay Bot v{}", env!("CARGO_PKG_VERSION"));

    start_server(&config).await
}

async fn register_webhook(config: &Config, base: &str) -> Result<()> {
    let Some(token) = config.telegram_bot_token() else {
        bail!("TELEGRAM_BOT_TOKEN is required to register the webhook");
    };
    let Some(secret) = config.webhook_secret() else {
        bail!("WEBHOOK_SECRET_TOKEN is required to register the webhook");
    };

    let telegram =
        TelegramChannel::with_api_base(token.to_string(), config.telegram.api_base.clone())
            .with_timeout(std::time::Duration::from_secs(config.telegram.timeout_secs));
    let username = telegram.verify().await?;

    let url = format!("{}/webhook/telegram/{secret}", base.trim_end_matches('/'));
    telegram.set_webhook(&url).await?;

    println!("Webhook registered for @{username}");
    Ok(())
}
