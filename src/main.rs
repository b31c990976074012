//! slackgpt entry point.

use anyhow::Context as _;
use clap::Parser;
use slackgpt::agent::Relay;
use slackgpt::config::Config;
use slackgpt::llm::OpenAiClient;
use slackgpt::messaging::{ChatPlatformDyn, SlackAdapter};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "slackgpt")]
#[command(about = "Relays Slack conversations to a language model")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // slack-morphism's hyper connector needs a process-wide rustls provider.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    tracing::info!(
        default_model = %config.llm.default_model,
        history_limit = config.relay.history_limit,
        "configuration loaded"
    );

    let openai = Arc::new(OpenAiClient::new(&config.llm).context("failed to build OpenAI client")?);
    let slack: Arc<dyn ChatPlatformDyn> = Arc::new(
        SlackAdapter::new(&config.slack.bot_token, &config.slack.app_token)
            .context("failed to build slack adapter")?,
    );

    let relay = Arc::new(
        Relay::from_config(&config, slack.clone(), openai.clone(), openai)
            .context("failed to build relay")?,
    );

    let events = slack
        .start()
        .await
        .context("failed to start slack adapter")?;
    tracing::info!(platform = slack.name(), "slackgpt started");

    let shutdown = CancellationToken::new();
    let mut relay_task = tokio::spawn(relay.run(events, shutdown.clone()));

    tokio::select! {
        _ = &mut relay_task => {
            tracing::info!("relay ended");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            shutdown.cancel();
            if let Err(error) = relay_task.await {
                tracing::error!(%error, "relay task failed");
            }
        }
    }

    if let Err(error) = slack.shutdown().await {
        tracing::warn!(%error, "slack adapter shutdown failed");
    }

    tracing::info!("slackgpt stopped");
    Ok(())
}
