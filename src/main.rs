//! Chartist entry point

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chartist::api;
use chartist::config::AppConfig;
use chartist::engine::{Engine, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;
    info!(config = %config.digest(), "🚀 Chartist starting");
    if config.bot.live_trading && !config.has_credentials() {
        info!("Live trading requested without credentials, running paper-only");
    }

    let shared = Arc::new(SharedState::new());

    if config.api.enabled {
        let api_shared = shared.clone();
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = api::serve(api_shared, port).await {
                error!(error = %e, "Inspection API failed");
            }
        });
    }

    Engine::new(config, shared).run().await
}
