//! Voice relay server
//!
//! Accepts WebM/Opus clients over WebSocket and bridges each one to its
//! own live conversational session.

use anyhow::{bail, Result};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_relay::{config::AppConfig, server::RelayServer, session::LiveConnector};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting voice relay");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())?;

    if config.session.api_key.is_none() {
        bail!("GEMINI_API_KEY is not set");
    }

    tracing::info!(
        "Session model {} at {} Hz uplink",
        config.session.model,
        config.session.input_sample_rate
    );
    if let Some(dir) = &config.server.static_dir {
        tracing::info!("Serving static files from {}", dir.display());
    }

    let connector = LiveConnector::new(&config.pipeline);
    RelayServer::new(connector, config).serve().await?;

    Ok(())
}
