//! Voice relay client
//!
//! Press Enter to start a conversation and Enter again to stop it.
//! `talk --devices` lists audio devices.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_relay::{audio::list_devices, client::ClientDriver, config::AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let arg = std::env::args().nth(1);

    if arg.as_deref() == Some("--devices") {
        println!("\n=== Available Audio Devices ===");
        for device in list_devices() {
            let device_type = if device.is_input { "Input" } else { "Output" };
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("  {} ({}){}", device.name, device_type, default_marker);
        }
        println!();
        return Ok(());
    }

    let mut config = AppConfig::load(None)?;
    if let Some(url) = arg {
        config.client.server_url = url;
    }

    println!("Relay: {}", config.client.server_url);
    println!("Press Enter to start or stop talking, Ctrl-D to quit.");

    let (toggle_tx, toggle_rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            if toggle_tx.send(()).await.is_err() {
                break;
            }
        }
    });

    ClientDriver::new(config.client).run(toggle_rx).await?;
    Ok(())
}
