//! Relay Server Application
//!
//! Accepts producers and listeners over WebSocket and relays audio frames
//! between them.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_relay::{config::AppConfig, server::RelayServer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting audio relay");

    let mut config = AppConfig::load_or_default()?;
    if let Some(port) = std::env::args().nth(1) {
        config.server.port = port.parse()?;
    }

    tracing::info!(
        "Heartbeat every {:?}, idle connections dropped after {:?}",
        config.server.heartbeat_interval(),
        config.server.idle_timeout()
    );

    RelayServer::new(config.server).run().await?;
    Ok(())
}
