//! Netwarden Server
//!
//! Runs the connection warden as a standalone server with stand-in game
//! hooks. Config comes from the environment; see `ServerConfig::from_env`.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use netwarden::{ServerConfig, WardenServer, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();
    info!("Netwarden v{}", VERSION);
    info!("Bind: {}", config.bind_addr);
    info!("Advertised address: {}", config.protocol.advertised_addr);
    info!(
        "Minimum compat version: {}",
        config.protocol.min_compat_version
    );

    let server = WardenServer::new(config);
    server.run().await.context("server terminated")?;

    Ok(())
}
