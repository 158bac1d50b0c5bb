//! relaydrop - rendezvous relay server.
//!
//! ```bash
//! relaydrop --port 3001
//! RUST_LOG=relaydrop=debug relaydrop
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relaydrop::config::RelayConfig;
use relaydrop::relay::RelayServer;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = RelayConfig::parse();
    info!(
        max_members = config.max_members,
        room_idle_secs = config.room_idle_secs,
        "Starting relay"
    );

    let server = RelayServer::new(config);
    let listener = server.bind().await.context("failed to start relay")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
        signal_token.cancel();
    });

    server
        .serve(listener, shutdown)
        .await
        .context("relay server failed")?;
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relaydrop=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
