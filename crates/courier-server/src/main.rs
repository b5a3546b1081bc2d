//! # Courier Server
//!
//! Realtime messaging hub. Runs either as the client-facing gateway or as the
//! peer hub inside the chat service.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! courier
//!
//! # Run with a specific config file
//! COURIER_CONFIG=/path/to/courier.toml courier
//!
//! # Override the bind address
//! COURIER_PORT=8080 COURIER_HOST=0.0.0.0 courier
//! ```

mod auth;
mod config;
mod handlers;
mod metrics;
mod store;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "courier_server=debug,courier_core=debug,courier_transport=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Courier server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
            }
            shutdown.cancel();
        }
    });

    handlers::run_server(config, shutdown).await?;

    Ok(())
}
