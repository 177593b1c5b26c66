//! # banter server
//!
//! Topic-based realtime messaging over WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! banter
//!
//! # Run with a config file in the working directory
//! # (banter.toml, /etc/banter/banter.toml, ~/.config/banter/banter.toml)
//!
//! # Run with environment variables
//! BANTER_PORT=7070 BANTER_HOST=0.0.0.0 banter
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "banter=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting banter on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
