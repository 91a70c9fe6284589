//! # eventual
//!
//! Realtime CloudEvents broker.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! eventual
//!
//! # Run with a specific config file
//! eventual /path/to/eventual.toml
//!
//! # Run with environment variables
//! EVENTUAL_PORT=8080 EVENTUAL_RPC_PORT=9090 JWT_TOKEN_SECRET=s3cret eventual
//! ```

use anyhow::Result;
use eventual_server::config::{Config, LoggingConfig};
use eventual_server::{handlers, metrics};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    init_tracing(&config.logging);

    tracing::info!(
        "Starting eventual on {}:{} (peer RPC on port {})",
        config.host,
        config.port,
        config.rpc.port
    );

    if config.metrics.enabled {
        metrics::init_metrics();
    }

    handlers::run_server(config).await
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    if logging.timestamps {
        registry.with(fmt::layer()).init();
    } else {
        registry.with(fmt::layer().without_time()).init();
    }
}
