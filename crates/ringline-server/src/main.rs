//! # Ringline Server
//!
//! Realtime call signaling server: presence, call setup and relay of
//! session descriptions between peers.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! ringline
//!
//! # Run with custom config
//! ringline --config /path/to/ringline.toml
//!
//! # Override single settings through the environment
//! RINGLINE__PORT=8080 RINGLINE__PRESENCE__GRACE_PERIOD_MS=20000 ringline
//!
//! # Show the effective configuration
//! ringline --print-config
//! ```

mod audit;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ringline", version, about = "Realtime call signaling server")]
struct Args {
    /// Configuration file; defaults to the first of ./ringline.toml,
    /// /etc/ringline/ringline.toml and ~/.config/ringline/ringline.toml.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ringline=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load(args.config.as_deref())?;
    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tracing::info!("Starting Ringline server on {}:{}", config.host, config.port);

    if config.metrics.enabled {
        metrics::init_metrics();
    }

    handlers::run_server(config).await
}
