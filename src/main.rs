//! Herald - WhatsApp HTTP Gateway
//!
//! CLI entry point for the herald server.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod middleware;
mod server;

/// Multi-tenant HTTP gateway for a CLI-driven WhatsApp messaging client.
#[derive(Debug, Parser)]
#[command(name = "herald", version)]
struct Cli {
    /// Override the configured listen host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the session state directory.
    #[arg(long)]
    base_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=info,herald_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = server::load_config()?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(base_dir) = cli.base_dir {
        config.engine.base_dir = base_dir;
    }

    info!("Starting Herald v{}", env!("CARGO_PKG_VERSION"));
    server::run(config).await
}
