//! Server initialization
//!
//! Contains the main `run()` function that starts the HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Extension;
use herald_core::Supervisor;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::config::AppConfig;
use crate::api;

/// Run the server
pub async fn run(config: AppConfig) -> Result<()> {
    if config.auth.enabled && config.auth.api_key.is_none() {
        anyhow::bail!("auth.enabled is set but auth.api_key is not configured");
    }
    if !config.auth.enabled {
        warn!("API key authentication is disabled");
    }

    tokio::fs::create_dir_all(&config.engine.base_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create session directory {}",
                config.engine.base_dir.display()
            )
        })?;
    info!(
        base_dir = %config.engine.base_dir.display(),
        client = %config.engine.client_bin,
        "session engine ready"
    );

    let supervisor = Arc::new(Supervisor::new(config.engine.engine_config()));
    let auth = Arc::new(config.auth.clone());

    let app = api::api_router()
        .layer(Extension(supervisor))
        .layer(Extension(auth))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Herald shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl-C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
