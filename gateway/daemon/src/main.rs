//! Gateway Daemon
//!
//! OpenAI-compatible HTTP server in front of the configured model backends.
//!
//! # Usage
//!
//! ```bash
//! # Start with the default config ($XDG_CONFIG_HOME/model-gateway/gateway.toml)
//! gateway-daemon
//!
//! # Custom config and listen address
//! gateway-daemon --config ./gateway.toml --bind 127.0.0.1:8000
//!
//! # With verbose logging
//! RUST_LOG=debug gateway-daemon
//! ```
//!
//! # Environment Variables
//!
//! - `GATEWAY_CONFIG`: Config file path
//! - `GATEWAY_BIND`: Listen address
//! - `GATEWAY_LOG`: Log level for gateway crates (default: info)
//! - `API_KEY`: Bearer token clients must send (name configurable via `server.api_key_env`)
//! - `RUST_LOG`: Additional log directives
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown

mod server;
mod wire;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use gateway_core::{load_config_from_path, Dispatcher};

use crate::server::AppState;

#[derive(Debug, Parser)]
#[command(name = "gateway-daemon", version, about = "OpenAI-compatible model gateway")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(long, env = "GATEWAY_BIND")]
    bind: Option<String>,

    /// Log level for gateway crates
    #[arg(long, env = "GATEWAY_LOG", default_value = "info")]
    log_level: String,
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("gateway_daemon={}", args.log_level).parse()?)
                .add_directive(format!("gateway_core={}", args.log_level).parse()?),
        )
        .with_target(true)
        .init();

    info!("Starting Gateway Daemon");

    let mut config =
        load_config_from_path(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    info!(source = %config.source, models = config.models.len(), "Configuration loaded");

    let api_key = config.server.resolve_api_key();
    if api_key.is_none() {
        warn!(
            env = %config.server.api_key_env,
            "No API key configured, authentication disabled"
        );
    }

    let dispatcher = Dispatcher::from_config(&config).context("Failed to build backends")?;

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;

    server::serve(listener, AppState::new(dispatcher, api_key), shutdown_signal()).await?;

    info!("Gateway Daemon stopped");
    Ok(())
}
