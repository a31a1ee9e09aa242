//! Real-time WebSocket hub.
//!
//! Accepts HTTP Upgrade requests on configured endpoint paths and keeps one
//! Hub per endpoint that tracks live connections and fans messages out.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Upgrade          ┌──────────────────────────────────────────────────┐
//!     ────────────────────────┼─▶ http server ──▶ endpoint registry ──▶ handshake │
//!                             │                         │                  │       │
//!                             │                         ▼                  ▼       │
//!                             │                       Hub ◀──register── Connection │
//!                             │                        │                 │   │     │
//!     Frames ◀────────────────┼──── writer task ◀─queue┘         reader ─┘   │     │
//!     Frames ─────────────────┼─────────────────────────────────▶ task ──────┘     │
//!                             │                                                    │
//!                             │  config · observability · lifecycle · admin        │
//!                             └──────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use realtime_hub::admin::{setup_admin_router, AdminState};
use realtime_hub::config::{load_config, ServerConfig};
use realtime_hub::lifecycle::{shutdown_on_signal, Shutdown};
use realtime_hub::observability::{logging, metrics};
use realtime_hub::{EndpointRegistry, HttpServer};

#[derive(Parser)]
#[command(name = "realtime-hub", version, about = "WebSocket hub server")]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };

    logging::init(&config.observability.log_level);
    tracing::info!("realtime-hub v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        endpoints = config.endpoints.len(),
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );
    if config.endpoints.is_empty() {
        tracing::warn!("No endpoints configured; every upgrade will be refused");
    }

    if config.observability.metrics_enabled {
        // Address already checked by validation.
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        }
    }

    let registry = Arc::new(EndpointRegistry::from_config(&config.endpoints)?);
    let shutdown = Shutdown::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        let router = setup_admin_router(AdminState {
            registry: registry.clone(),
            api_key: Arc::from(config.admin.api_key.as_str()),
        });
        let signal = shutdown.signalled();
        tracing::info!(address = %listener.local_addr()?, "Admin API listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(signal)
                .await
            {
                tracing::error!(error = %e, "Admin API failed");
            }
        });
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let server = HttpServer::new(&config, registry);
    server.run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
