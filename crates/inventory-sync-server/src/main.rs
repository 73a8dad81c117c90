//! HTTP/SSE server for the inventory synchronization engine.
//!
//! This server:
//! - Polls each authoritative source and keeps the Item Store in sync
//! - Serves items, edit locks, mutations and bulk operations over HTTP
//! - Streams committed changes to connected clients via SSE

use std::sync::Arc;

use anyhow::bail;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use inventory_sync_engine::{HttpRowSource, SyncEngine};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod demo;
mod error;
mod handlers;

use config::Config;
use handlers::{
    acquire_lock_handler, bulk_handler, events_handler, get_item_handler, health_handler,
    list_items_handler, mutation_handler, pending_handler, poll_handler, refresh_handler,
    release_lock_handler, sessions_handler, status_handler, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    info!("Starting inventory-sync-server v{}", env!("CARGO_PKG_VERSION"));
    info!("  Host: {}", config.host);
    info!("  Port: {}", config.port);
    info!("  Poll interval: {}ms", config.poll_interval_ms);
    info!("  Edit TTL: {}s", config.edit_ttl_secs);

    let engine = Arc::new(build_engine(&config)?);
    info!("  Sources: {}", engine.source_names().join(", "));

    let shutdown_rx = create_shutdown_signal();
    let pollers = engine.start(shutdown_rx.clone());

    let state = AppState {
        engine: engine.clone(),
    };

    // Configure CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/items", get(list_items_handler))
        .route("/items/{source}/{local_id}", get(get_item_handler))
        .route(
            "/items/{source}/{local_id}/lock",
            post(acquire_lock_handler).delete(release_lock_handler),
        )
        .route("/mutations", post(mutation_handler))
        .route("/bulk", post(bulk_handler))
        .route("/sessions", get(sessions_handler))
        .route("/pending", get(pending_handler))
        .route("/status", get(status_handler))
        .route("/sources/{source}/refresh", post(refresh_handler))
        .route("/sources/{source}/poll", post(poll_handler))
        .route("/events", get(events_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Bind and serve
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);

    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|&v| v).await;
        })
        .await?;

    for poller in pollers {
        if let Err(e) = poller.await {
            warn!("Poller task ended abnormally: {}", e);
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

fn build_engine(config: &Config) -> anyhow::Result<SyncEngine> {
    let mut builder = SyncEngine::builder(config.engine_config());

    if config.demo {
        info!("  Backend: in-memory demo data");
        let source = Arc::new(demo::demo_source());
        builder = builder
            .source(demo::WAREHOUSE, source.clone())
            .source(demo::SHOP, source);
    } else {
        if config.sources.is_empty() {
            bail!("No source configured: pass --source NAME=URL or --demo");
        }
        if config.row_service_token.is_none() {
            warn!("  Row service token not set, requests are unauthenticated");
        }
        for spec in &config.sources {
            info!("  Backend: {} -> {}", spec.name, spec.url);
            let adapter = HttpRowSource::new(spec.url.clone(), config.row_service_token.clone());
            builder = builder.source(spec.name.clone(), Arc::new(adapter));
        }
    }

    Ok(builder.build()?)
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    warn!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
