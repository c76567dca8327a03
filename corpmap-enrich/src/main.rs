//! corpmap-enrich - progressive company enrichment service
//!
//! Serves `GET /enrich/:domain` (SSE), `GET /session/:session_id` and
//! `GET /health`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use corpmap_common::config;
use corpmap_enrich::db::{init_database_pool, spawn_session_janitor};
use corpmap_enrich::AppState;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for corpmap-enrich
#[derive(Parser, Debug)]
#[command(name = "corpmap-enrich")]
#[command(about = "Progressive company enrichment service")]
#[command(version)]
struct Args {
    /// Config file (default: CORPMAP_CONFIG, then ~/.config/corpmap/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Folder holding corpmap.db
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// HTTP bind address, e.g. 127.0.0.1:5780
    #[arg(short, long)]
    bind: Option<String>,

    /// Keep sessions and cache in memory only
    #[arg(long)]
    no_database: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let toml = config::load_or_default(args.config.as_deref())
        .context("Failed to load configuration")?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&toml.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting corpmap-enrich");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let pool = if args.no_database {
        info!("Database disabled, sessions and cache are in-memory only");
        None
    } else {
        let root_folder = config::resolve_root_folder(args.root_folder.as_deref(), &toml);
        let db_path = config::ensure_root_folder(&root_folder)
            .context("Failed to initialize root folder")?;
        info!("Database: {}", db_path.display());
        Some(
            init_database_pool(&db_path)
                .await
                .context("Failed to open database")?,
        )
    };

    let orchestrator = corpmap_enrich::config::build_orchestrator(&toml, pool)
        .context("Failed to build enrichment pipeline")?;
    let shutdown = orchestrator.shutdown_token();

    let janitor = spawn_session_janitor(
        orchestrator.session_store(),
        Duration::from_secs(toml.orchestrator.purge_interval_secs.max(1)),
        shutdown.clone(),
    );

    let state = AppState::new(
        orchestrator,
        Duration::from_secs(toml.server.heartbeat_secs.max(1)),
    );
    let app = corpmap_enrich::build_router(state);

    let bind = config::resolve_bind(args.bind.as_deref(), &toml);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;
    info!("Listening on http://{}", bind);
    info!("Health check: http://{}/health", bind);

    // Cancelling ends running sessions so their streams close
    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            stop.cancel();
        })
        .await
        .context("Server error")?;

    let _ = janitor.await;

    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
