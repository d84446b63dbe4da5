//! Parley chat backend (parley-server) - Main entry point
//!
//! Serves the audio WebSocket, message history and live feed, and the
//! OAuth callback over a SQLite store in the root folder.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parley_common::config::{resolve_root_folder, TomlConfig};
use parley_common::db::{init_database, SqliteStore};
use parley_common::events::EventBus;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parley_server::analyzer::GeminiAnalyzer;
use parley_server::exchange::HttpCodeExchange;
use parley_server::{build_router, AppState};

const DATABASE_FILE: &str = "parley.db";

/// Command-line arguments for parley-server
#[derive(Parser, Debug)]
#[command(name = "parley-server")]
#[command(about = "Chat backend for Parley")]
#[command(version)]
struct Args {
    /// Address to listen on (overrides config file)
    #[arg(short, long, env = "PARLEY_BIND_ADDR")]
    bind: Option<String>,

    /// Root folder holding the database
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Config file (defaults to the platform config dir)
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Gemini API key (overrides config file)
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    gemini_api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = TomlConfig::load_or_default(args.config.as_deref());

    let level = &config.log_level;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "parley_server={0},parley_common={0},parley_session={0},tower_http={0}",
                    level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting Parley server (parley-server) v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), &config);
    std::fs::create_dir_all(&root_folder)
        .with_context(|| format!("Failed to create root folder {}", root_folder.display()))?;
    info!("Root folder: {}", root_folder.display());

    let db_path = root_folder.join(DATABASE_FILE);
    let pool = init_database(&db_path)
        .await
        .context("Failed to initialize database")?;
    info!("Database ready at {}", db_path.display());

    let store = Arc::new(SqliteStore::new(pool, EventBus::new(1024)));
    let mut state = AppState::new(store, config.allowed_origin.clone());

    match args.gemini_api_key.or(config.gemini_api_key.clone()) {
        Some(key) if !key.trim().is_empty() => {
            let analyzer = GeminiAnalyzer::new(key, config.gemini_model.clone())
                .context("Failed to build analyzer client")?;
            info!("Audio analysis enabled with model {}", analyzer.model());
            state = state.with_analyzer(Arc::new(analyzer));
        }
        _ => warn!("No Gemini API key configured; audio submissions will be answered with errors"),
    }

    match config.auth_exchange_url.clone() {
        Some(url) => {
            let exchange = HttpCodeExchange::new(url).context("Failed to build code exchange client")?;
            state = state.with_exchange(Arc::new(exchange));
        }
        None => warn!("No auth_exchange_url configured; sign-in callbacks will not merge history"),
    }

    let app = build_router(state);

    let bind_addr = args.bind.unwrap_or_else(|| config.bind_addr.clone());
    info!("Starting HTTP server on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
