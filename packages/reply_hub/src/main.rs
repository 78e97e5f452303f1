use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod config;
mod db;
mod error;
mod generation;
mod handlers;
mod hub;
mod metrics;
mod models;
mod repository;
mod streaming;
#[cfg(test)]
mod test_helpers;
mod ws;

use crate::config::{DataDirConfig, FileConfig, GenerationConfig, HubConfig};
use crate::db::Database;
use crate::generation::{Generator, OllamaGenerator};
use crate::hub::StreamHub;
use crate::metrics::ServerMetrics;
use crate::repository::{MessageRepository, MessageStore};

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "reply-hub")]
#[command(about = "Real-time streaming hub for assistant replies")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.reply_hub)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground (the default)
    Server(ServerArgs),

    /// Print the merged configuration as TOML
    Config,

    /// Delete the message database
    ResetDb(ResetDbArgs),
}

#[derive(Parser, Default)]
struct ServerArgs {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct ResetDbArgs {
    /// Skip confirmation prompt
    #[arg(short, long)]
    force: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub hub: Arc<StreamHub>,
    pub db: Arc<Database>,
    pub metrics: Arc<ServerMetrics>,
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/ws", get(handlers::stream_websocket_handler))
        .route("/api/metrics", get(handlers::metrics_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => run_server(ServerArgs::default(), cli.data_dir).await,
        Some(Commands::Server(args)) => run_server(args, cli.data_dir).await,
        Some(Commands::Config) => print_config(cli.data_dir),
        Some(Commands::ResetDb(args)) => reset_db(args, cli.data_dir),
    }
}

fn load_file_config(dirs: &DataDirConfig) -> Result<FileConfig> {
    config::load_config(&dirs.data_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {:?}", dirs.config_toml_path()))
}

fn print_config(data_dir: Option<PathBuf>) -> Result<()> {
    let dirs = DataDirConfig::new(data_dir)?;
    let file_config = load_file_config(&dirs)?;
    let rendered = toml::to_string_pretty(&file_config).context("Failed to render config")?;
    println!("# {}", dirs.config_toml_path().display());
    print!("{rendered}");
    Ok(())
}

fn reset_db(args: ResetDbArgs, data_dir: Option<PathBuf>) -> Result<()> {
    let dirs = DataDirConfig::new(data_dir)?;
    if !dirs.db_path.exists() {
        println!("No database at {}", dirs.db_path.display());
        return Ok(());
    }

    if !args.force {
        println!("This will delete all stored messages!");
        print!("Are you sure? (yes/no): ");
        use std::io::{self, Write};
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if input.trim() != "yes" {
            println!("Cancelled.");
            return Ok(());
        }
    }

    dirs.reset_database()?;
    println!("Database reset.");
    Ok(())
}

async fn run_server(args: ServerArgs, data_dir: Option<PathBuf>) -> Result<()> {
    let default_directive = if args.debug {
        "reply_hub=debug,tower_http=debug,info"
    } else {
        "reply_hub=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting reply hub");

    let dirs = DataDirConfig::new(data_dir)?;
    let mut file_config = load_file_config(&dirs)?;
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }

    info!("Initializing database...");
    let db = Arc::new(Database::new(&dirs).await?);
    let store: Arc<dyn MessageStore> = Arc::new(MessageRepository::new(db.pool.clone()));

    let generation_config = GenerationConfig::from_file(&file_config.generation);
    info!(
        endpoint = %generation_config.endpoint,
        model = %generation_config.model,
        "Generation backend configured"
    );
    let generator: Arc<dyn Generator> = Arc::new(OllamaGenerator::new(&generation_config)?);

    let hub_config = HubConfig::from_file(&file_config.stream);
    info!(
        "Stream config: outbound_queue={}, generation_timeout={:?}",
        hub_config.outbound_queue_capacity, hub_config.generation_timeout
    );

    let metrics = Arc::new(ServerMetrics::new());
    let hub = Arc::new(StreamHub::new(
        store,
        generator,
        hub_config,
        Arc::clone(&metrics),
    ));

    let app = build_router(AppState {
        hub: Arc::clone(&hub),
        db,
        metrics,
    });

    let addr = file_config.server.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let actual_addr = listener.local_addr()?;

    info!("Reply hub listening on http://{}", actual_addr);
    info!("  GET /api/ws        - Streaming WebSocket");
    info!("  GET /api/metrics   - Server metrics");
    info!("  GET /health        - Health summary");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    info!(
        "Shutdown complete ({} sessions still in flight)",
        hub.sessions().len()
    );
    server_result
}
