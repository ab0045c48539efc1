use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use relay_supervisor::{
    AlwaysReady, ContainerGate, DependencyGate, FileStatusSink, SupervisorHandle, SupervisorParts,
    TokioLauncher, spawn_supervisor,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod config;
mod db;
mod handlers;
mod metrics;
mod models;
mod monitor;
mod repository;
#[cfg(test)]
mod test_helpers;
mod ws;

use crate::config::{FileConfig, RadioConfig, initial_relay_config, load_config};
use crate::db::Database;
use crate::metrics::ServerMetrics;
use crate::repository::ChatRepository;
use crate::ws::GatewayHandle;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HOST: &str = "127.0.0.1";

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
#[command(name = "radio")]
#[command(about = "Radio station server: encoder supervision and live listener chat")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.radiocity)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground
    Server(ServerArgs),

    /// Show the encoder status written by a running server
    Monitor(MonitorArgs),
}

#[derive(Parser)]
struct ServerArgs {
    /// Port for the web server (default: [server] port, then 8080)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (default: [server] host, then 127.0.0.1)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct MonitorArgs {
    /// Re-read the status file every N seconds
    #[arg(short, long)]
    watch: Option<u64>,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    pub db: Arc<Database>,
    pub supervisor: SupervisorHandle,
    pub gateway: GatewayHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = RadioConfig::new(cli.data_dir.clone())?;

    match cli.command {
        Commands::Monitor(args) => monitor::monitor_command(&config, args.watch, args.json).await,
        Commands::Server(args) => run_server(args, config).await,
    }
}

async fn run_server(args: ServerArgs, config: RadioConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "radio=debug,relay_supervisor=debug,tower_http=debug,info"
    } else {
        "radio=info,relay_supervisor=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Radio City");

    let file_config: FileConfig = load_config(&config)
        .extract()
        .context("Invalid configuration")?;
    let config = Arc::new(config);

    // Initialize database
    info!("Initializing database...");
    let db = Arc::new(Database::new(&config).await?);
    let repository = ChatRepository::new(db.pool.clone());

    // Warm the chat history from the last retention window
    let gateway_settings = file_config.gateway.to_settings();
    let since = chrono::Utc::now()
        - chrono::Duration::from_std(gateway_settings.history_retention)
            .unwrap_or(chrono::Duration::zero());
    let seed = match repository
        .chat_messages_since(since, gateway_settings.max_history_messages as i64)
        .await
    {
        Ok(messages) => messages,
        Err(e) => {
            warn!("Starting with empty chat history: {:#}", e);
            Vec::new()
        }
    };
    info!("Restored {} chat messages", seed.len());

    let metrics = Arc::new(ServerMetrics::new());
    let gateway = ws::spawn_gateway(
        gateway_settings,
        metrics.clone(),
        Some(repository),
        seed,
    );

    // Encoder supervisor
    let relay_config = initial_relay_config(&file_config, &config)?;
    let gate: Arc<dyn DependencyGate> = match &file_config.supervisor.relay_container {
        Some(container) => {
            info!("Encoder spawns gated on container '{}'", container);
            Arc::new(ContainerGate::new(container.clone()))
        }
        None => Arc::new(AlwaysReady),
    };
    let parts = SupervisorParts::new(
        Arc::new(TokioLauncher),
        gate,
        Arc::new(FileStatusSink::new(config.status_path())),
    );
    let supervisor = spawn_supervisor(
        relay_config,
        file_config
            .supervisor
            .to_settings(config.relay_config_path()),
        parts,
    );

    if file_config.supervisor.autostart {
        info!("Autostarting encoder");
        if let Err(e) = supervisor.start().await {
            warn!("Encoder autostart did not begin: {}", e);
        }
    }

    let app_state = AppState {
        metrics,
        db,
        supervisor: supervisor.clone(),
        gateway,
    };

    // Build routes
    let app = Router::new()
        // Encoder control surface
        .route("/api/encoder/start", post(handlers::start_encoder_handler))
        .route("/api/encoder/stop", post(handlers::stop_encoder_handler))
        .route("/api/encoder/restart", post(handlers::restart_encoder_handler))
        .route("/api/encoder/status", get(handlers::encoder_status_handler))
        .route(
            "/api/encoder/config",
            get(handlers::get_encoder_config_handler).patch(handlers::patch_encoder_config_handler),
        )
        // Realtime gateway
        .route("/api/ws", get(handlers::listener_websocket_handler))
        .route("/api/listeners", get(handlers::listeners_handler))
        // Health and metrics
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let host = args
        .host
        .or(file_config.server.host)
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = args.port.or(file_config.server.port).unwrap_or(DEFAULT_PORT);
    let addr = format!("{}:{}", host, port).parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Radio City listening on http://{}", actual_addr);
    info!("Data directory: {}", config.data_dir.display());
    info!("API endpoints:");
    info!("  POST   /api/encoder/start    - Start the encoder");
    info!("  POST   /api/encoder/stop     - Stop the encoder");
    info!("  POST   /api/encoder/restart  - Restart the encoder");
    info!("  GET    /api/encoder/status   - Encoder status record");
    info!("  PATCH  /api/encoder/config   - Update encoder settings");
    info!("  GET    /api/ws               - Listener WebSocket");

    // Create shutdown signal handler
    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received shutdown signal, cleaning up...");
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    info!("Stopping encoder...");
    supervisor.shutdown().await;

    info!("Shutdown complete");
    server_result
}
