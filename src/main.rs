//! stackgate -- oVirt-compatible REST gateway for Apache CloudStack.
//!
//! Sessions and tokens are held in memory only. SIGTERM/SIGINT stop
//! accepting connections and give in-flight requests the configured
//! shutdown timeout to finish.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the stackgate server.
#[derive(Parser, Debug)]
#[command(
    name = "stackgate",
    version,
    about = "oVirt-compatible REST gateway for Apache CloudStack"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "stackgate.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = stackgate::config::load_config(&cli.config)?;

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    match config.logging.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .clone()
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        stackgate::metrics::init_metrics();
        stackgate::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let state = Arc::new(stackgate::AppState::new(config)?);
    info!("CloudStack backend: {}", state.backend.endpoint());

    let sweeper = state.config.sessions.sweep_interval().map(|interval| {
        info!("Session sweep every {:?}", interval);
        stackgate::session::spawn_sweeper(state.sessions.clone(), state.tokens.clone(), interval)
    });

    let shutdown_timeout = Duration::from_secs(state.config.server.shutdown_timeout);
    let app = stackgate::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("stackgate listening on {}", bind_addr);

    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    };
    tokio::select! {
        result = server => result?,
        _ = async {
            shutdown_signal().await;
            tokio::time::sleep(shutdown_timeout).await;
        } => {
            warn!("Shutdown timeout of {:?} exceeded; exiting", shutdown_timeout);
        }
    }

    if let Some(handle) = sweeper {
        handle.abort();
    }
    info!("stackgate shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
