//! grpc-fanout - main entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use grpc_fanout::{BackendPool, ProxyConfig, TableDirector, metrics, proxy};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "grpc-fanout")]
#[command(about = "Schema-agnostic gRPC reverse proxy with fan-out/fan-in multiplexing", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override listen port
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting grpc-fanout proxy");

    // Load configuration
    let mut config = ProxyConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.listen_port = port;
    }

    config.validate()?;

    tracing::info!(
        listen_port = config.listen_port,
        backends = config.backends.len(),
        routes = config.routes.len(),
        exposed = config.expose.len(),
        "Configuration loaded"
    );

    // Setup metrics
    if let Some(port) = config.metrics_port {
        metrics::setup_metrics(SocketAddr::from(([0, 0, 0, 0], port)))?;
    }

    // Resolve the routing table once at startup
    let pool = BackendPool::new(&config);
    let director = Arc::new(TableDirector::new(&config, pool));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    proxy::server::serve(addr, &config, director, shutdown_signal())
        .await
        .context("Proxy server error")?;

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
