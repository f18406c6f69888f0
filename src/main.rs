//! CodePush server -- deployment management REST service.
//!
//! Configuration is the YAML file (if any) overlaid with the process
//! environment.  A failed Key Vault fetch at startup exits non-zero before
//! the listener is bound.

use clap::Parser;
use tracing::info;

use codepush_server::config::{load_config, Config};
use codepush_server::telemetry;
use codepush_server::vault::KeyVaultConnector;

/// Command-line arguments for the CodePush server.
#[derive(Parser, Debug)]
#[command(name = "codepush-server", version, about = "CodePush deployment server")]
struct Cli {
    /// Path to a YAML configuration file.  Environment variables override it.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,

    /// Use in-memory storage regardless of the configuration.
    #[arg(long)]
    local_storage: bool,
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    config.apply_env(|name| std::env::var(name).ok());
    if cli.local_storage {
        config.storage.use_local_storage = true;
    }

    init_tracing(&config);
    if let Some(path) = &cli.config {
        info!("Loaded configuration from {}", path);
    }

    if config.observability.metrics {
        telemetry::init_metrics();
        telemetry::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    let service = codepush_server::startup::start(config, &KeyVaultConnector).await?;

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("CodePush server listening on {}", bind_addr);

    axum::serve(listener, service.router.clone())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    info!("CodePush server shut down");

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
