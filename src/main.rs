//! aztables-emulator: in-memory Table service for local development.
//!
//! Speaks the Table REST protocol, including entity group transactions,
//! on the port Azurite uses for tables. State lives in memory and is lost
//! on exit.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aztables::config::{load_config, Config};
use aztables::emulator::{self, EmulatorState};

/// Command-line arguments for the emulator.
#[derive(Parser, Debug)]
#[command(
    name = "aztables-emulator",
    version,
    about = "In-memory Azure Table service emulator"
)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,

    /// Require Shared Key authentication on every request.
    #[arg(long)]
    require_auth: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path).with_context(|| format!("loading config from {path}"))?,
        None => Config::default(),
    };
    if cli.require_auth {
        config.emulator.require_auth = true;
    }

    init_tracing(&config.logging.level, &config.logging.format);
    match &cli.config {
        Some(path) => info!("Configuration loaded from {}", path),
        None => info!("No configuration file given, using defaults"),
    }

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.emulator.host, config.emulator.port));

    let metrics_enabled = config.observability.metrics && aztables::metrics::init_metrics().is_some();
    if metrics_enabled {
        aztables::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let shutdown_timeout = Duration::from_secs(config.emulator.shutdown_timeout);
    info!(
        "Emulator initialized: account={} require_auth={} max_batch_operations={}",
        config.emulator.account, config.emulator.require_auth, config.emulator.max_batch_operations
    );
    let state = Arc::new(EmulatorState::new(config.emulator)?);
    let app = emulator::app(state, metrics_enabled);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!("aztables-emulator listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_timeout))
        .await?;

    info!("aztables-emulator shut down");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGTERM or SIGINT, then return to trigger graceful shutdown.
/// In-flight requests get `timeout` to finish before the process exits.
async fn shutdown_signal(timeout: Duration) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }

    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        warn!("Shutdown timeout of {:?} elapsed, exiting", timeout);
        std::process::exit(1);
    });
}
