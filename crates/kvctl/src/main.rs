//! kvctl control plane service entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use kvctl::{api::HttpApi, config::Config, Controller};

/// kvctl - Control plane for sharded key-value clusters
#[derive(Parser, Debug)]
#[command(name = "kvctl")]
#[command(about = "Topology, failover and slot migration controller")]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP API listen address
    #[arg(long)]
    http_addr: Option<String>,

    /// Data directory for the store journal and snapshots
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(dir) = args.data_dir {
        config.store.data_dir = Some(dir);
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    config.validate()?;

    // Initialize logging
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting kvctl control plane...");
    info!("  HTTP API: {}", config.server.http_addr);
    info!("  Store: {:?}, data dir: {:?}", config.store.backend, config.store.data_dir);
    info!(
        "  Failover: enabled={}, threshold={}",
        config.failover.enabled, config.failover.failure_threshold
    );
    info!("  Migration: enabled={}", config.migration.enabled);

    let http_addr = config.server.http_addr.clone();
    let controller = Arc::new(Controller::new(config).await?);

    // Start background tasks
    let handles = controller.start();

    // Start HTTP API
    let app = HttpApi::new(controller.clone()).router();
    let listener = tokio::net::TcpListener::bind(&http_addr).await?;
    info!("HTTP API listening on {}", http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    for handle in handles {
        handle.abort();
    }
    controller.shutdown().await?;
    info!("kvctl stopped");

    Ok(())
}
