//! Coordinator node binary: wires storage, registry, index, relay and the
//! transfer orchestrator together, then serves the coordinator API and the
//! blob server until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tracker_index::ContentIndex;
use tracker_registry::PeerRegistry;
use tracker_relay::SignalRelay;
use tracker_rpc::{start_file_server, start_server, AppState};
use tracker_storage::{SledStorage, Storage};
use tracker_transfer::{TransferConfig, TransferOrchestrator};
use tracker_vault::FileVault;

mod config;

use config::AppConfig;

#[derive(Debug, Parser)]
#[command(name = "tracker-node", about = "P2P file sharing coordinator")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the coordinator API listen address.
    #[arg(long)]
    rpc_addr: Option<String>,

    /// Override the data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the log level filter.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(rpc_addr) = cli.rpc_addr {
        config.rpc_addr = rpc_addr;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }

    init_logging(&config);

    info!(node_id = %config.node_id, "starting coordinator node");

    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("failed to create data directory {}", config.data_dir.display())
    })?;

    let storage: Arc<dyn Storage> =
        Arc::new(SledStorage::new(config.db_path()).context("failed to open database")?);
    let vault = FileVault::new(config.vault_dir());

    let registry = Arc::new(
        PeerRegistry::new(storage.clone(), vault.clone())
            .context("failed to initialize peer registry")?,
    );
    let index = Arc::new(ContentIndex::new(storage));
    let relay = Arc::new(SignalRelay::new());
    let orchestrator = Arc::new(
        TransferOrchestrator::new(
            registry.clone(),
            index.clone(),
            vault.clone(),
            TransferConfig {
                file_port: config.file_port,
                fetch_timeout: config.fetch_timeout(),
            },
        )
        .context("failed to initialize transfer orchestrator")?,
    );

    let state = AppState {
        registry,
        index,
        orchestrator,
        relay,
        node_id: config.node_id.clone(),
        start_time: Instant::now(),
        req_count: Arc::new(AtomicUsize::new(0)),
        transfer_count: Arc::new(AtomicUsize::new(0)),
    };

    let rpc_addr = config.rpc_addr.clone();
    let rpc_handle: JoinHandle<Result<()>> =
        tokio::spawn(async move { start_server(state, &rpc_addr).await });

    let file_addr = config.file_addr.clone();
    let file_vault = vault.clone();
    let file_handle: JoinHandle<Result<()>> =
        tokio::spawn(async move { start_file_server(file_vault, &file_addr).await });

    info!("coordinator API listening on {}", config.rpc_addr);
    info!("blob server listening on {}", config.file_addr);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        result = rpc_handle => {
            report_server_exit("coordinator API", result);
        }
        result = file_handle => {
            report_server_exit("blob server", result);
        }
    }

    info!("coordinator node stopped");
    Ok(())
}

fn report_server_exit(name: &str, result: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => error!("{name} exited unexpectedly"),
        Ok(Err(err)) => error!("{name} failed: {err:#}"),
        Err(err) => error!("{name} task panicked: {err}"),
    }
}

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}
