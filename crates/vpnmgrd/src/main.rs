//! vpnmgrd - VPN interface manager daemon
//!
//! Binds VPN interfaces as their dependencies appear and ages out learned
//! MAC entries. Learned entries are fed through [`MacEntryCache::learn`]
//! by the adjacency source; removing an interface withdraws its entries.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vpnmgr_common::{DeferMetrics, DependencyCoordinator, MemoryDataStore};
use vpnmgrd::{
    MacEntryCache, VpnInterface, VpnInterfaceHandler, VpnInterfaceManager, VpnMgrConfig, DEFAULT_CONFIG_PATH,
};

/// VPN interface manager
#[derive(Parser, Debug)]
#[command(name = "vpnmgrd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level, overrides the configuration file (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match VpnMgrConfig::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("vpnmgrd: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level);

    info!("--- Starting vpnmgrd ---");

    match run(config).await {
        Ok(()) => {
            info!("vpnmgrd exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = format!("{:#}", e), "vpnmgrd failed");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();
}

async fn run(config: VpnMgrConfig) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;

    let store = Arc::new(MemoryDataStore::new());
    let metrics = DeferMetrics::new().context("failed to register metrics")?;
    let handler = Arc::new(VpnInterfaceHandler::new(store.clone()));
    let coordinator = DependencyCoordinator::<VpnInterface>::new(
        config.defer.clone(),
        store.clone(),
        handler.clone(),
        metrics,
    )
    .context("failed to create dependency coordinator")?;
    coordinator.start();

    let cache = Arc::new(MacEntryCache::new(
        store.clone(),
        config.entry_ttl(),
        config.reaper_tick(),
    ));
    let manager = Arc::new(
        VpnInterfaceManager::new(coordinator.clone(), handler, store).with_mac_cache(cache.clone()),
    );

    let shutdown = CancellationToken::new();
    let manager_task = {
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { manager.run(shutdown).await })
    };
    let reaper_task = {
        let cache = Arc::clone(&cache);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { cache.run_reaper(shutdown).await })
    };

    info!("vpnmgrd initialization complete");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    shutdown.cancel();
    reaper_task.await.context("MAC entry reaper panicked")?;
    let manager_result = manager_task.await.context("interface manager panicked")?;
    coordinator.shutdown().await;
    manager_result.context("interface manager failed")?;

    let metrics = coordinator.metrics();
    info!(
        deferred = metrics.events_deferred_total.get(),
        dispatched = metrics.events_dispatched_total.get(),
        expired = metrics.events_expired_total.get(),
        "Dependency coordinator totals"
    );
    Ok(())
}
