//! PerpBot - autonomous perpetual-futures trading engine
//!
//! Wires the process together: store, decision-oracle client, adapter
//! registry, reconciliation workers and the per-trader orchestrators.
//! Ctrl-C broadcasts stop; in-flight I/O completes before exit.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use perpbot_backend::exchange::AdapterRegistry;
use perpbot_backend::models::Config;
use perpbot_backend::oracle::OracleClient;
use perpbot_backend::store::Store;
use perpbot_backend::sync::SyncManager;
use perpbot_backend::trader::TraderManager;

/// Idle adapters are evicted after this long without use
const ADAPTER_IDLE_TTL: Duration = Duration::from_secs(3600);

#[derive(Parser, Debug)]
#[command(name = "perpbot", about = "Autonomous perpetual-futures trading engine")]
struct Args {
    /// Override DATABASE_PATH
    #[arg(long)]
    database: Option<String>,

    /// Run startup reconciliation and exit without trading
    #[arg(long)]
    reconcile_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "info,perpbot_backend=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(database) = args.database {
        config.database_path = database;
    }

    info!("perpbot starting (db: {})", config.database_path);

    let store = Store::open(&config.database_path)?;
    let registry = Arc::new(AdapterRegistry::new(ADAPTER_IDLE_TTL));

    let oracle = if config.oracle_url.is_empty() {
        warn!("ORACLE_URL empty, traders will scan without decisions");
        None
    } else {
        Some(Arc::new(OracleClient::new(
            &config.oracle_url,
            config.oracle_api_key.clone(),
        )))
    };

    let manager = Arc::new(TraderManager::new(
        store.clone(),
        registry.clone(),
        oracle,
        &config,
    ));

    if args.reconcile_only {
        let reconciled = manager.reconcile_all().await?;
        info!("reconciliation pass complete for {} traders, exiting", reconciled);
        return Ok(());
    }

    let sync_manager = Arc::new(SyncManager::new(store, registry, &config));
    sync_manager.start();

    let started = manager.start_all().await?;
    if started == 0 {
        warn!("no enabled traders found; the process will idle until stopped");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received, draining");

    manager.stop_all();
    sync_manager.stop();

    // Give in-flight I/O a moment to complete
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("perpbot stopped ({} traders were running)", manager.running_count());
    Ok(())
}
