//! AutoTrader orchestration

pub mod autotrader;
pub mod candidates;
pub mod decisions;
pub mod monitor;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::exchange::AdapterRegistry;
use crate::models::Config;
use crate::oracle::OracleClient;
use crate::store::Store;
use crate::sync;

pub use autotrader::{AutoTrader, TraderStatus};
pub use candidates::ExternalPools;
pub use monitor::PeakPnlCache;

/// Builds, reconciles and runs every enabled trader.
pub struct TraderManager {
    store: Store,
    registry: Arc<AdapterRegistry>,
    oracle: Option<Arc<OracleClient>>,
    monitor_interval: Duration,
    traders: Mutex<Vec<Arc<AutoTrader>>>,
}

impl TraderManager {
    pub fn new(
        store: Store,
        registry: Arc<AdapterRegistry>,
        oracle: Option<Arc<OracleClient>>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            registry,
            oracle,
            monitor_interval: Duration::from_secs(config.monitor_interval_secs.max(5)),
            traders: Mutex::new(Vec::new()),
        }
    }

    /// One startup-reconciliation pass for every enabled trader, without
    /// starting any trading task.
    pub async fn reconcile_all(&self) -> Result<usize> {
        let configs = self.store.list_traders()?;
        let mut reconciled = 0;
        for config in configs {
            let adapter = match self
                .registry
                .get_or_create(config.id, &config.exchange_id)
                .await
            {
                Ok(adapter) => adapter,
                Err(e) => {
                    error!("trader {}: adapter init failed: {}", config.name, e);
                    continue;
                }
            };
            match sync::startup_reconcile(&self.store, config.id, &adapter).await {
                Ok(()) => reconciled += 1,
                Err(e) => error!("trader {}: reconciliation failed: {}", config.name, e),
            }
        }
        Ok(reconciled)
    }

    /// Startup reconciliation first, then the scan/monitor tasks.
    pub async fn start_all(&self) -> Result<usize> {
        let configs = self.store.list_traders()?;
        let mut started = 0;

        for config in configs {
            let adapter = match self
                .registry
                .get_or_create(config.id, &config.exchange_id)
                .await
            {
                Ok(adapter) => adapter,
                Err(e) => {
                    error!("trader {}: adapter init failed: {}", config.name, e);
                    continue;
                }
            };

            if let Err(e) = sync::startup_reconcile(&self.store, config.id, &adapter).await {
                error!("trader {}: startup reconciliation failed: {}", config.name, e);
            }

            let trader = Arc::new(AutoTrader::new(
                config,
                adapter,
                self.oracle.clone(),
                self.store.clone(),
                self.monitor_interval,
            ));
            trader.start();
            self.traders.lock().push(trader);
            started += 1;
        }

        info!("{} traders started", started);
        Ok(started)
    }

    pub fn stop_all(&self) {
        for trader in self.traders.lock().iter() {
            trader.stop();
        }
    }

    pub fn running_count(&self) -> usize {
        self.traders
            .lock()
            .iter()
            .filter(|t| t.is_running())
            .count()
    }
}
