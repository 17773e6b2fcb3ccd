//! Per-trader lifecycle
//!
//! Each trader owns one scan task and one drawdown-monitor task. The stop
//! signal is a broadcast channel: in-flight I/O completes, no new decisions
//! are executed, caches are cleared on the way out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::exchange::Exchange;
use crate::grid::GridEngine;
use crate::market::MarketData;
use crate::models::{DecisionRecord, StrategyKind, TraderConfig};
use crate::oracle::{OracleClient, TradingContext};
use crate::store::Store;

use super::candidates::{select_candidates, ExternalPools};
use super::decisions::{execute_decision, sort_decisions};
use super::monitor::{run_drawdown_check, PeakPnlCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraderStatus {
    Idle,
    Running,
    Stopped,
}

pub struct AutoTrader {
    pub config: TraderConfig,
    exchange: Arc<dyn Exchange>,
    market: Arc<MarketData>,
    oracle: Option<Arc<OracleClient>>,
    store: Store,
    peak_cache: Arc<PeakPnlCache>,
    pools: Arc<RwLock<ExternalPools>>,
    grid_engine: Option<Arc<GridEngine>>,
    status: Mutex<TraderStatus>,
    stop_tx: broadcast::Sender<()>,
    monitor_interval: Duration,
}

impl AutoTrader {
    pub fn new(
        config: TraderConfig,
        exchange: Arc<dyn Exchange>,
        oracle: Option<Arc<OracleClient>>,
        store: Store,
        monitor_interval: Duration,
    ) -> Self {
        let market = Arc::new(MarketData::new(exchange.clone()));
        let grid_engine = match (&config.strategy, &config.grid) {
            (StrategyKind::Grid, Some(grid_config)) => Some(Arc::new(GridEngine::new(
                config.clone(),
                grid_config.clone(),
                exchange.clone(),
                market.clone(),
                oracle.clone(),
                store.clone(),
            ))),
            (StrategyKind::Grid, None) => {
                warn!("{}: grid strategy without grid config, staying idle", config.name);
                None
            }
            _ => None,
        };

        let (stop_tx, _) = broadcast::channel(4);
        Self {
            config,
            exchange,
            market,
            oracle,
            store,
            peak_cache: Arc::new(PeakPnlCache::new()),
            pools: Arc::new(RwLock::new(ExternalPools::default())),
            grid_engine,
            status: Mutex::new(TraderStatus::Idle),
            stop_tx,
            monitor_interval,
        }
    }

    pub fn status(&self) -> TraderStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.status() == TraderStatus::Running
    }

    pub fn set_external_pools(&self, pools: ExternalPools) {
        *self.pools.write() = pools;
    }

    /// Spawn the scan and monitor tasks.
    pub fn start(self: &Arc<Self>) {
        {
            let mut status = self.status.lock();
            if *status == TraderStatus::Running {
                return;
            }
            *status = TraderStatus::Running;
        }
        info!(
            "starting trader {} ({}, every {}s)",
            self.config.name,
            self.config.strategy.as_str(),
            self.config.scan_interval_secs
        );

        let scan = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(scan.config.scan_interval_secs.max(5)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut stop_rx = scan.stop_tx.subscribe();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !scan.is_running() {
                            break;
                        }
                        if let Err(e) = scan.run_scan_cycle().await {
                            error!("{}: scan cycle failed: {}", scan.config.name, e);
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
            info!("{}: scan task drained", scan.config.name);
        });

        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(monitor.monitor_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut stop_rx = monitor.stop_tx.subscribe();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !monitor.is_running() {
                            break;
                        }
                        if let Err(e) =
                            run_drawdown_check(&monitor.exchange, &monitor.peak_cache).await
                        {
                            warn!("{}: drawdown check failed: {}", monitor.config.name, e);
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
            monitor.peak_cache.clear_all();
            info!("{}: monitor task drained", monitor.config.name);
        });
    }

    /// Signal both tasks to drain; in-flight I/O finishes first.
    pub fn stop(&self) {
        *self.status.lock() = TraderStatus::Stopped;
        let _ = self.stop_tx.send(());
        info!("trader {} stopped", self.config.name);
    }

    pub async fn run_scan_cycle(&self) -> Result<()> {
        match self.config.strategy {
            StrategyKind::Grid => {
                if let Some(engine) = &self.grid_engine {
                    engine.run_grid_cycle().await
                } else {
                    Ok(())
                }
            }
            StrategyKind::Directional => self.run_directional_cycle().await,
        }
    }

    async fn run_directional_cycle(&self) -> Result<()> {
        let Some(oracle) = &self.oracle else {
            return Ok(());
        };

        let balance = self.exchange.get_balance().await?;
        let positions = self.exchange.get_positions().await?;

        let mut candidates = {
            let pools = self.pools.read().clone();
            select_candidates(&self.config, &pools)
        };
        // Positions are always in scope for the oracle
        for position in &positions {
            if !candidates.iter().any(|c| c.symbol == position.symbol) {
                candidates.push(crate::oracle::Candidate {
                    symbol: position.symbol.clone(),
                    sources: vec!["position".to_string()],
                    snapshot: None,
                });
            }
        }
        for candidate in candidates.iter_mut() {
            match self.market.snapshot(&candidate.symbol).await {
                Ok(snapshot) => candidate.snapshot = Some(snapshot),
                Err(e) => warn!("snapshot failed for {}: {}", candidate.symbol, e),
            }
        }

        let context = TradingContext {
            trader_name: self.config.name.clone(),
            strategy: "directional".to_string(),
            account: balance,
            positions,
            candidates,
            btc_eth_leverage: self.config.btc_eth_leverage,
            altcoin_leverage: self.config.altcoin_leverage,
            strategy_state: serde_json::Value::Null,
            system_prompt: self.config.system_prompt_template.clone(),
        };

        let outcome = oracle.decide(&context).await?;
        let decisions = sort_decisions(outcome.decisions.clone());

        let mut actions = Vec::with_capacity(decisions.len());
        for decision in &decisions {
            // The stop signal aborts the remainder of the list
            if !self.is_running() {
                warn!("{}: stopped mid-cycle, aborting remaining decisions", self.config.name);
                break;
            }
            actions.push(execute_decision(&self.config, &self.exchange, &self.store, decision).await);
        }

        let record = DecisionRecord {
            id: None,
            trader_id: self.config.id,
            strategy: "directional".to_string(),
            context_json: serde_json::to_string(&context)?,
            cot_trace: outcome.cot_trace,
            raw_response: outcome.raw_response,
            decisions_json: serde_json::to_string(&decisions)?,
            actions_json: serde_json::to_string(&actions)?,
            created_at: Utc::now(),
        };
        self.store.log_decision(&record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use crate::models::StrategyKind;

    #[tokio::test]
    async fn lifecycle_transitions() {
        let mock = Arc::new(MockExchange::new("mock"));
        let exchange: Arc<dyn Exchange> = mock;
        let store = Store::open_in_memory().unwrap();
        let trader = Arc::new(AutoTrader::new(
            TraderConfig {
                id: 1,
                name: "t".to_string(),
                exchange_id: "mock".to_string(),
                strategy: StrategyKind::Directional,
                scan_interval_secs: 3600,
                btc_eth_leverage: 10,
                altcoin_leverage: 5,
                is_cross_margin: true,
                system_prompt_template: String::new(),
                default_coins: vec![],
                trading_coins: vec![],
                grid: None,
            },
            exchange,
            None,
            store,
            Duration::from_secs(3600),
        ));

        assert_eq!(trader.status(), TraderStatus::Idle);
        trader.start();
        assert_eq!(trader.status(), TraderStatus::Running);
        // Idempotent start
        trader.start();
        assert_eq!(trader.status(), TraderStatus::Running);
        trader.stop();
        assert_eq!(trader.status(), TraderStatus::Stopped);
    }

    #[tokio::test]
    async fn directional_cycle_without_oracle_is_a_noop() {
        let mock = Arc::new(MockExchange::new("mock"));
        let exchange: Arc<dyn Exchange> = mock;
        let store = Store::open_in_memory().unwrap();
        let trader = AutoTrader::new(
            TraderConfig {
                id: 1,
                name: "t".to_string(),
                exchange_id: "mock".to_string(),
                strategy: StrategyKind::Directional,
                scan_interval_secs: 60,
                btc_eth_leverage: 10,
                altcoin_leverage: 5,
                is_cross_margin: true,
                system_prompt_template: String::new(),
                default_coins: vec!["BTCUSDT".to_string()],
                trading_coins: vec![],
                grid: None,
            },
            exchange,
            None,
            store,
            Duration::from_secs(15),
        );
        trader.run_scan_cycle().await.unwrap();
    }
}
