//! Reconciliation workers
//!
//! Three background loops per process (order sync, position sync, trade
//! history sync), each on its own cadence, all watching one broadcast stop
//! channel and draining cleanly. Startup reconciliation ingests externally
//! opened positions and replays recent trade history before the traders
//! start scanning.

pub mod order_sync;
pub mod position_builder;
pub mod position_sync;
pub mod trade_sync;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{info, warn};

use crate::exchange::{AdapterRegistry, Exchange};
use crate::models::{Config, Position, PositionSource};
use crate::store::Store;

pub use position_builder::PositionBuilder;

/// Ingest venue positions with no local mirror as `source=sync`, then run
/// one trade-history pass from the last closed exit (clamped to 30 days).
pub async fn startup_reconcile(
    store: &Store,
    trader_id: i64,
    adapter: &Arc<dyn Exchange>,
) -> Result<()> {
    let venue_positions = adapter.get_positions().await?;
    let mut ingested = 0;

    for venue_position in venue_positions {
        let existing = store.get_open_by_symbol_side(
            trader_id,
            &venue_position.symbol,
            venue_position.side,
        )?;
        if existing.is_some() {
            continue;
        }
        let position = Position::open(
            trader_id,
            adapter.exchange_id(),
            &venue_position.symbol,
            venue_position.side,
            venue_position.quantity,
            venue_position.entry_price,
            venue_position.leverage,
            PositionSource::Sync,
        );
        store.create_open_position(&position)?;
        ingested += 1;
        info!(
            "startup: ingested external {} {:?} qty {:.6} @ {:.4}",
            venue_position.symbol,
            venue_position.side,
            venue_position.quantity,
            venue_position.entry_price
        );
    }
    if ingested > 0 {
        info!("startup: {} external positions ingested for trader {}", ingested, trader_id);
    }

    let since = trade_sync::history_sync_start(store, trader_id);
    trade_sync::run_trade_sync_pass(store, trader_id, adapter, since).await?;
    Ok(())
}

/// Owns the three reconciliation tasks.
pub struct SyncManager {
    store: Store,
    registry: Arc<AdapterRegistry>,
    order_interval: Duration,
    position_interval: Duration,
    trade_interval: Duration,
    stop_tx: broadcast::Sender<()>,
}

impl SyncManager {
    pub fn new(store: Store, registry: Arc<AdapterRegistry>, config: &Config) -> Self {
        let (stop_tx, _) = broadcast::channel(4);
        Self {
            store,
            registry,
            order_interval: Duration::from_secs(config.order_sync_interval_secs.max(5)),
            position_interval: Duration::from_secs(config.position_sync_interval_secs.max(5)),
            trade_interval: Duration::from_secs(config.trade_sync_interval_secs.max(30)),
            stop_tx,
        }
    }

    pub fn start(self: &Arc<Self>) {
        info!(
            "sync workers starting (orders {}s, positions {}s, trades {}s)",
            self.order_interval.as_secs(),
            self.position_interval.as_secs(),
            self.trade_interval.as_secs()
        );

        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(manager.order_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut stop_rx = manager.stop_tx.subscribe();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) =
                            order_sync::run_order_sync_pass(&manager.store, &manager.registry).await
                        {
                            warn!("order sync pass failed: {}", e);
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
            info!("order sync drained");
        });

        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(manager.position_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut stop_rx = manager.stop_tx.subscribe();
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.position_pass().await,
                    _ = stop_rx.recv() => break,
                }
            }
            info!("position sync drained");
        });

        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(manager.trade_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut stop_rx = manager.stop_tx.subscribe();
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.trade_pass().await,
                    _ = stop_rx.recv() => break,
                }
            }
            info!("trade sync drained");
        });
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
        self.registry.clear();
        info!("sync workers stopping");
    }

    async fn position_pass(&self) {
        let traders = match self.store.list_traders() {
            Ok(traders) => traders,
            Err(e) => {
                warn!("position sync: trader list failed: {}", e);
                return;
            }
        };
        for trader in traders {
            let adapter = match self
                .registry
                .get_or_create(trader.id, &trader.exchange_id)
                .await
            {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!("position sync: no adapter for {}: {}", trader.name, e);
                    continue;
                }
            };
            if let Err(e) =
                position_sync::run_position_sync_pass(&self.store, trader.id, &adapter).await
            {
                warn!("position sync failed for {}: {}", trader.name, e);
            }
        }
    }

    async fn trade_pass(&self) {
        let traders = match self.store.list_traders() {
            Ok(traders) => traders,
            Err(e) => {
                warn!("trade sync: trader list failed: {}", e);
                return;
            }
        };
        for trader in traders {
            let adapter = match self
                .registry
                .get_or_create(trader.id, &trader.exchange_id)
                .await
            {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!("trade sync: no adapter for {}: {}", trader.name, e);
                    continue;
                }
            };
            let since = trade_sync::history_sync_start(&self.store, trader.id);
            if let Err(e) =
                trade_sync::run_trade_sync_pass(&self.store, trader.id, &adapter, since).await
            {
                warn!("trade sync failed for {}: {}", trader.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use crate::exchange::{OrderSide, PositionInfo, TradeRecord};
    use crate::models::PositionSide;
    use chrono::{Duration as ChronoDuration, Utc};

    #[tokio::test]
    async fn startup_ingests_external_position_and_history() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new("mock"));
        mock.state.lock().positions.push(PositionInfo {
            symbol: "ETHUSDT".to_string(),
            side: PositionSide::Long,
            quantity: 0.5,
            entry_price: 3000.0,
            mark_price: 3000.0,
            unrealized_profit: 0.0,
            leverage: 5,
            liquidation_price: 0.0,
        });

        let adapter: Arc<dyn Exchange> = mock.clone();
        startup_reconcile(&store, 1, &adapter).await.unwrap();

        let open = store
            .get_open_by_symbol_side(1, "ETHUSDT", PositionSide::Long)
            .unwrap()
            .unwrap();
        assert_eq!(open.source, crate::models::PositionSource::Sync);
        assert!((open.quantity - 0.5).abs() < 1e-9);

        // A later history sync pulls the closing trade and closes it
        mock.state.lock().positions.clear();
        mock.state.lock().trades.push(TradeRecord {
            exchange_trade_id: "c1".to_string(),
            exchange_order_id: "o1".to_string(),
            symbol: "ETHUSDT".to_string(),
            side: OrderSide::Sell,
            position_side: None,
            order_action: None,
            price: 3100.0,
            quantity: 0.5,
            commission: 0.1,
            realized_pnl: 50.0,
            executed_at: Utc::now(),
        });
        let since = Utc::now() - ChronoDuration::hours(1);
        trade_sync::run_trade_sync_pass(&store, 1, &adapter, since)
            .await
            .unwrap();

        assert!(store
            .get_open_by_symbol_side(1, "ETHUSDT", PositionSide::Long)
            .unwrap()
            .is_none());
        // The closed row carries the venue's realized PnL
        assert!(store.get_last_closed_time(1).unwrap().is_some());

        // Running startup again ingests nothing new
        startup_reconcile(&store, 1, &adapter).await.unwrap();
        assert_eq!(store.count_fills().unwrap(), 1);
    }
}
