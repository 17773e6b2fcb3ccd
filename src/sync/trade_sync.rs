//! Trade-history reconciliation
//!
//! Pulls recent venue trades, totally orders them by execution time, skips
//! anything already ingested, and feeds the rest to the PositionBuilder.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info};

use crate::exchange::Exchange;
use crate::store::Store;

use super::position_builder::PositionBuilder;

const HISTORY_WINDOW_DAYS: i64 = 30;
const TRADE_FETCH_LIMIT: usize = 1000;

/// Start of the history window: the last closed exit (clamped to 30 days)
/// minus one minute of overlap.
pub fn history_sync_start(store: &Store, trader_id: i64) -> DateTime<Utc> {
    let floor = Utc::now() - ChronoDuration::days(HISTORY_WINDOW_DAYS);
    let start = store
        .get_last_closed_time(trader_id)
        .ok()
        .flatten()
        .map(|last| last.max(floor))
        .unwrap_or(floor);
    start - ChronoDuration::minutes(1)
}

pub async fn run_trade_sync_pass(
    store: &Store,
    trader_id: i64,
    adapter: &Arc<dyn Exchange>,
    since: DateTime<Utc>,
) -> Result<usize> {
    let mut trades = adapter.get_user_trades(since, TRADE_FETCH_LIMIT).await?;
    if trades.is_empty() {
        return Ok(0);
    }

    // The builder depends on total order per (exchange, account); venues
    // may deliver out of order.
    trades.sort_by_key(|t| t.executed_at);

    let builder = PositionBuilder::new(store, trader_id, adapter.exchange_id());
    let mut ingested = 0;
    for trade in &trades {
        if builder.apply(trade)? {
            ingested += 1;
        }
    }

    if ingested > 0 {
        info!(
            "trade sync: ingested {}/{} trades for trader {}",
            ingested,
            trades.len(),
            trader_id
        );
    } else {
        debug!("trade sync: {} trades, all seen", trades.len());
    }
    Ok(ingested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use crate::exchange::{OrderSide, TradeRecord};
    use crate::models::PositionSide;

    fn trade(trade_id: &str, side: OrderSide, price: f64, pnl: f64, at_secs: i64) -> TradeRecord {
        TradeRecord {
            exchange_trade_id: trade_id.to_string(),
            exchange_order_id: format!("o-{}", trade_id),
            symbol: "ETHUSDT".to_string(),
            side,
            position_side: None,
            order_action: None,
            price,
            quantity: 0.5,
            commission: 0.01,
            realized_pnl: pnl,
            executed_at: Utc::now() - ChronoDuration::seconds(3600 - at_secs),
        }
    }

    #[tokio::test]
    async fn out_of_order_delivery_is_sorted_before_ingest() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new("mock"));
        {
            let mut state = mock.state.lock();
            // Close delivered before the open
            state.trades.push(trade("t2", OrderSide::Sell, 3100.0, 50.0, 100));
            state.trades.push(trade("t1", OrderSide::Buy, 3000.0, 0.0, 10));
        }

        let adapter: Arc<dyn Exchange> = mock;
        let since = Utc::now() - ChronoDuration::hours(2);
        assert_eq!(
            run_trade_sync_pass(&store, 1, &adapter, since).await.unwrap(),
            2
        );

        // The open was applied first, then closed by the later trade
        assert!(store
            .get_open_by_symbol_side(1, "ETHUSDT", PositionSide::Long)
            .unwrap()
            .is_none());
        assert_eq!(store.count_fills().unwrap(), 2);
    }

    #[tokio::test]
    async fn second_pass_ingests_nothing() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new("mock"));
        mock.state
            .lock()
            .trades
            .push(trade("t1", OrderSide::Buy, 3000.0, 0.0, 10));

        let adapter: Arc<dyn Exchange> = mock;
        let since = Utc::now() - ChronoDuration::hours(2);
        assert_eq!(run_trade_sync_pass(&store, 1, &adapter, since).await.unwrap(), 1);
        assert_eq!(run_trade_sync_pass(&store, 1, &adapter, since).await.unwrap(), 0);
        assert_eq!(store.count_fills().unwrap(), 1);
    }

    #[test]
    fn history_window_clamps_to_thirty_days() {
        let store = Store::open_in_memory().unwrap();
        let start = history_sync_start(&store, 1);
        let expected_floor = Utc::now() - ChronoDuration::days(30) - ChronoDuration::minutes(1);
        assert!((start - expected_floor).num_seconds().abs() < 5);
    }
}
