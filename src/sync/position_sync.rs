//! Position reconciliation
//!
//! Local OPEN positions that no longer exist on the venue were closed
//! externally. The closer is found in the venue's closed-PnL records
//! (symbol + side, entry within 2%); failing that, the position is closed
//! at the current market price with PnL computed from our entry.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::exchange::Exchange;
use crate::models::{ClosedPnlRecord, Position, PositionSide};
use crate::store::Store;

/// Entry-price tolerance when matching a closed-PnL record
const ENTRY_MATCH_TOLERANCE: f64 = 0.02;
const CLOSED_PNL_LOOKBACK_HOURS: i64 = 24;

const QTY_EPSILON: f64 = 1e-9;

pub async fn run_position_sync_pass(
    store: &Store,
    trader_id: i64,
    adapter: &Arc<dyn Exchange>,
) -> Result<usize> {
    let local = store.get_open_positions(trader_id)?;
    if local.is_empty() {
        return Ok(0);
    }

    let venue = adapter.get_positions().await?;
    let venue_sizes: HashMap<(String, PositionSide), f64> = venue
        .iter()
        .map(|p| ((p.symbol.clone(), p.side), p.quantity))
        .collect();

    // Closed-PnL records are fetched lazily, once per pass
    let mut closed_records: Option<Vec<ClosedPnlRecord>> = None;
    let mut closed = 0;

    for position in local {
        let venue_qty = venue_sizes
            .get(&(position.symbol.clone(), position.side))
            .copied()
            .unwrap_or(0.0);
        if venue_qty > QTY_EPSILON {
            continue;
        }

        if closed_records.is_none() {
            let since = Utc::now() - ChronoDuration::hours(CLOSED_PNL_LOOKBACK_HOURS);
            closed_records = Some(match adapter.get_closed_pnl(since, 200).await {
                Ok(records) => records,
                Err(e) => {
                    debug!("closed pnl fetch failed, using market fallback: {}", e);
                    Vec::new()
                }
            });
        }

        close_missing_position(
            store,
            adapter,
            &position,
            closed_records.as_deref().unwrap_or(&[]),
        )
        .await?;
        closed += 1;
    }
    Ok(closed)
}

/// Find the venue's own story for this close, or fall back to market price.
pub async fn close_missing_position(
    store: &Store,
    adapter: &Arc<dyn Exchange>,
    position: &Position,
    closed_records: &[ClosedPnlRecord],
) -> Result<()> {
    let matched = closed_records.iter().find(|record| {
        record.symbol == position.symbol
            && record.side == position.side
            && position.entry_price > 0.0
            && ((record.entry_price - position.entry_price) / position.entry_price).abs()
                < ENTRY_MATCH_TOLERANCE
    });

    match matched {
        Some(record) => {
            info!(
                "position {} {} {:?} closed externally: exit {:.4}, pnl {:.4} ({})",
                position.id.unwrap_or(0),
                position.symbol,
                position.side,
                record.exit_price,
                record.realized_pnl,
                record.close_type
            );
            store.close_position(
                position.id.unwrap_or(0),
                record.exit_price,
                record.closed_at,
                record.realized_pnl,
                record.fee,
                &record.close_type,
                record.exchange_trade_id.as_deref(),
            )?;
        }
        None => {
            let mark = adapter
                .get_market_price(&position.symbol)
                .await
                .unwrap_or(position.entry_price);
            let realized = match position.side {
                PositionSide::Long => (mark - position.entry_price) * position.quantity,
                PositionSide::Short => (position.entry_price - mark) * position.quantity,
            };
            warn!(
                "position {} {} {:?} gone from venue with no closed record, closing at mark {:.4}",
                position.id.unwrap_or(0),
                position.symbol,
                position.side,
                mark
            );
            store.close_position(
                position.id.unwrap_or(0),
                mark,
                Utc::now(),
                realized,
                0.0,
                "external",
                None,
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use crate::models::PositionSource;

    fn open_local(store: &Store, symbol: &str, entry: f64) -> Position {
        let mut position = Position::open(
            1,
            "mock",
            symbol,
            PositionSide::Long,
            0.5,
            entry,
            10,
            PositionSource::Trade,
        );
        let id = store.create_open_position(&position).unwrap();
        position.id = Some(id);
        position
    }

    #[tokio::test]
    async fn missing_position_closed_with_matching_record() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new("mock"));
        mock.set_price("ETHUSDT", 3_100.0);
        open_local(&store, "ETHUSDT", 3_000.0);

        mock.state.lock().closed_pnl.push(ClosedPnlRecord {
            exchange_id: "mock".to_string(),
            exchange_trade_id: Some("c1".to_string()),
            symbol: "ETHUSDT".to_string(),
            side: PositionSide::Long,
            quantity: 0.5,
            entry_price: 3_010.0, // within 2% of 3000
            exit_price: 3_100.0,
            realized_pnl: 50.0,
            fee: 0.5,
            close_type: "manual".to_string(),
            closed_at: Utc::now(),
        });

        let adapter: Arc<dyn Exchange> = mock;
        assert_eq!(run_position_sync_pass(&store, 1, &adapter).await.unwrap(), 1);

        assert!(store.get_open_positions(1).unwrap().is_empty());
        let last_closed = store.get_last_closed_time(1).unwrap();
        assert!(last_closed.is_some());
    }

    #[tokio::test]
    async fn missing_position_falls_back_to_market_price() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new("mock"));
        mock.set_price("ETHUSDT", 2_900.0);
        open_local(&store, "ETHUSDT", 3_000.0);

        let adapter: Arc<dyn Exchange> = mock;
        assert_eq!(run_position_sync_pass(&store, 1, &adapter).await.unwrap(), 1);
        assert!(store.get_open_positions(1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn live_position_untouched() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new("mock"));
        mock.set_price("ETHUSDT", 3_000.0);
        open_local(&store, "ETHUSDT", 3_000.0);
        mock.set_position("ETHUSDT", PositionSide::Long, 0.5, 3_000.0);

        let adapter: Arc<dyn Exchange> = mock;
        assert_eq!(run_position_sync_pass(&store, 1, &adapter).await.unwrap(), 0);
        assert_eq!(store.get_open_positions(1).unwrap().len(), 1);
    }
}
