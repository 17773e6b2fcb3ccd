//! Order status reconciliation
//!
//! Polls every pending local order against its venue. Filled closes get a
//! realized PnL computed from the local entry; a status query that keeps
//! failing past the grace window is assumed filled with conservative values
//! (the order's own price).

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::exchange::{AdapterRegistry, Exchange};
use crate::models::{Order, OrderStatus, PositionSide};
use crate::store::Store;

/// A NEW order whose status cannot be fetched for this long is assumed
/// filled.
pub const ORDER_GRACE_SECS: i64 = 300;

pub async fn run_order_sync_pass(store: &Store, registry: &AdapterRegistry) -> Result<usize> {
    let pending = store.get_all_pending_orders()?;
    if pending.is_empty() {
        return Ok(0);
    }
    debug!("order sync: {} pending orders", pending.len());

    let mut resolved = 0;
    for order in pending {
        let adapter = match registry
            .get_or_create(order.trader_id, &order.exchange_id)
            .await
        {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("order sync: no adapter for trader {}: {}", order.trader_id, e);
                continue;
            }
        };
        if sync_one_order(store, &adapter, &order).await? {
            resolved += 1;
        }
    }
    Ok(resolved)
}

/// Returns true when the order reached a terminal state this pass.
pub async fn sync_one_order(
    store: &Store,
    adapter: &Arc<dyn Exchange>,
    order: &Order,
) -> Result<bool> {
    let order_id = order.id.unwrap_or(0);

    match adapter
        .get_order_status(&order.symbol, &order.exchange_order_id)
        .await
    {
        Ok(info) => match info.status {
            OrderStatus::Filled => {
                let avg_price = if info.avg_price > 0.0 {
                    info.avg_price
                } else {
                    order.price
                };
                let executed = if info.executed_qty > 0.0 {
                    info.executed_qty
                } else {
                    order.quantity
                };
                let realized = realized_pnl_for_close(store, order, avg_price, executed);
                store.update_order_execution(
                    order_id,
                    OrderStatus::Filled,
                    avg_price,
                    executed,
                    info.commission,
                    realized,
                    Some(Utc::now()),
                )?;
                info!(
                    "order {} filled: {} {} @ {:.4} (pnl {:.4})",
                    order.exchange_order_id, order.symbol, executed, avg_price, realized
                );
                Ok(true)
            }
            OrderStatus::PartiallyFilled => {
                store.update_order_execution(
                    order_id,
                    OrderStatus::PartiallyFilled,
                    info.avg_price,
                    info.executed_qty,
                    info.commission,
                    0.0,
                    None,
                )?;
                Ok(false)
            }
            OrderStatus::Canceled | OrderStatus::Expired => {
                store.update_order_execution(
                    order_id,
                    info.status,
                    info.avg_price,
                    info.executed_qty,
                    info.commission,
                    0.0,
                    None,
                )?;
                Ok(true)
            }
            OrderStatus::New => Ok(false),
        },
        Err(e) => {
            let age = Utc::now() - order.created_at;
            if age > ChronoDuration::seconds(ORDER_GRACE_SECS) {
                // Conservative assumption: the order executed at its own
                // price; the trade-history sync corrects the details later.
                warn!(
                    "order {} status unavailable for {}s ({}), assuming filled",
                    order.exchange_order_id,
                    age.num_seconds(),
                    e
                );
                let realized = realized_pnl_for_close(store, order, order.price, order.quantity);
                store.update_order_execution(
                    order_id,
                    OrderStatus::Filled,
                    order.price,
                    order.quantity,
                    0.0,
                    realized,
                    Some(Utc::now()),
                )?;
                Ok(true)
            } else {
                debug!("order {} status query failed, will retry: {}", order.exchange_order_id, e);
                Ok(false)
            }
        }
    }
}

/// Realized PnL of a closing order: (exit - entry) * qty, signed by side.
/// Opens realize nothing.
fn realized_pnl_for_close(store: &Store, order: &Order, exit_price: f64, quantity: f64) -> f64 {
    if !order.is_close() {
        return 0.0;
    }
    let side = match order.action {
        crate::models::DecisionAction::CloseLong => PositionSide::Long,
        _ => PositionSide::Short,
    };
    // Entry comes from the matching local position (open or just closed)
    let entry = store
        .get_open_by_symbol_side(order.trader_id, &order.symbol, side)
        .ok()
        .flatten()
        .map(|p| p.entry_price)
        .unwrap_or(order.price);

    match side {
        PositionSide::Long => (exit_price - entry) * quantity,
        PositionSide::Short => (entry - exit_price) * quantity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use crate::exchange::OrderStatusInfo;
    use crate::models::{DecisionAction, Position, PositionSource};

    fn pending_order(store: &Store, action: DecisionAction, exchange_order_id: &str) -> Order {
        let order = Order::new_intent(
            1,
            "mock",
            exchange_order_id,
            "BTCUSDT",
            action,
            0.1,
            50_000.0,
            10,
        );
        let id = store.create_order(&order).unwrap();
        let mut order = order;
        order.id = Some(id);
        order
    }

    #[tokio::test]
    async fn filled_close_computes_realized_pnl() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new("mock"));

        // Open long at 49000 exists locally
        store
            .create_open_position(&Position::open(
                1,
                "mock",
                "BTCUSDT",
                PositionSide::Long,
                0.1,
                49_000.0,
                10,
                PositionSource::Trade,
            ))
            .unwrap();

        let order = pending_order(&store, DecisionAction::CloseLong, "x1");
        mock.state.lock().order_statuses.insert(
            "x1".to_string(),
            OrderStatusInfo {
                status: OrderStatus::Filled,
                avg_price: 50_000.0,
                executed_qty: 0.1,
                commission: 0.05,
            },
        );

        let adapter: Arc<dyn Exchange> = mock;
        assert!(sync_one_order(&store, &adapter, &order).await.unwrap());

        let synced = store
            .get_order_by_exchange_id(1, "mock", "x1")
            .unwrap()
            .unwrap();
        assert_eq!(synced.status, OrderStatus::Filled);
        assert!((synced.realized_pnl - 100.0).abs() < 1e-6);
        assert!((synced.commission - 0.05).abs() < 1e-9);
        assert!(synced.filled_at.is_some());
        assert!(store.get_all_pending_orders().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_unqueryable_order_assumed_filled() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new("mock"));
        // No status entry in the mock: every query fails

        let mut order = pending_order(&store, DecisionAction::OpenLong, "x2");
        order.created_at = Utc::now() - ChronoDuration::seconds(ORDER_GRACE_SECS + 60);

        let adapter: Arc<dyn Exchange> = mock;
        assert!(sync_one_order(&store, &adapter, &order).await.unwrap());

        let synced = store
            .get_order_by_exchange_id(1, "mock", "x2")
            .unwrap()
            .unwrap();
        assert_eq!(synced.status, OrderStatus::Filled);
        assert!((synced.avg_price - 50_000.0).abs() < 1e-9);
        assert!((synced.executed_qty - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn young_unqueryable_order_stays_pending() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new("mock"));
        let order = pending_order(&store, DecisionAction::OpenLong, "x3");

        let adapter: Arc<dyn Exchange> = mock;
        assert!(!sync_one_order(&store, &adapter, &order).await.unwrap());
        assert_eq!(store.get_all_pending_orders().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_order_is_terminal() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new("mock"));
        let order = pending_order(&store, DecisionAction::OpenLong, "x4");
        mock.state.lock().order_statuses.insert(
            "x4".to_string(),
            OrderStatusInfo {
                status: OrderStatus::Canceled,
                avg_price: 0.0,
                executed_qty: 0.0,
                commission: 0.0,
            },
        );
        let adapter: Arc<dyn Exchange> = mock;
        assert!(sync_one_order(&store, &adapter, &order).await.unwrap());
        assert!(store.get_all_pending_orders().unwrap().is_empty());
    }
}
