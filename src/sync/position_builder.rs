//! Position reconstruction from fill streams
//!
//! Feeds venue trades (sorted ascending by execution time) into the local
//! mirror while keeping the one-position-per-(trader, symbol, side)
//! invariant. Every trade produces its order, fill and position writes;
//! a trade id seen before is a no-op.

use anyhow::Result;
use tracing::{debug, warn};

use crate::exchange::{OrderSide, TradeRecord};
use crate::models::{
    ClosedPnlRecord, DecisionAction, Fill, Order, OrderStatus, Position, PositionSide,
    PositionSource,
};
use crate::store::Store;

const QTY_EPSILON: f64 = 1e-9;

/// Action inference: the venue's explicit tag wins, then the hedge-mode
/// position side, then the realized-PnL heuristic (a nonzero realized PnL
/// is a closing leg).
pub fn infer_action(trade: &TradeRecord) -> DecisionAction {
    if let Some(action) = trade.order_action {
        return action;
    }
    if let Some(position_side) = trade.position_side {
        return match (trade.side, position_side) {
            (OrderSide::Buy, PositionSide::Long) => DecisionAction::OpenLong,
            (OrderSide::Sell, PositionSide::Long) => DecisionAction::CloseLong,
            (OrderSide::Sell, PositionSide::Short) => DecisionAction::OpenShort,
            (OrderSide::Buy, PositionSide::Short) => DecisionAction::CloseShort,
        };
    }
    if trade.realized_pnl.abs() > QTY_EPSILON {
        match trade.side {
            OrderSide::Sell => DecisionAction::CloseLong,
            OrderSide::Buy => DecisionAction::CloseShort,
        }
    } else {
        match trade.side {
            OrderSide::Buy => DecisionAction::OpenLong,
            OrderSide::Sell => DecisionAction::OpenShort,
        }
    }
}

fn position_side_of(action: DecisionAction) -> PositionSide {
    match action {
        DecisionAction::OpenLong | DecisionAction::CloseLong => PositionSide::Long,
        _ => PositionSide::Short,
    }
}

pub struct PositionBuilder<'a> {
    store: &'a Store,
    trader_id: i64,
    exchange_id: String,
}

impl<'a> PositionBuilder<'a> {
    pub fn new(store: &'a Store, trader_id: i64, exchange_id: &str) -> Self {
        Self {
            store,
            trader_id,
            exchange_id: exchange_id.to_string(),
        }
    }

    /// Ingest one trade. Returns false when the trade id was seen before.
    pub fn apply(&self, trade: &TradeRecord) -> Result<bool> {
        if self
            .store
            .has_fill(&self.exchange_id, &trade.exchange_trade_id)?
        {
            return Ok(false);
        }

        let action = infer_action(trade);
        let side = position_side_of(action);

        // Order mirror: external trades get a FILLED intent row
        let mut order = Order::new_intent(
            self.trader_id,
            &self.exchange_id,
            &trade.exchange_order_id,
            &trade.symbol,
            action,
            trade.quantity,
            trade.price,
            1,
        );
        order.status = OrderStatus::Filled;
        order.avg_price = trade.price;
        order.executed_qty = trade.quantity;
        order.commission = trade.commission;
        order.realized_pnl = trade.realized_pnl;
        order.created_at = trade.executed_at;
        order.filled_at = Some(trade.executed_at);
        self.store.create_order(&order)?;

        let inserted = self.store.create_fill(&Fill {
            id: None,
            trader_id: self.trader_id,
            exchange_id: self.exchange_id.clone(),
            exchange_trade_id: trade.exchange_trade_id.clone(),
            exchange_order_id: trade.exchange_order_id.clone(),
            symbol: trade.symbol.clone(),
            side,
            price: trade.price,
            quantity: trade.quantity,
            commission: trade.commission,
            realized_pnl: trade.realized_pnl,
            executed_at: trade.executed_at,
        })?;
        if !inserted {
            return Ok(false);
        }

        if action.is_open() {
            self.apply_open(trade, side)?;
        } else {
            self.apply_close(trade, side)?;
        }
        Ok(true)
    }

    fn apply_open(&self, trade: &TradeRecord, side: PositionSide) -> Result<()> {
        match self
            .store
            .get_open_by_symbol_side(self.trader_id, &trade.symbol, side)?
        {
            Some(existing) => {
                // Scale in: weighted-average the entry
                let total = existing.quantity + trade.quantity;
                let entry = (existing.entry_price * existing.quantity
                    + trade.price * trade.quantity)
                    / total;
                self.store.update_position_quantity(
                    existing.id.unwrap_or(0),
                    total,
                    entry,
                )?;
                debug!(
                    "scaled into {} {:?}: qty {:.6} entry {:.4}",
                    trade.symbol, side, total, entry
                );
            }
            None => {
                let mut position = Position::open(
                    self.trader_id,
                    &self.exchange_id,
                    &trade.symbol,
                    side,
                    trade.quantity,
                    trade.price,
                    1,
                    PositionSource::Trade,
                );
                position.entry_time = trade.executed_at;
                self.store.create_open_position(&position)?;
            }
        }
        Ok(())
    }

    fn apply_close(&self, trade: &TradeRecord, side: PositionSide) -> Result<()> {
        match self
            .store
            .get_open_by_symbol_side(self.trader_id, &trade.symbol, side)?
        {
            Some(existing) => {
                let remaining = existing.quantity - trade.quantity;
                if remaining > QTY_EPSILON {
                    self.store.update_position_quantity(
                        existing.id.unwrap_or(0),
                        remaining,
                        existing.entry_price,
                    )?;
                } else {
                    self.store.close_position(
                        existing.id.unwrap_or(0),
                        trade.price,
                        trade.executed_at,
                        trade.realized_pnl,
                        trade.commission,
                        "trade",
                        Some(&trade.exchange_trade_id),
                    )?;
                }
            }
            None => {
                // Closing leg with no local open row: the whole lifespan
                // happened off-process. Record one closed row.
                warn!(
                    "close {} {:?} with no open local position, recording closed row",
                    trade.symbol, side
                );
                let entry_price = if trade.quantity > 0.0 {
                    match side {
                        PositionSide::Long => trade.price - trade.realized_pnl / trade.quantity,
                        PositionSide::Short => trade.price + trade.realized_pnl / trade.quantity,
                    }
                } else {
                    trade.price
                };
                self.store.sync_closed_batch(
                    self.trader_id,
                    &[ClosedPnlRecord {
                        exchange_id: self.exchange_id.clone(),
                        exchange_trade_id: Some(trade.exchange_trade_id.clone()),
                        symbol: trade.symbol.clone(),
                        side,
                        quantity: trade.quantity,
                        entry_price,
                        exit_price: trade.price,
                        realized_pnl: trade.realized_pnl,
                        fee: trade.commission,
                        close_type: "trade".to_string(),
                        closed_at: trade.executed_at,
                    }],
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn trade(
        trade_id: &str,
        side: OrderSide,
        qty: f64,
        price: f64,
        realized_pnl: f64,
    ) -> TradeRecord {
        TradeRecord {
            exchange_trade_id: trade_id.to_string(),
            exchange_order_id: format!("o-{}", trade_id),
            symbol: "ETHUSDT".to_string(),
            side,
            position_side: None,
            order_action: None,
            price,
            quantity: qty,
            commission: 0.01,
            realized_pnl,
            executed_at: Utc::now(),
        }
    }

    #[test]
    fn inference_rules() {
        // Explicit action wins
        let mut t = trade("1", OrderSide::Buy, 1.0, 3000.0, 0.0);
        t.order_action = Some(DecisionAction::CloseShort);
        assert_eq!(infer_action(&t), DecisionAction::CloseShort);

        // Hedge-mode position side
        let mut t = trade("2", OrderSide::Sell, 1.0, 3000.0, 0.0);
        t.position_side = Some(PositionSide::Long);
        assert_eq!(infer_action(&t), DecisionAction::CloseLong);

        // Realized PnL implies a close leg
        assert_eq!(
            infer_action(&trade("3", OrderSide::Sell, 1.0, 3000.0, 25.0)),
            DecisionAction::CloseLong
        );
        assert_eq!(
            infer_action(&trade("4", OrderSide::Buy, 1.0, 3000.0, -5.0)),
            DecisionAction::CloseShort
        );
        // No signal at all: an opening leg
        assert_eq!(
            infer_action(&trade("5", OrderSide::Buy, 1.0, 3000.0, 0.0)),
            DecisionAction::OpenLong
        );
    }

    #[test]
    fn open_then_close_builds_one_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let builder = PositionBuilder::new(&store, 1, "mock");

        assert!(builder.apply(&trade("t1", OrderSide::Buy, 0.5, 3000.0, 0.0)).unwrap());
        let open = store
            .get_open_by_symbol_side(1, "ETHUSDT", PositionSide::Long)
            .unwrap()
            .unwrap();
        assert!((open.quantity - 0.5).abs() < 1e-9);

        assert!(builder.apply(&trade("t2", OrderSide::Sell, 0.5, 3100.0, 50.0)).unwrap());
        assert!(store
            .get_open_by_symbol_side(1, "ETHUSDT", PositionSide::Long)
            .unwrap()
            .is_none());
        assert!(store.get_last_closed_time(1).unwrap().is_some());
        assert_eq!(store.count_fills().unwrap(), 2);
    }

    #[test]
    fn scale_in_averages_entry() {
        let store = Store::open_in_memory().unwrap();
        let builder = PositionBuilder::new(&store, 1, "mock");

        builder.apply(&trade("t1", OrderSide::Buy, 1.0, 3000.0, 0.0)).unwrap();
        builder.apply(&trade("t2", OrderSide::Buy, 1.0, 3200.0, 0.0)).unwrap();

        let open = store
            .get_open_by_symbol_side(1, "ETHUSDT", PositionSide::Long)
            .unwrap()
            .unwrap();
        assert!((open.quantity - 2.0).abs() < 1e-9);
        assert!((open.entry_price - 3100.0).abs() < 1e-9);
    }

    #[test]
    fn duplicate_trade_is_a_noop() {
        let store = Store::open_in_memory().unwrap();
        let builder = PositionBuilder::new(&store, 1, "mock");
        let t = trade("t1", OrderSide::Buy, 0.5, 3000.0, 0.0);

        assert!(builder.apply(&t).unwrap());
        assert!(!builder.apply(&t).unwrap());
        assert_eq!(store.count_fills().unwrap(), 1);
        let open = store
            .get_open_by_symbol_side(1, "ETHUSDT", PositionSide::Long)
            .unwrap()
            .unwrap();
        // Quantity not double counted
        assert!((open.quantity - 0.5).abs() < 1e-9);
    }

    #[test]
    fn close_without_open_records_closed_row() {
        let store = Store::open_in_memory().unwrap();
        let builder = PositionBuilder::new(&store, 1, "mock");

        assert!(builder.apply(&trade("t9", OrderSide::Sell, 0.5, 3100.0, 50.0)).unwrap());
        assert!(store
            .get_open_by_symbol_side(1, "ETHUSDT", PositionSide::Long)
            .unwrap()
            .is_none());
        assert!(store.get_last_closed_time(1).unwrap().is_some());
    }
}
