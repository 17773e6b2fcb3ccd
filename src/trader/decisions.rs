//! Directional decision execution
//!
//! Decisions run in a fixed priority order (closes before opens before
//! everything passive). Each one pre-flights margin, duplicate-position and
//! price checks, calls the adapter, and leaves an action record plus the
//! order/position mirror rows behind.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::exchange::{symbols, Exchange, ExchangeError};
use crate::models::{
    Decision, DecisionAction, DecisionActionRecord, Order, Position, PositionSide, PositionSource,
    TraderConfig,
};
use crate::store::Store;

/// Stable priority sort: close > open > hold/wait.
pub fn sort_decisions(mut decisions: Vec<Decision>) -> Vec<Decision> {
    decisions.sort_by_key(|d| d.action.priority());
    decisions
}

pub async fn execute_decision(
    trader: &TraderConfig,
    exchange: &Arc<dyn Exchange>,
    store: &Store,
    decision: &Decision,
) -> DecisionActionRecord {
    let symbol = symbols::normalize(&decision.symbol);

    let result = match decision.action {
        DecisionAction::OpenLong => {
            open(trader, exchange, store, decision, &symbol, PositionSide::Long).await
        }
        DecisionAction::OpenShort => {
            open(trader, exchange, store, decision, &symbol, PositionSide::Short).await
        }
        DecisionAction::CloseLong => {
            close(trader, exchange, store, decision, &symbol, PositionSide::Long).await
        }
        DecisionAction::CloseShort => {
            close(trader, exchange, store, decision, &symbol, PositionSide::Short).await
        }
        DecisionAction::Hold | DecisionAction::Wait => {
            debug!("{}: {} on {}", trader.name, decision.action.as_str(), symbol);
            Ok(Execution::noop())
        }
        other => Err(ExchangeError::Venue {
            code: 0,
            message: format!("{} is not valid on a directional strategy", other.as_str()),
        }),
    };

    match result {
        Ok(execution) => DecisionActionRecord {
            action: decision.action,
            symbol,
            order_id: execution.order_id,
            quantity: execution.quantity,
            avg_price: execution.price,
            success: true,
            error: None,
            executed_at: Utc::now(),
        },
        Err(e) => {
            if e.is_precondition() {
                info!("{}: {} skipped: {}", trader.name, decision.action.as_str(), e);
            } else {
                warn!("{}: {} failed: {}", trader.name, decision.action.as_str(), e);
            }
            DecisionActionRecord {
                action: decision.action,
                symbol,
                order_id: None,
                quantity: decision.quantity.unwrap_or(0.0),
                avg_price: 0.0,
                success: false,
                error: Some(e.to_string()),
                executed_at: Utc::now(),
            }
        }
    }
}

struct Execution {
    order_id: Option<String>,
    quantity: f64,
    price: f64,
}

impl Execution {
    fn noop() -> Self {
        Self {
            order_id: None,
            quantity: 0.0,
            price: 0.0,
        }
    }
}

async fn open(
    trader: &TraderConfig,
    exchange: &Arc<dyn Exchange>,
    store: &Store,
    decision: &Decision,
    symbol: &str,
    side: PositionSide,
) -> Result<Execution, ExchangeError> {
    // One live position per (symbol, side)
    if let Ok(Some(existing)) = store.get_open_by_symbol_side(trader.id, symbol, side) {
        return Err(ExchangeError::PositionExists {
            symbol: symbol.to_string(),
            side: existing.side.as_str().to_string(),
        });
    }

    let leverage = decision.leverage.unwrap_or_else(|| trader.leverage_for(symbol));
    let price = exchange.get_market_price(symbol).await?;

    let quantity = match (decision.quantity, decision.position_size_usd) {
        (Some(qty), _) if qty > 0.0 => qty,
        (_, Some(usd)) if usd > 0.0 => usd / price,
        _ => {
            return Err(ExchangeError::InvalidQuantity {
                symbol: symbol.to_string(),
                reason: "decision carries neither quantity nor position_size_usd".to_string(),
            })
        }
    };

    // Margin pre-flight against the venue's available balance
    let balance = exchange.get_balance().await?;
    let margin_needed = quantity * price / leverage.max(1) as f64;
    if margin_needed > balance.available_balance {
        return Err(ExchangeError::InsufficientMargin {
            needed: margin_needed,
            available: balance.available_balance,
        });
    }

    let ack = match side {
        PositionSide::Long => exchange.open_long(symbol, quantity, leverage).await?,
        PositionSide::Short => exchange.open_short(symbol, quantity, leverage).await?,
    };

    let order = Order::new_intent(
        trader.id,
        exchange.exchange_id(),
        &ack.order_id,
        symbol,
        decision.action,
        quantity,
        price,
        leverage,
    );
    if let Err(e) = store.create_order(&order) {
        warn!("failed to persist order intent: {}", e);
    }

    let position = Position::open(
        trader.id,
        exchange.exchange_id(),
        symbol,
        side,
        quantity,
        price,
        leverage,
        PositionSource::Trade,
    );
    if let Err(e) = store.create_open_position(&position) {
        warn!("failed to persist position mirror: {}", e);
    }

    // Protective orders ride on the fresh position
    if let Some(stop) = decision.stop_loss {
        if let Err(e) = exchange.set_stop_loss(symbol, side, quantity, stop).await {
            warn!("stop loss placement failed for {}: {}", symbol, e);
        }
    }
    if let Some(target) = decision.take_profit {
        if let Err(e) = exchange.set_take_profit(symbol, side, quantity, target).await {
            warn!("take profit placement failed for {}: {}", symbol, e);
        }
    }

    info!(
        "{}: opened {} {} qty {:.6} @ ~{:.4} ({}x)",
        trader.name,
        side.as_str(),
        symbol,
        quantity,
        price,
        leverage
    );

    Ok(Execution {
        order_id: Some(ack.order_id),
        quantity,
        price,
    })
}

async fn close(
    trader: &TraderConfig,
    exchange: &Arc<dyn Exchange>,
    store: &Store,
    decision: &Decision,
    symbol: &str,
    side: PositionSide,
) -> Result<Execution, ExchangeError> {
    let quantity = decision.quantity.unwrap_or(0.0);
    let price = exchange.get_market_price(symbol).await.unwrap_or(0.0);

    let ack = match side {
        PositionSide::Long => exchange.close_long(symbol, quantity).await?,
        PositionSide::Short => exchange.close_short(symbol, quantity).await?,
    };

    let order = Order::new_intent(
        trader.id,
        exchange.exchange_id(),
        &ack.order_id,
        symbol,
        decision.action,
        quantity,
        price,
        1,
    );
    if let Err(e) = store.create_order(&order) {
        warn!("failed to persist close intent: {}", e);
    }

    // Mirror the close locally when the whole position went; partial closes
    // are left to the reconcilers which see the venue's remaining size.
    if quantity <= 0.0 {
        if let Ok(Some(position)) = store.get_open_by_symbol_side(trader.id, symbol, side) {
            let realized = match side {
                PositionSide::Long => (price - position.entry_price) * position.quantity,
                PositionSide::Short => (position.entry_price - price) * position.quantity,
            };
            let _ = store.close_position(
                position.id.unwrap_or(0),
                price,
                Utc::now(),
                realized,
                0.0,
                "decision",
                None,
            );
        }
    }

    info!("{}: closed {} {} ({})", trader.name, side.as_str(), symbol, ack.order_id);

    Ok(Execution {
        order_id: Some(ack.order_id),
        quantity,
        price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use crate::exchange::Balance;
    use crate::models::StrategyKind;

    fn trader() -> TraderConfig {
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
            default_coins: vec![],
            trading_coins: vec![],
            grid: None,
        }
    }

    fn decision(action: DecisionAction, usd: Option<f64>) -> Decision {
        Decision {
            action,
            symbol: "BTCUSDT".to_string(),
            quantity: None,
            position_size_usd: usd,
            leverage: None,
            price: None,
            stop_loss: None,
            take_profit: None,
            order_id: None,
            confidence: 0.8,
            reasoning: String::new(),
        }
    }

    fn rich_mock() -> Arc<MockExchange> {
        let mock = Arc::new(MockExchange::new("mock"));
        mock.set_price("BTCUSDT", 50_000.0);
        mock.state.lock().balance = Balance {
            wallet_balance: 10_000.0,
            available_balance: 10_000.0,
            unrealized_profit: 0.0,
            equity: 10_000.0,
        };
        mock
    }

    #[tokio::test]
    async fn open_computes_quantity_from_usd() {
        let mock = rich_mock();
        let exchange: Arc<dyn Exchange> = mock.clone();
        let store = Store::open_in_memory().unwrap();

        let record = execute_decision(
            &trader(),
            &exchange,
            &store,
            &decision(DecisionAction::OpenLong, Some(5_000.0)),
        )
        .await;

        assert!(record.success, "{:?}", record.error);
        assert!((record.quantity - 0.1).abs() < 1e-9);
        // Mirror rows exist
        assert_eq!(store.get_all_pending_orders().unwrap().len(), 1);
        assert!(store
            .get_open_by_symbol_side(1, "BTCUSDT", PositionSide::Long)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn same_side_position_blocks_reopen() {
        let mock = rich_mock();
        let exchange: Arc<dyn Exchange> = mock.clone();
        let store = Store::open_in_memory().unwrap();
        let d = decision(DecisionAction::OpenLong, Some(5_000.0));

        assert!(execute_decision(&trader(), &exchange, &store, &d).await.success);
        let second = execute_decision(&trader(), &exchange, &store, &d).await;
        assert!(!second.success);
        assert!(second.error.unwrap().contains("already exists"));
    }

    #[tokio::test]
    async fn insufficient_margin_is_a_recorded_failure() {
        let mock = rich_mock();
        mock.state.lock().balance.available_balance = 100.0;
        let exchange: Arc<dyn Exchange> = mock.clone();
        let store = Store::open_in_memory().unwrap();

        let record = execute_decision(
            &trader(),
            &exchange,
            &store,
            &decision(DecisionAction::OpenLong, Some(50_000.0)),
        )
        .await;
        assert!(!record.success);
        assert!(record.error.unwrap().contains("insufficient"));
        assert!(mock.submissions().is_empty());
    }

    #[tokio::test]
    async fn close_without_position_reports_no_position() {
        let mock = rich_mock();
        let exchange: Arc<dyn Exchange> = mock.clone();
        let store = Store::open_in_memory().unwrap();

        let record = execute_decision(
            &trader(),
            &exchange,
            &store,
            &decision(DecisionAction::CloseLong, None),
        )
        .await;
        assert!(!record.success);
        assert!(record.error.unwrap().contains("no position"));
    }

    #[test]
    fn decisions_sorted_close_first() {
        let sorted = sort_decisions(vec![
            decision(DecisionAction::Hold, None),
            decision(DecisionAction::OpenShort, Some(100.0)),
            decision(DecisionAction::CloseLong, None),
        ]);
        assert_eq!(sorted[0].action, DecisionAction::CloseLong);
        assert_eq!(sorted[1].action, DecisionAction::OpenShort);
        assert_eq!(sorted[2].action, DecisionAction::Hold);
    }
}
