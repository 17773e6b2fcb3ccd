//! End-to-end flow over the mock venue: decision execution, order
//! reconciliation, external close detection and idempotent history ingest.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use perpbot_backend::exchange::mock::MockExchange;
use perpbot_backend::exchange::{Balance, Exchange, OrderSide, OrderStatusInfo, TradeRecord};
use perpbot_backend::models::{
    Decision, DecisionAction, OrderStatus, PositionSide, StrategyKind, TraderConfig,
};
use perpbot_backend::store::Store;
use perpbot_backend::sync;
use perpbot_backend::trader::decisions::execute_decision;

fn trader_config() -> TraderConfig {
    TraderConfig {
        id: 1,
        name: "flow-test".to_string(),
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
async fn open_reconcile_and_externally_close() {
    let store = Store::open_in_memory().unwrap();
    let mock = rich_mock();
    let exchange: Arc<dyn Exchange> = mock.clone();
    let trader = trader_config();

    // 1. Oracle decision opens a long worth 5000 USD -> 0.1 BTC
    let decision = Decision {
        action: DecisionAction::OpenLong,
        symbol: "btc".to_string(), // normalization happens in pre-flight
        quantity: None,
        position_size_usd: Some(5_000.0),
        leverage: Some(10),
        price: None,
        stop_loss: Some(47_500.0),
        take_profit: None,
        order_id: None,
        confidence: 0.9,
        reasoning: "test".to_string(),
    };
    let record = execute_decision(&trader, &exchange, &store, &decision).await;
    assert!(record.success, "{:?}", record.error);
    let order_id = record.order_id.clone().unwrap();

    // Local mirror: one pending order, one open position
    assert_eq!(store.get_all_pending_orders().unwrap().len(), 1);
    let open = store
        .get_open_by_symbol_side(1, "BTCUSDT", PositionSide::Long)
        .unwrap()
        .unwrap();
    assert!((open.quantity - 0.1).abs() < 1e-9);

    // 2. The venue reports the order filled; order sync resolves it
    mock.state.lock().order_statuses.insert(
        order_id.clone(),
        OrderStatusInfo {
            status: OrderStatus::Filled,
            avg_price: 50_010.0,
            executed_qty: 0.1,
            commission: 0.02,
        },
    );
    let pending = store.get_all_pending_orders().unwrap();
    sync::order_sync::sync_one_order(&store, &exchange, &pending[0])
        .await
        .unwrap();
    let synced = store
        .get_order_by_exchange_id(1, "mock", &order_id)
        .unwrap()
        .unwrap();
    assert_eq!(synced.status, OrderStatus::Filled);
    assert!((synced.avg_price - 50_010.0).abs() < 1e-9);

    // 3. The position disappears from the venue (manual close); position
    //    sync closes the local row from the venue's closed-PnL record
    mock.state.lock().positions.clear();
    mock.state.lock().closed_pnl.push(perpbot_backend::models::ClosedPnlRecord {
        exchange_id: "mock".to_string(),
        exchange_trade_id: Some("ext-1".to_string()),
        symbol: "BTCUSDT".to_string(),
        side: PositionSide::Long,
        quantity: 0.1,
        entry_price: 50_000.0,
        exit_price: 51_000.0,
        realized_pnl: 100.0,
        fee: 0.04,
        close_type: "manual".to_string(),
        closed_at: Utc::now(),
    });

    let closed = sync::position_sync::run_position_sync_pass(&store, 1, &exchange)
        .await
        .unwrap();
    assert_eq!(closed, 1);
    assert!(store
        .get_open_by_symbol_side(1, "BTCUSDT", PositionSide::Long)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn history_ingest_is_idempotent_across_passes() {
    let store = Store::open_in_memory().unwrap();
    let mock = rich_mock();
    let exchange: Arc<dyn Exchange> = mock.clone();

    let base = Utc::now() - ChronoDuration::minutes(30);
    {
        let mut state = mock.state.lock();
        for (i, (side, price, pnl)) in [
            (OrderSide::Buy, 50_000.0, 0.0),
            (OrderSide::Buy, 50_200.0, 0.0),
            (OrderSide::Sell, 50_400.0, 60.0),
        ]
        .iter()
        .enumerate()
        {
            state.trades.push(TradeRecord {
                exchange_trade_id: format!("t{}", i),
                exchange_order_id: format!("o{}", i),
                symbol: "BTCUSDT".to_string(),
                side: *side,
                position_side: None,
                order_action: None,
                price: *price,
                quantity: 0.1,
                commission: 0.01,
                realized_pnl: *pnl,
                executed_at: base + ChronoDuration::seconds(i as i64 * 10),
            });
        }
    }

    let since = base - ChronoDuration::minutes(5);
    let first = sync::trade_sync::run_trade_sync_pass(&store, 1, &exchange, since)
        .await
        .unwrap();
    assert_eq!(first, 3);
    assert_eq!(store.count_fills().unwrap(), 3);

    // Two buys scale in (0.2), the sell of 0.1 leaves 0.1 open
    let open = store
        .get_open_by_symbol_side(1, "BTCUSDT", PositionSide::Long)
        .unwrap()
        .unwrap();
    assert!((open.quantity - 0.1).abs() < 1e-9);

    // Replaying the same window ingests nothing
    let second = sync::trade_sync::run_trade_sync_pass(&store, 1, &exchange, since)
        .await
        .unwrap();
    assert_eq!(second, 0);
    assert_eq!(store.count_fills().unwrap(), 3);
}
