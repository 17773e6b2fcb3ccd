//! Limit-grid emulation over venues without native resting orders
//!
//! Wraps any `Exchange` and exposes the grid capability by emulating
//! price-triggered placement with the venue's conditional primitives:
//! a buy below market becomes a down-trigger, a sell above market an
//! up-trigger, and a marketable price executes immediately. Per-order
//! cancellation cannot be expressed and is rejected explicitly; callers
//! fall back to `cancel_all_orders`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::{ClosedPnlRecord, PositionSide};

use super::errors::{ExchangeError, ExchangeResult};
use super::{
    Balance, Exchange, GridExchange, Kline, OpenOrder, OrderAck, OrderBookSnapshot, OrderSide,
    OrderStatusInfo, PositionInfo, TradeRecord,
};

pub struct GridFallback {
    inner: Arc<dyn Exchange>,
}

impl GridFallback {
    pub fn new(inner: Arc<dyn Exchange>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Exchange for GridFallback {
    fn exchange_id(&self) -> &str {
        self.inner.exchange_id()
    }

    async fn get_balance(&self) -> ExchangeResult<Balance> {
        self.inner.get_balance().await
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<PositionInfo>> {
        self.inner.get_positions().await
    }

    async fn get_market_price(&self, symbol: &str) -> ExchangeResult<f64> {
        self.inner.get_market_price(symbol).await
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Kline>> {
        self.inner.get_klines(symbol, interval, limit).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.inner.set_leverage(symbol, leverage).await
    }

    async fn set_margin_mode(&self, symbol: &str, cross: bool) -> ExchangeResult<()> {
        self.inner.set_margin_mode(symbol, cross).await
    }

    async fn open_long(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        self.inner.open_long(symbol, quantity, leverage).await
    }

    async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        self.inner.open_short(symbol, quantity, leverage).await
    }

    async fn close_long(&self, symbol: &str, quantity: f64) -> ExchangeResult<OrderAck> {
        self.inner.close_long(symbol, quantity).await
    }

    async fn close_short(&self, symbol: &str, quantity: f64) -> ExchangeResult<OrderAck> {
        self.inner.close_short(symbol, quantity).await
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
        trigger_price: f64,
    ) -> ExchangeResult<OrderAck> {
        self.inner
            .set_stop_loss(symbol, position_side, quantity, trigger_price)
            .await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
        trigger_price: f64,
    ) -> ExchangeResult<OrderAck> {
        self.inner
            .set_take_profit(symbol, position_side, quantity, trigger_price)
            .await
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.inner.cancel_stop_loss_orders(symbol).await
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.inner.cancel_take_profit_orders(symbol).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.inner.cancel_all_orders(symbol).await
    }

    async fn cancel_stop_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.inner.cancel_stop_orders(symbol).await
    }

    async fn format_quantity(&self, symbol: &str, quantity: f64) -> ExchangeResult<String> {
        self.inner.format_quantity(symbol, quantity).await
    }

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> ExchangeResult<OrderStatusInfo> {
        self.inner.get_order_status(symbol, order_id).await
    }

    async fn get_closed_pnl(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ExchangeResult<Vec<ClosedPnlRecord>> {
        self.inner.get_closed_pnl(since, limit).await
    }

    async fn get_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OpenOrder>> {
        self.inner.get_open_orders(symbol).await
    }

    async fn get_user_trades(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ExchangeResult<Vec<TradeRecord>> {
        self.inner.get_user_trades(since, limit).await
    }

    fn grid(&self) -> Option<&dyn GridExchange> {
        Some(self)
    }
}

#[async_trait]
impl GridExchange for GridFallback {
    /// Emulated placement. A marketable price executes immediately via the
    /// open primitives; a passive price becomes a conditional trigger. On
    /// venues whose conditionals are reduce-only, a triggered entry needs an
    /// opposing position to act against.
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        _post_only: bool,
    ) -> ExchangeResult<OrderAck> {
        let mark = self.inner.get_market_price(symbol).await?;

        match side {
            OrderSide::Buy => {
                if price >= mark {
                    debug!("emulated buy at {} is marketable (mark {})", price, mark);
                    return self.inner.open_long(symbol, quantity, 1).await;
                }
                // Buy when price falls to the level: a down-trigger
                self.inner
                    .set_take_profit(symbol, PositionSide::Short, quantity, price)
                    .await
            }
            OrderSide::Sell => {
                if price <= mark {
                    debug!("emulated sell at {} is marketable (mark {})", price, mark);
                    return self.inner.open_short(symbol, quantity, 1).await;
                }
                // Sell when price rises to the level: an up-trigger
                self.inner
                    .set_take_profit(symbol, PositionSide::Long, quantity, price)
                    .await
            }
        }
    }

    /// The emulated book has no per-order handle to cancel.
    async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> ExchangeResult<()> {
        Err(ExchangeError::Unsupported(
            "per-order cancellation on an emulated grid; use cancel_all_orders",
        ))
    }

    async fn get_order_book(
        &self,
        _symbol: &str,
        _depth: usize,
    ) -> ExchangeResult<OrderBookSnapshot> {
        Err(ExchangeError::Unsupported(
            "order book depth on an emulated grid",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{MockExchange, SubmittedCall};

    #[tokio::test]
    async fn marketable_buy_executes_immediately() {
        let inner = Arc::new(MockExchange::new("mock").with_price("BTCUSDT", 50_000.0));
        let fallback = GridFallback::new(inner.clone());

        fallback
            .place_limit_order("BTCUSDT", OrderSide::Buy, 0.01, 50_500.0, true)
            .await
            .unwrap();
        assert!(matches!(
            inner.submissions()[0],
            SubmittedCall::OpenLong { .. }
        ));
    }

    #[tokio::test]
    async fn passive_buy_becomes_down_trigger() {
        let inner = Arc::new(MockExchange::new("mock").with_price("BTCUSDT", 50_000.0));
        let fallback = GridFallback::new(inner.clone());

        fallback
            .place_limit_order("BTCUSDT", OrderSide::Buy, 0.01, 49_000.0, true)
            .await
            .unwrap();
        assert!(matches!(
            inner.submissions()[0],
            SubmittedCall::TakeProfit { trigger, .. } if (trigger - 49_000.0).abs() < 1e-9
        ));
    }

    #[tokio::test]
    async fn per_order_cancel_is_rejected() {
        let inner = Arc::new(MockExchange::new("mock"));
        let fallback = GridFallback::new(inner);
        let err = fallback.cancel_order("BTCUSDT", "1").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Unsupported(_)));
    }
}
