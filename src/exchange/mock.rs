//! In-memory venue used by engine and reconciliation tests
//!
//! State is fully scriptable: tests set prices, positions and order lists
//! directly and assert on the submission log afterwards.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::models::{ClosedPnlRecord, OrderStatus, PositionSide};

use super::{
    Balance, Exchange, ExchangeError, ExchangeResult, GridExchange, Kline, OpenOrder, OrderAck,
    OrderBookSnapshot, OrderSide, OrderStatusInfo, PositionInfo, TradeRecord,
};

/// One call captured by the submission log
#[derive(Debug, Clone, PartialEq)]
pub enum SubmittedCall {
    OpenLong { symbol: String, quantity: f64, leverage: u32 },
    OpenShort { symbol: String, quantity: f64, leverage: u32 },
    CloseLong { symbol: String, quantity: f64 },
    CloseShort { symbol: String, quantity: f64 },
    StopLoss { symbol: String, quantity: f64, trigger: f64 },
    TakeProfit { symbol: String, quantity: f64, trigger: f64 },
    LimitOrder { symbol: String, side: OrderSide, quantity: f64, price: f64 },
    CancelOrder { symbol: String, order_id: String },
    CancelAll { symbol: String },
    SetLeverage { symbol: String, leverage: u32 },
}

#[derive(Default)]
pub struct MockState {
    pub prices: HashMap<String, f64>,
    pub klines: HashMap<String, Vec<Kline>>,
    pub balance: Balance,
    pub positions: Vec<PositionInfo>,
    pub open_orders: Vec<OpenOrder>,
    pub order_statuses: HashMap<String, OrderStatusInfo>,
    pub closed_pnl: Vec<ClosedPnlRecord>,
    pub trades: Vec<TradeRecord>,
    pub submitted: Vec<SubmittedCall>,
    pub next_order_id: u64,
    /// When set, the next close_* call fails with NoPosition regardless of
    /// scripted positions.
    pub fail_close: bool,
    /// When set, order submission fails transiently.
    pub fail_submit: bool,
}

pub struct MockExchange {
    id: String,
    pub state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(MockState {
                next_order_id: 1,
                ..MockState::default()
            }),
        }
    }

    pub fn with_price(self, symbol: &str, price: f64) -> Self {
        self.state.lock().prices.insert(symbol.to_string(), price);
        self
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state.lock().prices.insert(symbol.to_string(), price);
    }

    pub fn set_position(&self, symbol: &str, side: PositionSide, quantity: f64, entry: f64) {
        let mut state = self.state.lock();
        let mark = state.prices.get(symbol).copied().unwrap_or(entry);
        state
            .positions
            .retain(|p| !(p.symbol == symbol && p.side == side));
        if quantity > 0.0 {
            state.positions.push(PositionInfo {
                symbol: symbol.to_string(),
                side,
                quantity,
                entry_price: entry,
                mark_price: mark,
                unrealized_profit: 0.0,
                leverage: 1,
                liquidation_price: 0.0,
            });
        }
    }

    pub fn submissions(&self) -> Vec<SubmittedCall> {
        self.state.lock().submitted.clone()
    }

    fn next_id(&self) -> String {
        let mut state = self.state.lock();
        let id = state.next_order_id;
        state.next_order_id += 1;
        format!("mock-{}", id)
    }

    fn close(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
    ) -> ExchangeResult<OrderAck> {
        {
            let state = self.state.lock();
            if state.fail_close {
                return Err(ExchangeError::NoPosition(symbol.to_string()));
            }
        }
        let held = {
            let state = self.state.lock();
            state
                .positions
                .iter()
                .find(|p| p.symbol == symbol && p.side == side)
                .map(|p| p.quantity)
        };
        let Some(held) = held else {
            return Err(ExchangeError::NoPosition(symbol.to_string()));
        };

        let qty = if quantity <= 0.0 { held } else { quantity.min(held) };
        let id = self.next_id();
        {
            let mut state = self.state.lock();
            state.submitted.push(match side {
                PositionSide::Long => SubmittedCall::CloseLong {
                    symbol: symbol.to_string(),
                    quantity: qty,
                },
                PositionSide::Short => SubmittedCall::CloseShort {
                    symbol: symbol.to_string(),
                    quantity: qty,
                },
            });
            for p in state.positions.iter_mut() {
                if p.symbol == symbol && p.side == side {
                    p.quantity -= qty;
                }
            }
            state.positions.retain(|p| p.quantity > 1e-12);
        }
        Ok(OrderAck {
            order_id: id,
            status: OrderStatus::Filled,
        })
    }
}

#[async_trait]
impl Exchange for MockExchange {
    fn exchange_id(&self) -> &str {
        &self.id
    }

    async fn get_balance(&self) -> ExchangeResult<Balance> {
        Ok(self.state.lock().balance.clone())
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<PositionInfo>> {
        Ok(self.state.lock().positions.clone())
    }

    async fn get_market_price(&self, symbol: &str) -> ExchangeResult<f64> {
        self.state
            .lock()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    async fn get_klines(
        &self,
        symbol: &str,
        _interval: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Kline>> {
        let state = self.state.lock();
        let klines = state.klines.get(symbol).cloned().unwrap_or_default();
        let start = klines.len().saturating_sub(limit);
        Ok(klines[start..].to_vec())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.state.lock().submitted.push(SubmittedCall::SetLeverage {
            symbol: symbol.to_string(),
            leverage,
        });
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, _cross: bool) -> ExchangeResult<()> {
        Ok(())
    }

    async fn open_long(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        if self.state.lock().fail_submit {
            return Err(ExchangeError::transient("mock submit failure"));
        }
        let id = self.next_id();
        self.state.lock().submitted.push(SubmittedCall::OpenLong {
            symbol: symbol.to_string(),
            quantity,
            leverage,
        });
        Ok(OrderAck {
            order_id: id,
            status: OrderStatus::New,
        })
    }

    async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        if self.state.lock().fail_submit {
            return Err(ExchangeError::transient("mock submit failure"));
        }
        let id = self.next_id();
        self.state.lock().submitted.push(SubmittedCall::OpenShort {
            symbol: symbol.to_string(),
            quantity,
            leverage,
        });
        Ok(OrderAck {
            order_id: id,
            status: OrderStatus::New,
        })
    }

    async fn close_long(&self, symbol: &str, quantity: f64) -> ExchangeResult<OrderAck> {
        self.close(symbol, PositionSide::Long, quantity)
    }

    async fn close_short(&self, symbol: &str, quantity: f64) -> ExchangeResult<OrderAck> {
        self.close(symbol, PositionSide::Short, quantity)
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        _position_side: PositionSide,
        quantity: f64,
        trigger_price: f64,
    ) -> ExchangeResult<OrderAck> {
        let id = self.next_id();
        self.state.lock().submitted.push(SubmittedCall::StopLoss {
            symbol: symbol.to_string(),
            quantity,
            trigger: trigger_price,
        });
        Ok(OrderAck {
            order_id: id,
            status: OrderStatus::New,
        })
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        _position_side: PositionSide,
        quantity: f64,
        trigger_price: f64,
    ) -> ExchangeResult<OrderAck> {
        let id = self.next_id();
        self.state.lock().submitted.push(SubmittedCall::TakeProfit {
            symbol: symbol.to_string(),
            quantity,
            trigger: trigger_price,
        });
        Ok(OrderAck {
            order_id: id,
            status: OrderStatus::New,
        })
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.cancel_stop_orders(symbol).await
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.cancel_stop_orders(symbol).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        let mut state = self.state.lock();
        let before = state.open_orders.len();
        state.open_orders.retain(|o| o.symbol != symbol);
        let removed = (before - state.open_orders.len()) as u32;
        state.submitted.push(SubmittedCall::CancelAll {
            symbol: symbol.to_string(),
        });
        Ok(removed)
    }

    async fn cancel_stop_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        let mut state = self.state.lock();
        let before = state.open_orders.len();
        state
            .open_orders
            .retain(|o| !(o.symbol == symbol && o.trigger_price.is_some()));
        Ok((before - state.open_orders.len()) as u32)
    }

    async fn format_quantity(&self, _symbol: &str, quantity: f64) -> ExchangeResult<String> {
        Ok(format!("{:.3}", quantity))
    }

    async fn get_order_status(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> ExchangeResult<OrderStatusInfo> {
        self.state
            .lock()
            .order_statuses
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::transient(format!("no status for {}", order_id)))
    }

    async fn get_closed_pnl(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ExchangeResult<Vec<ClosedPnlRecord>> {
        let state = self.state.lock();
        Ok(state
            .closed_pnl
            .iter()
            .filter(|r| r.closed_at >= since)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OpenOrder>> {
        let state = self.state.lock();
        Ok(state
            .open_orders
            .iter()
            .filter(|o| o.symbol == symbol || symbol.is_empty())
            .cloned()
            .collect())
    }

    async fn get_user_trades(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ExchangeResult<Vec<TradeRecord>> {
        let state = self.state.lock();
        Ok(state
            .trades
            .iter()
            .filter(|t| t.executed_at >= since)
            .take(limit)
            .cloned()
            .collect())
    }

    fn grid(&self) -> Option<&dyn GridExchange> {
        Some(self)
    }
}

#[async_trait]
impl GridExchange for MockExchange {
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        _post_only: bool,
    ) -> ExchangeResult<OrderAck> {
        if self.state.lock().fail_submit {
            return Err(ExchangeError::transient("mock submit failure"));
        }
        let id = self.next_id();
        let mut state = self.state.lock();
        state.submitted.push(SubmittedCall::LimitOrder {
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
        });
        state.open_orders.push(OpenOrder {
            order_id: id.clone(),
            symbol: symbol.to_string(),
            side,
            order_type: "limit".to_string(),
            price,
            quantity,
            trigger_price: None,
            reduce_only: false,
            created_at: Utc::now(),
        });
        Ok(OrderAck {
            order_id: id,
            status: OrderStatus::New,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        let mut state = self.state.lock();
        state.open_orders.retain(|o| o.order_id != order_id);
        state.submitted.push(SubmittedCall::CancelOrder {
            symbol: symbol.to_string(),
            order_id: order_id.to_string(),
        });
        Ok(())
    }

    async fn get_order_book(
        &self,
        symbol: &str,
        _depth: usize,
    ) -> ExchangeResult<OrderBookSnapshot> {
        let price = self.get_market_price(symbol).await?;
        Ok(OrderBookSnapshot {
            bids: vec![(price * 0.999, 1.0)],
            asks: vec![(price * 1.001, 1.0)],
            fetched_at: Utc::now(),
        })
    }
}

/// Helper: signed venue position for fill-detection tests
pub fn signed_size(positions: &[PositionInfo], symbol: &str) -> f64 {
    positions
        .iter()
        .filter(|p| p.symbol == symbol)
        .map(|p| match p.side {
            PositionSide::Long => p.quantity,
            PositionSide::Short => -p.quantity,
        })
        .sum()
}
