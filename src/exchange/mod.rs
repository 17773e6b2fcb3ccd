//! Exchange adapter abstraction
//!
//! One capability set implemented over heterogeneous venues. Wire shapes are
//! parsed eagerly at the adapter boundary; everything past this module is a
//! concrete record.

pub mod binance;
pub mod eip55;
pub mod errors;
pub mod grid_fallback;
pub mod hyperliquid;
pub mod kumex;
pub mod lighter;
pub mod mock;
pub mod precision;
pub mod symbols;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::models::{ClosedPnlRecord, PositionSide};
pub use errors::{ExchangeError, ExchangeResult};

/// Account totals. Wallet balance excludes unrealized profit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Balance {
    pub wallet_balance: f64,
    pub available_balance: f64,
    pub unrealized_profit: f64,
    pub equity: f64,
}

/// One nonzero venue position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_profit: f64,
    pub leverage: u32,
    pub liquidation_price: f64,
}

/// Venue acknowledgement of a submitted order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: crate::models::OrderStatus,
}

/// Normalized order-status query result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusInfo {
    pub status: crate::models::OrderStatus,
    pub avg_price: f64,
    pub executed_qty: f64,
    pub commission: f64,
}

/// Taker/maker direction of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// One open (possibly conditional) order on the venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: String,
    pub price: f64,
    pub quantity: f64,
    pub trigger_price: Option<f64>,
    pub reduce_only: bool,
    pub created_at: DateTime<Utc>,
}

/// One user execution pulled from venue trade history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub exchange_trade_id: String,
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: Option<PositionSide>,
    /// Explicit venue action tag when the venue emits one
    pub order_action: Option<crate::models::DecisionAction>,
    pub price: f64,
    pub quantity: f64,
    pub commission: f64,
    pub realized_pnl: f64,
    pub executed_at: DateTime<Utc>,
}

/// OHLCV candle
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Order book snapshot; price/quantity pairs best-first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub fetched_at: DateTime<Utc>,
}

/// The uniform trading capability set every venue adapter satisfies.
///
/// All network calls are bounded by the client timeout; no adapter retries
/// internally beyond one server-time resync on timestamp errors.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn exchange_id(&self) -> &str;

    async fn get_balance(&self) -> ExchangeResult<Balance>;

    async fn get_positions(&self) -> ExchangeResult<Vec<PositionInfo>>;

    /// Best mid/last. Fails only on unknown symbol.
    async fn get_market_price(&self, symbol: &str) -> ExchangeResult<f64>;

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Kline>>;

    /// Idempotent; "not modified" venue responses are success.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    /// Idempotent; cross when `cross` else isolated.
    async fn set_margin_mode(&self, symbol: &str, cross: bool) -> ExchangeResult<()>;

    async fn open_long(&self, symbol: &str, quantity: f64, leverage: u32)
        -> ExchangeResult<OrderAck>;

    async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> ExchangeResult<OrderAck>;

    /// Quantity 0 closes the whole venue-side position (looked up live,
    /// never from a local cache). `NoPosition` when none is present.
    async fn close_long(&self, symbol: &str, quantity: f64) -> ExchangeResult<OrderAck>;

    async fn close_short(&self, symbol: &str, quantity: f64) -> ExchangeResult<OrderAck>;

    async fn set_stop_loss(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
        trigger_price: f64,
    ) -> ExchangeResult<OrderAck>;

    async fn set_take_profit(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
        trigger_price: f64,
    ) -> ExchangeResult<OrderAck>;

    /// Returns the number of cancelled orders. Scope is per-symbol.
    async fn cancel_stop_loss_orders(&self, symbol: &str) -> ExchangeResult<u32>;

    async fn cancel_take_profit_orders(&self, symbol: &str) -> ExchangeResult<u32>;

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<u32>;

    /// Conditional (stop/take-profit) family only.
    async fn cancel_stop_orders(&self, symbol: &str) -> ExchangeResult<u32>;

    async fn format_quantity(&self, symbol: &str, quantity: f64) -> ExchangeResult<String>;

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> ExchangeResult<OrderStatusInfo>;

    async fn get_closed_pnl(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ExchangeResult<Vec<ClosedPnlRecord>>;

    async fn get_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OpenOrder>>;

    async fn get_user_trades(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ExchangeResult<Vec<TradeRecord>>;

    /// Native limit-grid capability, when the venue has one.
    fn grid(&self) -> Option<&dyn GridExchange> {
        None
    }
}

/// Additional capability for venues with native resting limit orders.
#[async_trait]
pub trait GridExchange: Exchange {
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        post_only: bool,
    ) -> ExchangeResult<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()>;

    async fn get_order_book(&self, symbol: &str, depth: usize)
        -> ExchangeResult<OrderBookSnapshot>;
}

/// Credentials handed to the factory. Which fields matter depends on the
/// venue; signing material never leaves the adapter that consumes it.
#[derive(Debug, Clone, Default)]
pub struct VenueCredentials {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub passphrase: Option<String>,
    /// Hex private key for DEX signing (agent or API key)
    pub signing_key: Option<String>,
    /// Funding/main account address for DEX venues
    pub wallet_address: Option<String>,
    pub testnet: bool,
}

impl VenueCredentials {
    pub fn from_env(exchange_id: &str) -> Self {
        let prefix = exchange_id.to_uppercase();
        let var = |suffix: &str| std::env::var(format!("{}_{}", prefix, suffix)).ok();
        Self {
            api_key: var("API_KEY"),
            api_secret: var("API_SECRET"),
            passphrase: var("PASSPHRASE"),
            signing_key: var("SIGNING_KEY"),
            wallet_address: var("WALLET_ADDRESS"),
            testnet: var("TESTNET").map(|v| v == "1" || v == "true").unwrap_or(false),
        }
    }
}

/// Build an adapter for a venue id. DEX adapters perform their key-material
/// checks during construction and fail loudly.
pub async fn build_adapter(
    exchange_id: &str,
    creds: &VenueCredentials,
) -> anyhow::Result<Arc<dyn Exchange>> {
    let adapter: Arc<dyn Exchange> = match exchange_id {
        "binance" => Arc::new(binance::BinanceAdapter::connect(creds).await?),
        "kumex" => Arc::new(kumex::KumexAdapter::new(creds)?),
        "hyperliquid" => Arc::new(hyperliquid::HyperliquidAdapter::connect(creds).await?),
        "lighter" => Arc::new(lighter::LighterAdapter::connect(creds).await?),
        other => anyhow::bail!("unknown exchange id: {}", other),
    };
    Ok(adapter)
}

/// Process-scoped adapter cache keyed by (trader, venue). Safe for
/// concurrent use; idle entries are evicted.
pub struct AdapterRegistry {
    idle_ttl: Duration,
    entries: RwLock<HashMap<(i64, String), (Arc<dyn Exchange>, Instant)>>,
}

impl AdapterRegistry {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            idle_ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(
        &self,
        trader_id: i64,
        exchange_id: &str,
    ) -> anyhow::Result<Arc<dyn Exchange>> {
        let key = (trader_id, exchange_id.to_string());

        if let Some(adapter) = {
            let mut entries = self.entries.write();
            entries.get_mut(&key).map(|(adapter, touched)| {
                *touched = Instant::now();
                adapter.clone()
            })
        } {
            return Ok(adapter);
        }

        // Build outside the lock: adapter construction does network I/O.
        let creds = VenueCredentials::from_env(exchange_id);
        let adapter = build_adapter(exchange_id, &creds).await?;

        let mut entries = self.entries.write();
        let adapter = entries
            .entry(key)
            .or_insert_with(|| (adapter, Instant::now()))
            .0
            .clone();
        Ok(adapter)
    }

    pub fn insert(&self, trader_id: i64, exchange_id: &str, adapter: Arc<dyn Exchange>) {
        self.entries.write().insert(
            (trader_id, exchange_id.to_string()),
            (adapter, Instant::now()),
        );
    }

    /// Drop adapters that have not been used within the idle TTL.
    pub fn evict_idle(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, (_, touched)| touched.elapsed() < self.idle_ttl);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_insert_and_evict() {
        let registry = AdapterRegistry::new(Duration::from_secs(0));
        let adapter: Arc<dyn Exchange> = Arc::new(mock::MockExchange::new("mock"));
        registry.insert(1, "mock", adapter);
        assert_eq!(registry.len(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.evict_idle(), 1);
        assert!(registry.is_empty());
    }
}
