//! Binance-style USDT-M futures adapter
//!
//! Signed REST (HMAC-SHA256 over the query string), hedge-mode position
//! sides, server-time offset maintained on init and on any timestamp error.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::models::{ClosedPnlRecord, OrderStatus, PositionSide};

use super::errors::{is_idempotent_ok, ExchangeError, ExchangeResult};
use super::precision::{InstrumentSpec, SpecCache};
use super::symbols;
use super::{
    Balance, Exchange, GridExchange, Kline, OpenOrder, OrderAck, OrderBookSnapshot, OrderSide,
    OrderStatusInfo, PositionInfo, TradeRecord, VenueCredentials,
};

const MAINNET_BASE: &str = "https://fapi.binance.com";
const TESTNET_BASE: &str = "https://testnet.binancefuture.com";

const RECV_WINDOW_MS: u64 = 5_000;
const ACCOUNT_CACHE_TTL: Duration = Duration::from_secs(15);
const SPEC_CACHE_TTL: Duration = Duration::from_secs(3600);

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceAdapter {
    client: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    /// server_time - local_time, in milliseconds
    time_offset_ms: AtomicI64,
    specs: SpecCache,
    balance_cache: Mutex<Option<(Balance, Instant)>>,
    positions_cache: Mutex<Option<(Vec<PositionInfo>, Instant)>>,
}

impl std::fmt::Debug for BinanceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceAdapter")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct VenueError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
struct ServerTime {
    #[serde(rename = "serverTime")]
    server_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    total_wallet_balance: String,
    total_unrealized_profit: String,
    available_balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
    entry_price: String,
    mark_price: String,
    un_realized_profit: String,
    liquidation_price: String,
    leverage: String,
    #[serde(default)]
    position_side: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    quantity_precision: u32,
    price_precision: u32,
    #[serde(default)]
    filters: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    status: String,
    #[serde(default)]
    avg_price: Option<String>,
    #[serde(default)]
    executed_qty: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenOrderResponse {
    order_id: i64,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    price: String,
    orig_qty: String,
    #[serde(default)]
    stop_price: Option<String>,
    #[serde(default)]
    reduce_only: bool,
    time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserTrade {
    id: i64,
    order_id: i64,
    symbol: String,
    side: String,
    #[serde(default)]
    position_side: String,
    price: String,
    qty: String,
    commission: String,
    realized_pnl: String,
    time: i64,
}

fn parse_f64(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

impl BinanceAdapter {
    /// Construct and sync server time before the first signed request.
    pub async fn connect(creds: &VenueCredentials) -> anyhow::Result<Self> {
        let adapter = Self::new(creds)?;
        adapter.sync_server_time().await?;
        info!("binance adapter initialized");
        Ok(adapter)
    }

    pub fn new(creds: &VenueCredentials) -> anyhow::Result<Self> {
        let api_key = creds
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("BINANCE_API_KEY not set"))?;
        let api_secret = creds
            .api_secret
            .clone()
            .ok_or_else(|| anyhow::anyhow!("BINANCE_API_SECRET not set"))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let base_url = if creds.testnet { TESTNET_BASE } else { MAINNET_BASE }.to_string();

        Ok(Self {
            client,
            api_key,
            api_secret,
            base_url,
            time_offset_ms: AtomicI64::new(0),
            specs: SpecCache::new(SPEC_CACHE_TTL),
            balance_cache: Mutex::new(None),
            positions_cache: Mutex::new(None),
        })
    }

    fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    /// Poll server time and update the request offset.
    async fn sync_server_time(&self) -> ExchangeResult<()> {
        let url = format!("{}/fapi/v1/time", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::transient(format!("server time: {}", e)))?;
        let server: ServerTime = resp
            .json()
            .await
            .map_err(|e| ExchangeError::transient(format!("server time parse: {}", e)))?;
        let offset = server.server_time - Utc::now().timestamp_millis();
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        debug!("server time offset updated: {}ms", offset);
        Ok(())
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn map_error(status: StatusCode, body: &str) -> ExchangeError {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return ExchangeError::transient(format!("{}: {}", status, body));
        }
        let Ok(err) = serde_json::from_str::<VenueError>(body) else {
            return ExchangeError::Venue {
                code: status.as_u16() as i64,
                message: body.to_string(),
            };
        };
        match err.code {
            -1021 => ExchangeError::transient(format!("timestamp drift: {}", err.msg)),
            -1121 => ExchangeError::UnknownSymbol(err.msg),
            -1111 | -1013 | -4164 => ExchangeError::InvalidQuantity {
                symbol: String::new(),
                reason: err.msg,
            },
            -2019 => ExchangeError::InsufficientMargin {
                needed: 0.0,
                available: 0.0,
            },
            -2022 => ExchangeError::NoPosition(err.msg),
            -4028 => ExchangeError::LeverageOutOfBounds {
                symbol: String::new(),
                requested: 0,
                max: 0,
            },
            -4400 | -2027 => ExchangeError::PositionLimit(err.msg),
            -2014 | -2015 | -1022 => ExchangeError::Auth(format!(
                "{} - check API key permissions and IP allowlist",
                err.msg
            )),
            _ => ExchangeError::Venue {
                code: err.code,
                message: err.msg,
            },
        }
    }

    /// Signed request with one server-time resync retry on timestamp drift.
    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<serde_json::Value> {
        for attempt in 0..2 {
            match self.signed_request_once(method.clone(), path, params).await {
                Err(ExchangeError::Transient(msg))
                    if attempt == 0 && msg.contains("timestamp drift") =>
                {
                    warn!("timestamp drift on {}, resyncing server time", path);
                    self.sync_server_time().await?;
                }
                other => return other,
            }
        }
        unreachable!()
    }

    async fn signed_request_once(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<serde_json::Value> {
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "recvWindow={}&timestamp={}",
            RECV_WINDOW_MS,
            self.timestamp_ms()
        ));
        let signature = self.sign(&query);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let resp = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExchangeError::transient(format!("timeout: {}", e))
                } else {
                    ExchangeError::transient(format!("request: {}", e))
                }
            })?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(Self::map_error(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::transient(format!("parse {}: {}", path, e)))
    }

    async fn public_request(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| ExchangeError::transient(format!("request: {}", e)))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Self::map_error(status, &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::transient(format!("parse {}: {}", path, e)))
    }

    /// Load (or refresh) the instrument spec for a symbol.
    async fn spec(&self, symbol: &str) -> ExchangeResult<InstrumentSpec> {
        if let Some(spec) = self.specs.get(symbol) {
            return Ok(spec);
        }
        let value = self.public_request("/fapi/v1/exchangeInfo", &[]).await?;
        let info: ExchangeInfo = serde_json::from_value(value)
            .map_err(|e| ExchangeError::transient(format!("exchangeInfo parse: {}", e)))?;

        let mut specs = Vec::with_capacity(info.symbols.len());
        for s in info.symbols {
            let mut tick_size = 0.0;
            let mut lot_size = 0.0;
            let mut max_qty = f64::MAX;
            for filter in &s.filters {
                match filter.get("filterType").and_then(|v| v.as_str()) {
                    Some("PRICE_FILTER") => {
                        tick_size = filter
                            .get("tickSize")
                            .and_then(|v| v.as_str())
                            .map(parse_f64)
                            .unwrap_or(0.0);
                    }
                    Some("LOT_SIZE") => {
                        lot_size = filter
                            .get("stepSize")
                            .and_then(|v| v.as_str())
                            .map(parse_f64)
                            .unwrap_or(0.0);
                        max_qty = filter
                            .get("maxQty")
                            .and_then(|v| v.as_str())
                            .map(parse_f64)
                            .unwrap_or(f64::MAX);
                    }
                    _ => {}
                }
            }
            specs.push(InstrumentSpec {
                symbol: symbols::normalize(&s.symbol),
                size_decimals: s.quantity_precision,
                price_decimals: s.price_precision,
                tick_size,
                lot_size,
                multiplier: 1.0,
                max_order_qty: max_qty,
                max_leverage: 125,
            });
        }
        self.specs.put_all(specs);

        self.specs
            .get(symbol)
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    fn venue_symbol(&self, symbol: &str) -> String {
        // Canonical form is already the venue spelling here
        symbols::normalize(symbol)
    }

    fn invalidate_account_caches(&self) {
        *self.balance_cache.lock() = None;
        *self.positions_cache.lock() = None;
    }

    /// Cancel reduce-only orders left behind by a previous close attempt.
    async fn cancel_stale_reduce_only(&self, symbol: &str) -> ExchangeResult<()> {
        let orders = self.get_open_orders(symbol).await?;
        for order in orders.iter().filter(|o| o.reduce_only) {
            let _ = self
                .signed_request(
                    Method::DELETE,
                    "/fapi/v1/order",
                    &[
                        ("symbol", self.venue_symbol(symbol)),
                        ("orderId", order.order_id.clone()),
                    ],
                )
                .await;
        }
        Ok(())
    }

    async fn submit_market(
        &self,
        symbol: &str,
        side: &str,
        position_side: PositionSide,
        quantity: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck> {
        let spec = self.spec(symbol).await?;
        let qty = spec.round_quantity(quantity).map_err(|e| match e {
            ExchangeError::InvalidQuantity { reason, .. } => ExchangeError::InvalidQuantity {
                symbol: symbol.to_string(),
                reason,
            },
            other => other,
        })?;

        let mut params = vec![
            ("symbol", self.venue_symbol(symbol)),
            ("side", side.to_string()),
            ("positionSide", position_side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", spec.format_quantity(qty)),
        ];
        // Hedge mode rejects the reduceOnly flag; direction is implied by
        // positionSide + side, so it is only sent for one-way accounts.
        let _ = reduce_only;
        params.push(("newOrderRespType", "RESULT".to_string()));

        let value = self
            .signed_request(Method::POST, "/fapi/v1/order", &params)
            .await
            .map_err(|e| self.tag_precision_error(symbol, e))?;
        let order: OrderResponse = serde_json::from_value(value)
            .map_err(|e| ExchangeError::transient(format!("order parse: {}", e)))?;

        self.invalidate_account_caches();

        Ok(OrderAck {
            order_id: order.order_id.to_string(),
            status: OrderStatus::parse(&order.status).unwrap_or(OrderStatus::New),
        })
    }

    /// Precision errors invalidate the cached spec so the next attempt
    /// refreshes it.
    fn tag_precision_error(&self, symbol: &str, e: ExchangeError) -> ExchangeError {
        if let ExchangeError::InvalidQuantity { reason, .. } = e {
            self.specs.invalidate(symbol);
            ExchangeError::InvalidQuantity {
                symbol: symbol.to_string(),
                reason,
            }
        } else {
            e
        }
    }

    async fn open(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        self.cancel_stale_reduce_only(symbol).await.ok();

        if let Err(e) = self.set_leverage(symbol, leverage).await {
            warn!("set_leverage before open failed (continuing): {}", e);
        }

        // Price read for slippage awareness; market orders here are bounded
        // by the venue's own price bands.
        let mark = self.get_market_price(symbol).await?;
        debug!(
            "opening {} {} qty={} mark={}",
            symbol,
            position_side.as_str(),
            quantity,
            mark
        );

        let side = match position_side {
            PositionSide::Long => "BUY",
            PositionSide::Short => "SELL",
        };
        self.submit_market(symbol, side, position_side, quantity, false)
            .await
    }

    async fn close(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
    ) -> ExchangeResult<OrderAck> {
        // Live venue size, never the local cache
        let positions = self.fetch_positions().await?;
        let held = positions
            .iter()
            .find(|p| p.symbol == symbols::normalize(symbol) && p.side == position_side)
            .map(|p| p.quantity)
            .unwrap_or(0.0);

        if held <= 0.0 {
            return Err(ExchangeError::NoPosition(symbol.to_string()));
        }

        let qty = if quantity <= 0.0 { held } else { quantity.min(held) };
        let side = match position_side {
            PositionSide::Long => "SELL",
            PositionSide::Short => "BUY",
        };
        let ack = self
            .submit_market(symbol, side, position_side, qty, true)
            .await?;

        // Residual conditional orders are dead once the position is gone
        if quantity <= 0.0 || qty >= held {
            if let Err(e) = self.cancel_stop_orders(symbol).await {
                warn!("cancel residual stops after close failed: {}", e);
            }
        }
        Ok(ack)
    }

    async fn submit_conditional(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
        trigger_price: f64,
        order_type: &str,
    ) -> ExchangeResult<OrderAck> {
        let spec = self.spec(symbol).await?;
        let qty = spec.round_quantity(quantity)?;
        let side = match position_side {
            PositionSide::Long => "SELL",
            PositionSide::Short => "BUY",
        };

        let params = vec![
            ("symbol", self.venue_symbol(symbol)),
            ("side", side.to_string()),
            ("positionSide", position_side.as_str().to_string()),
            ("type", order_type.to_string()),
            ("quantity", spec.format_quantity(qty)),
            ("stopPrice", spec.format_price(spec.round_price(trigger_price))),
            ("workingType", "MARK_PRICE".to_string()),
        ];

        let value = self
            .signed_request(Method::POST, "/fapi/v1/order", &params)
            .await
            .map_err(|e| self.tag_precision_error(symbol, e))?;
        let order: OrderResponse = serde_json::from_value(value)
            .map_err(|e| ExchangeError::transient(format!("order parse: {}", e)))?;

        Ok(OrderAck {
            order_id: order.order_id.to_string(),
            status: OrderStatus::parse(&order.status).unwrap_or(OrderStatus::New),
        })
    }

    async fn cancel_conditional_family(
        &self,
        symbol: &str,
        types: &[&str],
    ) -> ExchangeResult<u32> {
        let orders = self.get_open_orders(symbol).await?;
        let mut cancelled = 0;
        for order in orders {
            if !types.contains(&order.order_type.as_str()) {
                continue;
            }
            match self
                .signed_request(
                    Method::DELETE,
                    "/fapi/v1/order",
                    &[
                        ("symbol", self.venue_symbol(symbol)),
                        ("orderId", order.order_id.clone()),
                    ],
                )
                .await
            {
                Ok(_) => cancelled += 1,
                Err(e) => warn!("cancel {} failed: {}", order.order_id, e),
            }
        }
        Ok(cancelled)
    }

    async fn fetch_positions(&self) -> ExchangeResult<Vec<PositionInfo>> {
        let value = self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", &[])
            .await?;
        let rows: Vec<PositionRisk> = serde_json::from_value(value)
            .map_err(|e| ExchangeError::transient(format!("positionRisk parse: {}", e)))?;

        let mut positions = Vec::new();
        for row in rows {
            let amt = parse_f64(&row.position_amt);
            if amt.abs() < 1e-12 {
                continue;
            }
            // Hedge mode tags the side; one-way infers it from the sign.
            let side = match row.position_side.as_str() {
                "LONG" => PositionSide::Long,
                "SHORT" => PositionSide::Short,
                _ if amt > 0.0 => PositionSide::Long,
                _ => PositionSide::Short,
            };
            positions.push(PositionInfo {
                symbol: symbols::normalize(&row.symbol),
                side,
                quantity: amt.abs(),
                entry_price: parse_f64(&row.entry_price),
                mark_price: parse_f64(&row.mark_price),
                unrealized_profit: parse_f64(&row.un_realized_profit),
                leverage: parse_f64(&row.leverage) as u32,
                liquidation_price: parse_f64(&row.liquidation_price),
            });
        }
        Ok(positions)
    }
}

#[async_trait]
impl Exchange for BinanceAdapter {
    fn exchange_id(&self) -> &str {
        "binance"
    }

    async fn get_balance(&self) -> ExchangeResult<Balance> {
        if let Some((balance, at)) = self.balance_cache.lock().clone() {
            if at.elapsed() < ACCOUNT_CACHE_TTL {
                return Ok(balance);
            }
        }

        let value = self
            .signed_request(Method::GET, "/fapi/v2/account", &[])
            .await?;
        let account: AccountResponse = serde_json::from_value(value)
            .map_err(|e| ExchangeError::transient(format!("account parse: {}", e)))?;

        let wallet = parse_f64(&account.total_wallet_balance);
        let unrealized = parse_f64(&account.total_unrealized_profit);
        let balance = Balance {
            wallet_balance: wallet,
            available_balance: parse_f64(&account.available_balance),
            unrealized_profit: unrealized,
            equity: wallet + unrealized,
        };

        *self.balance_cache.lock() = Some((balance.clone(), Instant::now()));
        Ok(balance)
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<PositionInfo>> {
        if let Some((positions, at)) = self.positions_cache.lock().clone() {
            if at.elapsed() < ACCOUNT_CACHE_TTL {
                return Ok(positions);
            }
        }
        let positions = self.fetch_positions().await?;
        *self.positions_cache.lock() = Some((positions.clone(), Instant::now()));
        Ok(positions)
    }

    async fn get_market_price(&self, symbol: &str) -> ExchangeResult<f64> {
        let value = self
            .public_request(
                "/fapi/v1/ticker/price",
                &[("symbol", self.venue_symbol(symbol))],
            )
            .await
            .map_err(|e| match e {
                ExchangeError::Venue { code: -1121, message } => {
                    ExchangeError::UnknownSymbol(message)
                }
                other => other,
            })?;
        let ticker: TickerPrice = serde_json::from_value(value)
            .map_err(|e| ExchangeError::transient(format!("ticker parse: {}", e)))?;
        Ok(parse_f64(&ticker.price))
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Kline>> {
        let value = self
            .public_request(
                "/fapi/v1/klines",
                &[
                    ("symbol", self.venue_symbol(symbol)),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        let rows: Vec<Vec<serde_json::Value>> = serde_json::from_value(value)
            .map_err(|e| ExchangeError::transient(format!("klines parse: {}", e)))?;

        Ok(rows
            .into_iter()
            .filter(|r| r.len() >= 6)
            .map(|r| Kline {
                open_time: r[0].as_i64().unwrap_or(0),
                open: r[1].as_str().map(parse_f64).unwrap_or(0.0),
                high: r[2].as_str().map(parse_f64).unwrap_or(0.0),
                low: r[3].as_str().map(parse_f64).unwrap_or(0.0),
                close: r[4].as_str().map(parse_f64).unwrap_or(0.0),
                volume: r[5].as_str().map(parse_f64).unwrap_or(0.0),
            })
            .collect())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let result = self
            .signed_request(
                Method::POST,
                "/fapi/v1/leverage",
                &[
                    ("symbol", self.venue_symbol(symbol)),
                    ("leverage", leverage.to_string()),
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(ExchangeError::Venue { message, .. }) if is_idempotent_ok(&message) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_margin_mode(&self, symbol: &str, cross: bool) -> ExchangeResult<()> {
        let mode = if cross { "CROSSED" } else { "ISOLATED" };
        let result = self
            .signed_request(
                Method::POST,
                "/fapi/v1/marginType",
                &[
                    ("symbol", self.venue_symbol(symbol)),
                    ("marginType", mode.to_string()),
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(ExchangeError::Venue { code: -4046, .. }) => Ok(()),
            Err(ExchangeError::Venue { message, .. }) if is_idempotent_ok(&message) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn open_long(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        self.open(symbol, PositionSide::Long, quantity, leverage).await
    }

    async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        self.open(symbol, PositionSide::Short, quantity, leverage).await
    }

    async fn close_long(&self, symbol: &str, quantity: f64) -> ExchangeResult<OrderAck> {
        self.close(symbol, PositionSide::Long, quantity).await
    }

    async fn close_short(&self, symbol: &str, quantity: f64) -> ExchangeResult<OrderAck> {
        self.close(symbol, PositionSide::Short, quantity).await
    }

    async fn set_stop_loss(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
        trigger_price: f64,
    ) -> ExchangeResult<OrderAck> {
        self.submit_conditional(symbol, position_side, quantity, trigger_price, "STOP_MARKET")
            .await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
        trigger_price: f64,
    ) -> ExchangeResult<OrderAck> {
        self.submit_conditional(
            symbol,
            position_side,
            quantity,
            trigger_price,
            "TAKE_PROFIT_MARKET",
        )
        .await
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.cancel_conditional_family(symbol, &["STOP_MARKET", "STOP"]).await
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.cancel_conditional_family(symbol, &["TAKE_PROFIT_MARKET", "TAKE_PROFIT"])
            .await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        let open = self.get_open_orders(symbol).await?.len() as u32;
        self.signed_request(
            Method::DELETE,
            "/fapi/v1/allOpenOrders",
            &[("symbol", self.venue_symbol(symbol))],
        )
        .await?;
        Ok(open)
    }

    async fn cancel_stop_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.cancel_conditional_family(
            symbol,
            &["STOP_MARKET", "TAKE_PROFIT_MARKET", "STOP", "TAKE_PROFIT"],
        )
        .await
    }

    async fn format_quantity(&self, symbol: &str, quantity: f64) -> ExchangeResult<String> {
        let spec = self.spec(symbol).await?;
        Ok(spec.format_quantity(spec.round_quantity(quantity)?))
    }

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> ExchangeResult<OrderStatusInfo> {
        let value = self
            .signed_request(
                Method::GET,
                "/fapi/v1/order",
                &[
                    ("symbol", self.venue_symbol(symbol)),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        let order: OrderResponse = serde_json::from_value(value)
            .map_err(|e| ExchangeError::transient(format!("order parse: {}", e)))?;

        // Commission lives on the per-order trade list
        let mut commission = 0.0;
        if let Ok(value) = self
            .signed_request(
                Method::GET,
                "/fapi/v1/userTrades",
                &[
                    ("symbol", self.venue_symbol(symbol)),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await
        {
            if let Ok(trades) = serde_json::from_value::<Vec<UserTrade>>(value) {
                commission = trades.iter().map(|t| parse_f64(&t.commission)).sum();
            }
        }

        Ok(OrderStatusInfo {
            status: OrderStatus::parse(&order.status).unwrap_or(OrderStatus::New),
            avg_price: order.avg_price.as_deref().map(parse_f64).unwrap_or(0.0),
            executed_qty: order.executed_qty.as_deref().map(parse_f64).unwrap_or(0.0),
            commission,
        })
    }

    async fn get_closed_pnl(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ExchangeResult<Vec<ClosedPnlRecord>> {
        // Derived from closing fills: realized PnL is nonzero only on the
        // leg that reduces a position.
        let trades = self.get_user_trades(since, limit.max(100)).await?;
        let mut records = Vec::new();
        for t in trades.into_iter().filter(|t| t.realized_pnl.abs() > 1e-12) {
            let side = match t.side {
                // A sell that realizes PnL closed a long, a buy closed a short
                OrderSide::Sell => PositionSide::Long,
                OrderSide::Buy => PositionSide::Short,
            };
            let entry_price = if t.quantity > 0.0 {
                match side {
                    PositionSide::Long => t.price - t.realized_pnl / t.quantity,
                    PositionSide::Short => t.price + t.realized_pnl / t.quantity,
                }
            } else {
                t.price
            };
            records.push(ClosedPnlRecord {
                exchange_id: "binance".to_string(),
                exchange_trade_id: Some(t.exchange_trade_id),
                symbol: t.symbol,
                side,
                quantity: t.quantity,
                entry_price,
                exit_price: t.price,
                realized_pnl: t.realized_pnl,
                fee: t.commission,
                close_type: "trade".to_string(),
                closed_at: t.executed_at,
            });
        }
        records.truncate(limit);
        Ok(records)
    }

    async fn get_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OpenOrder>> {
        let params = if symbol.is_empty() {
            vec![]
        } else {
            vec![("symbol", self.venue_symbol(symbol))]
        };
        let value = self
            .signed_request(Method::GET, "/fapi/v1/openOrders", &params)
            .await?;
        let rows: Vec<OpenOrderResponse> = serde_json::from_value(value)
            .map_err(|e| ExchangeError::transient(format!("openOrders parse: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|r| OpenOrder {
                order_id: r.order_id.to_string(),
                symbol: symbols::normalize(&r.symbol),
                side: if r.side == "BUY" {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                },
                order_type: r.order_type,
                price: parse_f64(&r.price),
                quantity: parse_f64(&r.orig_qty),
                trigger_price: r.stop_price.as_deref().map(parse_f64).filter(|p| *p > 0.0),
                reduce_only: r.reduce_only,
                created_at: Utc.timestamp_millis_opt(r.time).single().unwrap_or_else(Utc::now),
            })
            .collect())
    }

    async fn get_user_trades(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ExchangeResult<Vec<TradeRecord>> {
        let value = self
            .signed_request(
                Method::GET,
                "/fapi/v1/userTrades",
                &[
                    ("startTime", since.timestamp_millis().to_string()),
                    ("limit", limit.min(1000).to_string()),
                ],
            )
            .await?;
        let rows: Vec<UserTrade> = serde_json::from_value(value)
            .map_err(|e| ExchangeError::transient(format!("userTrades parse: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|t| {
                let position_side = match t.position_side.as_str() {
                    "LONG" => Some(PositionSide::Long),
                    "SHORT" => Some(PositionSide::Short),
                    _ => None,
                };
                TradeRecord {
                    exchange_trade_id: t.id.to_string(),
                    exchange_order_id: t.order_id.to_string(),
                    symbol: symbols::normalize(&t.symbol),
                    side: if t.side == "BUY" {
                        OrderSide::Buy
                    } else {
                        OrderSide::Sell
                    },
                    position_side,
                    order_action: None,
                    price: parse_f64(&t.price),
                    quantity: parse_f64(&t.qty),
                    commission: parse_f64(&t.commission),
                    realized_pnl: parse_f64(&t.realized_pnl),
                    executed_at: Utc
                        .timestamp_millis_opt(t.time)
                        .single()
                        .unwrap_or_else(Utc::now),
                }
            })
            .collect())
    }

    fn grid(&self) -> Option<&dyn GridExchange> {
        Some(self)
    }
}

#[async_trait]
impl GridExchange for BinanceAdapter {
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        post_only: bool,
    ) -> ExchangeResult<OrderAck> {
        let spec = self.spec(symbol).await?;
        let qty = spec.round_quantity(quantity)?;
        let limit_price = spec.round_price(price);

        // Post-only limit orders use GTX; plain limits fall back to GTC.
        let tif = if post_only { "GTX" } else { "GTC" };
        let position_side = match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };

        let params = vec![
            ("symbol", self.venue_symbol(symbol)),
            (
                "side",
                match side {
                    OrderSide::Buy => "BUY".to_string(),
                    OrderSide::Sell => "SELL".to_string(),
                },
            ),
            ("positionSide", position_side.as_str().to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", tif.to_string()),
            ("quantity", spec.format_quantity(qty)),
            ("price", spec.format_price(limit_price)),
        ];

        let value = self
            .signed_request(Method::POST, "/fapi/v1/order", &params)
            .await
            .map_err(|e| self.tag_precision_error(symbol, e))?;
        let order: OrderResponse = serde_json::from_value(value)
            .map_err(|e| ExchangeError::transient(format!("order parse: {}", e)))?;

        Ok(OrderAck {
            order_id: order.order_id.to_string(),
            status: OrderStatus::parse(&order.status).unwrap_or(OrderStatus::New),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        self.signed_request(
            Method::DELETE,
            "/fapi/v1/order",
            &[
                ("symbol", self.venue_symbol(symbol)),
                ("orderId", order_id.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_order_book(
        &self,
        symbol: &str,
        depth: usize,
    ) -> ExchangeResult<OrderBookSnapshot> {
        let value = self
            .public_request(
                "/fapi/v1/depth",
                &[
                    ("symbol", self.venue_symbol(symbol)),
                    ("limit", depth.max(5).to_string()),
                ],
            )
            .await?;

        let parse_levels = |key: &str| -> Vec<(f64, f64)> {
            value
                .get(key)
                .and_then(|v| v.as_array())
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| {
                            let pair = row.as_array()?;
                            Some((
                                pair.first()?.as_str().map(parse_f64)?,
                                pair.get(1)?.as_str().map(parse_f64)?,
                            ))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(OrderBookSnapshot {
            bids: parse_levels("bids"),
            asks: parse_levels("asks"),
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mapping() {
        let e = BinanceAdapter::map_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-1021,"msg":"Timestamp for this request is outside of the recvWindow."}"#,
        );
        assert!(e.is_transient());

        let e = BinanceAdapter::map_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-1121,"msg":"Invalid symbol."}"#,
        );
        assert!(matches!(e, ExchangeError::UnknownSymbol(_)));

        let e = BinanceAdapter::map_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-2019,"msg":"Margin is insufficient."}"#,
        );
        assert!(e.is_precondition());

        let e = BinanceAdapter::map_error(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(e.is_transient());
    }

    #[test]
    fn signing_is_deterministic() {
        let creds = VenueCredentials {
            api_key: Some("key".to_string()),
            api_secret: Some("secret".to_string()),
            ..VenueCredentials::default()
        };
        let adapter = BinanceAdapter::new(&creds).unwrap();
        let a = adapter.sign("symbol=BTCUSDT&timestamp=1");
        let b = adapter.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
