//! KuCoin-futures-style contract venue adapter
//!
//! Quantities are integer contract lots (`size = round(qty / multiplier)`),
//! symbols carry the M suffix (XBTUSDTM), auth is passphrase-signed headers
//! (HMAC-SHA256, base64). The account is one-way: position side is inferred
//! from the sign of `currentQty`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{ClosedPnlRecord, OrderStatus, PositionSide};

use super::errors::{is_idempotent_ok, ExchangeError, ExchangeResult};
use super::precision::{InstrumentSpec, SpecCache};
use super::symbols;
use super::{
    Balance, Exchange, Kline, OpenOrder, OrderAck, OrderSide, OrderStatusInfo, PositionInfo,
    TradeRecord, VenueCredentials,
};

const BASE_URL: &str = "https://api-futures.kucoin.com";

const ACCOUNT_CACHE_TTL: Duration = Duration::from_secs(15);
const SPEC_CACHE_TTL: Duration = Duration::from_secs(600);

type HmacSha256 = Hmac<Sha256>;

pub struct KumexAdapter {
    client: Client,
    api_key: String,
    api_secret: String,
    passphrase: String,
    base_url: String,
    specs: SpecCache,
    balance_cache: Mutex<Option<(Balance, Instant)>>,
    positions_cache: Mutex<Option<(Vec<PositionInfo>, Instant)>>,
    /// Leverage is per-order on this venue; the last requested value is
    /// recorded here and attached to submissions.
    leverage: Mutex<std::collections::HashMap<String, u32>>,
}

impl std::fmt::Debug for KumexAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KumexAdapter")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: String,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractInfo {
    symbol: String,
    multiplier: f64,
    lot_size: f64,
    tick_size: f64,
    max_order_qty: f64,
    max_leverage: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountOverview {
    account_equity: f64,
    unrealised_pnl: f64,
    available_balance: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VenuePosition {
    symbol: String,
    current_qty: f64,
    avg_entry_price: f64,
    mark_price: f64,
    unrealised_pnl: f64,
    liquidation_price: f64,
    real_leverage: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VenueOrder {
    id: String,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    price: Option<String>,
    size: f64,
    #[serde(default)]
    deal_size: f64,
    #[serde(default)]
    deal_value: f64,
    #[serde(default)]
    stop_price: Option<String>,
    #[serde(default)]
    reduce_only: bool,
    #[serde(default)]
    is_active: bool,
    #[serde(default)]
    cancel_exist: bool,
    created_at: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VenueFill {
    trade_id: String,
    order_id: String,
    symbol: String,
    side: String,
    price: String,
    size: f64,
    fee: String,
    trade_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryPosition {
    symbol: String,
    #[serde(rename = "type")]
    side: String,
    close_id: Option<String>,
    pnl: f64,
    open_price: f64,
    close_price: f64,
    qty: f64,
    fee: f64,
    close_time: i64,
}

fn parse_f64(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

impl KumexAdapter {
    pub fn new(creds: &VenueCredentials) -> anyhow::Result<Self> {
        let api_key = creds
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("KUMEX_API_KEY not set"))?;
        let api_secret = creds
            .api_secret
            .clone()
            .ok_or_else(|| anyhow::anyhow!("KUMEX_API_SECRET not set"))?;
        let passphrase = creds
            .passphrase
            .clone()
            .ok_or_else(|| anyhow::anyhow!("KUMEX_PASSPHRASE not set"))?;

        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            api_key,
            api_secret,
            passphrase,
            base_url: BASE_URL.to_string(),
            specs: SpecCache::new(SPEC_CACHE_TTL),
            balance_cache: Mutex::new(None),
            positions_cache: Mutex::new(None),
            leverage: Mutex::new(std::collections::HashMap::new()),
        })
    }

    /// Canonical BTCUSDT -> venue XBTUSDTM.
    fn venue_symbol(&self, symbol: &str) -> String {
        let canonical = symbols::normalize(symbol);
        let base = symbols::base_asset(&canonical);
        let venue_base = if base == "BTC" { "XBT" } else { base };
        format!("{}USDTM", venue_base)
    }

    fn sign_headers(
        &self,
        method: &str,
        endpoint: &str,
        body: &str,
    ) -> Vec<(&'static str, String)> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let payload = format!("{}{}{}{}", timestamp, method, endpoint, body);

        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        let mut pmac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        pmac.update(self.passphrase.as_bytes());
        let signed_passphrase = BASE64.encode(pmac.finalize().into_bytes());

        vec![
            ("KC-API-KEY", self.api_key.clone()),
            ("KC-API-SIGN", signature),
            ("KC-API-TIMESTAMP", timestamp),
            ("KC-API-PASSPHRASE", signed_passphrase),
            ("KC-API-KEY-VERSION", "2".to_string()),
        ]
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> ExchangeResult<serde_json::Value> {
        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let headers = self.sign_headers(method.as_str(), endpoint, &body_str);
        let url = format!("{}{}", self.base_url, endpoint);

        let mut request = self.client.request(method, &url);
        for (key, value) in headers {
            request = request.header(key, value);
        }
        if let Some(b) = body {
            request = request.json(&b);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExchangeError::transient(format!("timeout: {}", e))
            } else {
                ExchangeError::transient(format!("request: {}", e))
            }
        })?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(ExchangeError::transient(format!("{}: {}", status, text)));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ExchangeError::Auth(format!(
                "{} - check API key, secret and passphrase",
                text
            )));
        }

        let envelope: Envelope = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::transient(format!("parse {}: {}", endpoint, e)))?;

        if envelope.code != "200000" {
            let msg = envelope.msg.unwrap_or_default();
            if is_idempotent_ok(&msg) {
                return Ok(envelope.data);
            }
            let code: i64 = envelope.code.parse().unwrap_or(0);
            return Err(match code {
                300018 | 300009 => ExchangeError::InsufficientMargin {
                    needed: 0.0,
                    available: 0.0,
                },
                100001 if msg.to_lowercase().contains("symbol") => {
                    ExchangeError::UnknownSymbol(msg)
                }
                _ => ExchangeError::Venue { code, message: msg },
            });
        }

        Ok(envelope.data)
    }

    async fn spec(&self, symbol: &str) -> ExchangeResult<InstrumentSpec> {
        let canonical = symbols::normalize(symbol);
        if let Some(spec) = self.specs.get(&canonical) {
            return Ok(spec);
        }

        let data = self
            .request(Method::GET, "/api/v1/contracts/active", None)
            .await?;
        let contracts: Vec<ContractInfo> = serde_json::from_value(data)
            .map_err(|e| ExchangeError::transient(format!("contracts parse: {}", e)))?;

        let specs = contracts
            .into_iter()
            .map(|c| InstrumentSpec {
                symbol: symbols::normalize(&c.symbol),
                size_decimals: 0,
                price_decimals: 2,
                tick_size: c.tick_size,
                lot_size: c.lot_size,
                multiplier: c.multiplier,
                max_order_qty: c.max_order_qty,
                max_leverage: c.max_leverage,
            })
            .collect();
        self.specs.put_all(specs);

        self.specs
            .get(&canonical)
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    fn invalidate_account_caches(&self) {
        *self.balance_cache.lock() = None;
        *self.positions_cache.lock() = None;
    }

    fn leverage_for(&self, symbol: &str) -> u32 {
        self.leverage
            .lock()
            .get(&symbols::normalize(symbol))
            .copied()
            .unwrap_or(3)
    }

    async fn fetch_positions(&self) -> ExchangeResult<Vec<PositionInfo>> {
        let data = self.request(Method::GET, "/api/v1/positions", None).await?;
        let rows: Vec<VenuePosition> = serde_json::from_value(data)
            .map_err(|e| ExchangeError::transient(format!("positions parse: {}", e)))?;

        let mut positions = Vec::new();
        for row in rows {
            if row.current_qty.abs() < 1e-12 {
                continue;
            }
            let spec = self.spec(&row.symbol).await.unwrap_or_else(|_| {
                InstrumentSpec::linear_default(&symbols::normalize(&row.symbol))
            });
            // One-way account: side comes from the sign, lots from multiplier
            let side = if row.current_qty > 0.0 {
                PositionSide::Long
            } else {
                PositionSide::Short
            };
            positions.push(PositionInfo {
                symbol: symbols::normalize(&row.symbol),
                side,
                quantity: row.current_qty.abs() * spec.multiplier,
                entry_price: row.avg_entry_price,
                mark_price: row.mark_price,
                unrealized_profit: row.unrealised_pnl,
                leverage: row.real_leverage.round().max(1.0) as u32,
                liquidation_price: row.liquidation_price,
            });
        }
        Ok(positions)
    }

    async fn submit_order(&self, body: serde_json::Value) -> ExchangeResult<OrderAck> {
        let data = self
            .request(Method::POST, "/api/v1/orders", Some(body))
            .await?;
        let order_id = data
            .get("orderId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExchangeError::transient("order response missing orderId"))?
            .to_string();
        self.invalidate_account_caches();
        Ok(OrderAck {
            order_id,
            status: OrderStatus::New,
        })
    }

    async fn open(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        // Stale reduce-only orders would fight the new exposure
        self.cancel_stale_reduce_only(symbol).await.ok();
        self.set_leverage(symbol, leverage).await.ok();

        let mark = self.get_market_price(symbol).await?;
        debug!("opening {} {:?} qty={} mark={}", symbol, side, quantity, mark);

        let spec = self.spec(symbol).await?;
        let lots = spec.lots_for_quantity(quantity)?;

        let body = serde_json::json!({
            "clientOid": Uuid::new_v4().to_string(),
            "symbol": self.venue_symbol(symbol),
            "side": side.as_str(),
            "type": "market",
            "size": lots as i64,
            "leverage": leverage.to_string(),
        });
        self.submit_order(body).await
    }

    async fn close(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
    ) -> ExchangeResult<OrderAck> {
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
        let spec = self.spec(symbol).await?;
        let lots = spec.lots_for_quantity(qty)?;
        let side = match position_side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        };

        let body = serde_json::json!({
            "clientOid": Uuid::new_v4().to_string(),
            "symbol": self.venue_symbol(symbol),
            "side": side.as_str(),
            "type": "market",
            "size": lots as i64,
            "reduceOnly": true,
            "leverage": self.leverage_for(symbol).to_string(),
        });
        let ack = self.submit_order(body).await?;

        if quantity <= 0.0 || qty >= held {
            if let Err(e) = self.cancel_stop_orders(symbol).await {
                warn!("cancel residual stops after close failed: {}", e);
            }
        }
        Ok(ack)
    }

    async fn cancel_stale_reduce_only(&self, symbol: &str) -> ExchangeResult<()> {
        let orders = self.get_open_orders(symbol).await?;
        for order in orders.iter().filter(|o| o.reduce_only) {
            let endpoint = format!("/api/v1/orders/{}", order.order_id);
            let _ = self.request(Method::DELETE, &endpoint, None).await;
        }
        Ok(())
    }

    /// Conditional order. Stop direction is inferred from the position side
    /// and the trigger's relation to the mark price.
    async fn submit_stop(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
        trigger_price: f64,
    ) -> ExchangeResult<OrderAck> {
        let mark = self.get_market_price(symbol).await?;
        let spec = self.spec(symbol).await?;
        let lots = spec.lots_for_quantity(quantity)?;
        let side = match position_side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        };
        let stop = if trigger_price < mark { "down" } else { "up" };

        let body = serde_json::json!({
            "clientOid": Uuid::new_v4().to_string(),
            "symbol": self.venue_symbol(symbol),
            "side": side.as_str(),
            "type": "market",
            "size": lots as i64,
            "stop": stop,
            "stopPrice": spec.format_price(spec.round_price(trigger_price)),
            "stopPriceType": "MP",
            "reduceOnly": true,
            "leverage": self.leverage_for(symbol).to_string(),
        });
        self.submit_order(body).await
    }
}

#[async_trait]
impl Exchange for KumexAdapter {
    fn exchange_id(&self) -> &str {
        "kumex"
    }

    async fn get_balance(&self) -> ExchangeResult<Balance> {
        if let Some((balance, at)) = self.balance_cache.lock().clone() {
            if at.elapsed() < ACCOUNT_CACHE_TTL {
                return Ok(balance);
            }
        }

        let data = self
            .request(Method::GET, "/api/v1/account-overview?currency=USDT", None)
            .await?;
        let overview: AccountOverview = serde_json::from_value(data)
            .map_err(|e| ExchangeError::transient(format!("account parse: {}", e)))?;

        // Wallet balance excludes unrealized profit
        let balance = Balance {
            wallet_balance: overview.account_equity - overview.unrealised_pnl,
            available_balance: overview.available_balance,
            unrealized_profit: overview.unrealised_pnl,
            equity: overview.account_equity,
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
        let endpoint = format!("/api/v1/ticker?symbol={}", self.venue_symbol(symbol));
        let data = self.request(Method::GET, &endpoint, None).await?;
        data.get("price")
            .and_then(|v| v.as_str().map(parse_f64).or_else(|| v.as_f64()))
            .filter(|p| *p > 0.0)
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Kline>> {
        // Venue granularity is minutes
        let granularity: i64 = match interval {
            "1m" => 1,
            "5m" => 5,
            "15m" => 15,
            "1h" => 60,
            "4h" => 240,
            "1d" => 1440,
            _ => 60,
        };
        let from = Utc::now().timestamp_millis() - (granularity * 60 * 1000) * limit as i64;
        let endpoint = format!(
            "/api/v1/kline/query?symbol={}&granularity={}&from={}",
            self.venue_symbol(symbol),
            granularity,
            from
        );
        let data = self.request(Method::GET, &endpoint, None).await?;
        let rows: Vec<Vec<f64>> = serde_json::from_value(data)
            .map_err(|e| ExchangeError::transient(format!("kline parse: {}", e)))?;

        Ok(rows
            .into_iter()
            .filter(|r| r.len() >= 6)
            .map(|r| Kline {
                open_time: r[0] as i64,
                open: r[1],
                high: r[2],
                low: r[3],
                close: r[4],
                volume: r[5],
            })
            .collect())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        // Leverage rides on each order for this venue; recording it locally
        // is the whole operation and repeat calls are naturally idempotent.
        let spec = self.spec(symbol).await?;
        if leverage > spec.max_leverage {
            return Err(ExchangeError::LeverageOutOfBounds {
                symbol: symbol.to_string(),
                requested: leverage,
                max: spec.max_leverage,
            });
        }
        self.leverage
            .lock()
            .insert(symbols::normalize(symbol), leverage.max(1));
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, cross: bool) -> ExchangeResult<()> {
        let body = serde_json::json!({
            "symbol": self.venue_symbol(symbol),
            "marginMode": if cross { "CROSS" } else { "ISOLATED" },
        });
        match self
            .request(Method::POST, "/api/v2/position/changeMarginMode", Some(body))
            .await
        {
            Ok(_) => Ok(()),
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
        self.open(symbol, OrderSide::Buy, quantity, leverage).await
    }

    async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        self.open(symbol, OrderSide::Sell, quantity, leverage).await
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
        self.submit_stop(symbol, position_side, quantity, trigger_price)
            .await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
        trigger_price: f64,
    ) -> ExchangeResult<OrderAck> {
        self.submit_stop(symbol, position_side, quantity, trigger_price)
            .await
    }

    /// The stop-order list does not distinguish stop-loss from take-profit;
    /// both families are cancelled together.
    async fn cancel_stop_loss_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.cancel_stop_orders(symbol).await
    }

    /// See `cancel_stop_loss_orders`: both conditional families go together.
    async fn cancel_take_profit_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.cancel_stop_orders(symbol).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        let open = self.get_open_orders(symbol).await?.len() as u32;
        let endpoint = format!("/api/v1/orders?symbol={}", self.venue_symbol(symbol));
        self.request(Method::DELETE, &endpoint, None).await?;
        let stop_endpoint = format!("/api/v1/stopOrders?symbol={}", self.venue_symbol(symbol));
        let _ = self.request(Method::DELETE, &stop_endpoint, None).await;
        Ok(open)
    }

    async fn cancel_stop_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        let endpoint = format!("/api/v1/stopOrders?symbol={}", self.venue_symbol(symbol));
        let data = self.request(Method::DELETE, &endpoint, None).await?;
        let cancelled = data
            .get("cancelledOrderIds")
            .and_then(|v| v.as_array())
            .map(|a| a.len() as u32)
            .unwrap_or(0);
        Ok(cancelled)
    }

    async fn format_quantity(&self, symbol: &str, quantity: f64) -> ExchangeResult<String> {
        let spec = self.spec(symbol).await?;
        let lots = spec.lots_for_quantity(quantity)?;
        Ok(format!("{}", lots as i64))
    }

    async fn get_order_status(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> ExchangeResult<OrderStatusInfo> {
        let endpoint = format!("/api/v1/orders/{}", order_id);
        let data = self.request(Method::GET, &endpoint, None).await?;
        let order: VenueOrder = serde_json::from_value(data)
            .map_err(|e| ExchangeError::transient(format!("order parse: {}", e)))?;

        let spec = self.spec(&order.symbol).await?;
        let executed_qty = order.deal_size * spec.multiplier;
        let avg_price = if order.deal_size > 0.0 {
            order.deal_value / (order.deal_size * spec.multiplier)
        } else {
            0.0
        };

        let status = if order.is_active {
            if order.deal_size > 0.0 {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::New
            }
        } else if order.cancel_exist {
            OrderStatus::Canceled
        } else {
            OrderStatus::Filled
        };

        Ok(OrderStatusInfo {
            status,
            avg_price,
            executed_qty,
            commission: 0.0,
        })
    }

    async fn get_closed_pnl(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ExchangeResult<Vec<ClosedPnlRecord>> {
        let endpoint = format!(
            "/api/v1/history-positions?from={}&limit={}",
            since.timestamp_millis(),
            limit.min(200)
        );
        let data = self.request(Method::GET, &endpoint, None).await?;
        let rows: Vec<HistoryPosition> = data
            .get("items")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ExchangeError::transient(format!("history parse: {}", e)))?
            .unwrap_or_default();

        Ok(rows
            .into_iter()
            .map(|r| ClosedPnlRecord {
                exchange_id: "kumex".to_string(),
                exchange_trade_id: r.close_id.clone(),
                symbol: symbols::normalize(&r.symbol),
                side: PositionSide::parse(&r.side).unwrap_or(PositionSide::Long),
                quantity: r.qty,
                entry_price: r.open_price,
                exit_price: r.close_price,
                realized_pnl: r.pnl,
                fee: r.fee,
                close_type: "close".to_string(),
                closed_at: Utc
                    .timestamp_millis_opt(r.close_time)
                    .single()
                    .unwrap_or_else(Utc::now),
            })
            .collect())
    }

    async fn get_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OpenOrder>> {
        let endpoint = format!(
            "/api/v1/orders?status=active&symbol={}",
            self.venue_symbol(symbol)
        );
        let data = self.request(Method::GET, &endpoint, None).await?;
        let rows: Vec<VenueOrder> = data
            .get("items")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ExchangeError::transient(format!("orders parse: {}", e)))?
            .unwrap_or_default();

        let mut orders = Vec::with_capacity(rows.len());
        for r in rows {
            let spec = self.spec(&r.symbol).await.unwrap_or_else(|_| {
                InstrumentSpec::linear_default(&symbols::normalize(&r.symbol))
            });
            orders.push(OpenOrder {
                order_id: r.id,
                symbol: symbols::normalize(&r.symbol),
                side: if r.side == "buy" {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                },
                order_type: r.order_type,
                price: r.price.as_deref().map(parse_f64).unwrap_or(0.0),
                quantity: r.size * spec.multiplier,
                trigger_price: r.stop_price.as_deref().map(parse_f64).filter(|p| *p > 0.0),
                reduce_only: r.reduce_only,
                created_at: Utc
                    .timestamp_millis_opt(r.created_at)
                    .single()
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(orders)
    }

    async fn get_user_trades(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ExchangeResult<Vec<TradeRecord>> {
        let endpoint = format!(
            "/api/v1/fills?startAt={}&pageSize={}",
            since.timestamp_millis(),
            limit.min(200)
        );
        let data = self.request(Method::GET, &endpoint, None).await?;
        let rows: Vec<VenueFill> = data
            .get("items")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ExchangeError::transient(format!("fills parse: {}", e)))?
            .unwrap_or_default();

        let mut trades = Vec::with_capacity(rows.len());
        for r in rows {
            let spec = self.spec(&r.symbol).await.unwrap_or_else(|_| {
                InstrumentSpec::linear_default(&symbols::normalize(&r.symbol))
            });
            trades.push(TradeRecord {
                exchange_trade_id: r.trade_id,
                exchange_order_id: r.order_id,
                symbol: symbols::normalize(&r.symbol),
                side: if r.side == "buy" {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                },
                // One-way venue: no explicit position side on fills
                position_side: None,
                order_action: None,
                price: parse_f64(&r.price),
                quantity: r.size * spec.multiplier,
                commission: parse_f64(&r.fee),
                realized_pnl: 0.0,
                executed_at: Utc
                    .timestamp_millis_opt(r.trade_time)
                    .single()
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(trades)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> KumexAdapter {
        KumexAdapter::new(&VenueCredentials {
            api_key: Some("k".into()),
            api_secret: Some("s".into()),
            passphrase: Some("p".into()),
            ..VenueCredentials::default()
        })
        .unwrap()
    }

    #[test]
    fn venue_symbol_round_trip() {
        let a = adapter();
        assert_eq!(a.venue_symbol("BTCUSDT"), "XBTUSDTM");
        assert_eq!(a.venue_symbol("ETHUSDT"), "ETHUSDTM");
        // convert_out(normalize(venue)) == venue
        assert_eq!(a.venue_symbol(&symbols::normalize("XBTUSDTM")), "XBTUSDTM");
    }

    #[test]
    fn signed_headers_present() {
        let a = adapter();
        let headers = a.sign_headers("GET", "/api/v1/positions", "");
        let names: Vec<&str> = headers.iter().map(|(k, _)| *k).collect();
        assert!(names.contains(&"KC-API-SIGN"));
        assert!(names.contains(&"KC-API-PASSPHRASE"));
        assert!(names.contains(&"KC-API-KEY-VERSION"));
    }
}
