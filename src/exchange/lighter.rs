//! zk-rollup L2 perpetuals adapter
//!
//! Orders are client-signed transactions submitted as multipart form data
//! `{tx_type, tx_info, price_protection}`. The account holds a registered
//! API signing key; a session auth token (~8 h validity) is minted locally
//! and refreshed at least 30 minutes before expiry. Transaction nonces are
//! fetched from the venue per submission unless supplied.
//!
//! The venue only exposes an open-order list: an order id absent from the
//! list is reported FILLED once its lifetime exceeds a short grace period.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ethers_core::k256::elliptic_curve::sec1::ToEncodedPoint;
use ethers_core::types::H256;
use ethers_core::utils::keccak256;
use ethers_signers::{LocalWallet, Signer};
use parking_lot::Mutex;
use reqwest::multipart::Form;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::models::{ClosedPnlRecord, OrderStatus, PositionSide};

use super::eip55::to_checksum_address;
use super::errors::{ExchangeError, ExchangeResult};
use super::symbols;
use super::{
    Balance, Exchange, GridExchange, Kline, OpenOrder, OrderAck, OrderBookSnapshot, OrderSide,
    OrderStatusInfo, PositionInfo, TradeRecord, VenueCredentials,
};

const MAINNET_API: &str = "https://mainnet.zklighter.elliot.ai";

const TX_TYPE_CREATE_ORDER: u8 = 14;
const TX_TYPE_CANCEL_ORDER: u8 = 15;
const TX_TYPE_CANCEL_ALL: u8 = 16;

/// Session tokens live ~8 h; refresh when less than 30 min remain.
const TOKEN_LIFETIME_SECS: i64 = 8 * 3600;
const TOKEN_REFRESH_MARGIN_SECS: i64 = 30 * 60;

/// Orders absent from the open list are assumed filled once older than this.
const ORDER_GRACE: Duration = Duration::from_secs(90);

const SLIPPAGE_BUY: f64 = 1.05;
const SLIPPAGE_SELL: f64 = 0.95;

const MARKET_CACHE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct MarketMeta {
    market_index: u32,
    size_decimals: u32,
    price_decimals: u32,
}

pub struct LighterAdapter {
    client: Client,
    api_url: String,
    wallet: LocalWallet,
    l1_address: String,
    account_index: i64,
    api_key_index: u8,
    auth_token: Mutex<Option<(String, DateTime<Utc>)>>,
    markets: Mutex<Option<(HashMap<String, MarketMeta>, Instant)>>,
    /// Orders this process submitted, for grace-period status inference
    submitted_at: Mutex<HashMap<String, Instant>>,
}

impl std::fmt::Debug for LighterAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LighterAdapter")
            .field("l1_address", &self.l1_address)
            .field("account_index", &self.account_index)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ApiKeyEntry {
    api_key_index: u8,
    public_key: String,
}

fn strip_hex(s: &str) -> &str {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s)
}

/// The signing key must derive the public key registered for this API key
/// slot; a mismatch means orders would be rejected server-side.
fn check_registered_key(derived_pubkey: &str, registered: &str) -> ExchangeResult<()> {
    if !strip_hex(registered).eq_ignore_ascii_case(strip_hex(derived_pubkey)) {
        return Err(ExchangeError::Auth(format!(
            "signing key derives public key {} but the venue has {} registered; \
             re-register the API key or use the matching private key",
            derived_pubkey, registered
        )));
    }
    Ok(())
}

impl LighterAdapter {
    pub async fn connect(creds: &VenueCredentials) -> anyhow::Result<Self> {
        let signing_key = creds
            .signing_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("LIGHTER_SIGNING_KEY not set"))?;
        let l1_address = creds
            .wallet_address
            .clone()
            .ok_or_else(|| anyhow::anyhow!("LIGHTER_WALLET_ADDRESS not set"))?;

        let wallet: LocalWallet = signing_key
            .trim_start_matches("0x")
            .parse()
            .map_err(|e| anyhow::anyhow!("malformed signing key: {}", e))?;

        // Venue canonical case before any API call
        let l1_address = to_checksum_address(&l1_address)?;

        let adapter = Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            api_url: MAINNET_API.to_string(),
            wallet,
            l1_address,
            account_index: -1,
            api_key_index: 0,
            auth_token: Mutex::new(None),
            markets: Mutex::new(None),
            submitted_at: Mutex::new(HashMap::new()),
        };

        let adapter = adapter.resolve_account().await?;
        adapter.verify_signing_key().await?;
        info!(
            "lighter adapter initialized: account_index={} l1={}",
            adapter.account_index, adapter.l1_address
        );
        Ok(adapter)
    }

    async fn resolve_account(mut self) -> anyhow::Result<Self> {
        let value = self
            .get_json(&format!(
                "/api/v1/accountsByL1Address?l1_address={}",
                self.l1_address
            ))
            .await?;
        let index = value
            .pointer("/sub_accounts/0/index")
            .and_then(|v| v.as_i64())
            .or_else(|| value.get("account_index").and_then(|v| v.as_i64()))
            .ok_or_else(|| {
                anyhow::anyhow!("no account registered for {}", self.l1_address)
            })?;
        self.account_index = index;
        Ok(self)
    }

    fn derived_pubkey(&self) -> String {
        let point = self.wallet.signer().verifying_key().to_encoded_point(false);
        hex::encode(point.as_bytes())
    }

    async fn verify_signing_key(&self) -> anyhow::Result<()> {
        let value = self
            .get_json(&format!(
                "/api/v1/apikeys?account_index={}&api_key_index={}",
                self.account_index, self.api_key_index
            ))
            .await?;
        let keys: Vec<ApiKeyEntry> = value
            .get("api_keys")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();

        let registered = keys
            .iter()
            .find(|k| k.api_key_index == self.api_key_index)
            .map(|k| k.public_key.clone())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no API key registered at index {} for account {}",
                    self.api_key_index,
                    self.account_index
                )
            })?;

        check_registered_key(&self.derived_pubkey(), &registered)?;
        Ok(())
    }

    /// Mint or reuse the session auth token. Tokens are refreshed while
    /// still comfortably valid so a mid-request expiry cannot happen.
    fn auth_token(&self) -> ExchangeResult<String> {
        let now = Utc::now();
        {
            let token = self.auth_token.lock();
            if let Some((value, expiry)) = token.as_ref() {
                if (*expiry - now).num_seconds() > TOKEN_REFRESH_MARGIN_SECS {
                    return Ok(value.clone());
                }
            }
        }

        let deadline = now + chrono::Duration::seconds(TOKEN_LIFETIME_SECS);
        let message = format!(
            "{}:{}:{}",
            self.account_index,
            self.api_key_index,
            deadline.timestamp()
        );
        let digest = H256::from(keccak256(message.as_bytes()));
        let sig = self
            .wallet
            .sign_hash(digest)
            .map_err(|e| ExchangeError::Auth(format!("auth token signing failed: {}", e)))?;
        let token = format!("{}:{}", deadline.timestamp(), sig);

        debug!("minted session token valid until {}", deadline);
        *self.auth_token.lock() = Some((token.clone(), deadline));
        Ok(token)
    }

    async fn get_json(&self, path: &str) -> ExchangeResult<serde_json::Value> {
        let token = self.auth_token()?;
        let resp = self
            .client
            .get(format!("{}{}", self.api_url, path))
            .header("Authorization", token)
            .send()
            .await
            .map_err(|e| ExchangeError::transient(format!("request: {}", e)))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(ExchangeError::transient(format!("{}: {}", status, text)));
            }
            if status.as_u16() == 401 {
                return Err(ExchangeError::Auth(format!(
                    "session token rejected: {} - the token is refreshed 30m early, \
                     so this usually means a revoked API key",
                    text
                )));
            }
            return Err(ExchangeError::Venue {
                code: status.as_u16() as i64,
                message: text,
            });
        }
        serde_json::from_str(&text)
            .map_err(|e| ExchangeError::transient(format!("parse {}: {}", path, e)))
    }

    /// Next transaction nonce, auto-fetched from the venue.
    async fn next_nonce(&self) -> ExchangeResult<i64> {
        let value = self
            .get_json(&format!(
                "/api/v1/nextNonce?account_index={}&api_key_index={}",
                self.account_index, self.api_key_index
            ))
            .await?;
        value
            .get("nonce")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ExchangeError::transient("nextNonce response missing nonce"))
    }

    /// Sign tx_info and submit as multipart form data.
    async fn send_tx(
        &self,
        tx_type: u8,
        mut tx_info: serde_json::Value,
        price_protection: Option<f64>,
    ) -> ExchangeResult<serde_json::Value> {
        let nonce = self.next_nonce().await?;
        tx_info["account_index"] = self.account_index.into();
        tx_info["api_key_index"] = self.api_key_index.into();
        tx_info["nonce"] = nonce.into();

        // Signature over the canonical tx_info bytes
        let payload = tx_info.to_string();
        let digest = H256::from(keccak256(payload.as_bytes()));
        let sig = self
            .wallet
            .sign_hash(digest)
            .map_err(|e| ExchangeError::Auth(format!("tx signing failed: {}", e)))?;
        tx_info["sig"] = format!("{}", sig).into();

        let mut form = Form::new()
            .text("tx_type", tx_type.to_string())
            .text("tx_info", tx_info.to_string());
        if let Some(protection) = price_protection {
            form = form.text("price_protection", format!("{}", protection));
        }

        let token = self.auth_token()?;
        let resp = self
            .client
            .post(format!("{}/api/v1/sendTx", self.api_url))
            .header("Authorization", token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ExchangeError::transient(format!("sendTx: {}", e)))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(ExchangeError::transient(format!("{}: {}", status, text)));
            }
            return Err(ExchangeError::Venue {
                code: status.as_u16() as i64,
                message: text,
            });
        }

        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| ExchangeError::transient(format!("sendTx parse: {}", e)))?;

        if let Some(code) = value.get("code").and_then(|v| v.as_i64()) {
            if code != 200 {
                let msg = value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("sendTx rejected")
                    .to_string();
                let lower = msg.to_lowercase();
                return Err(if lower.contains("margin") || lower.contains("collateral") {
                    ExchangeError::InsufficientMargin {
                        needed: 0.0,
                        available: 0.0,
                    }
                } else if lower.contains("nonce") {
                    ExchangeError::transient(msg)
                } else {
                    ExchangeError::Venue { code, message: msg }
                });
            }
        }
        Ok(value)
    }

    async fn market_meta(&self, symbol: &str) -> ExchangeResult<MarketMeta> {
        let canonical = symbols::normalize(symbol);
        {
            let markets = self.markets.lock();
            if let Some((map, at)) = markets.as_ref() {
                if at.elapsed() < MARKET_CACHE_TTL {
                    return map
                        .get(&canonical)
                        .cloned()
                        .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()));
                }
            }
        }

        let value = self.get_json("/api/v1/orderBooks").await?;
        let rows = value
            .get("order_books")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut map = HashMap::new();
        for row in rows {
            let Some(sym) = row.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            map.insert(
                symbols::normalize(sym),
                MarketMeta {
                    market_index: row
                        .get("market_id")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0) as u32,
                    size_decimals: row
                        .get("supported_size_decimals")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(4) as u32,
                    price_decimals: row
                        .get("supported_price_decimals")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(2) as u32,
                },
            );
        }
        let result = map
            .get(&canonical)
            .cloned()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()));
        *self.markets.lock() = Some((map, Instant::now()));
        result
    }

    fn scaled_amount(qty: f64, decimals: u32, symbol: &str) -> ExchangeResult<i64> {
        let scale = 10f64.powi(decimals as i32);
        let scaled = (qty * scale).round() as i64;
        if scaled <= 0 {
            return Err(ExchangeError::InvalidQuantity {
                symbol: symbol.to_string(),
                reason: format!("{} rounds to zero at {} decimals", qty, decimals),
            });
        }
        Ok(scaled)
    }

    async fn account_state(&self) -> ExchangeResult<serde_json::Value> {
        self.get_json(&format!(
            "/api/v1/account?by=index&value={}",
            self.account_index
        ))
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_order(
        &self,
        symbol: &str,
        is_buy: bool,
        quantity: f64,
        price: f64,
        reduce_only: bool,
        order_type: u8,
        price_protection: Option<f64>,
    ) -> ExchangeResult<OrderAck> {
        let meta = self.market_meta(symbol).await?;
        let base_amount = Self::scaled_amount(quantity, meta.size_decimals, symbol)?;
        let price_scaled = Self::scaled_amount(price, meta.price_decimals, symbol)?;
        let client_order_index = Utc::now().timestamp_millis();

        // IOC for market-ish submissions, GTC for resting orders
        let time_in_force = if order_type == 1 { 0 } else { 1 };
        let tx_info = serde_json::json!({
            "market_index": meta.market_index,
            "client_order_index": client_order_index,
            "base_amount": base_amount,
            "price": price_scaled,
            "is_ask": !is_buy,
            "type": order_type,
            "time_in_force": time_in_force,
            "reduce_only": reduce_only,
        });

        let value = self
            .send_tx(TX_TYPE_CREATE_ORDER, tx_info, price_protection)
            .await?;

        let order_id = value
            .get("tx_hash")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| client_order_index.to_string());

        self.submitted_at
            .lock()
            .insert(order_id.clone(), Instant::now());

        Ok(OrderAck {
            order_id,
            status: OrderStatus::New,
        })
    }

    async fn market_ish(
        &self,
        symbol: &str,
        is_buy: bool,
        quantity: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck> {
        let mark = self.get_market_price(symbol).await?;
        let protection = if is_buy {
            mark * SLIPPAGE_BUY
        } else {
            mark * SLIPPAGE_SELL
        };
        // type 1 = immediate-or-cancel market order with protection price
        self.create_order(symbol, is_buy, quantity, protection, reduce_only, 1, Some(protection))
            .await
    }

    async fn venue_position(&self, symbol: &str) -> ExchangeResult<Option<(PositionSide, f64)>> {
        let canonical = symbols::normalize(symbol);
        let state = self.account_state().await?;
        let rows = state
            .pointer("/accounts/0/positions")
            .or_else(|| state.get("positions"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        for row in rows {
            let sym = row
                .get("symbol")
                .and_then(|v| v.as_str())
                .map(symbols::normalize)
                .unwrap_or_default();
            if sym != canonical {
                continue;
            }
            let size: f64 = row
                .get("position")
                .and_then(|v| v.as_str().map(|s| s.parse().unwrap_or(0.0)).or_else(|| v.as_f64()))
                .unwrap_or(0.0);
            let sign = row.get("sign").and_then(|v| v.as_i64()).unwrap_or(1);
            let signed = if sign < 0 { -size.abs() } else { size };
            if signed.abs() < 1e-12 {
                return Ok(None);
            }
            let side = if signed > 0.0 {
                PositionSide::Long
            } else {
                PositionSide::Short
            };
            return Ok(Some((side, signed.abs())));
        }
        Ok(None)
    }

    async fn close(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
    ) -> ExchangeResult<OrderAck> {
        let held = match self.venue_position(symbol).await? {
            Some((side, qty)) if side == position_side => qty,
            _ => return Err(ExchangeError::NoPosition(symbol.to_string())),
        };
        let qty = if quantity <= 0.0 { held } else { quantity.min(held) };
        let is_buy = position_side == PositionSide::Short;
        self.market_ish(symbol, is_buy, qty, true).await
    }

    async fn cancel_all_tx(&self, symbol: &str) -> ExchangeResult<u32> {
        let open = self.get_open_orders(symbol).await?.len() as u32;
        let meta = self.market_meta(symbol).await?;
        let tx_info = serde_json::json!({
            "market_index": meta.market_index,
        });
        self.send_tx(TX_TYPE_CANCEL_ALL, tx_info, None).await?;
        Ok(open)
    }
}

#[async_trait]
impl Exchange for LighterAdapter {
    fn exchange_id(&self) -> &str {
        "lighter"
    }

    async fn get_balance(&self) -> ExchangeResult<Balance> {
        let state = self.account_state().await?;
        let account = state
            .pointer("/accounts/0")
            .cloned()
            .unwrap_or(state);

        let get = |key: &str| -> f64 {
            account
                .get(key)
                .and_then(|v| v.as_str().map(|s| s.parse().unwrap_or(0.0)).or_else(|| v.as_f64()))
                .unwrap_or(0.0)
        };

        let collateral = get("collateral");
        let available = get("available_balance");

        // Unrealized is summed per position when the venue omits a total
        let mut unrealized = 0.0;
        if let Some(rows) = account.get("positions").and_then(|v| v.as_array()) {
            for row in rows {
                unrealized += row
                    .get("unrealized_pnl")
                    .and_then(|v| v.as_str().map(|s| s.parse().unwrap_or(0.0)).or_else(|| v.as_f64()))
                    .unwrap_or(0.0);
            }
        }

        Ok(Balance {
            wallet_balance: collateral,
            available_balance: available,
            unrealized_profit: unrealized,
            equity: collateral + unrealized,
        })
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<PositionInfo>> {
        let state = self.account_state().await?;
        let rows = state
            .pointer("/accounts/0/positions")
            .or_else(|| state.get("positions"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let parse_field = |row: &serde_json::Value, key: &str| -> f64 {
            row.get(key)
                .and_then(|v| v.as_str().map(|s| s.parse().unwrap_or(0.0)).or_else(|| v.as_f64()))
                .unwrap_or(0.0)
        };

        let mut positions = Vec::new();
        for row in rows {
            let size = parse_field(&row, "position");
            let sign = row.get("sign").and_then(|v| v.as_i64()).unwrap_or(1);
            let signed = if sign < 0 { -size.abs() } else { size };
            if signed.abs() < 1e-12 {
                continue;
            }
            positions.push(PositionInfo {
                symbol: symbols::normalize(
                    row.get("symbol").and_then(|v| v.as_str()).unwrap_or_default(),
                ),
                side: if signed > 0.0 {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                quantity: signed.abs(),
                entry_price: parse_field(&row, "avg_entry_price"),
                mark_price: parse_field(&row, "mark_price"),
                unrealized_profit: parse_field(&row, "unrealized_pnl"),
                leverage: parse_field(&row, "leverage").round().max(1.0) as u32,
                liquidation_price: parse_field(&row, "liquidation_price"),
            });
        }
        Ok(positions)
    }

    async fn get_market_price(&self, symbol: &str) -> ExchangeResult<f64> {
        let meta = self.market_meta(symbol).await?;
        let value = self
            .get_json(&format!(
                "/api/v1/orderBookDetails?market_id={}",
                meta.market_index
            ))
            .await?;
        let last = value.pointer("/order_book_details/0/last_trade_price");
        last.and_then(|v| {
            v.as_str()
                .and_then(|s| s.parse().ok())
                .or_else(|| v.as_f64())
        })
        .filter(|p| *p > 0.0)
        .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Kline>> {
        let meta = self.market_meta(symbol).await?;
        let resolution = match interval {
            "1m" => "1m",
            "5m" => "5m",
            "15m" => "15m",
            "1h" => "1h",
            "4h" => "4h",
            "1d" => "1d",
            _ => "1h",
        };
        let end = Utc::now().timestamp();
        let value = self
            .get_json(&format!(
                "/api/v1/candlesticks?market_id={}&resolution={}&count_back={}&end_timestamp={}",
                meta.market_index, resolution, limit, end
            ))
            .await?;

        let parse_field = |row: &serde_json::Value, key: &str| -> f64 {
            row.get(key)
                .and_then(|v| v.as_str().map(|s| s.parse().unwrap_or(0.0)).or_else(|| v.as_f64()))
                .unwrap_or(0.0)
        };

        Ok(value
            .get("candlesticks")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|c| Kline {
                open_time: c.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0),
                open: parse_field(&c, "open"),
                high: parse_field(&c, "high"),
                low: parse_field(&c, "low"),
                close: parse_field(&c, "close"),
                volume: parse_field(&c, "volume0"),
            })
            .collect())
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> ExchangeResult<()> {
        // Account-wide cross margin with venue-side leverage; repeat
        // requests are the idempotent no-op case.
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, cross: bool) -> ExchangeResult<()> {
        if cross {
            return Ok(());
        }
        Err(ExchangeError::Unsupported(
            "isolated margin mode on this venue",
        ))
    }

    async fn open_long(
        &self,
        symbol: &str,
        quantity: f64,
        _leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        self.market_ish(symbol, true, quantity, false).await
    }

    async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        _leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        self.market_ish(symbol, false, quantity, false).await
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
        let is_buy = position_side == PositionSide::Short;
        // type 2 = stop-loss trigger order
        self.create_order(symbol, is_buy, quantity, trigger_price, true, 2, None)
            .await
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
        trigger_price: f64,
    ) -> ExchangeResult<OrderAck> {
        let is_buy = position_side == PositionSide::Short;
        // type 3 = take-profit trigger order
        self.create_order(symbol, is_buy, quantity, trigger_price, true, 3, None)
            .await
    }

    /// Trigger orders are not distinguishable by family on the open-order
    /// list; stop-loss and take-profit are cancelled together.
    async fn cancel_stop_loss_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.cancel_stop_orders(symbol).await
    }

    /// See `cancel_stop_loss_orders`.
    async fn cancel_take_profit_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.cancel_stop_orders(symbol).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.cancel_all_tx(symbol).await
    }

    async fn cancel_stop_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        let meta = self.market_meta(symbol).await?;
        let orders = self.get_open_orders(symbol).await?;
        let mut cancelled = 0;
        for order in orders.into_iter().filter(|o| o.trigger_price.is_some()) {
            let Ok(order_index) = order.order_id.parse::<i64>() else {
                continue;
            };
            let tx_info = serde_json::json!({
                "market_index": meta.market_index,
                "order_index": order_index,
            });
            match self.send_tx(TX_TYPE_CANCEL_ORDER, tx_info, None).await {
                Ok(_) => cancelled += 1,
                Err(e) => warn!("cancel order {} failed: {}", order.order_id, e),
            }
        }
        Ok(cancelled)
    }

    async fn format_quantity(&self, symbol: &str, quantity: f64) -> ExchangeResult<String> {
        let meta = self.market_meta(symbol).await?;
        let scaled = Self::scaled_amount(quantity, meta.size_decimals, symbol)?;
        let scale = 10f64.powi(meta.size_decimals as i32);
        Ok(format!(
            "{:.*}",
            meta.size_decimals as usize,
            scaled as f64 / scale
        ))
    }

    /// Only the open-order list is exposed: an absent id reports FILLED once
    /// its lifetime exceeds the grace period, NEW while still young.
    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> ExchangeResult<OrderStatusInfo> {
        let open = self.get_open_orders(symbol).await?;
        if let Some(order) = open.iter().find(|o| o.order_id == order_id) {
            return Ok(OrderStatusInfo {
                status: OrderStatus::New,
                avg_price: order.price,
                executed_qty: 0.0,
                commission: 0.0,
            });
        }

        let age = self
            .submitted_at
            .lock()
            .get(order_id)
            .map(|at| at.elapsed());

        match age {
            Some(age) if age < ORDER_GRACE => Ok(OrderStatusInfo {
                status: OrderStatus::New,
                avg_price: 0.0,
                executed_qty: 0.0,
                commission: 0.0,
            }),
            _ => {
                // Past the grace window (or submitted by a previous run):
                // absent means executed.
                self.submitted_at.lock().remove(order_id);
                Ok(OrderStatusInfo {
                    status: OrderStatus::Filled,
                    avg_price: 0.0,
                    executed_qty: 0.0,
                    commission: 0.0,
                })
            }
        }
    }

    async fn get_closed_pnl(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ExchangeResult<Vec<ClosedPnlRecord>> {
        let trades = self.get_user_trades(since, limit.max(100)).await?;
        let mut records = Vec::new();
        for t in trades.into_iter().filter(|t| t.realized_pnl.abs() > 1e-12) {
            let side = match t.side {
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
                exchange_id: "lighter".to_string(),
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
        let meta = self.market_meta(symbol).await?;
        let value = self
            .get_json(&format!(
                "/api/v1/accountActiveOrders?account_index={}&market_id={}",
                self.account_index, meta.market_index
            ))
            .await?;

        let parse_field = |row: &serde_json::Value, key: &str| -> f64 {
            row.get(key)
                .and_then(|v| v.as_str().map(|s| s.parse().unwrap_or(0.0)).or_else(|| v.as_f64()))
                .unwrap_or(0.0)
        };

        Ok(value
            .get("orders")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|o| {
                let trigger = parse_field(&o, "trigger_price");
                OpenOrder {
                    order_id: o
                        .get("order_index")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0)
                        .to_string(),
                    symbol: symbols::normalize(symbol),
                    side: if o.get("is_ask").and_then(|v| v.as_bool()).unwrap_or(false) {
                        OrderSide::Sell
                    } else {
                        OrderSide::Buy
                    },
                    order_type: o
                        .get("type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("limit")
                        .to_string(),
                    price: parse_field(&o, "price"),
                    quantity: parse_field(&o, "remaining_base_amount"),
                    trigger_price: (trigger > 0.0).then_some(trigger),
                    reduce_only: o
                        .get("reduce_only")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                    created_at: Utc
                        .timestamp_opt(o.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0), 0)
                        .single()
                        .unwrap_or_else(Utc::now),
                }
            })
            .collect())
    }

    async fn get_user_trades(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ExchangeResult<Vec<TradeRecord>> {
        let value = self
            .get_json(&format!(
                "/api/v1/accountTrades?account_index={}&from={}&limit={}",
                self.account_index,
                since.timestamp(),
                limit.min(500)
            ))
            .await?;

        let parse_field = |row: &serde_json::Value, key: &str| -> f64 {
            row.get(key)
                .and_then(|v| v.as_str().map(|s| s.parse().unwrap_or(0.0)).or_else(|| v.as_f64()))
                .unwrap_or(0.0)
        };

        Ok(value
            .get("trades")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|t| TradeRecord {
                exchange_trade_id: t
                    .get("trade_id")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0)
                    .to_string(),
                exchange_order_id: t
                    .get("order_index")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0)
                    .to_string(),
                symbol: symbols::normalize(
                    t.get("symbol").and_then(|v| v.as_str()).unwrap_or_default(),
                ),
                side: if t.get("is_ask").and_then(|v| v.as_bool()).unwrap_or(false) {
                    OrderSide::Sell
                } else {
                    OrderSide::Buy
                },
                position_side: None,
                order_action: None,
                price: parse_field(&t, "price"),
                quantity: parse_field(&t, "size"),
                commission: parse_field(&t, "fee"),
                realized_pnl: parse_field(&t, "realized_pnl"),
                executed_at: Utc
                    .timestamp_opt(t.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0), 0)
                    .single()
                    .unwrap_or_else(Utc::now),
            })
            .collect())
    }

    fn grid(&self) -> Option<&dyn GridExchange> {
        Some(self)
    }
}

#[async_trait]
impl GridExchange for LighterAdapter {
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        _post_only: bool,
    ) -> ExchangeResult<OrderAck> {
        // type 0 = resting limit order; maker-only books reject crossing
        // prices server-side so no separate post-only flag exists
        self.create_order(symbol, side == OrderSide::Buy, quantity, price, false, 0, None)
            .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        let meta = self.market_meta(symbol).await?;
        let order_index: i64 = order_id
            .parse()
            .map_err(|_| ExchangeError::transient(format!("malformed order id {}", order_id)))?;
        let tx_info = serde_json::json!({
            "market_index": meta.market_index,
            "order_index": order_index,
        });
        self.send_tx(TX_TYPE_CANCEL_ORDER, tx_info, None).await?;
        Ok(())
    }

    async fn get_order_book(
        &self,
        symbol: &str,
        depth: usize,
    ) -> ExchangeResult<OrderBookSnapshot> {
        let meta = self.market_meta(symbol).await?;
        let value = self
            .get_json(&format!(
                "/api/v1/orderBookOrders?market_id={}&limit={}",
                meta.market_index, depth
            ))
            .await?;

        let parse_levels = |key: &str| -> Vec<(f64, f64)> {
            value
                .get(key)
                .and_then(|v| v.as_array())
                .map(|rows| {
                    rows.iter()
                        .filter_map(|r| {
                            Some((
                                r.get("price")?.as_str()?.parse().ok()?,
                                r.get("remaining_base_amount")?.as_str()?.parse().ok()?,
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
    fn registered_key_comparison() {
        assert!(check_registered_key("0xABCDEF", "abcdef").is_ok());
        let err = check_registered_key("0xaaaa", "0xbbbb").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("0xaaaa"));
        assert!(msg.contains("0xbbbb"));
    }

    #[test]
    fn scaled_amount_rejects_zero() {
        assert!(LighterAdapter::scaled_amount(0.00004, 3, "BTCUSDT").is_err());
        assert_eq!(
            LighterAdapter::scaled_amount(0.045, 3, "BTCUSDT").unwrap(),
            45
        );
    }
}
