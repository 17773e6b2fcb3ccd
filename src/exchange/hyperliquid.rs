//! Hyperliquid-style Agent-Wallet DEX adapter
//!
//! Actions are msgpack-hashed and EIP-712 signed by an agent key that is
//! authorized by the funding wallet but holds no value itself. Startup
//! verifies the agent key against the server-registered agent and refuses
//! to run when the agent address carries more than the funds threshold.
//!
//! The venue has no market orders; "market-ish" submissions are IOC limits
//! at a slippage-protection price (x1.05 for buys, x0.95 for sells).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ethers_core::types::transaction::eip712::EIP712Domain;
use ethers_core::types::{Address, H256, U256};
use ethers_core::utils::keccak256;
use ethers_signers::{LocalWallet, Signer};
use parking_lot::Mutex;
use reqwest::Client;
use rmp_serde::Serializer;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::{ClosedPnlRecord, DecisionAction, OrderStatus, PositionSide};

use super::eip55::to_checksum_address;
use super::errors::{ExchangeError, ExchangeResult};
use super::symbols;
use super::{
    Balance, Exchange, GridExchange, Kline, OpenOrder, OrderAck, OrderBookSnapshot, OrderSide,
    OrderStatusInfo, PositionInfo, TradeRecord, VenueCredentials,
};

const MAINNET_API: &str = "https://api.hyperliquid.xyz";

/// USDC the agent address may hold before init refuses: the agent signs, it
/// does not custody funds.
const AGENT_FUNDS_THRESHOLD: f64 = 100.0;

const SLIPPAGE_BUY: f64 = 1.05;
const SLIPPAGE_SELL: f64 = 0.95;

const META_CACHE_TTL: Duration = Duration::from_secs(3600);
const ACCOUNT_CACHE_TTL: Duration = Duration::from_secs(15);

// ─── Wire types for msgpack action hashing ─────────────────────────────
// Single-letter keys and field order must match the venue's canonical
// serialization or the recovered signer address changes.

#[derive(Serialize)]
struct LimitWirePack {
    tif: String,
}

#[derive(Serialize)]
struct TriggerWirePack {
    #[serde(rename = "isMarket")]
    is_market: bool,
    #[serde(rename = "triggerPx")]
    trigger_px: String,
    tpsl: String,
}

#[derive(Serialize)]
enum OrderTypePack {
    #[serde(rename = "limit")]
    Limit(LimitWirePack),
    #[serde(rename = "trigger")]
    Trigger(TriggerWirePack),
}

#[derive(Serialize)]
struct OrderWirePack {
    a: u32,
    b: bool,
    p: String,
    s: String,
    r: bool,
    t: OrderTypePack,
}

#[derive(Serialize)]
struct OrderActionPack {
    r#type: String,
    orders: Vec<OrderWirePack>,
    grouping: String,
}

#[derive(Serialize)]
struct CancelWirePack {
    a: u32,
    o: u64,
}

#[derive(Serialize)]
struct CancelActionPack {
    r#type: String,
    cancels: Vec<CancelWirePack>,
}

#[derive(Serialize)]
struct UpdateLeveragePack {
    r#type: String,
    asset: u32,
    #[serde(rename = "isCross")]
    is_cross: bool,
    leverage: u32,
}

#[derive(Debug, Clone, Serialize)]
struct WireSignature {
    r: String,
    s: String,
    v: u8,
}

/// keccak(msgpack(action) + nonce_be + 0x00) - no vault address in use.
fn action_hash<T: Serialize>(action: &T, nonce: u64) -> [u8; 32] {
    let mut buf = Vec::new();
    let mut serializer = Serializer::new(&mut buf).with_struct_map();
    action
        .serialize(&mut serializer)
        .expect("msgpack serialization of a plain struct cannot fail");
    buf.extend_from_slice(&nonce.to_be_bytes());
    buf.push(0x00);
    keccak256(&buf)
}

/// EIP-712 signature over Agent(source, connectionId) with the venue's
/// fixed Exchange domain.
fn sign_agent_digest(wallet: &LocalWallet, connection_id: [u8; 32]) -> ExchangeResult<WireSignature> {
    let domain = EIP712Domain {
        name: Some("Exchange".to_string()),
        version: Some("1".to_string()),
        chain_id: Some(U256::from(1337u64)),
        verifying_contract: Some(Address::zero()),
        salt: None,
    };
    let domain_hash = domain.separator();

    let agent_type_hash = keccak256("Agent(string source,bytes32 connectionId)".as_bytes());
    let source_hash = keccak256("a".as_bytes());

    let mut encoded = Vec::new();
    encoded.extend_from_slice(&agent_type_hash);
    encoded.extend_from_slice(&source_hash);
    encoded.extend_from_slice(&connection_id);
    let struct_hash = keccak256(&encoded);

    let mut payload = Vec::new();
    payload.extend_from_slice(&[0x19, 0x01]);
    payload.extend_from_slice(&domain_hash);
    payload.extend_from_slice(&struct_hash);
    let digest = H256::from(keccak256(&payload));

    let sig = wallet
        .sign_hash(digest)
        .map_err(|e| ExchangeError::Auth(format!("agent signing failed: {}", e)))?;

    Ok(WireSignature {
        r: format!("0x{:0>64x}", sig.r),
        s: format!("0x{:0>64x}", sig.s),
        v: sig.v as u8,
    })
}

/// Refuse initialization when the agent address custodies real funds.
fn check_agent_funds(
    agent_address: &str,
    main_address: &str,
    agent_usdc: f64,
    threshold: f64,
) -> ExchangeResult<()> {
    if agent_usdc > threshold {
        return Err(ExchangeError::Auth(format!(
            "agent wallet {} holds {:.2} USDC (limit {:.0}); move funds to the main wallet {} - \
             the agent key is for signing only",
            agent_address, agent_usdc, threshold, main_address
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct AssetMeta {
    index: u32,
    sz_decimals: u32,
}

pub struct HyperliquidAdapter {
    client: Client,
    api_url: String,
    wallet: LocalWallet,
    agent_address: String,
    main_address: String,
    nonce_counter: AtomicU64,
    meta: Mutex<Option<(HashMap<String, AssetMeta>, Instant)>>,
    state_cache: Mutex<Option<(serde_json::Value, Instant)>>,
}

impl std::fmt::Debug for HyperliquidAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperliquidAdapter")
            .field("main_address", &self.main_address)
            .field("agent_address", &self.agent_address)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

impl HyperliquidAdapter {
    pub async fn connect(creds: &VenueCredentials) -> anyhow::Result<Self> {
        let signing_key = creds
            .signing_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("HYPERLIQUID_SIGNING_KEY not set"))?;
        let main_address = creds
            .wallet_address
            .clone()
            .ok_or_else(|| anyhow::anyhow!("HYPERLIQUID_WALLET_ADDRESS not set"))?;

        let wallet: LocalWallet = signing_key
            .trim_start_matches("0x")
            .parse()
            .map_err(|e| anyhow::anyhow!("malformed signing key: {}", e))?;

        let agent_address = to_checksum_address(&format!("{:#x}", wallet.address()))?;
        let main_address = to_checksum_address(&main_address)?;

        let adapter = Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            api_url: MAINNET_API.to_string(),
            wallet,
            agent_address,
            main_address,
            nonce_counter: AtomicU64::new(Utc::now().timestamp_millis() as u64),
            meta: Mutex::new(None),
            state_cache: Mutex::new(None),
        };

        adapter.verify_agent_registration().await?;
        adapter.verify_agent_funds().await?;
        info!(
            "hyperliquid adapter initialized: main={} agent={}",
            adapter.main_address, adapter.agent_address
        );
        Ok(adapter)
    }

    /// The signing key must derive the exact agent the server has
    /// registered for the main wallet.
    async fn verify_agent_registration(&self) -> anyhow::Result<()> {
        let agents = self
            .info(serde_json::json!({
                "type": "extraAgents",
                "user": self.main_address,
            }))
            .await?;

        let registered: Vec<String> = agents
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|a| a.get("address").and_then(|v| v.as_str()))
                    .filter_map(|a| to_checksum_address(a).ok())
                    .collect()
            })
            .unwrap_or_default();

        if !registered.iter().any(|a| *a == self.agent_address) {
            anyhow::bail!(
                "signing key derives agent {} but the server has {} registered for {}; \
                 approve this agent or use the matching key",
                self.agent_address,
                registered.join(", "),
                self.main_address
            );
        }
        Ok(())
    }

    async fn verify_agent_funds(&self) -> anyhow::Result<()> {
        let state = self
            .info(serde_json::json!({
                "type": "spotClearinghouseState",
                "user": self.agent_address,
            }))
            .await?;

        let usdc = state
            .get("balances")
            .and_then(|v| v.as_array())
            .and_then(|rows| {
                rows.iter().find(|b| {
                    b.get("coin").and_then(|c| c.as_str()) == Some("USDC")
                })
            })
            .and_then(|b| b.get("total"))
            .and_then(|t| t.as_str().map(|s| s.parse().unwrap_or(0.0)).or_else(|| t.as_f64()))
            .unwrap_or(0.0);

        check_agent_funds(
            &self.agent_address,
            &self.main_address,
            usdc,
            AGENT_FUNDS_THRESHOLD,
        )?;
        Ok(())
    }

    fn next_nonce(&self) -> u64 {
        // Monotonic, anchored to wall time as the venue expects
        let now = Utc::now().timestamp_millis() as u64;
        self.nonce_counter.fetch_max(now, Ordering::SeqCst);
        self.nonce_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn info(&self, body: serde_json::Value) -> ExchangeResult<serde_json::Value> {
        let resp = self
            .client
            .post(format!("{}/info", self.api_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ExchangeError::transient(format!("info request: {}", e)))?;

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
        serde_json::from_str(&text)
            .map_err(|e| ExchangeError::transient(format!("info parse: {}", e)))
    }

    /// Sign and submit one action to /exchange.
    async fn exchange_request<T: Serialize>(
        &self,
        action_pack: &T,
        action_json: serde_json::Value,
    ) -> ExchangeResult<serde_json::Value> {
        let nonce = self.next_nonce();
        let hash = action_hash(action_pack, nonce);
        let signature = sign_agent_digest(&self.wallet, hash)?;

        let body = serde_json::json!({
            "action": action_json,
            "nonce": nonce,
            "signature": signature,
            "vaultAddress": null,
        });

        let resp = self
            .client
            .post(format!("{}/exchange", self.api_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ExchangeError::transient(format!("exchange request: {}", e)))?;

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
            .map_err(|e| ExchangeError::transient(format!("exchange parse: {}", e)))?;

        if value.get("status").and_then(|s| s.as_str()) == Some("err") {
            let msg = value
                .get("response")
                .and_then(|r| r.as_str())
                .unwrap_or("unknown venue error")
                .to_string();
            let lower = msg.to_lowercase();
            return Err(if lower.contains("margin") {
                ExchangeError::InsufficientMargin {
                    needed: 0.0,
                    available: 0.0,
                }
            } else if lower.contains("signature") || lower.contains("agent") {
                ExchangeError::Auth(format!(
                    "{} - agent {} may not be authorized for {}",
                    msg, self.agent_address, self.main_address
                ))
            } else {
                ExchangeError::Venue {
                    code: 0,
                    message: msg,
                }
            });
        }

        self.invalidate_state_cache();
        Ok(value)
    }

    fn invalidate_state_cache(&self) {
        *self.state_cache.lock() = None;
    }

    async fn asset_meta(&self, symbol: &str) -> ExchangeResult<AssetMeta> {
        let coin = symbols::base_asset(&symbols::normalize(symbol)).to_string();
        {
            let meta = self.meta.lock();
            if let Some((map, at)) = meta.as_ref() {
                if at.elapsed() < META_CACHE_TTL {
                    return map
                        .get(&coin)
                        .cloned()
                        .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()));
                }
            }
        }

        let value = self.info(serde_json::json!({"type": "meta"})).await?;
        let universe = value
            .get("universe")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ExchangeError::transient("meta response missing universe"))?;

        let mut map = HashMap::new();
        for (index, asset) in universe.iter().enumerate() {
            let Some(name) = asset.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            let sz_decimals = asset
                .get("szDecimals")
                .and_then(|v| v.as_u64())
                .unwrap_or(3) as u32;
            map.insert(
                name.to_string(),
                AssetMeta {
                    index: index as u32,
                    sz_decimals,
                },
            );
        }
        let result = map
            .get(&coin)
            .cloned()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()));
        *self.meta.lock() = Some((map, Instant::now()));
        result
    }

    async fn clearinghouse_state(&self) -> ExchangeResult<serde_json::Value> {
        if let Some((state, at)) = self.state_cache.lock().clone() {
            if at.elapsed() < ACCOUNT_CACHE_TTL {
                return Ok(state);
            }
        }
        let state = self
            .info(serde_json::json!({
                "type": "clearinghouseState",
                "user": self.main_address,
            }))
            .await?;
        *self.state_cache.lock() = Some((state.clone(), Instant::now()));
        Ok(state)
    }

    fn round_size(qty: f64, sz_decimals: u32) -> ExchangeResult<f64> {
        let scale = 10f64.powi(sz_decimals as i32);
        let rounded = (qty * scale).round() / scale;
        if rounded <= 0.0 {
            return Err(ExchangeError::InvalidQuantity {
                symbol: String::new(),
                reason: format!("{} rounds to zero at {} decimals", qty, sz_decimals),
            });
        }
        Ok(rounded)
    }

    /// Prices are limited to 5 significant figures on this venue.
    fn round_price(price: f64) -> f64 {
        if price <= 0.0 {
            return price;
        }
        let magnitude = price.abs().log10().floor();
        let scale = 10f64.powf(4.0 - magnitude);
        (price * scale).round() / scale
    }

    fn format_size(qty: f64, sz_decimals: u32) -> String {
        let s = format!("{:.*}", sz_decimals as usize, qty);
        // The venue rejects trailing zeros in signed payloads
        let trimmed = s.trim_end_matches('0').trim_end_matches('.');
        if trimmed.is_empty() {
            "0".to_string()
        } else {
            trimmed.to_string()
        }
    }

    fn format_price(price: f64) -> String {
        let s = format!("{:.8}", price);
        let trimmed = s.trim_end_matches('0').trim_end_matches('.');
        trimmed.to_string()
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_order(
        &self,
        symbol: &str,
        is_buy: bool,
        quantity: f64,
        limit_price: f64,
        reduce_only: bool,
        tif: &str,
        trigger: Option<(f64, &str)>,
    ) -> ExchangeResult<OrderAck> {
        let meta = self.asset_meta(symbol).await?;
        let qty = Self::round_size(quantity, meta.sz_decimals).map_err(|e| match e {
            ExchangeError::InvalidQuantity { reason, .. } => ExchangeError::InvalidQuantity {
                symbol: symbol.to_string(),
                reason,
            },
            other => other,
        })?;
        let px = Self::round_price(limit_price);

        let (type_pack, type_json) = match trigger {
            None => (
                OrderTypePack::Limit(LimitWirePack {
                    tif: tif.to_string(),
                }),
                serde_json::json!({"limit": {"tif": tif}}),
            ),
            Some((trigger_px, tpsl)) => {
                let tpx = Self::format_price(Self::round_price(trigger_px));
                (
                    OrderTypePack::Trigger(TriggerWirePack {
                        is_market: true,
                        trigger_px: tpx.clone(),
                        tpsl: tpsl.to_string(),
                    }),
                    serde_json::json!({
                        "trigger": {"isMarket": true, "triggerPx": tpx, "tpsl": tpsl}
                    }),
                )
            }
        };

        let p = Self::format_price(px);
        let s = Self::format_size(qty, meta.sz_decimals);

        let pack = OrderActionPack {
            r#type: "order".to_string(),
            orders: vec![OrderWirePack {
                a: meta.index,
                b: is_buy,
                p: p.clone(),
                s: s.clone(),
                r: reduce_only,
                t: type_pack,
            }],
            grouping: "na".to_string(),
        };

        // JSON key order must match the msgpack struct order; maps are
        // built by insertion.
        let mut order_map = serde_json::Map::new();
        order_map.insert("a".into(), meta.index.into());
        order_map.insert("b".into(), is_buy.into());
        order_map.insert("p".into(), p.into());
        order_map.insert("s".into(), s.into());
        order_map.insert("r".into(), reduce_only.into());
        order_map.insert("t".into(), type_json);

        let mut action_map = serde_json::Map::new();
        action_map.insert("type".into(), "order".into());
        action_map.insert(
            "orders".into(),
            serde_json::Value::Array(vec![serde_json::Value::Object(order_map)]),
        );
        action_map.insert("grouping".into(), "na".into());

        let value = self
            .exchange_request(&pack, serde_json::Value::Object(action_map))
            .await?;

        // statuses[0] is {resting: {oid}}, {filled: {oid, avgPx}} or {error}
        let statuses = value
            .pointer("/response/data/statuses")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let first = statuses.first().cloned().unwrap_or_default();

        if let Some(err) = first.get("error").and_then(|v| v.as_str()) {
            let lower = err.to_lowercase();
            return Err(if lower.contains("margin") {
                ExchangeError::InsufficientMargin {
                    needed: 0.0,
                    available: 0.0,
                }
            } else {
                ExchangeError::Venue {
                    code: 0,
                    message: err.to_string(),
                }
            });
        }

        if let Some(filled) = first.get("filled") {
            let oid = filled.get("oid").and_then(|v| v.as_u64()).unwrap_or(0);
            return Ok(OrderAck {
                order_id: oid.to_string(),
                status: OrderStatus::Filled,
            });
        }
        let oid = first
            .pointer("/resting/oid")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        Ok(OrderAck {
            order_id: oid.to_string(),
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
        self.submit_order(symbol, is_buy, quantity, protection, reduce_only, "Ioc", None)
            .await
    }

    async fn venue_position(&self, symbol: &str) -> ExchangeResult<Option<(PositionSide, f64)>> {
        let coin = symbols::base_asset(&symbols::normalize(symbol)).to_string();
        let state = self
            .info(serde_json::json!({
                "type": "clearinghouseState",
                "user": self.main_address,
            }))
            .await?;
        let positions = state
            .get("assetPositions")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for p in positions {
            let Some(pos) = p.get("position") else { continue };
            if pos.get("coin").and_then(|v| v.as_str()) != Some(coin.as_str()) {
                continue;
            }
            let szi: f64 = pos
                .get("szi")
                .and_then(|v| v.as_str().map(|s| s.parse().unwrap_or(0.0)).or_else(|| v.as_f64()))
                .unwrap_or(0.0);
            if szi.abs() < 1e-12 {
                return Ok(None);
            }
            let side = if szi > 0.0 {
                PositionSide::Long
            } else {
                PositionSide::Short
            };
            return Ok(Some((side, szi.abs())));
        }
        Ok(None)
    }

    async fn close(
        &self,
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
    ) -> ExchangeResult<OrderAck> {
        // Always the live venue size, never local state
        let held = match self.venue_position(symbol).await? {
            Some((side, qty)) if side == position_side => qty,
            _ => return Err(ExchangeError::NoPosition(symbol.to_string())),
        };
        let qty = if quantity <= 0.0 { held } else { quantity.min(held) };
        let is_buy = position_side == PositionSide::Short;
        let ack = self.market_ish(symbol, is_buy, qty, true).await?;

        if quantity <= 0.0 || qty >= held {
            if let Err(e) = self.cancel_stop_orders(symbol).await {
                warn!("cancel residual triggers after close failed: {}", e);
            }
        }
        Ok(ack)
    }

    async fn cancel_by_filter<F>(&self, symbol: &str, should_cancel: F) -> ExchangeResult<u32>
    where
        F: Fn(&OpenOrder) -> bool,
    {
        let meta = self.asset_meta(symbol).await?;
        let orders = self.get_open_orders(symbol).await?;
        let mut cancelled = 0;
        for order in orders.into_iter().filter(|o| should_cancel(o)) {
            let Ok(oid) = order.order_id.parse::<u64>() else {
                continue;
            };
            let pack = CancelActionPack {
                r#type: "cancel".to_string(),
                cancels: vec![CancelWirePack {
                    a: meta.index,
                    o: oid,
                }],
            };
            let mut cancel_map = serde_json::Map::new();
            cancel_map.insert("a".into(), meta.index.into());
            cancel_map.insert("o".into(), oid.into());
            let mut action_map = serde_json::Map::new();
            action_map.insert("type".into(), "cancel".into());
            action_map.insert(
                "cancels".into(),
                serde_json::Value::Array(vec![serde_json::Value::Object(cancel_map)]),
            );
            match self
                .exchange_request(&pack, serde_json::Value::Object(action_map))
                .await
            {
                Ok(_) => cancelled += 1,
                Err(e) => warn!("cancel oid {} failed: {}", oid, e),
            }
        }
        Ok(cancelled)
    }
}

#[async_trait]
impl Exchange for HyperliquidAdapter {
    fn exchange_id(&self) -> &str {
        "hyperliquid"
    }

    async fn get_balance(&self) -> ExchangeResult<Balance> {
        let state = self.clearinghouse_state().await?;
        let get = |path: &str| -> f64 {
            state
                .pointer(path)
                .and_then(|v| v.as_str().map(|s| s.parse().unwrap_or(0.0)).or_else(|| v.as_f64()))
                .unwrap_or(0.0)
        };
        let equity = get("/marginSummary/accountValue");
        let withdrawable = get("/withdrawable");

        // The venue exposes equity; unrealized is the sum over positions
        let mut unrealized = 0.0;
        if let Some(rows) = state.get("assetPositions").and_then(|v| v.as_array()) {
            for p in rows {
                unrealized += p
                    .pointer("/position/unrealizedPnl")
                    .and_then(|v| v.as_str().map(|s| s.parse().unwrap_or(0.0)).or_else(|| v.as_f64()))
                    .unwrap_or(0.0);
            }
        }

        Ok(Balance {
            wallet_balance: equity - unrealized,
            available_balance: withdrawable,
            unrealized_profit: unrealized,
            equity,
        })
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<PositionInfo>> {
        let state = self.clearinghouse_state().await?;
        let rows = state
            .get("assetPositions")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let parse_field = |v: Option<&serde_json::Value>| -> f64 {
            v.and_then(|v| v.as_str().map(|s| s.parse().unwrap_or(0.0)).or_else(|| v.as_f64()))
                .unwrap_or(0.0)
        };

        let mut positions = Vec::new();
        for row in rows {
            let Some(pos) = row.get("position") else { continue };
            let szi = parse_field(pos.get("szi"));
            if szi.abs() < 1e-12 {
                continue;
            }
            let coin = pos
                .get("coin")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let entry = parse_field(pos.get("entryPx"));
            let value = parse_field(pos.get("positionValue"));
            let mark = if szi.abs() > 0.0 { value / szi.abs() } else { 0.0 };
            positions.push(PositionInfo {
                symbol: symbols::normalize(coin),
                side: if szi > 0.0 {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                },
                quantity: szi.abs(),
                entry_price: entry,
                mark_price: mark,
                unrealized_profit: parse_field(pos.get("unrealizedPnl")),
                leverage: pos
                    .pointer("/leverage/value")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(1) as u32,
                liquidation_price: parse_field(pos.get("liquidationPx")),
            });
        }
        Ok(positions)
    }

    async fn get_market_price(&self, symbol: &str) -> ExchangeResult<f64> {
        let coin = symbols::base_asset(&symbols::normalize(symbol)).to_string();
        let mids = self.info(serde_json::json!({"type": "allMids"})).await?;
        mids.get(&coin)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Kline>> {
        let coin = symbols::base_asset(&symbols::normalize(symbol)).to_string();
        let interval_ms: i64 = match interval {
            "1m" => 60_000,
            "5m" => 300_000,
            "15m" => 900_000,
            "1h" => 3_600_000,
            "4h" => 14_400_000,
            "1d" => 86_400_000,
            _ => 3_600_000,
        };
        let end = Utc::now().timestamp_millis();
        let start = end - interval_ms * limit as i64;

        let value = self
            .info(serde_json::json!({
                "type": "candleSnapshot",
                "req": {"coin": coin, "interval": interval, "startTime": start, "endTime": end},
            }))
            .await?;

        let parse_field = |v: Option<&serde_json::Value>| -> f64 {
            v.and_then(|v| v.as_str().map(|s| s.parse().unwrap_or(0.0)).or_else(|| v.as_f64()))
                .unwrap_or(0.0)
        };

        Ok(value
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|c| Kline {
                open_time: c.get("t").and_then(|v| v.as_i64()).unwrap_or(0),
                open: parse_field(c.get("o")),
                high: parse_field(c.get("h")),
                low: parse_field(c.get("l")),
                close: parse_field(c.get("c")),
                volume: parse_field(c.get("v")),
            })
            .collect())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let meta = self.asset_meta(symbol).await?;
        let pack = UpdateLeveragePack {
            r#type: "updateLeverage".to_string(),
            asset: meta.index,
            is_cross: true,
            leverage,
        };
        let mut action_map = serde_json::Map::new();
        action_map.insert("type".into(), "updateLeverage".into());
        action_map.insert("asset".into(), meta.index.into());
        action_map.insert("isCross".into(), true.into());
        action_map.insert("leverage".into(), leverage.into());

        self.exchange_request(&pack, serde_json::Value::Object(action_map))
            .await?;
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, cross: bool) -> ExchangeResult<()> {
        // Cross margin is the account default here; requesting it again is
        // the idempotent no-op case.
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
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        self.cancel_by_filter(symbol, |o| o.reduce_only).await.ok();
        if let Err(e) = self.set_leverage(symbol, leverage).await {
            warn!("set_leverage before open failed (continuing): {}", e);
        }
        self.market_ish(symbol, true, quantity, false).await
    }

    async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> ExchangeResult<OrderAck> {
        self.cancel_by_filter(symbol, |o| o.reduce_only).await.ok();
        if let Err(e) = self.set_leverage(symbol, leverage).await {
            warn!("set_leverage before open failed (continuing): {}", e);
        }
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
        self.submit_order(
            symbol,
            is_buy,
            quantity,
            trigger_price,
            true,
            "Gtc",
            Some((trigger_price, "sl")),
        )
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
        self.submit_order(
            symbol,
            is_buy,
            quantity,
            trigger_price,
            true,
            "Gtc",
            Some((trigger_price, "tp")),
        )
        .await
    }

    async fn cancel_stop_loss_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.cancel_by_filter(symbol, |o| o.order_type == "Stop Market").await
    }

    async fn cancel_take_profit_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.cancel_by_filter(symbol, |o| o.order_type == "Take Profit Market")
            .await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.cancel_by_filter(symbol, |_| true).await
    }

    async fn cancel_stop_orders(&self, symbol: &str) -> ExchangeResult<u32> {
        self.cancel_by_filter(symbol, |o| o.trigger_price.is_some()).await
    }

    async fn format_quantity(&self, symbol: &str, quantity: f64) -> ExchangeResult<String> {
        let meta = self.asset_meta(symbol).await?;
        let qty = Self::round_size(quantity, meta.sz_decimals)?;
        Ok(format!("{:.*}", meta.sz_decimals as usize, qty))
    }

    async fn get_order_status(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> ExchangeResult<OrderStatusInfo> {
        let oid: u64 = order_id
            .parse()
            .map_err(|_| ExchangeError::transient(format!("malformed oid {}", order_id)))?;
        let value = self
            .info(serde_json::json!({
                "type": "orderStatus",
                "user": self.main_address,
                "oid": oid,
            }))
            .await?;

        let parse_field = |v: Option<&serde_json::Value>| -> f64 {
            v.and_then(|v| v.as_str().map(|s| s.parse().unwrap_or(0.0)).or_else(|| v.as_f64()))
                .unwrap_or(0.0)
        };

        let status_str = value
            .pointer("/order/status")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let order = value.pointer("/order/order").cloned().unwrap_or_default();
        let orig_sz = parse_field(order.get("origSz"));
        let remaining = parse_field(order.get("sz"));
        let executed = (orig_sz - remaining).max(0.0);

        let status = match status_str {
            "open" => {
                if executed > 0.0 {
                    OrderStatus::PartiallyFilled
                } else {
                    OrderStatus::New
                }
            }
            "filled" => OrderStatus::Filled,
            "canceled" | "marginCanceled" => OrderStatus::Canceled,
            "rejected" => OrderStatus::Expired,
            _ => OrderStatus::New,
        };

        Ok(OrderStatusInfo {
            status,
            avg_price: parse_field(order.get("limitPx")),
            executed_qty: if status == OrderStatus::Filled {
                orig_sz
            } else {
                executed
            },
            commission: 0.0,
        })
    }

    async fn get_closed_pnl(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> ExchangeResult<Vec<ClosedPnlRecord>> {
        let trades = self.get_user_trades(since, limit.max(100)).await?;
        let mut records = Vec::new();
        for t in trades.into_iter().filter(|t| t.realized_pnl.abs() > 1e-12) {
            let side = match t.order_action {
                Some(DecisionAction::CloseLong) => PositionSide::Long,
                Some(DecisionAction::CloseShort) => PositionSide::Short,
                _ => match t.side {
                    OrderSide::Sell => PositionSide::Long,
                    OrderSide::Buy => PositionSide::Short,
                },
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
                exchange_id: "hyperliquid".to_string(),
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
        let coin = symbols::base_asset(&symbols::normalize(symbol)).to_string();
        let value = self
            .info(serde_json::json!({
                "type": "frontendOpenOrders",
                "user": self.main_address,
            }))
            .await?;

        let parse_field = |v: Option<&serde_json::Value>| -> f64 {
            v.and_then(|v| v.as_str().map(|s| s.parse().unwrap_or(0.0)).or_else(|| v.as_f64()))
                .unwrap_or(0.0)
        };

        Ok(value
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|o| {
                symbol.is_empty()
                    || o.get("coin").and_then(|v| v.as_str()) == Some(coin.as_str())
            })
            .map(|o| {
                let trigger_px = parse_field(o.get("triggerPx"));
                OpenOrder {
                    order_id: o
                        .get("oid")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0)
                        .to_string(),
                    symbol: symbols::normalize(
                        o.get("coin").and_then(|v| v.as_str()).unwrap_or_default(),
                    ),
                    side: if o.get("side").and_then(|v| v.as_str()) == Some("B") {
                        OrderSide::Buy
                    } else {
                        OrderSide::Sell
                    },
                    order_type: o
                        .get("orderType")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Limit")
                        .to_string(),
                    price: parse_field(o.get("limitPx")),
                    quantity: parse_field(o.get("sz")),
                    trigger_price: (trigger_px > 0.0).then_some(trigger_px),
                    reduce_only: o
                        .get("reduceOnly")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                    created_at: Utc
                        .timestamp_millis_opt(
                            o.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0),
                        )
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
            .info(serde_json::json!({
                "type": "userFillsByTime",
                "user": self.main_address,
                "startTime": since.timestamp_millis(),
            }))
            .await?;

        let parse_field = |v: Option<&serde_json::Value>| -> f64 {
            v.and_then(|v| v.as_str().map(|s| s.parse().unwrap_or(0.0)).or_else(|| v.as_f64()))
                .unwrap_or(0.0)
        };

        let mut trades: Vec<TradeRecord> = value
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|f| {
                // "dir" carries the explicit action: Open Long, Close Short..
                let dir = f.get("dir").and_then(|v| v.as_str()).unwrap_or_default();
                let order_action = match dir {
                    "Open Long" => Some(DecisionAction::OpenLong),
                    "Open Short" => Some(DecisionAction::OpenShort),
                    "Close Long" => Some(DecisionAction::CloseLong),
                    "Close Short" => Some(DecisionAction::CloseShort),
                    _ => None,
                };
                let side = if f.get("side").and_then(|v| v.as_str()) == Some("B") {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                };
                TradeRecord {
                    exchange_trade_id: f
                        .get("tid")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0)
                        .to_string(),
                    exchange_order_id: f
                        .get("oid")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0)
                        .to_string(),
                    symbol: symbols::normalize(
                        f.get("coin").and_then(|v| v.as_str()).unwrap_or_default(),
                    ),
                    side,
                    position_side: order_action.map(|a| match a {
                        DecisionAction::OpenLong | DecisionAction::CloseLong => PositionSide::Long,
                        _ => PositionSide::Short,
                    }),
                    order_action,
                    price: parse_field(f.get("px")),
                    quantity: parse_field(f.get("sz")),
                    commission: parse_field(f.get("fee")),
                    realized_pnl: parse_field(f.get("closedPnl")),
                    executed_at: Utc
                        .timestamp_millis_opt(
                            f.get("time").and_then(|v| v.as_i64()).unwrap_or(0),
                        )
                        .single()
                        .unwrap_or_else(Utc::now),
                }
            })
            .collect();
        trades.truncate(limit);
        Ok(trades)
    }

    fn grid(&self) -> Option<&dyn GridExchange> {
        Some(self)
    }
}

#[async_trait]
impl GridExchange for HyperliquidAdapter {
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        post_only: bool,
    ) -> ExchangeResult<OrderAck> {
        let tif = if post_only { "Alo" } else { "Gtc" };
        self.submit_order(
            symbol,
            side == OrderSide::Buy,
            quantity,
            price,
            false,
            tif,
            None,
        )
        .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        let target = order_id.to_string();
        let cancelled = self
            .cancel_by_filter(symbol, |o| o.order_id == target)
            .await?;
        if cancelled == 0 {
            debug!("cancel_order: oid {} not found among open orders", order_id);
        }
        Ok(())
    }

    async fn get_order_book(
        &self,
        symbol: &str,
        depth: usize,
    ) -> ExchangeResult<OrderBookSnapshot> {
        let coin = symbols::base_asset(&symbols::normalize(symbol)).to_string();
        let value = self
            .info(serde_json::json!({"type": "l2Book", "coin": coin}))
            .await?;

        let parse_side = |idx: usize| -> Vec<(f64, f64)> {
            value
                .pointer(&format!("/levels/{}", idx))
                .and_then(|v| v.as_array())
                .map(|rows| {
                    rows.iter()
                        .take(depth)
                        .filter_map(|r| {
                            Some((
                                r.get("px")?.as_str()?.parse().ok()?,
                                r.get("sz")?.as_str()?.parse().ok()?,
                            ))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(OrderBookSnapshot {
            bids: parse_side(0),
            asks: parse_side(1),
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_funds_threshold() {
        // Balance above the threshold refuses and names both addresses
        let err = check_agent_funds("0xAGENT", "0xMAIN", 250.0, 100.0).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("0xAGENT"));
        assert!(msg.contains("0xMAIN"));
        assert!(msg.contains("250.00"));

        assert!(check_agent_funds("0xAGENT", "0xMAIN", 50.0, 100.0).is_ok());
    }

    #[test]
    fn price_rounds_to_five_significant_figures() {
        assert!((HyperliquidAdapter::round_price(50123.456) - 50123.0).abs() < 1e-6);
        assert!((HyperliquidAdapter::round_price(0.0012345678) - 0.0012346).abs() < 1e-10);
    }

    #[test]
    fn size_formatting_trims_trailing_zeros() {
        assert_eq!(HyperliquidAdapter::format_size(0.0450, 3), "0.045");
        assert_eq!(HyperliquidAdapter::format_size(1.0, 3), "1");
        assert_eq!(HyperliquidAdapter::format_price(50000.0), "50000");
    }

    #[test]
    fn action_hash_is_stable() {
        let pack = OrderActionPack {
            r#type: "order".to_string(),
            orders: vec![OrderWirePack {
                a: 0,
                b: true,
                p: "50000".to_string(),
                s: "0.01".to_string(),
                r: false,
                t: OrderTypePack::Limit(LimitWirePack {
                    tif: "Gtc".to_string(),
                }),
            }],
            grouping: "na".to_string(),
        };
        let h1 = action_hash(&pack, 1);
        let h2 = action_hash(&pack, 1);
        assert_eq!(h1, h2);
        let h3 = action_hash(&pack, 2);
        assert_ne!(h1, h3);
    }
}
