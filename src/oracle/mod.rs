//! Decision oracle client
//!
//! The oracle is an external service: given a trading context it returns an
//! ordered list of decisions plus its serialized reasoning trace. Only the
//! request/response contract lives here; the client is a process-scoped
//! service handed to constructors, never read implicitly from hot paths.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::exchange::{Balance, PositionInfo};
use crate::market::MarketSnapshot;
use crate::models::Decision;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

/// Candidate symbol with the pools that nominated it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub symbol: String,
    pub sources: Vec<String>,
    pub snapshot: Option<MarketSnapshot>,
}

/// Everything the oracle sees for one cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingContext {
    pub trader_name: String,
    pub strategy: String,
    pub account: Balance,
    pub positions: Vec<PositionInfo>,
    pub candidates: Vec<Candidate>,
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,
    /// Strategy-specific state (grid levels, bounds, breakout, aggregates)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub strategy_state: serde_json::Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system_prompt: String,
}

/// Parsed oracle output plus the raw payloads for the decision log
#[derive(Debug, Clone)]
pub struct OracleOutcome {
    pub decisions: Vec<Decision>,
    pub cot_trace: String,
    pub raw_response: String,
}

#[derive(Debug, Deserialize)]
struct OracleResponse {
    #[serde(default)]
    decisions: Vec<Decision>,
    #[serde(default, alias = "cot", alias = "chain_of_thought")]
    cot_trace: String,
}

pub struct OracleClient {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl OracleClient {
    pub fn new(url: &str, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            url: url.to_string(),
            api_key,
        }
    }

    /// One decision round trip with bounded retries on transport errors.
    pub async fn decide(&self, context: &TradingContext) -> Result<OracleOutcome> {
        let mut backoff = INITIAL_BACKOFF_MS;
        let mut last_err = None;

        for attempt in 1..=MAX_RETRIES {
            match self.decide_once(context).await {
                Ok(outcome) => {
                    info!(
                        "oracle returned {} decisions for {}",
                        outcome.decisions.len(),
                        context.trader_name
                    );
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!("oracle call failed (attempt {}): {}", attempt, e);
                    last_err = Some(e);
                    if attempt < MAX_RETRIES {
                        sleep(Duration::from_millis(backoff)).await;
                        backoff = (backoff * 2).min(10_000);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("oracle unreachable")))
    }

    async fn decide_once(&self, context: &TradingContext) -> Result<OracleOutcome> {
        let mut request = self.client.post(&self.url).json(context);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.context("oracle request failed")?;
        let status = response.status();
        let raw = response.text().await.unwrap_or_default();

        if !status.is_success() {
            anyhow::bail!("oracle error {}: {}", status, raw);
        }

        let parsed: OracleResponse =
            serde_json::from_str(&raw).context("failed to parse oracle response")?;

        debug!(
            "oracle cot trace: {} chars, raw: {} chars",
            parsed.cot_trace.len(),
            raw.len()
        );

        Ok(OracleOutcome {
            decisions: parsed.decisions,
            cot_trace: parsed.cot_trace,
            raw_response: raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DecisionAction;

    #[test]
    fn parses_decision_list() {
        let raw = r#"{
            "decisions": [
                {"action": "open_long", "symbol": "BTCUSDT", "position_size_usd": 500.0,
                 "leverage": 10, "confidence": 0.8, "reasoning": "momentum"},
                {"action": "hold", "symbol": "ETHUSDT"}
            ],
            "cot": "thinking..."
        }"#;
        let parsed: OracleResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.decisions.len(), 2);
        assert_eq!(parsed.decisions[0].action, DecisionAction::OpenLong);
        assert_eq!(parsed.decisions[0].position_size_usd, Some(500.0));
        assert_eq!(parsed.cot_trace, "thinking...");
    }

    #[test]
    fn context_serializes_without_nulls() {
        let context = TradingContext {
            trader_name: "t1".to_string(),
            strategy: "directional".to_string(),
            account: Balance::default(),
            positions: vec![],
            candidates: vec![],
            btc_eth_leverage: 10,
            altcoin_leverage: 5,
            strategy_state: serde_json::Value::Null,
            system_prompt: String::new(),
        };
        let json = serde_json::to_string(&context).unwrap();
        assert!(!json.contains("strategy_state"));
        assert!(!json.contains("system_prompt"));
    }
}
