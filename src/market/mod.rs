//! Market snapshots and indicators
//!
//! Consumes venue klines only; no market-data aggregation of our own.
//! ATR uses Wilder smoothing, Bollinger width is (upper-lower)/middle on a
//! 20-period 2-sigma band, and the boxes are highest-high/lowest-low
//! envelopes over short/mid/long lookbacks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::exchange::{Exchange, ExchangeError, ExchangeResult, Kline};
use crate::util::retry_with_backoff;

pub const ATR_PERIOD: usize = 14;
pub const BOLLINGER_PERIOD: usize = 20;

pub const SHORT_BOX_LOOKBACK: usize = 20;
pub const MID_BOX_LOOKBACK: usize = 60;
pub const LONG_BOX_LOOKBACK: usize = 120;

const SNAPSHOT_TTL: Duration = Duration::from_secs(30);

/// Multi-period price envelopes used for regime-break detection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BoxBounds {
    pub short_upper: f64,
    pub short_lower: f64,
    pub mid_upper: f64,
    pub mid_lower: f64,
    pub long_upper: f64,
    pub long_lower: f64,
}

/// Per-symbol market view handed to the engine and the oracle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: f64,
    pub atr14: f64,
    pub atr_pct: f64,
    pub bb_width_pct: f64,
    pub boxes: BoxBounds,
    pub taken_at: chrono::DateTime<chrono::Utc>,
}

/// Wilder-smoothed average true range.
pub fn atr(klines: &[Kline], period: usize) -> Option<f64> {
    if klines.len() < period + 1 || period == 0 {
        return None;
    }
    let mut trs = Vec::with_capacity(klines.len() - 1);
    for w in klines.windows(2) {
        let (prev, cur) = (&w[0], &w[1]);
        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());
        trs.push(tr);
    }
    let mut value: f64 = trs[..period].iter().sum::<f64>() / period as f64;
    for tr in &trs[period..] {
        value = (value * (period - 1) as f64 + tr) / period as f64;
    }
    Some(value)
}

/// Bollinger band width as a percentage of the middle band.
pub fn bollinger_width_pct(klines: &[Kline], period: usize, k: f64) -> Option<f64> {
    if klines.len() < period || period == 0 {
        return None;
    }
    let closes: Vec<f64> = klines[klines.len() - period..].iter().map(|c| c.close).collect();
    let mean = closes.iter().sum::<f64>() / period as f64;
    if mean <= 0.0 {
        return None;
    }
    let variance = closes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / period as f64;
    let sigma = variance.sqrt();
    Some(2.0 * k * sigma / mean * 100.0)
}

/// Highest-high / lowest-low envelope over the trailing lookback.
pub fn box_bounds(klines: &[Kline], lookback: usize) -> Option<(f64, f64)> {
    if klines.is_empty() || lookback == 0 {
        return None;
    }
    let start = klines.len().saturating_sub(lookback);
    let window = &klines[start..];
    let upper = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let lower = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    (upper > lower).then_some((upper, lower))
}

pub fn boxes(klines: &[Kline]) -> BoxBounds {
    let mut bounds = BoxBounds::default();
    if let Some((u, l)) = box_bounds(klines, SHORT_BOX_LOOKBACK) {
        bounds.short_upper = u;
        bounds.short_lower = l;
    }
    if let Some((u, l)) = box_bounds(klines, MID_BOX_LOOKBACK) {
        bounds.mid_upper = u;
        bounds.mid_lower = l;
    }
    if let Some((u, l)) = box_bounds(klines, LONG_BOX_LOOKBACK) {
        bounds.long_upper = u;
        bounds.long_lower = l;
    }
    bounds
}

/// TTL-cached snapshot source over a venue adapter.
pub struct MarketData {
    exchange: Arc<dyn Exchange>,
    interval: String,
    cache: Mutex<HashMap<String, (MarketSnapshot, Instant)>>,
}

impl MarketData {
    pub fn new(exchange: Arc<dyn Exchange>) -> Self {
        Self {
            exchange,
            interval: "1h".to_string(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_interval(mut self, interval: &str) -> Self {
        self.interval = interval.to_string();
        self
    }

    pub async fn snapshot(&self, symbol: &str) -> ExchangeResult<MarketSnapshot> {
        if let Some((snapshot, at)) = self.cache.lock().get(symbol).cloned() {
            if at.elapsed() < SNAPSHOT_TTL {
                return Ok(snapshot);
            }
        }

        // Reads are idempotent; transient venue errors get a bounded retry
        let price = retry_with_backoff(
            "market price",
            3,
            200,
            |e: &ExchangeError| e.is_transient(),
            || self.exchange.get_market_price(symbol),
        )
        .await?;
        let klines = retry_with_backoff(
            "klines",
            3,
            200,
            |e: &ExchangeError| e.is_transient(),
            || {
                self.exchange
                    .get_klines(symbol, &self.interval, LONG_BOX_LOOKBACK + ATR_PERIOD + 1)
            },
        )
        .await?;

        let atr14 = atr(&klines, ATR_PERIOD).unwrap_or(0.0);
        let snapshot = MarketSnapshot {
            symbol: symbol.to_string(),
            price,
            atr14,
            atr_pct: if price > 0.0 { atr14 / price * 100.0 } else { 0.0 },
            bb_width_pct: bollinger_width_pct(&klines, BOLLINGER_PERIOD, 2.0).unwrap_or(0.0),
            boxes: boxes(&klines),
            taken_at: chrono::Utc::now(),
        };

        self.cache
            .lock()
            .insert(symbol.to_string(), (snapshot.clone(), Instant::now()));
        Ok(snapshot)
    }

    pub fn invalidate(&self, symbol: &str) {
        self.cache.lock().remove(symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_klines(n: usize, price: f64) -> Vec<Kline> {
        (0..n)
            .map(|i| Kline {
                open_time: i as i64,
                open: price,
                high: price + 1.0,
                low: price - 1.0,
                close: price,
                volume: 10.0,
            })
            .collect()
    }

    #[test]
    fn atr_on_flat_series_equals_range() {
        let klines = flat_klines(30, 100.0);
        let value = atr(&klines, ATR_PERIOD).unwrap();
        assert!((value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn atr_requires_enough_history() {
        assert!(atr(&flat_klines(10, 100.0), 14).is_none());
    }

    #[test]
    fn bollinger_width_zero_on_flat_series() {
        let width = bollinger_width_pct(&flat_klines(30, 100.0), 20, 2.0).unwrap();
        assert!(width.abs() < 1e-9);
    }

    #[test]
    fn box_bounds_track_extremes() {
        let mut klines = flat_klines(130, 100.0);
        klines[125].high = 140.0;
        klines[60].low = 80.0;

        let b = boxes(&klines);
        assert!((b.short_upper - 140.0).abs() < 1e-9);
        assert!((b.short_lower - 99.0).abs() < 1e-9);
        // The dip at index 60 is outside the short and mid lookbacks but
        // inside the long one
        assert!((b.long_lower - 80.0).abs() < 1e-9);
        assert!((b.mid_lower - 99.0).abs() < 1e-9);
    }
}
