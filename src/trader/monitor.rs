//! Peak-PnL drawdown monitor
//!
//! Runs between scans on its own cadence. Tracks the best achieved return
//! per (symbol, side) and force-closes a position once it has given back
//! 40% of a peak that reached at least 5%. The peak cache is monotonic and
//! cleared only on a successful close.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::exchange::Exchange;
use crate::models::{calculate_pnl_pct, PositionSide};

/// Peak reached before the drawdown rule arms
pub const PEAK_ARM_PCT: f64 = 5.0;
/// Fraction of the peak that may be given back
pub const DRAWDOWN_FROM_PEAK: f64 = 0.40;

/// (symbol, side) -> peak return percent; monotonically non-decreasing
/// until cleared on close.
#[derive(Default)]
pub struct PeakPnlCache {
    map: Mutex<HashMap<(String, PositionSide), f64>>,
}

impl PeakPnlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update and return the peak for this key.
    pub fn update(&self, symbol: &str, side: PositionSide, current_pct: f64) -> f64 {
        let mut map = self.map.lock();
        let entry = map.entry((symbol.to_string(), side)).or_insert(current_pct);
        if current_pct > *entry {
            *entry = current_pct;
        }
        *entry
    }

    pub fn get(&self, symbol: &str, side: PositionSide) -> Option<f64> {
        self.map.lock().get(&(symbol.to_string(), side)).copied()
    }

    pub fn clear(&self, symbol: &str, side: PositionSide) {
        self.map.lock().remove(&(symbol.to_string(), side));
    }

    pub fn clear_all(&self) {
        self.map.lock().clear();
    }
}

/// Decide whether a position must be force-closed.
pub fn should_force_close(peak_pct: f64, current_pct: f64) -> bool {
    if peak_pct < PEAK_ARM_PCT {
        return false;
    }
    current_pct <= peak_pct * (1.0 - DRAWDOWN_FROM_PEAK)
}

/// One monitor pass over the venue's open positions.
pub async fn run_drawdown_check(
    exchange: &Arc<dyn Exchange>,
    cache: &PeakPnlCache,
) -> anyhow::Result<usize> {
    let positions = exchange.get_positions().await?;
    let mut closed = 0;

    for position in positions {
        let margin = if position.leverage > 0 {
            position.quantity * position.entry_price / position.leverage as f64
        } else {
            0.0
        };
        let current_pct = calculate_pnl_pct(position.unrealized_profit, margin);
        let peak = cache.update(&position.symbol, position.side, current_pct);

        if !should_force_close(peak, current_pct) {
            continue;
        }

        info!(
            "drawdown-from-peak exit for {} {:?}: peak {:.2}%, now {:.2}%",
            position.symbol, position.side, peak, current_pct
        );

        let result = match position.side {
            PositionSide::Long => exchange.close_long(&position.symbol, 0.0).await,
            PositionSide::Short => exchange.close_short(&position.symbol, 0.0).await,
        };
        match result {
            Ok(_) => {
                // Cleared only on success; a failed close keeps the peak so
                // the next pass retries.
                cache.clear(&position.symbol, position.side);
                closed += 1;
            }
            Err(e) => warn!(
                "force close failed for {} {:?}: {}",
                position.symbol, position.side, e
            ),
        }
    }
    Ok(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use crate::exchange::PositionInfo;

    #[test]
    fn peak_is_monotonic() {
        let cache = PeakPnlCache::new();
        assert_eq!(cache.update("BTCUSDT", PositionSide::Long, 5.0), 5.0);
        assert_eq!(cache.update("BTCUSDT", PositionSide::Long, 4.5), 5.0);
        assert_eq!(cache.update("BTCUSDT", PositionSide::Long, 6.0), 6.0);
        cache.clear("BTCUSDT", PositionSide::Long);
        assert!(cache.get("BTCUSDT", PositionSide::Long).is_none());
    }

    #[test]
    fn force_close_rule() {
        // Peak below the arm threshold never closes
        assert!(!should_force_close(4.0, 1.0));
        // Peak 5%, now 3%: given back 40% exactly
        assert!(should_force_close(5.0, 3.0));
        assert!(!should_force_close(5.0, 3.1));
        assert!(should_force_close(10.0, 5.9));
    }

    #[tokio::test]
    async fn monitor_closes_and_clears_cache() {
        let mock = Arc::new(MockExchange::new("mock"));
        mock.set_price("BTCUSDT", 50_300.0);

        // Long 0.2 BTC from 50000 at 10x: margin 1000, +50 = +5%
        mock.state.lock().positions.push(PositionInfo {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            quantity: 0.2,
            entry_price: 50_000.0,
            mark_price: 50_500.0,
            unrealized_profit: 50.0,
            leverage: 10,
            liquidation_price: 0.0,
        });

        let exchange: Arc<dyn Exchange> = mock.clone();
        let cache = PeakPnlCache::new();

        // Peak +5%
        assert_eq!(run_drawdown_check(&exchange, &cache).await.unwrap(), 0);
        assert_eq!(cache.get("BTCUSDT", PositionSide::Long), Some(5.0));

        // +4.5%: still above the give-back line
        mock.state.lock().positions[0].unrealized_profit = 45.0;
        assert_eq!(run_drawdown_check(&exchange, &cache).await.unwrap(), 0);

        // +3%: 40% below the 5% peak -> force close, cache cleared
        mock.state.lock().positions[0].unrealized_profit = 30.0;
        assert_eq!(run_drawdown_check(&exchange, &cache).await.unwrap(), 1);
        assert!(cache.get("BTCUSDT", PositionSide::Long).is_none());
        assert!(mock.state.lock().positions.is_empty());
    }

    #[tokio::test]
    async fn failed_close_keeps_peak() {
        let mock = Arc::new(MockExchange::new("mock"));
        mock.state.lock().positions.push(PositionInfo {
            symbol: "ETHUSDT".to_string(),
            side: PositionSide::Short,
            quantity: 1.0,
            entry_price: 3000.0,
            mark_price: 2900.0,
            unrealized_profit: 180.0,
            leverage: 3,
            liquidation_price: 0.0,
        });
        let exchange: Arc<dyn Exchange> = mock.clone();
        let cache = PeakPnlCache::new();

        // Peak +18% on margin 1000
        run_drawdown_check(&exchange, &cache).await.unwrap();
        assert_eq!(cache.get("ETHUSDT", PositionSide::Short), Some(18.0));

        // Deep give-back but the close fails
        mock.state.lock().positions[0].unrealized_profit = 50.0;
        mock.state.lock().fail_close = true;
        assert_eq!(run_drawdown_check(&exchange, &cache).await.unwrap(), 0);
        assert_eq!(cache.get("ETHUSDT", PositionSide::Short), Some(18.0));
    }
}
