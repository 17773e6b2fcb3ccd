//! Instrument precision and rounding
//!
//! Every order-submitting path rounds through these helpers. Rounding is
//! never silent: a quantity that rounds to zero is an `InvalidQuantity`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::errors::{ExchangeError, ExchangeResult};

/// Per-symbol, per-venue trading constraints
#[derive(Debug, Clone)]
pub struct InstrumentSpec {
    pub symbol: String,
    pub size_decimals: u32,
    pub price_decimals: u32,
    /// Price grid; 0.0 means "round to price_decimals" instead
    pub tick_size: f64,
    /// Quantity grid; 0.0 means "round to size_decimals" instead
    pub lot_size: f64,
    /// Contract -> base asset conversion (1.0 for linear venues)
    pub multiplier: f64,
    pub max_order_qty: f64,
    pub max_leverage: u32,
}

impl InstrumentSpec {
    /// Linear-venue default used before the venue list has loaded
    pub fn linear_default(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            size_decimals: 3,
            price_decimals: 2,
            tick_size: 0.0,
            lot_size: 0.0,
            multiplier: 1.0,
            max_order_qty: f64::MAX,
            max_leverage: 100,
        }
    }

    /// Round a quantity onto the venue grid. Errors when the result is zero.
    pub fn round_quantity(&self, qty: f64) -> ExchangeResult<f64> {
        let rounded = if self.lot_size > 0.0 {
            (qty / self.lot_size).floor() * self.lot_size
        } else {
            let scale = 10f64.powi(self.size_decimals as i32);
            (qty * scale).round() / scale
        };

        if rounded <= 0.0 {
            return Err(ExchangeError::InvalidQuantity {
                symbol: self.symbol.clone(),
                reason: format!("{} rounds to zero", qty),
            });
        }
        Ok(rounded)
    }

    /// Round a price onto the venue tick grid.
    pub fn round_price(&self, price: f64) -> f64 {
        if self.tick_size > 0.0 {
            (price / self.tick_size).round() * self.tick_size
        } else {
            let scale = 10f64.powi(self.price_decimals as i32);
            (price * scale).round() / scale
        }
    }

    /// Contract lots for a base-asset quantity, capped by max_order_qty.
    pub fn lots_for_quantity(&self, quantity: f64) -> ExchangeResult<f64> {
        if self.multiplier <= 0.0 {
            return Err(ExchangeError::InvalidQuantity {
                symbol: self.symbol.clone(),
                reason: "zero multiplier".to_string(),
            });
        }
        let lots = (quantity / self.multiplier).round();
        if lots < 1.0 {
            return Err(ExchangeError::InvalidQuantity {
                symbol: self.symbol.clone(),
                reason: format!("{} is below one contract", quantity),
            });
        }
        Ok(lots.min(self.max_order_qty))
    }

    /// Plain decimal string at size_decimals, never scientific notation.
    pub fn format_quantity(&self, qty: f64) -> String {
        format!("{:.*}", self.size_decimals as usize, qty)
    }

    pub fn format_price(&self, price: f64) -> String {
        format!("{:.*}", self.price_decimals as usize, price)
    }
}

/// TTL cache of instrument specs, refreshed on first use and invalidated on
/// any precision error from the venue.
pub struct SpecCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, (InstrumentSpec, Instant)>>,
}

impl SpecCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<InstrumentSpec> {
        let entries = self.entries.read();
        let (spec, at) = entries.get(symbol)?;
        if at.elapsed() > self.ttl {
            return None;
        }
        Some(spec.clone())
    }

    pub fn put(&self, spec: InstrumentSpec) {
        self.entries
            .write()
            .insert(spec.symbol.clone(), (spec, Instant::now()));
    }

    pub fn put_all(&self, specs: Vec<InstrumentSpec>) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        for spec in specs {
            entries.insert(spec.symbol.clone(), (spec, now));
        }
    }

    pub fn invalidate(&self, symbol: &str) {
        self.entries.write().remove(symbol);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(size_decimals: u32, lot_size: f64) -> InstrumentSpec {
        InstrumentSpec {
            symbol: "BTCUSDT".to_string(),
            size_decimals,
            price_decimals: 2,
            tick_size: 0.5,
            lot_size,
            multiplier: 1.0,
            max_order_qty: 1000.0,
            max_leverage: 100,
        }
    }

    #[test]
    fn quantity_rounding_to_zero_is_rejected() {
        let s = spec(3, 0.0);
        let err = s.round_quantity(0.0004).unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidQuantity { .. }));
        assert!((s.round_quantity(0.0446).unwrap() - 0.045).abs() < 1e-12);
    }

    #[test]
    fn lot_floor_rounding() {
        let s = spec(3, 0.01);
        assert!((s.round_quantity(0.0199).unwrap() - 0.01).abs() < 1e-12);
        assert!(s.round_quantity(0.004).is_err());
    }

    #[test]
    fn price_rounds_to_tick() {
        let s = spec(3, 0.0);
        assert!((s.round_price(50000.26) - 50000.5).abs() < 1e-9);
        assert!((s.round_price(50000.24) - 50000.0).abs() < 1e-9);
    }

    #[test]
    fn lots_capped_by_max_order_qty() {
        let mut s = spec(0, 0.0);
        s.multiplier = 0.001;
        s.max_order_qty = 100.0;
        assert!((s.lots_for_quantity(0.05).unwrap() - 50.0).abs() < 1e-12);
        assert!((s.lots_for_quantity(10.0).unwrap() - 100.0).abs() < 1e-12);
        assert!(s.lots_for_quantity(0.0001).is_err());
    }

    #[test]
    fn format_quantity_plain_decimal() {
        let s = spec(3, 0.0);
        assert_eq!(s.format_quantity(0.045), "0.045");
        assert_eq!(s.format_quantity(1e-3), "0.001");
        let tiny = InstrumentSpec {
            size_decimals: 8,
            ..spec(8, 0.0)
        };
        assert_eq!(tiny.format_quantity(1e-7), "0.00000010");
    }

    #[test]
    fn spec_cache_ttl_and_invalidate() {
        let cache = SpecCache::new(Duration::from_secs(300));
        cache.put(spec(3, 0.0));
        assert!(cache.get("BTCUSDT").is_some());
        cache.invalidate("BTCUSDT");
        assert!(cache.get("BTCUSDT").is_none());
    }
}
