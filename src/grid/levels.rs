//! Level construction, sizing guardrails and skew-based rebuilds

use tracing::{info, warn};

use crate::market::MarketSnapshot;
use crate::models::{GridConfig, GridDistribution};

use super::state::{GridDirection, GridLevel, GridState, LevelSide, LevelState};

/// Envelope bounds: a volatility band around the current price when ATR
/// bounds are enabled (and ATR is available), explicit config otherwise.
pub fn compute_bounds(config: &GridConfig, snapshot: &MarketSnapshot) -> (f64, f64) {
    if config.use_atr_bounds && snapshot.atr14 > 0.0 {
        let band = snapshot.atr14 * config.atr_multiplier;
        return (snapshot.price + band, snapshot.price - band);
    }
    match (config.upper_price, config.lower_price) {
        (Some(upper), Some(lower)) if upper > lower => (upper, lower),
        _ => {
            // Last resort: a 5% band so the engine can still initialize
            warn!("no usable bounds configured, defaulting to +/-5% band");
            (snapshot.price * 1.05, snapshot.price * 0.95)
        }
    }
}

/// Per-level weights for the configured distribution, unnormalized.
pub fn level_weights(distribution: GridDistribution, count: usize) -> Vec<f64> {
    match distribution {
        GridDistribution::Uniform => vec![1.0; count],
        GridDistribution::Gaussian => {
            let center = (count as f64 - 1.0) / 2.0;
            let sigma = (count as f64 / 4.0).max(1.0);
            (0..count)
                .map(|i| {
                    let z = (i as f64 - center) / sigma;
                    (-0.5 * z * z).exp()
                })
                .collect()
        }
        GridDistribution::Pyramid => {
            let center = (count as f64 - 1.0) / 2.0;
            (0..count)
                .map(|i| 1.0 + center - (i as f64 - center).abs())
                .collect()
        }
    }
}

/// Build the ladder: price_i = lower + i * spacing, allocation by weight,
/// sides per the current direction model.
pub fn build_levels(
    config: &GridConfig,
    current_price: f64,
    upper: f64,
    lower: f64,
    direction: GridDirection,
) -> Vec<GridLevel> {
    let count = config.grid_count.max(2);
    let spacing = (upper - lower) / (count as f64 - 1.0);

    let weights = level_weights(config.distribution, count);
    let weight_sum: f64 = weights.iter().sum();

    let mut levels: Vec<GridLevel> = (0..count)
        .map(|i| {
            let price = lower + i as f64 * spacing;
            let allocated = config.total_investment * weights[i] / weight_sum;
            GridLevel::new(i, price, LevelSide::Buy, allocated)
        })
        .collect();

    assign_sides(&mut levels, current_price, direction, config.direction_bias_ratio);
    levels
}

/// Side assignment. Neutral is price-relative; long/short force one side;
/// biased modes give the majority side `bias_ratio` of the levels, placed
/// on the favored side of price first.
pub fn assign_sides(
    levels: &mut [GridLevel],
    current_price: f64,
    direction: GridDirection,
    bias_ratio: f64,
) {
    let count = levels.len();
    match direction {
        GridDirection::Neutral => {
            for level in levels.iter_mut() {
                level.side = if level.price <= current_price {
                    LevelSide::Buy
                } else {
                    LevelSide::Sell
                };
            }
        }
        GridDirection::Long => {
            for level in levels.iter_mut() {
                level.side = LevelSide::Buy;
            }
        }
        GridDirection::Short => {
            for level in levels.iter_mut() {
                level.side = LevelSide::Sell;
            }
        }
        GridDirection::LongBias => {
            // Majority buys fill from the bottom of the ladder upward
            let buys = (count as f64 * bias_ratio).round() as usize;
            for (i, level) in levels.iter_mut().enumerate() {
                level.side = if i < buys { LevelSide::Buy } else { LevelSide::Sell };
            }
        }
        GridDirection::ShortBias => {
            let sells = (count as f64 * bias_ratio).round() as usize;
            let boundary = count.saturating_sub(sells);
            for (i, level) in levels.iter_mut().enumerate() {
                level.side = if i >= boundary { LevelSide::Sell } else { LevelSide::Buy };
            }
        }
    }
}

/// Why an order request was rejected by the guardrails
#[derive(Debug, Clone, PartialEq)]
pub enum SizingRejection {
    AbsoluteCap { value: f64, cap: f64 },
    GlobalExposure { projected: f64, cap: f64 },
}

/// Per-level sizing: cap the requested quantity to the level's allocation
/// at leverage, reject anything beyond the absolute safety bound.
pub fn cap_level_quantity(
    level: &GridLevel,
    requested_qty: f64,
    price: f64,
    config: &GridConfig,
) -> Result<f64, SizingRejection> {
    let max_value = level.allocated_usd * config.leverage as f64;
    let capped = requested_qty.min(max_value / price);

    let absolute_cap = 2.0 * config.total_investment * config.leverage as f64;
    let value = capped * price;
    if value > absolute_cap {
        return Err(SizingRejection::AbsoluteCap {
            value,
            cap: absolute_cap,
        });
    }
    Ok(capped)
}

/// Global cap: open exposure + resting orders + this order must stay within
/// total_investment * leverage.
pub fn check_global_cap(
    current_position_value: f64,
    pending_orders_value: f64,
    this_order_value: f64,
    config: &GridConfig,
) -> Result<(), SizingRejection> {
    let cap = config.total_investment * config.leverage as f64;
    let projected = current_position_value + pending_orders_value + this_order_value;
    if projected > cap {
        return Err(SizingRejection::GlobalExposure { projected, cap });
    }
    Ok(())
}

/// Fill-count skew: one side dominating the other means the grid has
/// drifted away from the price.
pub fn is_skewed(state: &GridState) -> bool {
    let buy_filled = state.filled_count_locked(LevelSide::Buy);
    let sell_filled = state.filled_count_locked(LevelSide::Sell);
    let buy_empty = state.empty_count_locked(LevelSide::Buy);
    let sell_empty = state.empty_count_locked(LevelSide::Sell);

    let ratio_skew = (buy_filled >= 3 * sell_filled && buy_filled > 5)
        || (sell_filled >= 3 * buy_filled && sell_filled > 5);

    let full_side_skew = (buy_empty == 0 && buy_filled > 0 && sell_empty > 5)
        || (sell_empty == 0 && sell_filled > 0 && buy_empty > 5);

    ratio_skew || full_side_skew
}

/// Price drifted at least 30% of the grid range from the midpoint.
pub fn deviated_from_midpoint(state: &GridState, price: f64) -> bool {
    let range = state.range_locked();
    if range <= 0.0 {
        return false;
    }
    (price - state.midpoint_locked()).abs() >= 0.30 * range
}

/// Rebuild the ladder around the current price keeping the same width,
/// then restore each previously filled state onto the closest new level.
pub fn rebuild_around(state: &mut GridState, config: &GridConfig, price: f64) {
    let half_range = state.range_locked() / 2.0;
    let filled: Vec<GridLevel> = state
        .levels
        .iter()
        .filter(|l| l.state == LevelState::Filled)
        .cloned()
        .collect();

    state.upper_price = price + half_range;
    state.lower_price = price - half_range;
    state.levels = build_levels(
        config,
        price,
        state.upper_price,
        state.lower_price,
        state.current_direction,
    );
    state.spacing = (state.upper_price - state.lower_price) / (config.grid_count.max(2) as f64 - 1.0);
    state.order_book.clear();

    for old in filled {
        let Some(closest) = state
            .levels
            .iter_mut()
            .min_by(|a, b| {
                let da = (a.price - old.price).abs();
                let db = (b.price - old.price).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
        else {
            continue;
        };
        if closest.state == LevelState::Empty {
            closest.state = LevelState::Filled;
            closest.side = old.side;
            closest.order_quantity = old.order_quantity;
            closest.position_entry = old.position_entry;
            closest.position_size = old.position_size;
        }
    }

    info!(
        "grid rebuilt around {:.4}: bounds [{:.4}, {:.4}], {} filled restored",
        price,
        state.lower_price,
        state.upper_price,
        state
            .levels
            .iter()
            .filter(|l| l.state == LevelState::Filled)
            .count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GridConfig {
        serde_json::from_str(
            r#"{"symbol":"BTCUSDT","grid_count":11,"total_investment":1000.0,"leverage":5,
                "upper_price":11000.0,"lower_price":10000.0,"use_atr_bounds":false}"#,
        )
        .unwrap()
    }

    #[test]
    fn uniform_levels_and_spacing() {
        let c = config();
        let levels = build_levels(&c, 10_300.0, 11_000.0, 10_000.0, GridDirection::Neutral);
        assert_eq!(levels.len(), 11);
        assert!((levels[3].price - 10_300.0).abs() < 1e-9);
        assert!((levels[0].price - 10_000.0).abs() < 1e-9);
        assert!((levels[10].price - 11_000.0).abs() < 1e-9);
        // Uniform allocation: 1000 / 11 per level
        assert!((levels[5].allocated_usd - 1000.0 / 11.0).abs() < 1e-9);
        // Price-relative sides
        assert_eq!(levels[3].side, LevelSide::Buy);
        assert_eq!(levels[4].side, LevelSide::Sell);
    }

    #[test]
    fn directional_side_assignment() {
        let c = config();
        let mut levels = build_levels(&c, 10_500.0, 11_000.0, 10_000.0, GridDirection::Long);
        assert!(levels.iter().all(|l| l.side == LevelSide::Buy));

        assign_sides(&mut levels, 10_500.0, GridDirection::Short, 0.7);
        assert!(levels.iter().all(|l| l.side == LevelSide::Sell));
    }

    #[test]
    fn biased_assignment_respects_ratio() {
        let c = config();
        let levels = build_levels(&c, 10_500.0, 11_000.0, 10_000.0, GridDirection::LongBias);
        let buys = levels.iter().filter(|l| l.side == LevelSide::Buy).count();
        assert_eq!(buys, 8); // round(11 * 0.7)
        // The buys occupy the lower rungs
        assert_eq!(levels[0].side, LevelSide::Buy);
        assert_eq!(levels[10].side, LevelSide::Sell);

        let levels = build_levels(&c, 10_500.0, 11_000.0, 10_000.0, GridDirection::ShortBias);
        let sells = levels.iter().filter(|l| l.side == LevelSide::Sell).count();
        assert_eq!(sells, 8);
        assert_eq!(levels[10].side, LevelSide::Sell);
        assert_eq!(levels[0].side, LevelSide::Buy);
    }

    #[test]
    fn gaussian_and_pyramid_peak_in_middle() {
        for dist in [GridDistribution::Gaussian, GridDistribution::Pyramid] {
            let weights = level_weights(dist, 11);
            assert!(weights[5] > weights[0]);
            assert!(weights[5] > weights[10]);
        }
    }

    #[test]
    fn per_level_cap_and_absolute_reject() {
        let c = config();
        let level = GridLevel::new(3, 10_300.0, LevelSide::Buy, 1000.0 / 11.0);

        // Allocation cap: (1000/11 * 5) / 10300
        let qty = cap_level_quantity(&level, 1.0, 10_300.0, &c).unwrap();
        assert!((qty - (1000.0 / 11.0 * 5.0) / 10_300.0).abs() < 1e-9);

        // A level with an absurd allocation trips the absolute bound
        let whale = GridLevel::new(0, 10_300.0, LevelSide::Buy, 1_000_000.0);
        let err = cap_level_quantity(&whale, 10_000.0, 10_300.0, &c).unwrap_err();
        assert!(matches!(err, SizingRejection::AbsoluteCap { .. }));
    }

    #[test]
    fn global_cap_enforced() {
        let c = config();
        assert!(check_global_cap(3000.0, 1500.0, 400.0, &c).is_ok());
        let err = check_global_cap(3000.0, 1500.0, 600.0, &c).unwrap_err();
        assert!(matches!(err, SizingRejection::GlobalExposure { .. }));
    }

    #[test]
    fn skew_detection() {
        let c = config();
        let mut state = GridState::default();
        state.upper_price = 11_000.0;
        state.lower_price = 10_000.0;
        state.levels = build_levels(&c, 10_500.0, 11_000.0, 10_000.0, GridDirection::Neutral);
        assert!(!is_skewed(&state));

        // Fill six buy levels, zero sells
        for level in state.levels.iter_mut().filter(|l| l.side == LevelSide::Buy) {
            level.mark_pending("x".to_string(), 0.01);
            level.mark_filled();
        }
        assert!(is_skewed(&state));
    }

    #[test]
    fn midpoint_deviation() {
        let mut state = GridState::default();
        state.upper_price = 11_000.0;
        state.lower_price = 10_000.0;
        assert!(!deviated_from_midpoint(&state, 10_600.0));
        assert!(deviated_from_midpoint(&state, 10_900.0));
    }

    #[test]
    fn rebuild_restores_filled_states() {
        let c = config();
        let mut state = GridState::default();
        state.upper_price = 11_000.0;
        state.lower_price = 10_000.0;
        state.levels = build_levels(&c, 10_500.0, 11_000.0, 10_000.0, GridDirection::Neutral);
        state.levels[3].mark_pending("o1".to_string(), 0.044);
        state.levels[3].mark_filled();
        let old_entry = state.levels[3].position_entry;

        rebuild_around(&mut state, &c, 11_500.0);
        assert!((state.midpoint_locked() - 11_500.0).abs() < 1e-9);
        let restored: Vec<_> = state
            .levels
            .iter()
            .filter(|l| l.state == LevelState::Filled)
            .collect();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].position_entry, old_entry);
    }
}
