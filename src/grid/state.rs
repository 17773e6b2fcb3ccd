//! Grid state
//!
//! All fields live behind one reader-preferring RwLock owned by the engine.
//! Helpers that require the lock to already be held take `&mut GridState`
//! and carry the `_locked` suffix; cross-field updates must happen inside a
//! single write-lock hold.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::market::BoxBounds;

/// Lifecycle of one price level in the ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelState {
    Empty,
    Pending,
    Filled,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelSide {
    Buy,
    Sell,
}

/// One rung of the ladder; at most one resting order at a time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLevel {
    pub index: usize,
    pub price: f64,
    pub side: LevelSide,
    pub state: LevelState,
    pub order_id: Option<String>,
    pub order_quantity: f64,
    pub allocated_usd: f64,
    pub position_entry: Option<f64>,
    pub position_size: Option<f64>,
}

impl GridLevel {
    pub fn new(index: usize, price: f64, side: LevelSide, allocated_usd: f64) -> Self {
        Self {
            index,
            price,
            side,
            state: LevelState::Empty,
            order_id: None,
            order_quantity: 0.0,
            allocated_usd,
            position_entry: None,
            position_size: None,
        }
    }

    pub fn mark_pending(&mut self, order_id: String, quantity: f64) {
        self.state = LevelState::Pending;
        self.order_id = Some(order_id);
        self.order_quantity = quantity;
    }

    pub fn mark_filled(&mut self) {
        self.state = LevelState::Filled;
        self.position_entry = Some(self.price);
        self.position_size = Some(self.order_quantity);
        self.order_id = None;
    }

    pub fn mark_empty(&mut self) {
        self.state = LevelState::Empty;
        self.order_id = None;
        self.order_quantity = 0.0;
        self.position_entry = None;
        self.position_size = None;
    }

    pub fn mark_stopped(&mut self) {
        self.state = LevelState::Stopped;
        self.order_id = None;
    }

    /// Signed base-asset exposure of this level's fill
    pub fn signed_size(&self) -> f64 {
        let size = self.position_size.unwrap_or(0.0);
        match (self.state, self.side) {
            (LevelState::Filled, LevelSide::Buy) => size,
            (LevelState::Filled, LevelSide::Sell) => -size,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakoutLevel {
    Short,
    Mid,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakoutDirection {
    Up,
    Down,
}

/// Confirmation counter: three consecutive observations of the same
/// (level, direction) confirm; any inside observation resets to zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakoutState {
    pub active: Option<(BreakoutLevel, BreakoutDirection)>,
    pub confirm_count: u32,
    pub started_at: Option<DateTime<Utc>>,
}

pub const BREAKOUT_CONFIRMATIONS: u32 = 3;

impl BreakoutState {
    /// Feed one observation; returns the confirmed pair when the counter
    /// reaches the threshold.
    pub fn observe(
        &mut self,
        observation: Option<(BreakoutLevel, BreakoutDirection)>,
    ) -> Option<(BreakoutLevel, BreakoutDirection)> {
        match observation {
            None => {
                self.reset();
                None
            }
            Some(pair) => {
                if self.active == Some(pair) {
                    self.confirm_count += 1;
                } else {
                    self.active = Some(pair);
                    self.confirm_count = 1;
                    self.started_at = Some(Utc::now());
                }
                (self.confirm_count >= BREAKOUT_CONFIRMATIONS).then_some(pair)
            }
        }
    }

    pub fn reset(&mut self) {
        self.active = None;
        self.confirm_count = 0;
        self.started_at = None;
    }

    pub fn is_set(&self) -> bool {
        self.active.is_some()
    }
}

/// Directional stance of the whole grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridDirection {
    Neutral,
    LongBias,
    ShortBias,
    Long,
    Short,
}

impl GridDirection {
    /// One step back toward neutral, used on short-box re-entry.
    pub fn step_toward_neutral(self) -> Self {
        match self {
            GridDirection::Long => GridDirection::LongBias,
            GridDirection::LongBias => GridDirection::Neutral,
            GridDirection::Short => GridDirection::ShortBias,
            GridDirection::ShortBias => GridDirection::Neutral,
            GridDirection::Neutral => GridDirection::Neutral,
        }
    }
}

/// The mutable core of the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridState {
    pub levels: Vec<GridLevel>,
    pub upper_price: f64,
    pub lower_price: f64,
    pub spacing: f64,
    pub is_paused: bool,
    pub is_initialized: bool,
    pub boxes: BoxBounds,
    pub breakout: BreakoutState,
    pub current_direction: GridDirection,
    pub total_profit: f64,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub daily_pnl: f64,
    pub peak_equity: f64,
    pub max_drawdown: f64,
    pub last_daily_reset: NaiveDate,
    /// 0 or 50: recover at half size after a false breakout
    pub position_reduction_pct: u32,
    /// order id -> level index for fill attribution
    pub order_book: HashMap<String, usize>,
}

impl Default for GridState {
    fn default() -> Self {
        Self {
            levels: Vec::new(),
            upper_price: 0.0,
            lower_price: 0.0,
            spacing: 0.0,
            is_paused: false,
            is_initialized: false,
            boxes: BoxBounds::default(),
            breakout: BreakoutState::default(),
            current_direction: GridDirection::Neutral,
            total_profit: 0.0,
            total_trades: 0,
            winning_trades: 0,
            daily_pnl: 0.0,
            peak_equity: 0.0,
            max_drawdown: 0.0,
            last_daily_reset: Utc::now().date_naive(),
            position_reduction_pct: 0,
            order_book: HashMap::new(),
        }
    }
}

impl GridState {
    /// Sum of signed fills across levels; compared against the venue's
    /// signed position during sync.
    pub fn filled_signed_size_locked(&self) -> f64 {
        self.levels.iter().map(GridLevel::signed_size).sum()
    }

    pub fn filled_count_locked(&self, side: LevelSide) -> usize {
        self.levels
            .iter()
            .filter(|l| l.side == side && l.state == LevelState::Filled)
            .count()
    }

    pub fn empty_count_locked(&self, side: LevelSide) -> usize {
        self.levels
            .iter()
            .filter(|l| l.side == side && l.state == LevelState::Empty)
            .count()
    }

    /// Notional tied up in resting orders.
    pub fn pending_value_locked(&self) -> f64 {
        self.levels
            .iter()
            .filter(|l| l.state == LevelState::Pending)
            .map(|l| l.order_quantity * l.price)
            .sum()
    }

    /// Roll the daily PnL window on a calendar day change.
    pub fn maybe_reset_daily_locked(&mut self, today: NaiveDate) {
        if today != self.last_daily_reset {
            self.daily_pnl = 0.0;
            self.last_daily_reset = today;
        }
    }

    /// Track peak equity and return the current drawdown fraction.
    pub fn update_drawdown_locked(&mut self, equity: f64) -> f64 {
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        let drawdown = (self.peak_equity - equity) / self.peak_equity;
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
        }
        drawdown
    }

    /// Record a realized per-level result.
    pub fn record_level_pnl_locked(&mut self, pnl: f64) {
        self.total_profit += pnl;
        self.daily_pnl += pnl;
        if pnl > 0.0 {
            self.winning_trades += 1;
        }
    }

    /// Midpoint of the configured envelope.
    pub fn midpoint_locked(&self) -> f64 {
        (self.upper_price + self.lower_price) / 2.0
    }

    pub fn range_locked(&self) -> f64 {
        self.upper_price - self.lower_price
    }
}

/// Classify a price against the boxes: the widest violated envelope wins,
/// inside everything is None.
pub fn classify_box_breakout(
    price: f64,
    boxes: &BoxBounds,
) -> Option<(BreakoutLevel, BreakoutDirection)> {
    if boxes.long_upper > 0.0 && price > boxes.long_upper {
        return Some((BreakoutLevel::Long, BreakoutDirection::Up));
    }
    if boxes.long_lower > 0.0 && price < boxes.long_lower {
        return Some((BreakoutLevel::Long, BreakoutDirection::Down));
    }
    if boxes.mid_upper > 0.0 && price > boxes.mid_upper {
        return Some((BreakoutLevel::Mid, BreakoutDirection::Up));
    }
    if boxes.mid_lower > 0.0 && price < boxes.mid_lower {
        return Some((BreakoutLevel::Mid, BreakoutDirection::Down));
    }
    if boxes.short_upper > 0.0 && price > boxes.short_upper {
        return Some((BreakoutLevel::Short, BreakoutDirection::Up));
    }
    if boxes.short_lower > 0.0 && price < boxes.short_lower {
        return Some((BreakoutLevel::Short, BreakoutDirection::Down));
    }
    None
}

/// Direction transition on a confirmed short/mid breakout (direction
/// adjustment mode). Long breakouts defer to the emergency handler.
pub fn direction_after_breakout(
    current: GridDirection,
    level: BreakoutLevel,
    direction: BreakoutDirection,
) -> GridDirection {
    match (level, direction) {
        (BreakoutLevel::Short, BreakoutDirection::Up) => GridDirection::LongBias,
        (BreakoutLevel::Short, BreakoutDirection::Down) => GridDirection::ShortBias,
        (BreakoutLevel::Mid, BreakoutDirection::Up) => GridDirection::Long,
        (BreakoutLevel::Mid, BreakoutDirection::Down) => GridDirection::Short,
        (BreakoutLevel::Long, _) => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxes() -> BoxBounds {
        BoxBounds {
            short_upper: 101.0,
            short_lower: 99.0,
            mid_upper: 105.0,
            mid_lower: 95.0,
            long_upper: 110.0,
            long_lower: 90.0,
        }
    }

    #[test]
    fn classification_prefers_widest_break() {
        let b = boxes();
        assert_eq!(classify_box_breakout(100.0, &b), None);
        assert_eq!(
            classify_box_breakout(102.0, &b),
            Some((BreakoutLevel::Short, BreakoutDirection::Up))
        );
        assert_eq!(
            classify_box_breakout(106.0, &b),
            Some((BreakoutLevel::Mid, BreakoutDirection::Up))
        );
        assert_eq!(
            classify_box_breakout(111.0, &b),
            Some((BreakoutLevel::Long, BreakoutDirection::Up))
        );
        assert_eq!(
            classify_box_breakout(89.0, &b),
            Some((BreakoutLevel::Long, BreakoutDirection::Down))
        );
    }

    #[test]
    fn three_consecutive_observations_confirm() {
        let mut state = BreakoutState::default();
        let pair = (BreakoutLevel::Short, BreakoutDirection::Up);
        assert!(state.observe(Some(pair)).is_none());
        assert!(state.observe(Some(pair)).is_none());
        assert_eq!(state.observe(Some(pair)), Some(pair));
        assert!(state.confirm_count >= BREAKOUT_CONFIRMATIONS);
    }

    #[test]
    fn inside_observation_resets_counter() {
        let mut state = BreakoutState::default();
        let pair = (BreakoutLevel::Short, BreakoutDirection::Up);
        state.observe(Some(pair));
        state.observe(Some(pair));
        state.observe(None);
        assert_eq!(state.confirm_count, 0);
        assert!(!state.is_set());
    }

    #[test]
    fn level_change_restarts_counter() {
        let mut state = BreakoutState::default();
        state.observe(Some((BreakoutLevel::Short, BreakoutDirection::Up)));
        state.observe(Some((BreakoutLevel::Short, BreakoutDirection::Up)));
        state.observe(Some((BreakoutLevel::Mid, BreakoutDirection::Up)));
        assert_eq!(state.confirm_count, 1);
    }

    #[test]
    fn direction_steps_toward_neutral() {
        assert_eq!(GridDirection::Long.step_toward_neutral(), GridDirection::LongBias);
        assert_eq!(GridDirection::LongBias.step_toward_neutral(), GridDirection::Neutral);
        assert_eq!(GridDirection::Short.step_toward_neutral(), GridDirection::ShortBias);
        assert_eq!(GridDirection::Neutral.step_toward_neutral(), GridDirection::Neutral);
    }

    #[test]
    fn breakout_direction_transitions() {
        assert_eq!(
            direction_after_breakout(
                GridDirection::Neutral,
                BreakoutLevel::Short,
                BreakoutDirection::Up
            ),
            GridDirection::LongBias
        );
        assert_eq!(
            direction_after_breakout(
                GridDirection::Neutral,
                BreakoutLevel::Mid,
                BreakoutDirection::Down
            ),
            GridDirection::Short
        );
    }

    #[test]
    fn drawdown_tracking() {
        let mut state = GridState::default();
        assert_eq!(state.update_drawdown_locked(1000.0), 0.0);
        let dd = state.update_drawdown_locked(800.0);
        assert!((dd - 0.2).abs() < 1e-9);
        assert!((state.max_drawdown - 0.2).abs() < 1e-9);
        // Recovery does not shrink the recorded max
        state.update_drawdown_locked(950.0);
        assert!((state.max_drawdown - 0.2).abs() < 1e-9);
    }

    #[test]
    fn daily_reset_on_day_change() {
        let mut state = GridState::default();
        state.daily_pnl = -42.0;
        let today = state.last_daily_reset;
        state.maybe_reset_daily_locked(today);
        assert_eq!(state.daily_pnl, -42.0);
        state.maybe_reset_daily_locked(today.succ_opt().unwrap());
        assert_eq!(state.daily_pnl, 0.0);
    }

    #[test]
    fn signed_size_sums_filled_levels() {
        let mut state = GridState::default();
        let mut buy = GridLevel::new(0, 100.0, LevelSide::Buy, 50.0);
        buy.mark_pending("a".to_string(), 0.5);
        buy.mark_filled();
        let mut sell = GridLevel::new(1, 110.0, LevelSide::Sell, 50.0);
        sell.mark_pending("b".to_string(), 0.2);
        sell.mark_filled();
        state.levels = vec![buy, sell];
        assert!((state.filled_signed_size_locked() - 0.3).abs() < 1e-12);
    }
}
