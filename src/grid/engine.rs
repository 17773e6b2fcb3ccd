//! Grid cycle
//!
//! One entry point, `run_grid_cycle`, walks the tick sequence: envelope
//! breakout, drawdown and daily-loss circuit breakers, box breakout
//! confirmation, false-breakout recovery, oracle decisions, venue sync with
//! fill detection, per-level stop loss, skew auto-adjust, persistence.
//!
//! No lock is held across I/O: every step snapshots under the read lock,
//! performs its venue calls, then re-acquires the write lock to apply.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::exchange::grid_fallback::GridFallback;
use crate::exchange::{Exchange, ExchangeError, GridExchange, OrderAck, OrderSide};
use crate::market::{MarketData, MarketSnapshot};
use crate::models::{
    Decision, DecisionAction, DecisionActionRecord, DecisionRecord, GridConfig, Order,
    TraderConfig,
};
use crate::oracle::{OracleClient, TradingContext};
use crate::store::Store;

use super::levels::{
    self, cap_level_quantity, check_global_cap, compute_bounds, deviated_from_midpoint, is_skewed,
};
use super::regime;
use super::state::{
    classify_box_breakout, direction_after_breakout, BreakoutDirection, BreakoutLevel,
    GridDirection, GridState, LevelSide, LevelState,
};

/// Envelope breakout beyond this fraction cancels and pauses
const ENVELOPE_HARD_PCT: f64 = 0.02;
/// Advisory-only band below the hard threshold
const ENVELOPE_SOFT_PCT: f64 = 0.01;

const SIZE_EPSILON: f64 = 1e-9;

pub struct GridEngine {
    trader: TraderConfig,
    config: GridConfig,
    exchange: Arc<dyn Exchange>,
    fallback: GridFallback,
    market: Arc<MarketData>,
    oracle: Option<Arc<OracleClient>>,
    store: Store,
    state: RwLock<GridState>,
}

impl GridEngine {
    pub fn new(
        trader: TraderConfig,
        config: GridConfig,
        exchange: Arc<dyn Exchange>,
        market: Arc<MarketData>,
        oracle: Option<Arc<OracleClient>>,
        store: Store,
    ) -> Self {
        Self {
            trader,
            fallback: GridFallback::new(exchange.clone()),
            config,
            exchange,
            market,
            oracle,
            store,
            state: RwLock::new(GridState::default()),
        }
    }

    fn symbol(&self) -> &str {
        &self.config.symbol
    }

    /// Native grid capability when the venue has one, emulation otherwise.
    fn grid_venue(&self) -> &dyn GridExchange {
        match self.exchange.grid() {
            Some(grid) => grid,
            None => &self.fallback,
        }
    }

    pub fn state_snapshot(&self) -> GridState {
        self.state.read().clone()
    }

    /// The one tick entry point.
    pub async fn run_grid_cycle(&self) -> Result<()> {
        let symbol = self.symbol().to_string();
        let snapshot = self.market.snapshot(&symbol).await?;
        let price = snapshot.price;
        let mut actions: Vec<DecisionActionRecord> = Vec::new();

        self.ensure_initialized(&snapshot).await?;

        // 1. Directional breakout of the grid envelope
        if self.check_envelope_breakout(price, &mut actions).await? {
            return self.persist_cycle(&snapshot, &[], &actions);
        }

        // 2. Max drawdown circuit breaker
        let balance = self.exchange.get_balance().await?;
        let drawdown = self.state.write().update_drawdown_locked(balance.equity);
        if drawdown >= self.config.max_drawdown_pct {
            error!(
                "max drawdown tripped: {:.2}% >= {:.2}%",
                drawdown * 100.0,
                self.config.max_drawdown_pct * 100.0
            );
            self.emergency_exit("max_drawdown", &mut actions).await;
            return self.persist_cycle(&snapshot, &[], &actions);
        }

        // 3. Daily loss limit
        {
            let mut state = self.state.write();
            state.maybe_reset_daily_locked(Utc::now().date_naive());
            let loss_frac = -state.daily_pnl / self.config.total_investment;
            if loss_frac >= self.config.daily_loss_limit_pct {
                warn!(
                    "daily loss limit tripped: {:.2}% >= {:.2}%",
                    loss_frac * 100.0,
                    self.config.daily_loss_limit_pct * 100.0
                );
                state.is_paused = true;
            }
        }

        // 4. Box breakout detection and confirmation
        let confirmed = {
            let mut state = self.state.write();
            state.boxes = snapshot.boxes;
            let observation = classify_box_breakout(price, &state.boxes);
            state.breakout.observe(observation)
        };
        if let Some((level, direction)) = confirmed {
            self.dispatch_breakout(level, direction, &mut actions).await;
        }

        // 5. False-breakout recovery
        self.recover_false_breakout(price);

        // 6. Paused grids go no further
        if self.state.read().is_paused {
            return self.persist_cycle(&snapshot, &[], &actions);
        }

        // 7. Oracle decisions
        let decisions = match self.consult_oracle(&snapshot, &balance).await {
            Ok(decisions) => decisions,
            Err(e) => {
                warn!("oracle consult failed, continuing tick: {}", e);
                Vec::new()
            }
        };
        for decision in &decisions {
            let record = self.execute_decision(decision).await;
            actions.push(record);
            if self.state.read().is_paused {
                break;
            }
        }

        // 8. Sync level states against the venue
        if let Err(e) = self.sync_grid_state().await {
            warn!("grid sync failed: {}", e);
        }

        // 9. Per-level stop loss
        self.run_stop_loss_check(price, &mut actions).await;

        // 10. Skew-based auto-adjust
        self.maybe_auto_adjust(price, &mut actions).await;

        self.persist_cycle(&snapshot, &decisions, &actions)
    }

    async fn ensure_initialized(&self, snapshot: &MarketSnapshot) -> Result<()> {
        if self.state.read().is_initialized {
            return Ok(());
        }

        let (upper, lower) = compute_bounds(&self.config, snapshot);
        let balance = self.exchange.get_balance().await?;

        let mut state = self.state.write();
        if state.is_initialized {
            return Ok(());
        }
        state.upper_price = upper;
        state.lower_price = lower;
        state.spacing = (upper - lower) / (self.config.grid_count.max(2) as f64 - 1.0);
        state.levels = levels::build_levels(
            &self.config,
            snapshot.price,
            upper,
            lower,
            state.current_direction,
        );
        state.boxes = snapshot.boxes;
        state.peak_equity = balance.equity;
        state.is_initialized = true;

        info!(
            "grid initialized for {}: {} levels in [{:.4}, {:.4}], spacing {:.4}",
            self.symbol(),
            state.levels.len(),
            lower,
            upper,
            state.spacing
        );
        Ok(())
    }

    /// Returns true when the tick should stop here.
    async fn check_envelope_breakout(
        &self,
        price: f64,
        actions: &mut Vec<DecisionActionRecord>,
    ) -> Result<bool> {
        let (upper, lower) = {
            let state = self.state.read();
            (state.upper_price, state.lower_price)
        };
        if upper <= 0.0 || (price <= upper && price >= lower) {
            return Ok(false);
        }

        let breakout_pct = if price > upper {
            (price - upper) / upper
        } else {
            (lower - price) / lower
        };

        if breakout_pct >= ENVELOPE_HARD_PCT {
            warn!(
                "grid envelope breakout {:.2}% at {:.4}, cancelling and pausing",
                breakout_pct * 100.0,
                price
            );
            self.cancel_all_grid_orders(actions).await;
            self.state.write().is_paused = true;
            return Ok(true);
        }
        if breakout_pct >= ENVELOPE_SOFT_PCT {
            info!(
                "price {:.4} outside grid envelope by {:.2}% (advisory)",
                price,
                breakout_pct * 100.0
            );
        }
        Ok(false)
    }

    /// Cancel everything, close everything, pause. Never auto-resumes.
    async fn emergency_exit(&self, reason: &str, actions: &mut Vec<DecisionActionRecord>) {
        self.cancel_all_grid_orders(actions).await;

        let net = self.state.read().filled_signed_size_locked();
        if net.abs() > SIZE_EPSILON {
            let result = if net > 0.0 {
                self.exchange.close_long(self.symbol(), 0.0).await
            } else {
                self.exchange.close_short(self.symbol(), 0.0).await
            };
            actions.push(self.action_record(
                if net > 0.0 {
                    DecisionAction::CloseLong
                } else {
                    DecisionAction::CloseShort
                },
                net.abs(),
                0.0,
                &result,
            ));
            if result.is_ok() {
                let mut state = self.state.write();
                for level in state.levels.iter_mut() {
                    if level.state == LevelState::Filled {
                        level.mark_empty();
                    }
                }
            }
        }

        let mut state = self.state.write();
        state.is_paused = true;
        info!("emergency exit complete ({})", reason);
    }

    async fn cancel_all_grid_orders(&self, actions: &mut Vec<DecisionActionRecord>) {
        let result = self.exchange.cancel_all_orders(self.symbol()).await;
        actions.push(self.action_record(
            DecisionAction::CancelAllOrders,
            0.0,
            0.0,
            &result.as_ref().map(|n| OrderAck {
                order_id: format!("cancelled:{}", n),
                status: crate::models::OrderStatus::Canceled,
            }).map_err(|e| ExchangeError::transient(e.to_string())),
        ));
        if result.is_ok() {
            let mut state = self.state.write();
            state.order_book.clear();
            for level in state.levels.iter_mut() {
                if level.state == LevelState::Pending {
                    level.mark_empty();
                }
            }
        }
    }

    /// Confirmed box breakout dispatch: short reduces to half, mid pauses,
    /// long forces the full exit. With direction adjustment enabled, short
    /// and mid instead shift the grid direction.
    pub(crate) async fn dispatch_breakout(
        &self,
        level: BreakoutLevel,
        direction: BreakoutDirection,
        actions: &mut Vec<DecisionActionRecord>,
    ) {
        info!("confirmed box breakout: {:?} {:?}", level, direction);

        if self.config.enable_direction_adjust && level != BreakoutLevel::Long {
            let mut state = self.state.write();
            let next = direction_after_breakout(state.current_direction, level, direction);
            if next != state.current_direction {
                info!(
                    "direction shift {:?} -> {:?}",
                    state.current_direction, next
                );
                state.current_direction = next;
                reassign_empty_sides(&mut state, &self.config);
            }
            return;
        }

        match level {
            BreakoutLevel::Short => self.reduce_position_half(actions).await,
            BreakoutLevel::Mid => {
                self.cancel_all_grid_orders(actions).await;
                self.state.write().is_paused = true;
            }
            BreakoutLevel::Long => {
                self.emergency_exit("long_box_breakout", actions).await;
            }
        }
    }

    async fn reduce_position_half(&self, actions: &mut Vec<DecisionActionRecord>) {
        let net = self.state.read().filled_signed_size_locked();
        if net.abs() <= SIZE_EPSILON {
            self.state.write().position_reduction_pct = 50;
            return;
        }

        let half = net.abs() / 2.0;
        let result = if net > 0.0 {
            self.exchange.close_long(self.symbol(), half).await
        } else {
            self.exchange.close_short(self.symbol(), half).await
        };
        actions.push(self.action_record(
            if net > 0.0 {
                DecisionAction::CloseLong
            } else {
                DecisionAction::CloseShort
            },
            half,
            0.0,
            &result,
        ));

        if result.is_ok() {
            let mut state = self.state.write();
            state.position_reduction_pct = 50;
            for level in state.levels.iter_mut() {
                if level.state == LevelState::Filled {
                    if let Some(size) = level.position_size.as_mut() {
                        *size /= 2.0;
                    }
                }
            }
        }
    }

    /// Price re-entering the long box clears an armed breakout and resumes
    /// at half size; re-entering the short box steps an adjusted direction
    /// back toward neutral.
    pub(crate) fn recover_false_breakout(&self, price: f64) {
        let mut state = self.state.write();

        let inside_long = state.boxes.long_upper > 0.0
            && price < state.boxes.long_upper
            && price > state.boxes.long_lower;
        if state.breakout.is_set() && inside_long {
            info!("false breakout: price {:.4} back inside the long box", price);
            state.breakout.reset();
            state.is_paused = false;
            state.position_reduction_pct = 50;
        }

        let inside_short = state.boxes.short_upper > 0.0
            && price < state.boxes.short_upper
            && price > state.boxes.short_lower;
        if state.current_direction != GridDirection::Neutral && inside_short {
            let next = state.current_direction.step_toward_neutral();
            debug!(
                "direction recovery {:?} -> {:?}",
                state.current_direction, next
            );
            state.current_direction = next;
            reassign_empty_sides(&mut state, &self.config);
        }
    }

    async fn consult_oracle(
        &self,
        snapshot: &MarketSnapshot,
        balance: &crate::exchange::Balance,
    ) -> Result<Vec<Decision>> {
        let Some(oracle) = &self.oracle else {
            return Ok(Vec::new());
        };

        let positions = self.exchange.get_positions().await?;
        let state_json = serde_json::to_value(&*self.state.read())?;

        let context = TradingContext {
            trader_name: self.trader.name.clone(),
            strategy: "grid".to_string(),
            account: balance.clone(),
            positions,
            candidates: vec![crate::oracle::Candidate {
                symbol: self.symbol().to_string(),
                sources: vec!["grid".to_string()],
                snapshot: Some(snapshot.clone()),
            }],
            btc_eth_leverage: self.trader.btc_eth_leverage,
            altcoin_leverage: self.trader.altcoin_leverage,
            strategy_state: state_json,
            system_prompt: self.trader.system_prompt_template.clone(),
        };

        Ok(oracle.decide(&context).await?.decisions)
    }

    /// Route one oracle decision through the venue.
    pub(crate) async fn execute_decision(&self, decision: &Decision) -> DecisionActionRecord {
        match decision.action {
            DecisionAction::PlaceBuyLimit | DecisionAction::PlaceSellLimit => {
                self.place_level_order(decision).await
            }
            DecisionAction::CancelOrder => {
                let Some(order_id) = decision.order_id.as_deref() else {
                    return self.failed_record(decision, "cancel_order without order_id");
                };
                let result = self.grid_venue().cancel_order(self.symbol(), order_id).await;
                match result {
                    Ok(()) => {
                        let mut state = self.state.write();
                        if let Some(index) = state.order_book.remove(order_id) {
                            if let Some(level) = state.levels.get_mut(index) {
                                level.mark_empty();
                            }
                        }
                        self.ok_record(decision.action, decision, Some(order_id.to_string()))
                    }
                    Err(e) => self.failed_record(decision, &e.to_string()),
                }
            }
            DecisionAction::CancelAllOrders => {
                let mut actions = Vec::new();
                self.cancel_all_grid_orders(&mut actions).await;
                actions
                    .pop()
                    .unwrap_or_else(|| self.ok_record(decision.action, decision, None))
            }
            DecisionAction::PauseGrid => {
                self.state.write().is_paused = true;
                self.ok_record(decision.action, decision, None)
            }
            DecisionAction::ResumeGrid => {
                let mut state = self.state.write();
                state.is_paused = false;
                state.breakout.reset();
                self.ok_record(decision.action, decision, None)
            }
            DecisionAction::AdjustGrid => {
                let mut actions = Vec::new();
                self.cancel_all_grid_orders(&mut actions).await;
                let price = match self.exchange.get_market_price(self.symbol()).await {
                    Ok(price) => price,
                    Err(e) => return self.failed_record(decision, &e.to_string()),
                };
                levels::rebuild_around(&mut self.state.write(), &self.config, price);
                self.ok_record(decision.action, decision, None)
            }
            DecisionAction::CloseLong => {
                let qty = decision.quantity.unwrap_or(0.0);
                let result = self.exchange.close_long(self.symbol(), qty).await;
                self.action_record(decision.action, qty, 0.0, &result)
            }
            DecisionAction::CloseShort => {
                let qty = decision.quantity.unwrap_or(0.0);
                let result = self.exchange.close_short(self.symbol(), qty).await;
                self.action_record(decision.action, qty, 0.0, &result)
            }
            DecisionAction::Hold | DecisionAction::Wait => {
                self.ok_record(decision.action, decision, None)
            }
            // Directional-only actions are not valid on a grid
            DecisionAction::OpenLong | DecisionAction::OpenShort => {
                self.failed_record(decision, "directional open on a grid strategy")
            }
        }
    }

    async fn place_level_order(&self, decision: &Decision) -> DecisionActionRecord {
        let side = if decision.action == DecisionAction::PlaceBuyLimit {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };

        // Anchor the request to the closest empty level on the right side
        let (level, pending_value, reduction_pct) = {
            let state = self.state.read();
            let target_price = decision.price.unwrap_or(0.0);
            let Some(level) = state
                .levels
                .iter()
                .filter(|l| l.state == LevelState::Empty)
                .filter(|l| {
                    (side == OrderSide::Buy && l.side == LevelSide::Buy)
                        || (side == OrderSide::Sell && l.side == LevelSide::Sell)
                })
                .min_by(|a, b| {
                    let da = (a.price - target_price).abs();
                    let db = (b.price - target_price).abs();
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                })
                .cloned()
            else {
                return self.failed_record(decision, "no empty level available for this side");
            };
            (level, state.pending_value_locked(), state.position_reduction_pct)
        };

        let level_index = level.index;
        let price = level.price;

        // Venue leverage is regime-capped; the per-level sizing formula
        // stays on the configured grid leverage.
        let snapshot = match self.market.snapshot(self.symbol()).await {
            Ok(s) => s,
            Err(e) => return self.failed_record(decision, &e.to_string()),
        };
        let current_regime = regime::classify(snapshot.bb_width_pct, snapshot.atr_pct);
        let caps = regime::caps_for(&self.config, current_regime);
        let leverage = decision
            .leverage
            .unwrap_or(self.config.leverage)
            .min(caps.max_leverage)
            .max(1);

        let mut qty = decision.quantity.unwrap_or_else(|| {
            level.allocated_usd * self.config.leverage as f64 / price
        });
        if reduction_pct == 50 {
            qty /= 2.0;
        }

        qty = match cap_level_quantity(&level, qty, price, &self.config) {
            Ok(q) => q,
            Err(rejection) => {
                return self.failed_record(decision, &format!("sizing rejected: {:?}", rejection))
            }
        };

        // Regime position cap on the notional
        let max_notional = self.config.total_investment * caps.max_position_pct
            * self.config.leverage as f64;
        if qty * price > max_notional {
            qty = max_notional / price;
        }

        // Global exposure cap uses live venue positions, not local state
        let current_value = match self.exchange.get_positions().await {
            Ok(positions) => positions
                .iter()
                .filter(|p| p.symbol == self.symbol())
                .map(|p| p.quantity * p.mark_price)
                .sum(),
            Err(_) => 0.0,
        };
        if let Err(rejection) =
            check_global_cap(current_value, pending_value, qty * price, &self.config)
        {
            return self.failed_record(decision, &format!("sizing rejected: {:?}", rejection));
        }

        if let Err(e) = self.exchange.set_leverage(self.symbol(), leverage).await {
            debug!("set_leverage before placement failed (continuing): {}", e);
        }

        let result = self
            .grid_venue()
            .place_limit_order(self.symbol(), side, qty, price, self.config.use_maker_only)
            .await;

        match &result {
            Ok(ack) => {
                {
                    let mut state = self.state.write();
                    state.order_book.insert(ack.order_id.clone(), level_index);
                    if let Some(level) = state.levels.get_mut(level_index) {
                        level.mark_pending(ack.order_id.clone(), qty);
                    }
                }
                let order = Order::new_intent(
                    self.trader.id,
                    self.exchange.exchange_id(),
                    &ack.order_id,
                    self.symbol(),
                    decision.action,
                    qty,
                    price,
                    leverage,
                );
                if let Err(e) = self.store.create_order(&order) {
                    warn!("failed to persist grid order intent: {}", e);
                }
            }
            Err(e) => debug!("level order placement failed: {}", e),
        }
        self.action_record(decision.action, qty, price, &result)
    }

    /// Reconcile level states with the venue: a pending order gone from the
    /// open list either filled (venue position grew) or died (it did not).
    pub(crate) async fn sync_grid_state(&self) -> Result<()> {
        let open_orders = self.exchange.get_open_orders(self.symbol()).await?;
        let positions = self.exchange.get_positions().await?;

        let open_ids: HashSet<String> =
            open_orders.into_iter().map(|o| o.order_id).collect();
        let venue_signed: f64 = positions
            .iter()
            .filter(|p| p.symbol == self.symbol())
            .map(|p| match p.side {
                crate::models::PositionSide::Long => p.quantity,
                crate::models::PositionSide::Short => -p.quantity,
            })
            .sum();

        let mut state = self.state.write();
        let mut local_signed = state.filled_signed_size_locked();

        let ambiguous: Vec<usize> = state
            .levels
            .iter()
            .filter(|l| {
                l.state == LevelState::Pending
                    && l.order_id
                        .as_ref()
                        .map(|id| !open_ids.contains(id))
                        .unwrap_or(true)
            })
            .map(|l| l.index)
            .collect();

        for index in ambiguous {
            let level = &mut state.levels[index];
            let order_id = level.order_id.clone();
            let delta = match level.side {
                LevelSide::Buy => level.order_quantity,
                LevelSide::Sell => -level.order_quantity,
            };

            // Larger venue magnitude means the order executed
            if venue_signed.abs() > local_signed.abs() + SIZE_EPSILON {
                level.mark_filled();
                local_signed += delta;
                state.total_trades += 1;
                debug!("level {} detected filled", index);
            } else {
                level.mark_empty();
                debug!("level {} order vanished without a fill", index);
            }
            if let Some(id) = order_id {
                state.order_book.remove(&id);
            }
        }
        Ok(())
    }

    /// Per-level stop loss over filled levels.
    pub(crate) async fn run_stop_loss_check(
        &self,
        price: f64,
        actions: &mut Vec<DecisionActionRecord>,
    ) {
        let candidates: Vec<(usize, LevelSide, f64, f64)> = {
            let state = self.state.read();
            state
                .levels
                .iter()
                .filter(|l| l.state == LevelState::Filled)
                .filter_map(|l| {
                    let entry = l.position_entry?;
                    let size = l.position_size?;
                    let loss = match l.side {
                        LevelSide::Buy => (entry - price) / entry,
                        LevelSide::Sell => (price - entry) / entry,
                    };
                    (loss >= self.config.stop_loss_pct).then_some((l.index, l.side, entry, size))
                })
                .collect()
        };

        for (index, side, entry, size) in candidates {
            let result = match side {
                LevelSide::Buy => self.exchange.close_long(self.symbol(), size).await,
                LevelSide::Sell => self.exchange.close_short(self.symbol(), size).await,
            };
            let action = match side {
                LevelSide::Buy => DecisionAction::CloseLong,
                LevelSide::Sell => DecisionAction::CloseShort,
            };
            actions.push(self.action_record(action, size, price, &result));

            if result.is_ok() {
                let pnl = match side {
                    LevelSide::Buy => (price - entry) * size,
                    LevelSide::Sell => (entry - price) * size,
                };
                let mut state = self.state.write();
                state.levels[index].mark_stopped();
                state.record_level_pnl_locked(pnl);
                warn!(
                    "level {} stopped out at {:.4} (entry {:.4}, pnl {:.2})",
                    index, price, entry, pnl
                );
            }
        }
    }

    /// Auto-adjust when fills are skewed and price has left the midpoint.
    pub(crate) async fn maybe_auto_adjust(
        &self,
        price: f64,
        actions: &mut Vec<DecisionActionRecord>,
    ) {
        let should = {
            let state = self.state.read();
            is_skewed(&state) && deviated_from_midpoint(&state, price)
        };
        if !should {
            return;
        }

        info!("grid skew detected, re-centering around {:.4}", price);
        self.cancel_all_grid_orders(actions).await;
        levels::rebuild_around(&mut self.state.write(), &self.config, price);
    }

    fn persist_cycle(
        &self,
        snapshot: &MarketSnapshot,
        decisions: &[Decision],
        actions: &[DecisionActionRecord],
    ) -> Result<()> {
        let context = serde_json::json!({
            "snapshot": snapshot,
            "state": &*self.state.read(),
        });
        let record = DecisionRecord {
            id: None,
            trader_id: self.trader.id,
            strategy: "grid".to_string(),
            context_json: context.to_string(),
            cot_trace: String::new(),
            raw_response: String::new(),
            decisions_json: serde_json::to_string(decisions).unwrap_or_else(|_| "[]".into()),
            actions_json: serde_json::to_string(actions).unwrap_or_else(|_| "[]".into()),
            created_at: Utc::now(),
        };
        self.store.log_decision(&record)?;
        Ok(())
    }

    fn action_record(
        &self,
        action: DecisionAction,
        quantity: f64,
        price: f64,
        result: &Result<OrderAck, ExchangeError>,
    ) -> DecisionActionRecord {
        match result {
            Ok(ack) => DecisionActionRecord {
                action,
                symbol: self.symbol().to_string(),
                order_id: Some(ack.order_id.clone()),
                quantity,
                avg_price: price,
                success: true,
                error: None,
                executed_at: Utc::now(),
            },
            Err(e) => DecisionActionRecord {
                action,
                symbol: self.symbol().to_string(),
                order_id: None,
                quantity,
                avg_price: price,
                success: false,
                error: Some(e.to_string()),
                executed_at: Utc::now(),
            },
        }
    }

    fn ok_record(
        &self,
        action: DecisionAction,
        decision: &Decision,
        order_id: Option<String>,
    ) -> DecisionActionRecord {
        DecisionActionRecord {
            action,
            symbol: decision.symbol.clone(),
            order_id,
            quantity: decision.quantity.unwrap_or(0.0),
            avg_price: decision.price.unwrap_or(0.0),
            success: true,
            error: None,
            executed_at: Utc::now(),
        }
    }

    fn failed_record(&self, decision: &Decision, error: &str) -> DecisionActionRecord {
        DecisionActionRecord {
            action: decision.action,
            symbol: decision.symbol.clone(),
            order_id: None,
            quantity: decision.quantity.unwrap_or(0.0),
            avg_price: decision.price.unwrap_or(0.0),
            success: false,
            error: Some(error.to_string()),
            executed_at: Utc::now(),
        }
    }
}

/// Reassign sides on levels that carry no order and no fill; filled and
/// pending levels keep their attribution.
fn reassign_empty_sides(state: &mut GridState, config: &GridConfig) {
    let midpoint = state.midpoint_locked();
    let mut scratch = state.levels.clone();
    levels::assign_sides(
        &mut scratch,
        midpoint,
        state.current_direction,
        config.direction_bias_ratio,
    );
    for (level, assigned) in state.levels.iter_mut().zip(scratch) {
        if level.state == LevelState::Empty {
            level.side = assigned.side;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use crate::exchange::Kline;
    use crate::market::BoxBounds;
    use crate::models::{PositionSide, StrategyKind};

    fn grid_config() -> GridConfig {
        serde_json::from_str(
            r#"{"symbol":"BTCUSDT","grid_count":11,"total_investment":1000.0,"leverage":5,
                "upper_price":11000.0,"lower_price":10000.0,"use_atr_bounds":false,
                "stop_loss_pct":0.05,"max_drawdown_pct":0.2,"daily_loss_limit_pct":0.1}"#,
        )
        .unwrap()
    }

    fn trader_config() -> TraderConfig {
        TraderConfig {
            id: 1,
            name: "grid-test".to_string(),
            exchange_id: "mock".to_string(),
            strategy: StrategyKind::Grid,
            scan_interval_secs: 60,
            btc_eth_leverage: 10,
            altcoin_leverage: 5,
            is_cross_margin: true,
            system_prompt_template: String::new(),
            default_coins: vec![],
            trading_coins: vec![],
            grid: None,
        }
    }

    fn flat_klines(n: usize, price: f64) -> Vec<Kline> {
        (0..n)
            .map(|i| Kline {
                open_time: i as i64,
                open: price,
                high: price * 1.001,
                low: price * 0.999,
                close: price,
                volume: 10.0,
            })
            .collect()
    }

    fn engine_with(price: f64) -> (GridEngine, Arc<MockExchange>) {
        let mock = Arc::new(MockExchange::new("mock"));
        mock.set_price("BTCUSDT", price);
        mock.state.lock().klines.insert(
            "BTCUSDT".to_string(),
            flat_klines(140, price),
        );
        mock.state.lock().balance = crate::exchange::Balance {
            wallet_balance: 1000.0,
            available_balance: 1000.0,
            unrealized_profit: 0.0,
            equity: 1000.0,
        };
        let exchange: Arc<dyn Exchange> = mock.clone();
        let market = Arc::new(MarketData::new(exchange.clone()));
        let store = Store::open_in_memory().unwrap();
        let engine = GridEngine::new(
            trader_config(),
            grid_config(),
            exchange,
            market,
            None,
            store,
        );
        (engine, mock)
    }

    #[tokio::test]
    async fn level_fill_detection_end_to_end() {
        let (engine, mock) = engine_with(10_300.0);
        engine.run_grid_cycle().await.unwrap();
        assert!(engine.state_snapshot().is_initialized);

        // Place a buy at level 3 (price 10300): qty = (1000/11*5)/10300
        let decision = Decision {
            action: DecisionAction::PlaceBuyLimit,
            symbol: "BTCUSDT".to_string(),
            quantity: None,
            position_size_usd: None,
            leverage: Some(5),
            price: Some(10_300.0),
            stop_loss: None,
            take_profit: None,
            order_id: None,
            confidence: 0.9,
            reasoning: String::new(),
        };
        let record = engine.execute_decision(&decision).await;
        assert!(record.success, "placement failed: {:?}", record.error);
        let expected_qty = (1000.0 / 11.0 * 5.0) / 10_300.0;
        assert!((record.quantity - expected_qty).abs() < 1e-6);

        let state = engine.state_snapshot();
        let level = state
            .levels
            .iter()
            .find(|l| (l.price - 10_300.0).abs() < 1e-6)
            .unwrap();
        assert_eq!(level.state, LevelState::Pending);
        let order_id = level.order_id.clone().unwrap();
        assert_eq!(state.order_book.get(&order_id), Some(&level.index));

        // Venue reports the position and the order is gone from the list
        mock.state.lock().open_orders.clear();
        mock.set_position("BTCUSDT", PositionSide::Long, expected_qty, 10_300.0);

        engine.sync_grid_state().await.unwrap();

        let state = engine.state_snapshot();
        let level = state
            .levels
            .iter()
            .find(|l| (l.price - 10_300.0).abs() < 1e-6)
            .unwrap();
        assert_eq!(level.state, LevelState::Filled);
        assert_eq!(level.position_entry, Some(10_300.0));
        assert!((level.position_size.unwrap() - expected_qty).abs() < 1e-9);
        assert_eq!(state.total_trades, 1);

        // Sum of filled levels matches the venue position
        assert!(
            (state.filled_signed_size_locked() - expected_qty).abs() < 1e-9
        );
    }

    #[tokio::test]
    async fn vanished_order_without_position_is_cancelled() {
        let (engine, mock) = engine_with(10_300.0);
        engine.run_grid_cycle().await.unwrap();

        let decision = Decision {
            action: DecisionAction::PlaceBuyLimit,
            symbol: "BTCUSDT".to_string(),
            quantity: Some(0.04),
            position_size_usd: None,
            leverage: Some(5),
            price: Some(10_300.0),
            stop_loss: None,
            take_profit: None,
            order_id: None,
            confidence: 0.9,
            reasoning: String::new(),
        };
        engine.execute_decision(&decision).await;

        // Order disappears but the venue position stays flat
        mock.state.lock().open_orders.clear();
        engine.sync_grid_state().await.unwrap();

        let state = engine.state_snapshot();
        assert!(state
            .levels
            .iter()
            .all(|l| l.state != LevelState::Pending && l.state != LevelState::Filled));
        assert!(state.order_book.is_empty());
    }

    #[tokio::test]
    async fn box_breakout_confirms_and_reduces() {
        let (engine, mock) = engine_with(100.0);
        {
            let mut state = engine.state.write();
            state.is_initialized = true;
            state.upper_price = 200.0;
            state.lower_price = 50.0;
            state.boxes = BoxBounds {
                short_upper: 101.0,
                short_lower: 99.0,
                mid_upper: 105.0,
                mid_lower: 95.0,
                long_upper: 110.0,
                long_lower: 90.0,
            };
            // A filled buy level with one unit of position
            let mut level = super::super::state::GridLevel::new(
                0,
                100.0,
                LevelSide::Buy,
                100.0,
            );
            level.mark_pending("seed".to_string(), 1.0);
            level.mark_filled();
            state.levels.push(level);
        }
        mock.set_position("BTCUSDT", PositionSide::Long, 1.0, 100.0);

        let observe = |engine: &GridEngine, price: f64| {
            let mut state = engine.state.write();
            let boxes = state.boxes;
            state.breakout.observe(classify_box_breakout(price, &boxes))
        };

        // 100 inside, then three observations above the short box
        assert!(observe(&engine, 100.0).is_none());
        assert!(observe(&engine, 102.0).is_none());
        assert!(observe(&engine, 102.5).is_none());
        let confirmed = observe(&engine, 102.1).unwrap();
        assert_eq!(confirmed, (BreakoutLevel::Short, BreakoutDirection::Up));
        assert!(engine.state_snapshot().breakout.confirm_count >= 3);

        let mut actions = Vec::new();
        engine
            .dispatch_breakout(confirmed.0, confirmed.1, &mut actions)
            .await;

        let state = engine.state_snapshot();
        assert_eq!(state.position_reduction_pct, 50);
        assert!((state.levels[0].position_size.unwrap() - 0.5).abs() < 1e-9);

        // Back inside the long box: breakout state clears and the grid runs
        engine.recover_false_breakout(100.5);
        let state = engine.state_snapshot();
        assert!(!state.breakout.is_set());
        assert_eq!(state.breakout.confirm_count, 0);
        assert!(!state.is_paused);
    }

    #[tokio::test]
    async fn long_breakout_forces_full_exit() {
        let (engine, mock) = engine_with(100.0);
        {
            let mut state = engine.state.write();
            state.is_initialized = true;
            state.boxes = BoxBounds {
                short_upper: 101.0,
                short_lower: 99.0,
                mid_upper: 105.0,
                mid_lower: 95.0,
                long_upper: 110.0,
                long_lower: 90.0,
            };
            let mut level =
                super::super::state::GridLevel::new(0, 100.0, LevelSide::Buy, 100.0);
            level.mark_pending("seed".to_string(), 1.0);
            level.mark_filled();
            state.levels.push(level);
        }
        mock.set_position("BTCUSDT", PositionSide::Long, 1.0, 100.0);

        let mut actions = Vec::new();
        engine
            .dispatch_breakout(BreakoutLevel::Long, BreakoutDirection::Up, &mut actions)
            .await;

        let state = engine.state_snapshot();
        assert!(state.is_paused);
        assert!(state
            .levels
            .iter()
            .all(|l| l.state != LevelState::Filled));
        // The venue position was closed
        assert!(mock.state.lock().positions.is_empty());
    }

    #[tokio::test]
    async fn per_level_stop_loss_closes_and_marks() {
        let (engine, _mock) = engine_with(9_700.0);
        {
            let mut state = engine.state.write();
            state.is_initialized = true;
            let mut level = super::super::state::GridLevel::new(
                0,
                10_300.0,
                LevelSide::Buy,
                100.0,
            );
            level.mark_pending("seed".to_string(), 0.04);
            level.mark_filled();
            state.levels.push(level);
        }
        _mock.set_position("BTCUSDT", PositionSide::Long, 0.04, 10_300.0);

        // Loss = (10300 - 9700) / 10300 = 5.8% >= 5%
        let mut actions = Vec::new();
        engine.run_stop_loss_check(9_700.0, &mut actions).await;

        let state = engine.state_snapshot();
        assert_eq!(state.levels[0].state, LevelState::Stopped);
        assert!(state.daily_pnl < 0.0);
        assert_eq!(actions.len(), 1);
        assert!(actions[0].success);
    }

    #[tokio::test]
    async fn daily_loss_limit_pauses_the_grid() {
        let (engine, _mock) = engine_with(10_300.0);
        engine.run_grid_cycle().await.unwrap();

        // 15% of total investment lost today vs a 10% limit
        engine.state.write().daily_pnl = -150.0;
        engine.run_grid_cycle().await.unwrap();
        assert!(engine.state_snapshot().is_paused);

        // The next calendar day resets the window but not the pause
        {
            let mut state = engine.state.write();
            let next_day = state.last_daily_reset.succ_opt().unwrap();
            state.maybe_reset_daily_locked(next_day);
            assert_eq!(state.daily_pnl, 0.0);
        }
        assert!(engine.state_snapshot().is_paused);
    }

    #[tokio::test]
    async fn hard_envelope_breakout_cancels_and_pauses() {
        let (engine, mock) = engine_with(10_300.0);
        engine.run_grid_cycle().await.unwrap();

        // 11300 is 2.7% above the 11000 upper bound
        mock.set_price("BTCUSDT", 11_300.0);
        mock.state
            .lock()
            .klines
            .insert("BTCUSDT".to_string(), flat_klines(140, 11_300.0));
        engine.market.invalidate("BTCUSDT");

        engine.run_grid_cycle().await.unwrap();
        let state = engine.state_snapshot();
        assert!(state.is_paused);
        assert!(mock
            .submissions()
            .iter()
            .any(|c| matches!(c, crate::exchange::mock::SubmittedCall::CancelAll { .. })));
    }

    #[tokio::test]
    async fn max_drawdown_forces_emergency_exit() {
        let (engine, mock) = engine_with(10_300.0);
        engine.run_grid_cycle().await.unwrap();
        assert!((engine.state_snapshot().peak_equity - 1000.0).abs() < 1e-9);

        // Equity collapses 25% against a 20% limit
        mock.state.lock().balance.equity = 750.0;
        mock.set_position("BTCUSDT", PositionSide::Long, 0.05, 10_300.0);
        {
            let mut state = engine.state.write();
            let mut level =
                super::super::state::GridLevel::new(0, 10_300.0, LevelSide::Buy, 100.0);
            level.mark_pending("seed".to_string(), 0.05);
            level.mark_filled();
            state.levels[0] = level;
        }

        engine.run_grid_cycle().await.unwrap();
        let state = engine.state_snapshot();
        assert!(state.is_paused);
        assert!((state.max_drawdown - 0.25).abs() < 1e-9);
        // The whole position was flattened
        assert!(mock.state.lock().positions.is_empty());
    }

    #[tokio::test]
    async fn direction_adjust_shifts_instead_of_reducing() {
        let (engine, _mock) = {
            let mock = Arc::new(MockExchange::new("mock"));
            mock.set_price("BTCUSDT", 100.0);
            mock.state
                .lock()
                .klines
                .insert("BTCUSDT".to_string(), flat_klines(140, 100.0));
            let exchange: Arc<dyn Exchange> = mock.clone();
            let market = Arc::new(MarketData::new(exchange.clone()));
            let store = Store::open_in_memory().unwrap();
            let mut config = grid_config();
            config.enable_direction_adjust = true;
            (
                GridEngine::new(trader_config(), config, exchange, market, None, store),
                mock,
            )
        };
        {
            let mut state = engine.state.write();
            state.is_initialized = true;
            state.upper_price = 110.0;
            state.lower_price = 90.0;
            state.levels = levels::build_levels(
                &engine.config,
                100.0,
                110.0,
                90.0,
                GridDirection::Neutral,
            );
        }

        let mut actions = Vec::new();
        engine
            .dispatch_breakout(BreakoutLevel::Mid, BreakoutDirection::Up, &mut actions)
            .await;

        let state = engine.state_snapshot();
        assert_eq!(state.current_direction, GridDirection::Long);
        assert!(state
            .levels
            .iter()
            .filter(|l| l.state == LevelState::Empty)
            .all(|l| l.side == LevelSide::Buy));
        // No reduction happened
        assert!(actions.is_empty());
    }
}
