use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position side on a perpetual venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "LONG" | "BUY" => Some(PositionSide::Long),
            "SHORT" | "SELL" => Some(PositionSide::Short),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

/// Normalized order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Filled,
    PartiallyFilled,
    Canceled,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Filled => "FILLED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NEW" | "OPEN" | "ACTIVE" => Some(OrderStatus::New),
            "FILLED" | "DONE" => Some(OrderStatus::Filled),
            "PARTIALLY_FILLED" | "PARTIAL" => Some(OrderStatus::PartiallyFilled),
            "CANCELED" | "CANCELLED" => Some(OrderStatus::Canceled),
            "EXPIRED" => Some(OrderStatus::Expired),
            _ => None,
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Expired
        )
    }
}

/// Position lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
        }
    }
}

/// How a position row entered the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    Trade,
    Sync,
}

impl PositionSource {
    pub fn as_str(&self) -> &str {
        match self {
            PositionSource::Trade => "trade",
            PositionSource::Sync => "sync",
        }
    }
}

/// Actions the decision oracle (or the grid engine) can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    PlaceBuyLimit,
    PlaceSellLimit,
    CancelOrder,
    CancelAllOrders,
    PauseGrid,
    ResumeGrid,
    AdjustGrid,
    Hold,
    Wait,
}

impl DecisionAction {
    pub fn as_str(&self) -> &str {
        match self {
            DecisionAction::OpenLong => "open_long",
            DecisionAction::OpenShort => "open_short",
            DecisionAction::CloseLong => "close_long",
            DecisionAction::CloseShort => "close_short",
            DecisionAction::PlaceBuyLimit => "place_buy_limit",
            DecisionAction::PlaceSellLimit => "place_sell_limit",
            DecisionAction::CancelOrder => "cancel_order",
            DecisionAction::CancelAllOrders => "cancel_all_orders",
            DecisionAction::PauseGrid => "pause_grid",
            DecisionAction::ResumeGrid => "resume_grid",
            DecisionAction::AdjustGrid => "adjust_grid",
            DecisionAction::Hold => "hold",
            DecisionAction::Wait => "wait",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "open_long" => Some(DecisionAction::OpenLong),
            "open_short" => Some(DecisionAction::OpenShort),
            "close_long" => Some(DecisionAction::CloseLong),
            "close_short" => Some(DecisionAction::CloseShort),
            "place_buy_limit" => Some(DecisionAction::PlaceBuyLimit),
            "place_sell_limit" => Some(DecisionAction::PlaceSellLimit),
            "cancel_order" => Some(DecisionAction::CancelOrder),
            "cancel_all_orders" => Some(DecisionAction::CancelAllOrders),
            "pause_grid" => Some(DecisionAction::PauseGrid),
            "resume_grid" => Some(DecisionAction::ResumeGrid),
            "adjust_grid" => Some(DecisionAction::AdjustGrid),
            "hold" => Some(DecisionAction::Hold),
            "wait" => Some(DecisionAction::Wait),
            _ => None,
        }
    }

    /// Execution priority within one scan cycle: closes first, then opens,
    /// then everything passive.
    pub fn priority(&self) -> u8 {
        match self {
            DecisionAction::CloseLong | DecisionAction::CloseShort => 0,
            DecisionAction::OpenLong | DecisionAction::OpenShort => 1,
            DecisionAction::PlaceBuyLimit | DecisionAction::PlaceSellLimit => 2,
            DecisionAction::CancelOrder | DecisionAction::CancelAllOrders => 3,
            DecisionAction::PauseGrid
            | DecisionAction::ResumeGrid
            | DecisionAction::AdjustGrid => 4,
            DecisionAction::Hold | DecisionAction::Wait => 5,
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, DecisionAction::CloseLong | DecisionAction::CloseShort)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, DecisionAction::OpenLong | DecisionAction::OpenShort)
    }
}

/// A single decision returned by the oracle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub symbol: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub position_size_usd: Option<f64>,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Outcome of executing one decision, appended to the cycle log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionActionRecord {
    pub action: DecisionAction,
    pub symbol: String,
    pub order_id: Option<String>,
    pub quantity: f64,
    pub avg_price: f64,
    pub success: bool,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// One oracle cycle: prompts in, raw response, decisions, execution log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: Option<i64>,
    pub trader_id: i64,
    pub strategy: String,
    pub context_json: String,
    pub cot_trace: String,
    pub raw_response: String,
    pub decisions_json: String,
    pub actions_json: String,
    pub created_at: DateTime<Utc>,
}

/// Local mirror of one order intent sent to a venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Option<i64>,
    pub trader_id: i64,
    pub exchange_id: String,
    pub exchange_order_id: String,
    pub symbol: String,
    pub action: DecisionAction,
    pub quantity: f64,
    pub price: f64,
    pub leverage: u32,
    pub status: OrderStatus,
    pub avg_price: f64,
    pub executed_qty: f64,
    pub commission: f64,
    pub realized_pnl: f64,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new_intent(
        trader_id: i64,
        exchange_id: &str,
        exchange_order_id: &str,
        symbol: &str,
        action: DecisionAction,
        quantity: f64,
        price: f64,
        leverage: u32,
    ) -> Self {
        Self {
            id: None,
            trader_id,
            exchange_id: exchange_id.to_string(),
            exchange_order_id: exchange_order_id.to_string(),
            symbol: symbol.to_string(),
            action,
            quantity,
            price,
            leverage,
            status: OrderStatus::New,
            avg_price: 0.0,
            executed_qty: 0.0,
            commission: 0.0,
            realized_pnl: 0.0,
            created_at: Utc::now(),
            filled_at: None,
        }
    }

    pub fn is_close(&self) -> bool {
        self.action.is_close()
    }
}

/// One execution against an order, keyed by (exchange_id, exchange_trade_id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub id: Option<i64>,
    pub trader_id: i64,
    pub exchange_id: String,
    pub exchange_trade_id: String,
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub price: f64,
    pub quantity: f64,
    pub commission: f64,
    pub realized_pnl: f64,
    pub executed_at: DateTime<Utc>,
}

/// One open-or-closed position lifespan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Option<i64>,
    pub trader_id: i64,
    pub exchange_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub status: PositionStatus,
    pub source: PositionSource,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub realized_pnl: Option<f64>,
    pub fee: Option<f64>,
    pub close_reason: Option<String>,
}

impl Position {
    pub fn open(
        trader_id: i64,
        exchange_id: &str,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        entry_price: f64,
        leverage: u32,
        source: PositionSource,
    ) -> Self {
        Self {
            id: None,
            trader_id,
            exchange_id: exchange_id.to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price,
            leverage: leverage.max(1),
            status: PositionStatus::Open,
            source,
            entry_time: Utc::now(),
            exit_price: None,
            exit_time: None,
            realized_pnl: None,
            fee: None,
            close_reason: None,
        }
    }

    /// Margin consumed by this position at entry
    pub fn margin_used(&self) -> f64 {
        if self.leverage == 0 {
            return 0.0;
        }
        self.quantity * self.entry_price / self.leverage as f64
    }
}

/// Normalized closed-trade record pulled from a venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPnlRecord {
    pub exchange_id: String,
    pub exchange_trade_id: Option<String>,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub fee: f64,
    pub close_type: String,
    pub closed_at: DateTime<Utc>,
}

/// Return percentage against margin; zero margin yields zero rather than inf
pub fn calculate_pnl_pct(pnl: f64, margin: f64) -> f64 {
    if margin <= 0.0 {
        return 0.0;
    }
    pnl / margin * 100.0
}

/// Which strategy drives a trader's scan cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Directional,
    Grid,
}

impl StrategyKind {
    pub fn as_str(&self) -> &str {
        match self {
            StrategyKind::Directional => "directional",
            StrategyKind::Grid => "grid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "directional" => Some(StrategyKind::Directional),
            "grid" => Some(StrategyKind::Grid),
            _ => None,
        }
    }
}

/// Weight distribution across grid levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridDistribution {
    Uniform,
    Gaussian,
    Pyramid,
}

impl Default for GridDistribution {
    fn default() -> Self {
        GridDistribution::Uniform
    }
}

/// Per-regime leverage and position-size caps
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeCaps {
    pub max_leverage: u32,
    pub max_position_pct: f64,
}

/// Grid strategy configuration vocabulary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub symbol: String,
    pub grid_count: usize,
    pub total_investment: f64,
    pub leverage: u32,
    #[serde(default)]
    pub upper_price: Option<f64>,
    #[serde(default)]
    pub lower_price: Option<f64>,
    #[serde(default = "default_true")]
    pub use_atr_bounds: bool,
    #[serde(default = "default_atr_multiplier")]
    pub atr_multiplier: f64,
    #[serde(default)]
    pub distribution: GridDistribution,
    #[serde(default = "default_true")]
    pub use_maker_only: bool,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
    #[serde(default = "default_daily_loss_limit_pct")]
    pub daily_loss_limit_pct: f64,
    #[serde(default)]
    pub enable_direction_adjust: bool,
    #[serde(default = "default_bias_ratio")]
    pub direction_bias_ratio: f64,
    #[serde(default = "default_narrow_caps")]
    pub narrow_caps: RegimeCaps,
    #[serde(default = "default_standard_caps")]
    pub standard_caps: RegimeCaps,
    #[serde(default = "default_wide_caps")]
    pub wide_caps: RegimeCaps,
    #[serde(default = "default_volatile_caps")]
    pub volatile_caps: RegimeCaps,
}

fn default_true() -> bool {
    true
}
fn default_atr_multiplier() -> f64 {
    2.0
}
fn default_stop_loss_pct() -> f64 {
    0.05
}
fn default_max_drawdown_pct() -> f64 {
    0.20
}
fn default_daily_loss_limit_pct() -> f64 {
    0.10
}
fn default_bias_ratio() -> f64 {
    0.7
}
fn default_narrow_caps() -> RegimeCaps {
    RegimeCaps {
        max_leverage: 2,
        max_position_pct: 0.40,
    }
}
fn default_standard_caps() -> RegimeCaps {
    RegimeCaps {
        max_leverage: 4,
        max_position_pct: 0.70,
    }
}
fn default_wide_caps() -> RegimeCaps {
    RegimeCaps {
        max_leverage: 3,
        max_position_pct: 0.60,
    }
}
fn default_volatile_caps() -> RegimeCaps {
    RegimeCaps {
        max_leverage: 2,
        max_position_pct: 0.40,
    }
}

/// Full per-trader configuration as loaded from the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderConfig {
    pub id: i64,
    pub name: String,
    pub exchange_id: String,
    pub strategy: StrategyKind,
    pub scan_interval_secs: u64,
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,
    pub is_cross_margin: bool,
    #[serde(default)]
    pub system_prompt_template: String,
    #[serde(default)]
    pub default_coins: Vec<String>,
    #[serde(default)]
    pub trading_coins: Vec<String>,
    #[serde(default)]
    pub grid: Option<GridConfig>,
}

impl TraderConfig {
    /// Leverage knob for a symbol: majors get the BTC/ETH setting
    pub fn leverage_for(&self, symbol: &str) -> u32 {
        if symbol.starts_with("BTC") || symbol.starts_with("ETH") {
            self.btc_eth_leverage.max(1)
        } else {
            self.altcoin_leverage.max(1)
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub oracle_url: String,
    pub oracle_api_key: Option<String>,
    pub order_sync_interval_secs: u64,
    pub position_sync_interval_secs: u64,
    pub trade_sync_interval_secs: u64,
    pub monitor_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./perpbot.db".to_string());

        let oracle_url = std::env::var("ORACLE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8100/decide".to_string());

        let oracle_api_key = std::env::var("ORACLE_API_KEY").ok();

        let order_sync_interval_secs = env_u64("ORDER_SYNC_INTERVAL_SECS", 30);
        let position_sync_interval_secs = env_u64("POSITION_SYNC_INTERVAL_SECS", 60);
        let trade_sync_interval_secs = env_u64("TRADE_SYNC_INTERVAL_SECS", 300);
        let monitor_interval_secs = env_u64("MONITOR_INTERVAL_SECS", 15);

        Ok(Self {
            database_path,
            oracle_url,
            oracle_api_key,
            order_sync_interval_secs,
            position_sync_interval_secs,
            trade_sync_interval_secs,
            monitor_interval_secs,
        })
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pnl_pct_zero_margin_is_zero() {
        assert_eq!(calculate_pnl_pct(50.0, 0.0), 0.0);
        assert_eq!(calculate_pnl_pct(50.0, -10.0), 0.0);
        assert!((calculate_pnl_pct(50.0, 1000.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn decision_priority_orders_closes_first() {
        let mut actions = vec![
            DecisionAction::Hold,
            DecisionAction::OpenLong,
            DecisionAction::CloseShort,
        ];
        actions.sort_by_key(|a| a.priority());
        assert_eq!(actions[0], DecisionAction::CloseShort);
        assert_eq!(actions[1], DecisionAction::OpenLong);
    }

    #[test]
    fn order_status_terminal() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn position_margin_used() {
        let p = Position::open(
            1,
            "binance",
            "BTCUSDT",
            PositionSide::Long,
            0.2,
            50_000.0,
            10,
            PositionSource::Trade,
        );
        assert!((p.margin_used() - 1000.0).abs() < 1e-9);
    }
}
