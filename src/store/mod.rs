//! SQLite-backed trading store
//!
//! One connection behind a parking_lot mutex, WAL mode for concurrent
//! reads, prepared statements per call. Rows mirror the venue exactly:
//! orders are intents, fills are executions (idempotent by exchange trade
//! id), positions are one row per open lifespan and closed rows are never
//! mutated.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use tracing::{info, warn};

use crate::models::{
    ClosedPnlRecord, DecisionAction, DecisionRecord, Fill, GridConfig, Order, OrderStatus,
    Position, PositionSide, PositionSource, PositionStatus, StrategyKind, TraderConfig,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS traders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    exchange_id TEXT NOT NULL,
    strategy TEXT NOT NULL DEFAULT 'directional',
    scan_interval_secs INTEGER NOT NULL DEFAULT 180,
    btc_eth_leverage INTEGER NOT NULL DEFAULT 10,
    altcoin_leverage INTEGER NOT NULL DEFAULT 5,
    is_cross_margin INTEGER NOT NULL DEFAULT 1,
    system_prompt_template TEXT NOT NULL DEFAULT '',
    default_coins TEXT NOT NULL DEFAULT '',
    trading_coins TEXT NOT NULL DEFAULT '',
    grid_config_json TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trader_id INTEGER NOT NULL,
    exchange_id TEXT NOT NULL,
    exchange_order_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    action TEXT NOT NULL,
    quantity REAL NOT NULL,
    price REAL NOT NULL,
    leverage INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL,
    avg_price REAL NOT NULL DEFAULT 0,
    executed_qty REAL NOT NULL DEFAULT 0,
    commission REAL NOT NULL DEFAULT 0,
    realized_pnl REAL NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    filled_at INTEGER,
    UNIQUE(trader_id, exchange_id, exchange_order_id)
);

CREATE INDEX IF NOT EXISTS idx_orders_pending
    ON orders(status, trader_id) WHERE status IN ('NEW', 'PARTIALLY_FILLED');

CREATE TABLE IF NOT EXISTS fills (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trader_id INTEGER NOT NULL,
    exchange_id TEXT NOT NULL,
    exchange_trade_id TEXT NOT NULL,
    exchange_order_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    price REAL NOT NULL,
    quantity REAL NOT NULL,
    commission REAL NOT NULL DEFAULT 0,
    realized_pnl REAL NOT NULL DEFAULT 0,
    executed_at INTEGER NOT NULL,
    UNIQUE(exchange_id, exchange_trade_id)
);

CREATE INDEX IF NOT EXISTS idx_fills_trader_time
    ON fills(trader_id, executed_at DESC);

CREATE TABLE IF NOT EXISTS positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trader_id INTEGER NOT NULL,
    exchange_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity REAL NOT NULL,
    entry_price REAL NOT NULL,
    leverage INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL,
    source TEXT NOT NULL DEFAULT 'trade',
    entry_time INTEGER NOT NULL,
    exit_price REAL,
    exit_time INTEGER,
    realized_pnl REAL,
    fee REAL,
    close_reason TEXT,
    close_trade_id TEXT,
    UNIQUE(exchange_id, close_trade_id)
);

CREATE INDEX IF NOT EXISTS idx_positions_open
    ON positions(trader_id, status, symbol, side);

CREATE TABLE IF NOT EXISTS decision_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trader_id INTEGER NOT NULL,
    strategy TEXT NOT NULL,
    context_json TEXT NOT NULL,
    cot_trace TEXT NOT NULL DEFAULT '',
    raw_response TEXT NOT NULL DEFAULT '',
    decisions_json TEXT NOT NULL DEFAULT '[]',
    actions_json TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_decisions_trader_time
    ON decision_records(trader_id, created_at DESC);
"#;

/// Thread-safe store handle; clone freely.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn split_coins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("trading store initialized at {}", db_path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Ephemeral store, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ── Orders ─────────────────────────────────────────────────────────

    pub fn create_order(&self, order: &Order) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO orders
             (trader_id, exchange_id, exchange_order_id, symbol, action, quantity, price,
              leverage, status, avg_price, executed_qty, commission, realized_pnl,
              created_at, filled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                order.trader_id,
                order.exchange_id,
                order.exchange_order_id,
                order.symbol,
                order.action.as_str(),
                order.quantity,
                order.price,
                order.leverage,
                order.status.as_str(),
                order.avg_price,
                order.executed_qty,
                order.commission,
                order.realized_pnl,
                ts(order.created_at),
                order.filled_at.map(ts),
            ],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM orders WHERE trader_id = ?1 AND exchange_id = ?2 AND exchange_order_id = ?3",
            params![order.trader_id, order.exchange_id, order.exchange_order_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Persist the terminal (or partial) outcome of an order sync pass.
    pub fn update_order_execution(
        &self,
        order_id: i64,
        status: OrderStatus,
        avg_price: f64,
        executed_qty: f64,
        commission: f64,
        realized_pnl: f64,
        filled_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET status = ?2, avg_price = ?3, executed_qty = ?4,
             commission = ?5, realized_pnl = ?6, filled_at = COALESCE(?7, filled_at)
             WHERE id = ?1",
            params![
                order_id,
                status.as_str(),
                avg_price,
                executed_qty,
                commission,
                realized_pnl,
                filled_at.map(ts),
            ],
        )?;
        Ok(())
    }

    pub fn get_order_by_exchange_id(
        &self,
        trader_id: i64,
        exchange_id: &str,
        exchange_order_id: &str,
    ) -> Result<Option<Order>> {
        let conn = self.conn.lock();
        let order = conn
            .query_row(
                "SELECT * FROM orders WHERE trader_id = ?1 AND exchange_id = ?2 AND exchange_order_id = ?3",
                params![trader_id, exchange_id, exchange_order_id],
                row_to_order,
            )
            .optional()?;
        Ok(order)
    }

    /// All orders still awaiting a terminal status, oldest first.
    pub fn get_all_pending_orders(&self) -> Result<Vec<Order>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM orders WHERE status IN ('NEW', 'PARTIALLY_FILLED')
             ORDER BY created_at ASC",
        )?;
        let orders = stmt
            .query_map([], row_to_order)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(orders)
    }

    // ── Fills ──────────────────────────────────────────────────────────

    /// Idempotent by (exchange_id, exchange_trade_id); returns true when a
    /// new row was written.
    pub fn create_fill(&self, fill: &Fill) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO fills
             (trader_id, exchange_id, exchange_trade_id, exchange_order_id, symbol, side,
              price, quantity, commission, realized_pnl, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                fill.trader_id,
                fill.exchange_id,
                fill.exchange_trade_id,
                fill.exchange_order_id,
                fill.symbol,
                fill.side.as_str(),
                fill.price,
                fill.quantity,
                fill.commission,
                fill.realized_pnl,
                ts(fill.executed_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn has_fill(&self, exchange_id: &str, exchange_trade_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM fills WHERE exchange_id = ?1 AND exchange_trade_id = ?2",
            params![exchange_id, exchange_trade_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn count_fills(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM fills", [], |row| row.get(0))?)
    }

    // ── Positions ──────────────────────────────────────────────────────

    pub fn create_open_position(&self, position: &Position) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO positions
             (trader_id, exchange_id, symbol, side, quantity, entry_price, leverage,
              status, source, entry_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'OPEN', ?8, ?9)",
            params![
                position.trader_id,
                position.exchange_id,
                position.symbol,
                position.side.as_str(),
                position.quantity,
                position.entry_price,
                position.leverage,
                position.source.as_str(),
                ts(position.entry_time),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Close an open row. Closed rows are immutable; this is the only
    /// transition that touches them.
    #[allow(clippy::too_many_arguments)]
    pub fn close_position(
        &self,
        position_id: i64,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        realized_pnl: f64,
        fee: f64,
        close_reason: &str,
        close_trade_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE positions SET status = 'CLOSED', exit_price = ?2, exit_time = ?3,
             realized_pnl = ?4, fee = ?5, close_reason = ?6, close_trade_id = ?7
             WHERE id = ?1 AND status = 'OPEN'",
            params![
                position_id,
                exit_price,
                ts(exit_time),
                realized_pnl,
                fee,
                close_reason,
                close_trade_id,
            ],
        )?;
        if updated == 0 {
            warn!("close_position: row {} was not open", position_id);
        }
        Ok(())
    }

    pub fn update_position_quantity(
        &self,
        position_id: i64,
        quantity: f64,
        entry_price: f64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE positions SET quantity = ?2, entry_price = ?3 WHERE id = ?1 AND status = 'OPEN'",
            params![position_id, quantity, entry_price],
        )?;
        Ok(())
    }

    pub fn get_open_positions(&self, trader_id: i64) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM positions WHERE trader_id = ?1 AND status = 'OPEN'
             ORDER BY entry_time ASC",
        )?;
        let positions = stmt
            .query_map(params![trader_id], row_to_position)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(positions)
    }

    pub fn get_open_by_symbol_side(
        &self,
        trader_id: i64,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<Position>> {
        let conn = self.conn.lock();
        let position = conn
            .query_row(
                "SELECT * FROM positions WHERE trader_id = ?1 AND symbol = ?2 AND side = ?3
                 AND status = 'OPEN' ORDER BY entry_time DESC LIMIT 1",
                params![trader_id, symbol, side.as_str()],
                row_to_position,
            )
            .optional()?;
        Ok(position)
    }

    pub fn get_all_open_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM positions WHERE status = 'OPEN' ORDER BY entry_time ASC")?;
        let positions = stmt
            .query_map([], row_to_position)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(positions)
    }

    /// Exit time of the most recently closed position, for history-sync
    /// window selection.
    pub fn get_last_closed_time(&self, trader_id: i64) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let secs: Option<i64> = conn.query_row(
            "SELECT MAX(exit_time) FROM positions WHERE trader_id = ?1 AND status = 'CLOSED'",
            params![trader_id],
            |row| row.get(0),
        )?;
        Ok(secs.map(from_ts))
    }

    /// Ingest a batch of venue closed-trade records. Idempotent on
    /// (exchange_id, close_trade_id); records without a trade id dedupe on
    /// (symbol, side, entry_time). Returns the number of new closed rows.
    pub fn sync_closed_batch(&self, trader_id: i64, records: &[ClosedPnlRecord]) -> Result<usize> {
        let mut written = 0;
        for record in records {
            let exists = {
                let conn = self.conn.lock();
                match &record.exchange_trade_id {
                    Some(trade_id) => {
                        let count: i64 = conn.query_row(
                            "SELECT COUNT(*) FROM positions WHERE exchange_id = ?1 AND close_trade_id = ?2",
                            params![record.exchange_id, trade_id],
                            |row| row.get(0),
                        )?;
                        count > 0
                    }
                    None => {
                        let count: i64 = conn.query_row(
                            "SELECT COUNT(*) FROM positions WHERE exchange_id = ?1 AND symbol = ?2
                             AND side = ?3 AND status = 'CLOSED' AND ABS(exit_time - ?4) < 2",
                            params![
                                record.exchange_id,
                                record.symbol,
                                record.side.as_str(),
                                ts(record.closed_at)
                            ],
                            |row| row.get(0),
                        )?;
                        count > 0
                    }
                }
            };
            if exists {
                continue;
            }

            // A matching open row is closed in place; otherwise the whole
            // lifespan happened off-process and lands as one closed row.
            if let Some(open) =
                self.get_open_by_symbol_side(trader_id, &record.symbol, record.side)?
            {
                self.close_position(
                    open.id.unwrap_or(0),
                    record.exit_price,
                    record.closed_at,
                    record.realized_pnl,
                    record.fee,
                    &record.close_type,
                    record.exchange_trade_id.as_deref(),
                )?;
            } else {
                let conn = self.conn.lock();
                conn.execute(
                    "INSERT OR IGNORE INTO positions
                     (trader_id, exchange_id, symbol, side, quantity, entry_price, leverage,
                      status, source, entry_time, exit_price, exit_time, realized_pnl, fee,
                      close_reason, close_trade_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 'CLOSED', 'sync', ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        trader_id,
                        record.exchange_id,
                        record.symbol,
                        record.side.as_str(),
                        record.quantity,
                        record.entry_price,
                        ts(record.closed_at),
                        record.exit_price,
                        ts(record.closed_at),
                        record.realized_pnl,
                        record.fee,
                        record.close_type,
                        record.exchange_trade_id,
                    ],
                )?;
            }
            written += 1;
        }
        Ok(written)
    }

    // ── Traders ────────────────────────────────────────────────────────

    pub fn list_traders(&self) -> Result<Vec<TraderConfig>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM traders WHERE enabled = 1 ORDER BY id")?;
        let traders = stmt
            .query_map([], row_to_trader)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(traders)
    }

    pub fn get_full_config(&self, trader_id: i64) -> Result<Option<TraderConfig>> {
        let conn = self.conn.lock();
        let trader = conn
            .query_row(
                "SELECT * FROM traders WHERE id = ?1",
                params![trader_id],
                row_to_trader,
            )
            .optional()?;
        Ok(trader)
    }

    pub fn create_trader(&self, config: &TraderConfig) -> Result<i64> {
        let grid_json = config
            .grid
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO traders
             (name, exchange_id, strategy, scan_interval_secs, btc_eth_leverage,
              altcoin_leverage, is_cross_margin, system_prompt_template, default_coins,
              trading_coins, grid_config_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                config.name,
                config.exchange_id,
                config.strategy.as_str(),
                config.scan_interval_secs,
                config.btc_eth_leverage,
                config.altcoin_leverage,
                config.is_cross_margin as i64,
                config.system_prompt_template,
                config.default_coins.join(","),
                config.trading_coins.join(","),
                grid_json,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // ── Decisions ──────────────────────────────────────────────────────

    pub fn log_decision(&self, record: &DecisionRecord) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO decision_records
             (trader_id, strategy, context_json, cot_trace, raw_response, decisions_json,
              actions_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.trader_id,
                record.strategy,
                record.context_json,
                record.cot_trace,
                record.raw_response,
                record.decisions_json,
                record.actions_json,
                ts(record.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

fn row_to_order(row: &Row<'_>) -> rusqlite::Result<Order> {
    let action: String = row.get("action")?;
    let status: String = row.get("status")?;
    Ok(Order {
        id: Some(row.get("id")?),
        trader_id: row.get("trader_id")?,
        exchange_id: row.get("exchange_id")?,
        exchange_order_id: row.get("exchange_order_id")?,
        symbol: row.get("symbol")?,
        action: DecisionAction::parse(&action).unwrap_or(DecisionAction::Hold),
        quantity: row.get("quantity")?,
        price: row.get("price")?,
        leverage: row.get("leverage")?,
        status: OrderStatus::parse(&status).unwrap_or(OrderStatus::New),
        avg_price: row.get("avg_price")?,
        executed_qty: row.get("executed_qty")?,
        commission: row.get("commission")?,
        realized_pnl: row.get("realized_pnl")?,
        created_at: from_ts(row.get("created_at")?),
        filled_at: row.get::<_, Option<i64>>("filled_at")?.map(from_ts),
    })
}

fn row_to_position(row: &Row<'_>) -> rusqlite::Result<Position> {
    let side: String = row.get("side")?;
    let status: String = row.get("status")?;
    let source: String = row.get("source")?;
    Ok(Position {
        id: Some(row.get("id")?),
        trader_id: row.get("trader_id")?,
        exchange_id: row.get("exchange_id")?,
        symbol: row.get("symbol")?,
        side: PositionSide::parse(&side).unwrap_or(PositionSide::Long),
        quantity: row.get("quantity")?,
        entry_price: row.get("entry_price")?,
        leverage: row.get("leverage")?,
        status: if status == "CLOSED" {
            PositionStatus::Closed
        } else {
            PositionStatus::Open
        },
        source: if source == "sync" {
            PositionSource::Sync
        } else {
            PositionSource::Trade
        },
        entry_time: from_ts(row.get("entry_time")?),
        exit_price: row.get("exit_price")?,
        exit_time: row.get::<_, Option<i64>>("exit_time")?.map(from_ts),
        realized_pnl: row.get("realized_pnl")?,
        fee: row.get("fee")?,
        close_reason: row.get("close_reason")?,
    })
}

fn row_to_trader(row: &Row<'_>) -> rusqlite::Result<TraderConfig> {
    let strategy: String = row.get("strategy")?;
    let default_coins: String = row.get("default_coins")?;
    let trading_coins: String = row.get("trading_coins")?;
    let grid_json: Option<String> = row.get("grid_config_json")?;
    let grid: Option<GridConfig> =
        grid_json.and_then(|json| serde_json::from_str(&json).ok());
    Ok(TraderConfig {
        id: row.get("id")?,
        name: row.get("name")?,
        exchange_id: row.get("exchange_id")?,
        strategy: StrategyKind::parse(&strategy).unwrap_or(StrategyKind::Directional),
        scan_interval_secs: row.get::<_, i64>("scan_interval_secs")? as u64,
        btc_eth_leverage: row.get("btc_eth_leverage")?,
        altcoin_leverage: row.get("altcoin_leverage")?,
        is_cross_margin: row.get::<_, i64>("is_cross_margin")? != 0,
        system_prompt_template: row.get("system_prompt_template")?,
        default_coins: split_coins(&default_coins),
        trading_coins: split_coins(&trading_coins),
        grid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn sample_order(exchange_order_id: &str) -> Order {
        Order::new_intent(
            1,
            "binance",
            exchange_order_id,
            "BTCUSDT",
            DecisionAction::OpenLong,
            0.1,
            50_000.0,
            10,
        )
    }

    fn sample_fill(trade_id: &str) -> Fill {
        Fill {
            id: None,
            trader_id: 1,
            exchange_id: "binance".to_string(),
            exchange_trade_id: trade_id.to_string(),
            exchange_order_id: "o1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            price: 50_000.0,
            quantity: 0.1,
            commission: 0.02,
            realized_pnl: 0.0,
            executed_at: Utc::now(),
        }
    }

    #[test]
    fn order_create_is_idempotent_on_exchange_id() {
        let s = store();
        let id1 = s.create_order(&sample_order("abc")).unwrap();
        let id2 = s.create_order(&sample_order("abc")).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(s.get_all_pending_orders().unwrap().len(), 1);
    }

    #[test]
    fn fill_ingest_is_idempotent() {
        let s = store();
        assert!(s.create_fill(&sample_fill("t1")).unwrap());
        assert!(!s.create_fill(&sample_fill("t1")).unwrap());
        assert_eq!(s.count_fills().unwrap(), 1);
    }

    #[test]
    fn position_lifecycle() {
        let s = store();
        let p = Position::open(
            1,
            "binance",
            "ETHUSDT",
            PositionSide::Long,
            0.5,
            3000.0,
            5,
            PositionSource::Trade,
        );
        let id = s.create_open_position(&p).unwrap();
        assert_eq!(s.get_open_positions(1).unwrap().len(), 1);

        s.close_position(id, 3100.0, Utc::now(), 50.0, 1.0, "take_profit", Some("t9"))
            .unwrap();
        assert!(s.get_open_positions(1).unwrap().is_empty());
        assert!(s.get_last_closed_time(1).unwrap().is_some());

        // A second close attempt does not resurrect or mutate the row
        s.close_position(id, 9999.0, Utc::now(), 0.0, 0.0, "again", None)
            .unwrap();
        let open = s.get_open_by_symbol_side(1, "ETHUSDT", PositionSide::Long).unwrap();
        assert!(open.is_none());
    }

    #[test]
    fn reopening_creates_a_new_row() {
        let s = store();
        let p = Position::open(
            1,
            "binance",
            "ETHUSDT",
            PositionSide::Long,
            0.5,
            3000.0,
            5,
            PositionSource::Trade,
        );
        let first_id = s.create_open_position(&p).unwrap();
        s.close_position(first_id, 3100.0, Utc::now(), 50.0, 1.0, "tp", None)
            .unwrap();

        // A new entry at a different price is a new lifespan, not a mutation
        let mut reopened = p.clone();
        reopened.entry_price = 3200.0;
        let second_id = s.create_open_position(&reopened).unwrap();
        assert_ne!(first_id, second_id);

        let open = s
            .get_open_by_symbol_side(1, "ETHUSDT", PositionSide::Long)
            .unwrap()
            .unwrap();
        assert_eq!(open.id, Some(second_id));
        assert!((open.entry_price - 3200.0).abs() < 1e-9);
    }

    #[test]
    fn closed_batch_twice_writes_once() {
        let s = store();
        let record = ClosedPnlRecord {
            exchange_id: "binance".to_string(),
            exchange_trade_id: Some("tr1".to_string()),
            symbol: "ETHUSDT".to_string(),
            side: PositionSide::Long,
            quantity: 0.5,
            entry_price: 3000.0,
            exit_price: 3100.0,
            realized_pnl: 50.0,
            fee: 0.5,
            close_type: "trade".to_string(),
            closed_at: Utc::now(),
        };
        assert_eq!(s.sync_closed_batch(1, &[record.clone()]).unwrap(), 1);
        assert_eq!(s.sync_closed_batch(1, &[record]).unwrap(), 0);
    }

    #[test]
    fn trader_round_trip_with_grid_config() {
        let s = store();
        let config = TraderConfig {
            id: 0,
            name: "grid-1".to_string(),
            exchange_id: "binance".to_string(),
            strategy: StrategyKind::Grid,
            scan_interval_secs: 60,
            btc_eth_leverage: 10,
            altcoin_leverage: 5,
            is_cross_margin: true,
            system_prompt_template: String::new(),
            default_coins: vec!["BTCUSDT".to_string()],
            trading_coins: vec![],
            grid: Some(serde_json::from_str(
                r#"{"symbol":"BTCUSDT","grid_count":11,"total_investment":1000.0,"leverage":5}"#,
            ).unwrap()),
        };
        let id = s.create_trader(&config).unwrap();

        let loaded = s.get_full_config(id).unwrap().unwrap();
        assert_eq!(loaded.strategy, StrategyKind::Grid);
        assert_eq!(loaded.grid.as_ref().unwrap().grid_count, 11);
        assert_eq!(loaded.default_coins, vec!["BTCUSDT"]);
        assert_eq!(s.list_traders().unwrap().len(), 1);
    }
}
