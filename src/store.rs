//! The analytical store: a single SQLite connection shared by every writer.
//!
//! Each table has exactly one writer component; concurrent access is safe
//! because writers touch disjoint row keys. The connection itself is
//! wrapped in a `parking_lot::Mutex` since `rusqlite::Connection` is not
//! `Sync`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{info, warn};

use crate::models::{
    CopyTradeLog, CopyTradeStatus, InsiderAlert, InsiderSubScores, ProfitabilityStatus, Side,
    Trade, Wallet, WindowMetrics,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS live_trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_id TEXT NOT NULL UNIQUE,
    trader_address TEXT NOT NULL,
    condition_id TEXT NOT NULL,
    asset_id TEXT,
    market_slug TEXT,
    event_slug TEXT,
    side TEXT NOT NULL,
    outcome TEXT,
    outcome_index INTEGER NOT NULL DEFAULT 0,
    size REAL NOT NULL,
    price REAL NOT NULL,
    usd_value REAL NOT NULL,
    executed_at_ms INTEGER NOT NULL,
    tx_hash TEXT,
    received_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_live_trades_received ON live_trades(id, received_at_ms);
CREATE INDEX IF NOT EXISTS idx_live_trades_address ON live_trades(trader_address);

CREATE TABLE IF NOT EXISTS wallets (
    address TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    copytrade_score REAL NOT NULL DEFAULT 0,
    metrics_updated_at_ms INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_wallets_score ON wallets(copytrade_score);

CREATE TABLE IF NOT EXISTS watchlist (
    address TEXT NOT NULL,
    list_type TEXT NOT NULL,
    min_trade_size REAL NOT NULL DEFAULT 0,
    alert_threshold_usd REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (address, list_type)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS alert_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_type TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    conditions TEXT NOT NULL,
    severity TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trade_alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_type TEXT NOT NULL,
    trade_id TEXT NOT NULL,
    severity TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    acknowledged INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_trade_alerts_created ON trade_alerts(created_at_ms);

CREATE TABLE IF NOT EXISTS insider_alerts (
    trade_id TEXT PRIMARY KEY,
    composite_score INTEGER NOT NULL,
    sub_scores TEXT NOT NULL,
    signals TEXT NOT NULL,
    profitability TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_insider_alerts_created ON insider_alerts(created_at_ms);

CREATE TABLE IF NOT EXISTS copy_trade_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_trader TEXT NOT NULL,
    source_trade_id TEXT NOT NULL,
    our_order_id TEXT,
    market_id TEXT NOT NULL,
    size_chosen_usd REAL NOT NULL,
    status TEXT NOT NULL,
    rejection_reason TEXT,
    created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cursors (
    consumer TEXT PRIMARY KEY,
    value INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS user_positions (
    address TEXT NOT NULL,
    token_id TEXT NOT NULL,
    side TEXT NOT NULL,
    size REAL NOT NULL,
    avg_price REAL NOT NULL,
    current_price REAL NOT NULL,
    updated_at_ms INTEGER NOT NULL,
    PRIMARY KEY (address, token_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS user_orders (
    id TEXT PRIMARY KEY,
    address TEXT NOT NULL,
    token_id TEXT NOT NULL,
    side TEXT NOT NULL,
    size REAL NOT NULL,
    price REAL NOT NULL,
    status TEXT NOT NULL,
    filled_notional_usd REAL NOT NULL DEFAULT 0,
    filled_price REAL NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_user_orders_address ON user_orders(address, created_at_ms);

CREATE TABLE IF NOT EXISTS pipeline_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at_ms INTEGER NOT NULL,
    finished_at_ms INTEGER,
    candidate_count INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'running'
);

CREATE TABLE IF NOT EXISTS pipeline_progress (
    run_id INTEGER NOT NULL,
    stage TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    qualified INTEGER NOT NULL DEFAULT 0,
    eliminated INTEGER NOT NULL DEFAULT 0,
    updated_at_ms INTEGER NOT NULL,
    PRIMARY KEY (run_id, stage)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS pipeline_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    message TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pipeline_stats (
    run_id INTEGER PRIMARY KEY,
    stats_json TEXT NOT NULL
) WITHOUT ROWID;
"#;

pub struct AnalyticalStore {
    conn: Arc<Mutex<Connection>>,
}

impl AnalyticalStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("opening analytical store at {path}"))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("applying analytical store schema")?;

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if mode.to_lowercase() != "wal" {
            warn!(mode = %mode, "analytical store did not enter WAL mode");
        }

        let trade_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM live_trades", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path = %path, trades = trade_count, "analytical store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory store")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("applying in-memory schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- live_trades --------------------------------------------------

    /// Upsert one trade. Returns the row's `id` (stable across re-upserts).
    pub fn upsert_trade(&self, trade: &Trade) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO live_trades
                (trade_id, trader_address, condition_id, asset_id, market_slug, event_slug,
                 side, outcome, outcome_index, size, price, usd_value, executed_at_ms, tx_hash,
                 received_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(trade_id) DO UPDATE SET
                trader_address = excluded.trader_address,
                condition_id = excluded.condition_id,
                asset_id = excluded.asset_id,
                market_slug = excluded.market_slug,
                event_slug = excluded.event_slug,
                side = excluded.side,
                outcome = excluded.outcome,
                outcome_index = excluded.outcome_index,
                size = excluded.size,
                price = excluded.price,
                usd_value = excluded.usd_value,
                executed_at_ms = excluded.executed_at_ms,
                tx_hash = excluded.tx_hash",
            params![
                trade.trade_id,
                trade.trader_address,
                trade.condition_id,
                trade.asset_id,
                trade.market_slug,
                trade.event_slug,
                trade.side.as_str(),
                trade.outcome,
                trade.outcome_index,
                trade.size,
                trade.price,
                trade.usd_value,
                trade.executed_at.timestamp_millis(),
                trade.tx_hash,
                Utc::now().timestamp_millis(),
            ],
        )
        .context("upserting trade")?;

        conn.query_row(
            "SELECT id FROM live_trades WHERE trade_id = ?1",
            params![trade.trade_id],
            |row| row.get(0),
        )
        .context("reading back trade id")
    }

    pub fn max_trade_id(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COALESCE(MAX(id), 0) FROM live_trades", [], |row| {
            row.get(0)
        })
        .context("reading max trade id")
    }

    /// Fetch up to `limit` trades with `id > since_id`, ascending.
    pub fn trades_since(&self, since_id: i64, limit: usize) -> Result<Vec<(i64, Trade)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, trade_id, trader_address, condition_id, asset_id, market_slug,
                    event_slug, side, outcome, outcome_index, size, price, usd_value,
                    executed_at_ms, tx_hash
             FROM live_trades WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since_id, limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let side_str: String = row.get(7)?;
            let executed_at_ms: i64 = row.get(13)?;
            Ok((
                id,
                Trade {
                    trade_id: row.get(1)?,
                    trader_address: row.get(2)?,
                    condition_id: row.get(3)?,
                    asset_id: row.get(4)?,
                    market_slug: row.get(5)?,
                    event_slug: row.get(6)?,
                    side: Side::parse(&side_str).unwrap_or(Side::Buy),
                    outcome: row.get(8)?,
                    outcome_index: row.get(9)?,
                    size: row.get(10)?,
                    price: row.get(11)?,
                    usd_value: row.get(12)?,
                    executed_at: DateTime::from_timestamp_millis(executed_at_ms)
                        .unwrap_or_else(Utc::now),
                    tx_hash: row.get(14)?,
                },
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn prune_trades_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM live_trades WHERE executed_at_ms < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(n)
    }

    // ---- wallets --------------------------------------------------------

    pub fn upsert_wallet(&self, wallet: &Wallet) -> Result<()> {
        let data = serde_json::to_string(wallet).context("serializing wallet")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO wallets (address, data, copytrade_score, metrics_updated_at_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(address) DO UPDATE SET
                data = excluded.data,
                copytrade_score = excluded.copytrade_score,
                metrics_updated_at_ms = excluded.metrics_updated_at_ms",
            params![
                wallet.address,
                data,
                wallet.copytrade_score,
                wallet.metrics_updated_at.timestamp_millis(),
            ],
        )
        .context("upserting wallet")?;
        Ok(())
    }

    pub fn get_wallet(&self, address: &str) -> Result<Option<Wallet>> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM wallets WHERE address = ?1",
                params![address.to_lowercase()],
                |row| row.get(0),
            )
            .ok();
        match data {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("deserializing wallet")?,
            )),
            None => Ok(None),
        }
    }

    pub fn known_wallet_addresses(&self) -> Result<HashSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT address FROM wallets")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    pub fn last_analyzed_map(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT address, metrics_updated_at_ms FROM wallets")?;
        let rows = stmt.query_map([], |row| {
            let addr: String = row.get(0)?;
            let ms: i64 = row.get(1)?;
            Ok((addr, ms))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (addr, ms) = row?;
            out.insert(addr, DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now));
        }
        Ok(out)
    }

    /// Wallets with `copytrade_score >= min_score`, keyed by lowercase address.
    pub fn qualified_wallets(&self, min_score: f64) -> Result<HashMap<String, Wallet>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT data FROM wallets WHERE copytrade_score >= ?1")?;
        let rows = stmt.query_map(params![min_score], |row| row.get::<_, String>(0))?;
        let mut out = HashMap::new();
        for row in rows {
            let json = row?;
            let wallet: Wallet = serde_json::from_str(&json)?;
            out.insert(wallet.address.to_lowercase(), wallet);
        }
        Ok(out)
    }

    /// Lightweight profitability projection, refreshed periodically by the insider scorer.
    pub fn wallet_profitability_projection(
        &self,
    ) -> Result<HashMap<String, (f64, u32, f64, f64)>> {
        // address -> (pnl_all, trade_count_all, copytrade_score, profit_factor_30d)
        let wallets = self.all_wallets()?;
        Ok(wallets
            .into_iter()
            .map(|w| {
                let profit_factor_30d = if w.window_30d.volume > 0.0 {
                    (w.window_30d.pnl.max(0.0) + w.window_30d.volume) / w.window_30d.volume
                } else {
                    1.0
                };
                (
                    w.address.to_lowercase(),
                    (w.pnl_all, w.trade_count_all, w.copytrade_score, profit_factor_30d),
                )
            })
            .collect())
    }

    fn all_wallets(&self) -> Result<Vec<Wallet>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT data FROM wallets")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    // ---- insider_alerts --------------------------------------------------

    pub fn insert_insider_alert(&self, alert: &InsiderAlert) -> Result<()> {
        let sub_scores = serde_json::to_string(&alert.sub_scores)?;
        let signals = serde_json::to_string(&alert.signals)?;
        let profitability = match alert.profitability {
            ProfitabilityStatus::Copyable => "copyable",
            ProfitabilityStatus::Profitable => "profitable",
            ProfitabilityStatus::Unprofitable => "unprofitable",
            ProfitabilityStatus::Pending => "pending",
            ProfitabilityStatus::Unknown => "unknown",
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO insider_alerts
                (trade_id, composite_score, sub_scores, signals, profitability, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(trade_id) DO UPDATE SET
                composite_score = excluded.composite_score,
                sub_scores = excluded.sub_scores,
                signals = excluded.signals,
                profitability = excluded.profitability",
            params![
                alert.trade_id,
                alert.composite_score,
                sub_scores,
                signals,
                profitability,
                alert.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn prune_insider_alerts_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM insider_alerts WHERE created_at_ms < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(n)
    }

    // ---- copy_trade_log --------------------------------------------------

    pub fn insert_copy_trade_log(&self, log: &CopyTradeLog) -> Result<()> {
        let status = match log.status {
            CopyTradeStatus::Executed => "executed",
            CopyTradeStatus::Rejected => "rejected",
            CopyTradeStatus::Failed => "failed",
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO copy_trade_log
                (source_trader, source_trade_id, our_order_id, market_id, size_chosen_usd,
                 status, rejection_reason, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                log.source_trader,
                log.source_trade_id,
                log.our_order_id,
                log.market_id,
                log.size_chosen_usd,
                status,
                log.rejection_reason,
                log.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    // ---- cursors ----------------------------------------------------------

    pub fn get_cursor(&self, consumer: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM cursors WHERE consumer = ?1",
            params![consumer],
            |row| row.get(0),
        )
        .or_else(|_| Ok(0))
    }

    pub fn set_cursor(&self, consumer: &str, value: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cursors (consumer, value) VALUES (?1, ?2)
             ON CONFLICT(consumer) DO UPDATE SET value = excluded.value",
            params![consumer, value],
        )?;
        Ok(())
    }

    // ---- watchlist ----------------------------------------------------------

    pub fn watchlist_addresses(&self, list_type: &str) -> Result<HashSet<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT address FROM watchlist WHERE list_type = ?1")?;
        let rows = stmt.query_map(params![list_type], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for row in rows {
            out.insert(row?.to_lowercase());
        }
        Ok(out)
    }

    /// All watchlist entries keyed by lowercase address: `(min_trade_size, alert_threshold_usd)`.
    pub fn watchlist_entries(&self) -> Result<HashMap<String, (f64, f64)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT address, min_trade_size, alert_threshold_usd FROM watchlist")?;
        let rows = stmt.query_map([], |row| {
            let addr: String = row.get(0)?;
            let min_trade_size: f64 = row.get(1)?;
            let alert_threshold_usd: f64 = row.get(2)?;
            Ok((addr.to_lowercase(), (min_trade_size, alert_threshold_usd)))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (addr, vals) = row?;
            out.insert(addr, vals);
        }
        Ok(out)
    }

    // ---- alert_rules ----------------------------------------------------------

    pub fn list_enabled_alert_rules(&self) -> Result<Vec<AlertRuleRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT rule_type, conditions, severity FROM alert_rules WHERE enabled = 1",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AlertRuleRow {
                rule_type: row.get(0)?,
                conditions: row.get(1)?,
                severity: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- trade_alerts ----------------------------------------------------------

    pub fn insert_trade_alert(&self, rule_type: &str, trade_id: &str, severity: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trade_alerts (rule_type, trade_id, severity, created_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![rule_type, trade_id, severity, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn prune_acknowledged_alerts_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM trade_alerts WHERE acknowledged = 1 AND created_at_ms < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(n)
    }

    // ---- user_positions / user_orders --------------------------------------

    /// Upsert a tracked position for `address`. Called on every fill and
    /// price update so the book on disk never lags the in-memory tracker.
    pub fn upsert_position(&self, address: &str, pos: &PositionRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO user_positions
                (address, token_id, side, size, avg_price, current_price, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(address, token_id) DO UPDATE SET
                side = excluded.side,
                size = excluded.size,
                avg_price = excluded.avg_price,
                current_price = excluded.current_price,
                updated_at_ms = excluded.updated_at_ms",
            params![
                address.to_lowercase(),
                pos.token_id,
                pos.side,
                pos.size,
                pos.avg_price,
                pos.current_price,
                Utc::now().timestamp_millis(),
            ],
        )
        .context("upserting position")?;
        Ok(())
    }

    /// Removes a position once it fully closes.
    pub fn delete_position(&self, address: &str, token_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM user_positions WHERE address = ?1 AND token_id = ?2",
            params![address.to_lowercase(), token_id],
        )?;
        Ok(())
    }

    pub fn open_positions_for(&self, address: &str) -> Result<Vec<PositionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT token_id, side, size, avg_price, current_price
             FROM user_positions WHERE address = ?1",
        )?;
        let rows = stmt.query_map(params![address.to_lowercase()], |row| {
            Ok(PositionRow {
                token_id: row.get(0)?,
                side: row.get(1)?,
                size: row.get(2)?,
                avg_price: row.get(3)?,
                current_price: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn insert_order(&self, order: &OrderRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO user_orders
                (id, address, token_id, side, size, price, status,
                 filled_notional_usd, filled_price, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                filled_notional_usd = excluded.filled_notional_usd,
                filled_price = excluded.filled_price",
            params![
                order.id,
                order.address.to_lowercase(),
                order.token_id,
                order.side,
                order.size,
                order.price,
                order.status,
                order.filled_notional_usd,
                order.filled_price,
                Utc::now().timestamp_millis(),
            ],
        )
        .context("inserting order")?;
        Ok(())
    }

    // ---- pipeline_runs / pipeline_progress / pipeline_logs / pipeline_stats

    /// Starts a new batch-funnel run and returns its `id`.
    pub fn start_pipeline_run(&self, candidate_count: usize) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pipeline_runs (started_at_ms, candidate_count, status)
             VALUES (?1, ?2, 'running')",
            params![Utc::now().timestamp_millis(), candidate_count as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn record_pipeline_progress(
        &self,
        run_id: i64,
        stage: &str,
        processed: u32,
        qualified: u32,
        eliminated: u32,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pipeline_progress
                (run_id, stage, processed, qualified, eliminated, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(run_id, stage) DO UPDATE SET
                processed = excluded.processed,
                qualified = excluded.qualified,
                eliminated = excluded.eliminated,
                updated_at_ms = excluded.updated_at_ms",
            params![
                run_id,
                stage,
                processed,
                qualified,
                eliminated,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn insert_pipeline_log(&self, run_id: i64, message: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pipeline_logs (run_id, message, created_at_ms) VALUES (?1, ?2, ?3)",
            params![run_id, message, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn finish_pipeline_run(&self, run_id: i64, stats_json: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE pipeline_runs SET finished_at_ms = ?1, status = 'done' WHERE id = ?2",
            params![Utc::now().timestamp_millis(), run_id],
        )?;
        conn.execute(
            "INSERT INTO pipeline_stats (run_id, stats_json) VALUES (?1, ?2)
             ON CONFLICT(run_id) DO UPDATE SET stats_json = excluded.stats_json",
            params![run_id, stats_json],
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PositionRow {
    pub token_id: String,
    pub side: String,
    pub size: f64,
    pub avg_price: f64,
    pub current_price: f64,
}

#[derive(Debug, Clone)]
pub struct OrderRow {
    pub id: String,
    pub address: String,
    pub token_id: String,
    pub side: String,
    pub size: f64,
    pub price: f64,
    pub status: String,
    pub filled_notional_usd: f64,
    pub filled_price: f64,
}

#[derive(Debug, Clone)]
pub struct AlertRuleRow {
    pub rule_type: String,
    pub conditions: String,
    pub severity: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    fn sample_trade(id: &str) -> Trade {
        Trade {
            trade_id: id.to_string(),
            trader_address: "0xabc".into(),
            condition_id: "cond1".into(),
            asset_id: None,
            market_slug: Some("will-x-happen".into()),
            event_slug: None,
            side: Side::Buy,
            outcome: Some("Yes".into()),
            outcome_index: 0,
            size: 100.0,
            price: 0.4,
            usd_value: 40.0,
            executed_at: Utc::now(),
            tx_hash: None,
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let store = AnalyticalStore::open_in_memory().unwrap();
        let id1 = store.upsert_trade(&sample_trade("t1")).unwrap();
        let id2 = store.upsert_trade(&sample_trade("t1")).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.max_trade_id().unwrap(), id1);
    }

    #[test]
    fn trades_since_orders_ascending() {
        let store = AnalyticalStore::open_in_memory().unwrap();
        store.upsert_trade(&sample_trade("a")).unwrap();
        store.upsert_trade(&sample_trade("b")).unwrap();
        store.upsert_trade(&sample_trade("c")).unwrap();

        let rows = store.trades_since(0, 10).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn cursor_roundtrips() {
        let store = AnalyticalStore::open_in_memory().unwrap();
        assert_eq!(store.get_cursor("insider_scorer").unwrap(), 0);
        store.set_cursor("insider_scorer", 42).unwrap();
        assert_eq!(store.get_cursor("insider_scorer").unwrap(), 42);
    }
}
