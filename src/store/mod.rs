//! Single-process SQLite store.
//!
//! WAL journaling, foreign keys on, one `Mutex<Connection>` around all
//! access. The schema is versioned through `PRAGMA user_version`; migrations
//! are linear and applied once at startup in version order. A failed
//! migration is fatal.

pub mod alerts;
pub mod bars;
pub mod bots;
pub mod results;
pub mod roundtrips;
pub mod trades;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub use bars::BarCoverage;
pub use bots::BotRow;
pub use results::{EvolvedRow, OptimizationRow, SavedBacktest};
pub use roundtrips::{OpenPosition, RoundTrip};
pub use trades::{FeeStatistics, TradeFilter, TradeRow};

const MIGRATIONS: &[&str] = &[
    // v1: worker snapshots, append-only trades, history, settings
    "CREATE TABLE bots (
        name TEXT PRIMARY KEY,
        manager TEXT,
        symbol TEXT NOT NULL,
        tf TEXT NOT NULL,
        strategy TEXT NOT NULL,
        params_json TEXT NOT NULL,
        allocation REAL NOT NULL,
        cash REAL NOT NULL,
        pos_qty REAL NOT NULL,
        avg_price REAL NOT NULL,
        equity REAL NOT NULL,
        score REAL NOT NULL,
        trades INTEGER NOT NULL,
        updated_ts INTEGER NOT NULL
    );
    CREATE TABLE trades (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts INTEGER NOT NULL,
        bot_name TEXT NOT NULL REFERENCES bots(name) ON DELETE CASCADE,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        qty REAL NOT NULL,
        price REAL NOT NULL
    );
    CREATE TABLE equity_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts INTEGER NOT NULL,
        scope TEXT NOT NULL,
        name TEXT NOT NULL,
        equity REAL NOT NULL
    );
    CREATE TABLE param_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts INTEGER NOT NULL,
        bot_name TEXT NOT NULL,
        strategy TEXT NOT NULL,
        params_json TEXT NOT NULL
    );
    CREATE TABLE settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );",
    // v2: historical bar cache
    "CREATE TABLE bars (
        symbol TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        ts INTEGER NOT NULL,
        open REAL NOT NULL,
        high REAL NOT NULL,
        low REAL NOT NULL,
        close REAL NOT NULL,
        volume REAL NOT NULL,
        source TEXT NOT NULL,
        PRIMARY KEY (symbol, timeframe, ts)
    );
    CREATE INDEX idx_bars_symbol_tf ON bars(symbol, timeframe);
    CREATE INDEX idx_bars_ts ON bars(ts);",
    // v3: fee accounting and a fixed P&L baseline per worker
    "ALTER TABLE trades ADD COLUMN fee REAL NOT NULL DEFAULT 0;
    ALTER TABLE trades ADD COLUMN is_maker INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE bots ADD COLUMN starting_allocation REAL NOT NULL DEFAULT 0;",
    // v4: saved configurations and ranked optimizer/evolver candidates
    "CREATE TABLE saved_backtests (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        strategy TEXT NOT NULL,
        symbol TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        params_json TEXT NOT NULL,
        initial_capital REAL NOT NULL,
        min_notional REAL NOT NULL,
        days INTEGER NOT NULL,
        created_ts INTEGER NOT NULL
    );
    CREATE TABLE optimization_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        strategy TEXT NOT NULL,
        symbol TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        params_json TEXT NOT NULL,
        score REAL NOT NULL,
        total_return REAL NOT NULL,
        sharpe_ratio REAL NOT NULL,
        max_drawdown REAL NOT NULL,
        total_trades INTEGER NOT NULL,
        win_rate REAL NOT NULL,
        days INTEGER NOT NULL,
        tested_ts INTEGER NOT NULL,
        UNIQUE(strategy, symbol, timeframe, params_json)
    );
    CREATE TABLE evolved_strategies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        genome_json TEXT NOT NULL,
        symbol TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        score REAL NOT NULL,
        total_return REAL NOT NULL,
        sharpe_ratio REAL NOT NULL,
        max_drawdown REAL NOT NULL,
        total_trades INTEGER NOT NULL,
        win_rate REAL NOT NULL,
        generation INTEGER NOT NULL,
        days INTEGER NOT NULL,
        tested_ts INTEGER NOT NULL
    );",
    // v5: price alerts
    "CREATE TABLE price_alerts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol TEXT NOT NULL,
        target_price REAL NOT NULL,
        condition TEXT NOT NULL,
        email TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        created_ts INTEGER NOT NULL,
        triggered_ts INTEGER
    );",
];

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening database {}", path.as_ref().display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enabling foreign keys")?;
        migrate(&conn).context("applying schema migrations")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    // ── Settings ─────────────────────────────────────────────────────────

    pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.conn();
        let raw: Option<String> = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| {
                r.get(0)
            })
            .optional()?;
        match raw {
            Some(text) => {
                let value = serde_json::from_str(&text)
                    .with_context(|| format!("decoding setting '{key}'"))?;
                Ok(value)
            }
            None => Ok(None),
        }
    }

    pub fn get_setting_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get_setting(key)?.unwrap_or(default))
    }

    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.conn().execute(
            "INSERT INTO settings(key, value) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, text],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(())
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let target = idx as i64 + 1;
        if version < target {
            conn.execute_batch(&format!(
                "BEGIN;\n{sql}\nPRAGMA user_version = {target};\nCOMMIT;"
            ))
            .with_context(|| format!("migration to schema v{target}"))?;
            tracing::info!(version = target, "applied schema migration");
        }
    }
    Ok(())
}

pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
