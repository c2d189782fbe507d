//! Hydrated worker snapshots, parameter history, and equity snapshots.

use anyhow::{Context, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{now_ts, Store};

/// Persisted worker snapshot, keyed by `name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotRow {
    pub name: String,
    pub manager: Option<String>,
    pub symbol: String,
    pub tf: String,
    pub strategy: String,
    pub params: serde_json::Value,
    pub allocation: f64,
    pub starting_allocation: f64,
    pub cash: f64,
    pub pos_qty: f64,
    pub avg_price: f64,
    pub equity: f64,
    pub score: f64,
    pub trades: i64,
}

impl Store {
    pub fn upsert_bot(&self, bot: &BotRow) -> Result<()> {
        let params_json = serde_json::to_string(&bot.params).context("encoding bot params")?;
        self.conn().execute(
            "INSERT INTO bots(name, manager, symbol, tf, strategy, params_json,
                              allocation, starting_allocation, cash, pos_qty,
                              avg_price, equity, score, trades, updated_ts)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(name) DO UPDATE SET
                manager = excluded.manager,
                symbol = excluded.symbol,
                tf = excluded.tf,
                strategy = excluded.strategy,
                params_json = excluded.params_json,
                allocation = excluded.allocation,
                starting_allocation = excluded.starting_allocation,
                cash = excluded.cash,
                pos_qty = excluded.pos_qty,
                avg_price = excluded.avg_price,
                equity = excluded.equity,
                score = excluded.score,
                trades = excluded.trades,
                updated_ts = excluded.updated_ts",
            params![
                bot.name,
                bot.manager,
                bot.symbol,
                bot.tf,
                bot.strategy,
                params_json,
                bot.allocation,
                bot.starting_allocation,
                bot.cash,
                bot.pos_qty,
                bot.avg_price,
                bot.equity,
                bot.score,
                bot.trades,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    pub fn load_bots(&self) -> Result<HashMap<String, BotRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name, manager, symbol, tf, strategy, params_json, allocation,
                    starting_allocation, cash, pos_qty, avg_price, equity, score, trades
             FROM bots",
        )?;
        let rows = stmt.query_map([], |row| {
            let params_json: String = row.get(5)?;
            Ok(BotRow {
                name: row.get(0)?,
                manager: row.get(1)?,
                symbol: row.get(2)?,
                tf: row.get(3)?,
                strategy: row.get(4)?,
                params: serde_json::from_str(&params_json).unwrap_or(serde_json::Value::Null),
                allocation: row.get(6)?,
                starting_allocation: row.get(7)?,
                cash: row.get(8)?,
                pos_qty: row.get(9)?,
                avg_price: row.get(10)?,
                equity: row.get(11)?,
                score: row.get(12)?,
                trades: row.get(13)?,
            })
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let row = row?;
            out.insert(row.name.clone(), row);
        }
        Ok(out)
    }

    /// Delete bot rows not in `keep` (cascades to their trades). Used by
    /// reset-for-testing to drop records left behind by prior portfolio
    /// layouts.
    pub fn delete_bots_except(&self, keep: &[&str]) -> Result<usize> {
        let conn = self.conn();
        let existing: Vec<String> = {
            let mut stmt = conn.prepare("SELECT name FROM bots")?;
            let names = stmt.query_map([], |r| r.get::<_, String>(0))?;
            names.collect::<rusqlite::Result<_>>()?
        };
        let mut deleted = 0;
        for name in existing {
            if !keep.contains(&name.as_str()) {
                deleted += conn.execute("DELETE FROM bots WHERE name = ?1", [&name])?;
            }
        }
        Ok(deleted)
    }

    pub fn record_params(
        &self,
        bot_name: &str,
        strategy: &str,
        params: &serde_json::Value,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO param_history(ts, bot_name, strategy, params_json) VALUES(?1, ?2, ?3, ?4)",
            params![now_ts(), bot_name, strategy, serde_json::to_string(params)?],
        )?;
        Ok(())
    }

    /// Snapshot manager/bot equities plus the portfolio total in one pass.
    pub fn snapshot_equity(
        &self,
        portfolio_name: &str,
        managers: &[(String, f64)],
        bots: &[(String, f64)],
    ) -> Result<()> {
        let ts = now_ts();
        let conn = self.conn();
        let mut total = 0.0;
        for (name, equity) in managers {
            total += equity;
            conn.execute(
                "INSERT INTO equity_history(ts, scope, name, equity) VALUES(?1, 'manager', ?2, ?3)",
                params![ts, name, equity],
            )?;
        }
        for (name, equity) in bots {
            conn.execute(
                "INSERT INTO equity_history(ts, scope, name, equity) VALUES(?1, 'bot', ?2, ?3)",
                params![ts, name, equity],
            )?;
        }
        conn.execute(
            "INSERT INTO equity_history(ts, scope, name, equity) VALUES(?1, 'portfolio', ?2, ?3)",
            params![ts, portfolio_name, total],
        )?;
        Ok(())
    }

    /// Clear trade and equity history. The bot rows themselves survive; the
    /// caller rewrites them with fresh state.
    pub fn clear_trades_for_reset(&self) -> Result<usize> {
        let conn = self.conn();
        let trades = conn.execute("DELETE FROM trades", [])?;
        conn.execute("DELETE FROM equity_history", [])?;
        Ok(trades)
    }
}
