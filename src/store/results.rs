//! Saved backtest configurations and ranked optimizer/evolver candidates.

use anyhow::{Context, Result};
use rusqlite::params;
use serde::Serialize;

use super::{now_ts, Store};
use crate::backtest::BacktestMetrics;

#[derive(Debug, Clone, Serialize)]
pub struct SavedBacktest {
    pub id: i64,
    pub name: String,
    pub strategy: String,
    pub symbol: String,
    pub timeframe: String,
    pub params: serde_json::Value,
    pub initial_capital: f64,
    pub min_notional: f64,
    pub days: i64,
    pub created_ts: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationRow {
    pub id: i64,
    pub strategy: String,
    pub symbol: String,
    pub timeframe: String,
    pub params: serde_json::Value,
    pub score: f64,
    pub total_return: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub total_trades: i64,
    pub win_rate: f64,
    pub days: i64,
    pub tested_ts: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvolvedRow {
    pub id: i64,
    pub genome: serde_json::Value,
    pub symbol: String,
    pub timeframe: String,
    pub score: f64,
    pub total_return: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub total_trades: i64,
    pub win_rate: f64,
    pub generation: i64,
    pub days: i64,
    pub tested_ts: i64,
}

impl Store {
    // ── Saved backtest configurations ────────────────────────────────────

    pub fn save_backtest(
        &self,
        name: &str,
        strategy: &str,
        symbol: &str,
        timeframe: &str,
        params: &serde_json::Value,
        initial_capital: f64,
        min_notional: f64,
        days: i64,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO saved_backtests(name, strategy, symbol, timeframe, params_json,
                                         initial_capital, min_notional, days, created_ts)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(name) DO UPDATE SET
                strategy = excluded.strategy,
                symbol = excluded.symbol,
                timeframe = excluded.timeframe,
                params_json = excluded.params_json,
                initial_capital = excluded.initial_capital,
                min_notional = excluded.min_notional,
                days = excluded.days",
            params![
                name,
                strategy,
                symbol,
                timeframe,
                serde_json::to_string(params)?,
                initial_capital,
                min_notional,
                days,
                now_ts(),
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM saved_backtests WHERE name = ?1",
            [name],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn list_saved_backtests(&self) -> Result<Vec<SavedBacktest>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, strategy, symbol, timeframe, params_json,
                    initial_capital, min_notional, days, created_ts
             FROM saved_backtests ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], saved_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_saved_backtest(&self, id: i64) -> Result<Option<SavedBacktest>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, strategy, symbol, timeframe, params_json,
                    initial_capital, min_notional, days, created_ts
             FROM saved_backtests WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map([id], saved_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn delete_saved_backtest(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn()
            .execute("DELETE FROM saved_backtests WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    // ── Optimization results ─────────────────────────────────────────────

    /// Upsert keyed on `(strategy, symbol, timeframe, params)` so repeated
    /// sweeps refresh scores instead of accumulating duplicates.
    pub fn save_optimization_result(
        &self,
        strategy: &str,
        symbol: &str,
        timeframe: &str,
        params: &serde_json::Value,
        score: f64,
        metrics: &BacktestMetrics,
        days: i64,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO optimization_results(strategy, symbol, timeframe, params_json, score,
                 total_return, sharpe_ratio, max_drawdown, total_trades, win_rate, days, tested_ts)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(strategy, symbol, timeframe, params_json) DO UPDATE SET
                score = excluded.score,
                total_return = excluded.total_return,
                sharpe_ratio = excluded.sharpe_ratio,
                max_drawdown = excluded.max_drawdown,
                total_trades = excluded.total_trades,
                win_rate = excluded.win_rate,
                days = excluded.days,
                tested_ts = excluded.tested_ts",
            params![
                strategy,
                symbol,
                timeframe,
                canonical_json(params)?,
                score,
                metrics.total_return,
                metrics.sharpe_ratio,
                metrics.max_drawdown,
                metrics.total_trades as i64,
                metrics.win_rate,
                days,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    pub fn list_optimization_results(
        &self,
        strategy: Option<&str>,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<OptimizationRow>> {
        let mut sql = String::from(
            "SELECT id, strategy, symbol, timeframe, params_json, score, total_return,
                    sharpe_ratio, max_drawdown, total_trades, win_rate, days, tested_ts
             FROM optimization_results WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(strategy) = strategy {
            sql.push_str(" AND strategy = ?");
            args.push(Box::new(strategy.to_string()));
        }
        if let Some(symbol) = symbol {
            sql.push_str(" AND symbol = ?");
            args.push(Box::new(symbol.to_string()));
        }
        sql.push_str(" ORDER BY score DESC LIMIT ?");
        args.push(Box::new(limit as i64));

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            let params_json: String = row.get(4)?;
            Ok(OptimizationRow {
                id: row.get(0)?,
                strategy: row.get(1)?,
                symbol: row.get(2)?,
                timeframe: row.get(3)?,
                params: serde_json::from_str(&params_json).unwrap_or(serde_json::Value::Null),
                score: row.get(5)?,
                total_return: row.get(6)?,
                sharpe_ratio: row.get(7)?,
                max_drawdown: row.get(8)?,
                total_trades: row.get(9)?,
                win_rate: row.get(10)?,
                days: row.get(11)?,
                tested_ts: row.get(12)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_optimization_result(&self, id: i64) -> Result<Option<OptimizationRow>> {
        Ok(self
            .list_optimization_results(None, None, usize::MAX >> 1)?
            .into_iter()
            .find(|r| r.id == id))
    }

    // ── Evolved strategies ───────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn save_evolved_strategy(
        &self,
        genome: &serde_json::Value,
        symbol: &str,
        timeframe: &str,
        score: f64,
        metrics: &BacktestMetrics,
        generation: i64,
        days: i64,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO evolved_strategies(genome_json, symbol, timeframe, score, total_return,
                 sharpe_ratio, max_drawdown, total_trades, win_rate, generation, days, tested_ts)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                serde_json::to_string(genome)?,
                symbol,
                timeframe,
                score,
                metrics.total_return,
                metrics.sharpe_ratio,
                metrics.max_drawdown,
                metrics.total_trades as i64,
                metrics.win_rate,
                generation,
                days,
                now_ts(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_evolved_strategies(
        &self,
        symbol: Option<&str>,
        min_score: Option<f64>,
        limit: usize,
    ) -> Result<Vec<EvolvedRow>> {
        let mut sql = String::from(
            "SELECT id, genome_json, symbol, timeframe, score, total_return, sharpe_ratio,
                    max_drawdown, total_trades, win_rate, generation, days, tested_ts
             FROM evolved_strategies WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(symbol) = symbol {
            sql.push_str(" AND symbol = ?");
            args.push(Box::new(symbol.to_string()));
        }
        if let Some(min_score) = min_score {
            sql.push_str(" AND score >= ?");
            args.push(Box::new(min_score));
        }
        sql.push_str(" ORDER BY score DESC, id DESC LIMIT ?");
        args.push(Box::new(limit as i64));

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), evolved_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_evolved_strategy(&self, id: i64) -> Result<Option<EvolvedRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, genome_json, symbol, timeframe, score, total_return, sharpe_ratio,
                    max_drawdown, total_trades, win_rate, generation, days, tested_ts
             FROM evolved_strategies WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map([id], evolved_from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Best candidates for the portfolio build, score-descending.
    pub fn top_evolved_for_portfolio(&self, n: usize, min_score: f64) -> Result<Vec<EvolvedRow>> {
        self.list_evolved_strategies(None, Some(min_score), n)
    }
}

fn saved_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SavedBacktest> {
    let params_json: String = row.get(5)?;
    Ok(SavedBacktest {
        id: row.get(0)?,
        name: row.get(1)?,
        strategy: row.get(2)?,
        symbol: row.get(3)?,
        timeframe: row.get(4)?,
        params: serde_json::from_str(&params_json).unwrap_or(serde_json::Value::Null),
        initial_capital: row.get(6)?,
        min_notional: row.get(7)?,
        days: row.get(8)?,
        created_ts: row.get(9)?,
    })
}

fn evolved_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EvolvedRow> {
    let genome_json: String = row.get(1)?;
    Ok(EvolvedRow {
        id: row.get(0)?,
        genome: serde_json::from_str(&genome_json).unwrap_or(serde_json::Value::Null),
        symbol: row.get(2)?,
        timeframe: row.get(3)?,
        score: row.get(4)?,
        total_return: row.get(5)?,
        sharpe_ratio: row.get(6)?,
        max_drawdown: row.get(7)?,
        total_trades: row.get(8)?,
        win_rate: row.get(9)?,
        generation: row.get(10)?,
        days: row.get(11)?,
        tested_ts: row.get(12)?,
    })
}

/// Stable serialization for the dedup key (`serde_json` object keys are
/// ordered, so equal params encode to equal strings).
fn canonical_json(value: &serde_json::Value) -> Result<String> {
    serde_json::to_string(value).context("encoding params")
}

#[cfg(test)]
mod tests {
    use super::super::testutil::temp_store;
    use crate::backtest::BacktestMetrics;
    use serde_json::json;

    fn metrics(total_return: f64, trades: usize) -> BacktestMetrics {
        BacktestMetrics {
            total_return,
            total_trades: trades,
            ..BacktestMetrics::default()
        }
    }

    #[test]
    fn optimization_results_dedup_on_key() {
        let (_dir, store) = temp_store();
        let params = json!({"lookback": 20, "band": 2.0});
        store
            .save_optimization_result(
                "MeanReversion",
                "BTC_USDT",
                "1d",
                &params,
                110.0,
                &metrics(12.0, 7),
                365,
            )
            .unwrap();
        store
            .save_optimization_result(
                "MeanReversion",
                "BTC_USDT",
                "1d",
                &params,
                95.0,
                &metrics(3.0, 4),
                365,
            )
            .unwrap();

        let rows = store
            .list_optimization_results(Some("MeanReversion"), None, 10)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].score - 95.0).abs() < 1e-9, "second run replaces the first");
    }

    #[test]
    fn evolved_strategies_rank_by_score() {
        let (_dir, store) = temp_store();
        let genome = json!({"indicators": [{"type": "RSI", "period": 14}]});
        for (score, symbol) in [(80.0, "BTC_USDT"), (120.0, "ETH_USDT"), (100.0, "SOL_USDT")] {
            store
                .save_evolved_strategy(&genome, symbol, "1d", score, &metrics(5.0, 3), 2, 365)
                .unwrap();
        }

        let top = store.top_evolved_for_portfolio(2, 0.0).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].symbol, "ETH_USDT");
        assert_eq!(top[1].symbol, "SOL_USDT");

        let filtered = store
            .list_evolved_strategies(None, Some(90.0), 10)
            .unwrap();
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn saved_backtests_crud() {
        let (_dir, store) = temp_store();
        let id = store
            .save_backtest(
                "Mean Reversion • BTC • 5m",
                "MeanReversion",
                "BTC_USDT",
                "5m",
                &json!({"lookback": 50, "band": 2.0, "confirm_bars": 2}),
                1000.0,
                100.0,
                365,
            )
            .unwrap();

        let same_id = store
            .save_backtest(
                "Mean Reversion • BTC • 5m",
                "MeanReversion",
                "BTC_USDT",
                "5m",
                &json!({"lookback": 20, "band": 2.0, "confirm_bars": 2}),
                1000.0,
                100.0,
                365,
            )
            .unwrap();
        assert_eq!(id, same_id, "same name updates in place");

        let fetched = store.get_saved_backtest(id).unwrap().unwrap();
        assert_eq!(fetched.params["lookback"], json!(20));
        assert_eq!(store.list_saved_backtests().unwrap().len(), 1);
        assert!(store.delete_saved_backtest(id).unwrap());
        assert!(store.get_saved_backtest(id).unwrap().is_none());
    }
}
