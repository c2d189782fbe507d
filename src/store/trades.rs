//! Append-only trade log and fee statistics.

use anyhow::Result;
use rusqlite::params;
use serde::Serialize;
use std::collections::HashMap;

use super::{now_ts, Store};
use crate::exec::Side;

#[derive(Debug, Clone, Serialize)]
pub struct TradeRow {
    pub id: i64,
    pub ts: i64,
    pub bot: String,
    pub manager: Option<String>,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub price: f64,
    pub fee: f64,
    pub is_maker: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TradeFilter {
    pub limit: Option<usize>,
    pub since_id: Option<i64>,
    pub bot: Option<String>,
    pub symbol: Option<String>,
    pub manager: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FeeBucket {
    pub count: i64,
    pub fees: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeeStatistics {
    pub total_trades: i64,
    pub total_fees: f64,
    pub total_volume: f64,
    pub maker: FeeBucket,
    pub taker: FeeBucket,
}

impl Store {
    /// Append one fill to the trade log. Trades are never mutated afterwards.
    pub fn record_trade(
        &self,
        bot_name: &str,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
        fee: f64,
        is_maker: bool,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO trades(ts, bot_name, symbol, side, qty, price, fee, is_maker)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                now_ts(),
                bot_name,
                symbol,
                side.as_str(),
                qty,
                price,
                fee,
                i64::from(is_maker)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Recent trades, most recent first, with optional filters.
    pub fn list_trades(&self, filter: &TradeFilter) -> Result<Vec<TradeRow>> {
        let mut sql = String::from(
            "SELECT t.id, t.ts, t.bot_name, b.manager, t.symbol, t.side, t.qty, t.price, t.fee, t.is_maker
             FROM trades t LEFT JOIN bots b ON b.name = t.bot_name
             WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(since_id) = filter.since_id {
            sql.push_str(" AND t.id > ?");
            args.push(Box::new(since_id));
        }
        if let Some(bot) = &filter.bot {
            sql.push_str(" AND t.bot_name = ?");
            args.push(Box::new(bot.clone()));
        }
        if let Some(symbol) = &filter.symbol {
            sql.push_str(" AND t.symbol = ?");
            args.push(Box::new(symbol.clone()));
        }
        if let Some(manager) = &filter.manager {
            sql.push_str(" AND b.manager = ?");
            args.push(Box::new(manager.clone()));
        }
        sql.push_str(" ORDER BY t.id DESC LIMIT ?");
        args.push(Box::new(filter.limit.unwrap_or(100) as i64));

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            Ok(TradeRow {
                id: row.get(0)?,
                ts: row.get(1)?,
                bot: row.get(2)?,
                manager: row.get(3)?,
                symbol: row.get(4)?,
                side: row.get(5)?,
                qty: row.get(6)?,
                price: row.get(7)?,
                fee: row.get(8)?,
                is_maker: row.get::<_, i64>(9)? != 0,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Trade count per bot, straight from the log (authoritative across
    /// restarts).
    pub fn trade_counts(&self) -> Result<HashMap<String, i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT bot_name, COUNT(*) FROM trades GROUP BY bot_name")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn fee_statistics(&self) -> Result<FeeStatistics> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT is_maker, COUNT(*), COALESCE(SUM(fee), 0), COALESCE(SUM(qty * price), 0)
             FROM trades GROUP BY is_maker",
        )?;
        let mut maker = FeeBucket::default();
        let mut taker = FeeBucket::default();
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)? != 0,
                FeeBucket {
                    count: row.get(1)?,
                    fees: row.get(2)?,
                    volume: row.get(3)?,
                },
            ))
        })?;
        for row in rows {
            let (is_maker, bucket) = row?;
            if is_maker {
                maker = bucket;
            } else {
                taker = bucket;
            }
        }
        Ok(FeeStatistics {
            total_trades: maker.count + taker.count,
            total_fees: maker.fees + taker.fees,
            total_volume: maker.volume + taker.volume,
            maker,
            taker,
        })
    }
}
