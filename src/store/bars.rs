//! Historical bar cache. Bars are immutable, so inserts use OR IGNORE and
//! cached rows never expire.

use anyhow::Result;
use rusqlite::params;
use serde::Serialize;

use super::Store;
use crate::data::Bar;

#[derive(Debug, Clone, Serialize)]
pub struct BarCoverage {
    pub symbol: String,
    pub timeframe: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageRow {
    pub symbol: String,
    pub timeframe: String,
    pub source: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub count: usize,
}

impl Store {
    pub fn store_bars(&self, symbol: &str, timeframe: &str, bars: &[Bar], source: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO bars(symbol, timeframe, ts, open, high, low, close, volume, source)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for b in bars {
                stmt.execute(params![
                    symbol, timeframe, b.ts, b.open, b.high, b.low, b.close, b.volume, source
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Cached bars oldest→newest, optionally bounded by time range and count.
    pub fn get_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        start_ts: Option<i64>,
        end_ts: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<Bar>> {
        let mut sql = String::from(
            "SELECT ts, open, high, low, close, volume FROM bars
             WHERE symbol = ? AND timeframe = ?",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(symbol.to_string()), Box::new(timeframe.to_string())];
        if let Some(start) = start_ts {
            sql.push_str(" AND ts >= ?");
            args.push(Box::new(start));
        }
        if let Some(end) = end_ts {
            sql.push_str(" AND ts <= ?");
            args.push(Box::new(end));
        }
        sql.push_str(" ORDER BY ts ASC");
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(limit as i64));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            Ok(Bar {
                ts: row.get(0)?,
                open: row.get(1)?,
                high: row.get(2)?,
                low: row.get(3)?,
                close: row.get(4)?,
                volume: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_bar_coverage(&self, symbol: &str, timeframe: &str) -> Result<Option<BarCoverage>> {
        let conn = self.conn();
        let row = conn.query_row(
            "SELECT MIN(ts), MAX(ts), COUNT(*) FROM bars WHERE symbol = ?1 AND timeframe = ?2",
            params![symbol, timeframe],
            |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )?;
        Ok(match row {
            (Some(start), Some(end), count) if count > 0 => Some(BarCoverage {
                symbol: symbol.to_string(),
                timeframe: timeframe.to_string(),
                start_ts: start,
                end_ts: end,
                count: count as usize,
            }),
            _ => None,
        })
    }

    /// Per `(symbol, timeframe)` coverage for the whole cache; when several
    /// sources overlap, the one with the most bars wins.
    pub fn coverage_summary(&self) -> Result<Vec<CoverageRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT symbol, timeframe, source, MIN(ts), MAX(ts), COUNT(*)
             FROM bars GROUP BY symbol, timeframe, source",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CoverageRow {
                symbol: row.get(0)?,
                timeframe: row.get(1)?,
                source: row.get(2)?,
                start_ts: row.get(3)?,
                end_ts: row.get(4)?,
                count: row.get::<_, i64>(5)? as usize,
            })
        })?;
        let mut best: std::collections::BTreeMap<(String, String), CoverageRow> =
            std::collections::BTreeMap::new();
        for row in rows {
            let row = row?;
            let key = (row.symbol.clone(), row.timeframe.clone());
            match best.get(&key) {
                Some(existing) if existing.count >= row.count => {}
                _ => {
                    best.insert(key, row);
                }
            }
        }
        Ok(best.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::temp_store;
    use crate::data::Bar;

    fn bar(ts: i64, close: f64) -> Bar {
        Bar {
            ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn duplicate_inserts_are_ignored() {
        let (_dir, store) = temp_store();
        let bars = vec![bar(100, 1.0), bar(200, 2.0)];
        store.store_bars("BTC_USDT", "1d", &bars, "gate").unwrap();
        store.store_bars("BTC_USDT", "1d", &bars, "gate").unwrap();

        let loaded = store.get_bars("BTC_USDT", "1d", None, None, None).unwrap();
        assert_eq!(loaded.len(), 2);
        let coverage = store.get_bar_coverage("BTC_USDT", "1d").unwrap().unwrap();
        assert_eq!(coverage.count, 2);
        assert_eq!(coverage.start_ts, 100);
        assert_eq!(coverage.end_ts, 200);
    }

    #[test]
    fn range_and_limit_filters() {
        let (_dir, store) = temp_store();
        let bars: Vec<Bar> = (1..=5).map(|i| bar(i * 100, i as f64)).collect();
        store.store_bars("ETH_USDT", "1h", &bars, "gate").unwrap();

        let mid = store
            .get_bars("ETH_USDT", "1h", Some(200), Some(400), None)
            .unwrap();
        assert_eq!(mid.len(), 3);
        assert_eq!(mid[0].ts, 200);

        let limited = store
            .get_bars("ETH_USDT", "1h", None, None, Some(2))
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].ts, 100);
    }

    #[test]
    fn coverage_summary_prefers_richer_source() {
        let (_dir, store) = temp_store();
        store
            .store_bars("BTC_USDT", "1d", &[bar(100, 1.0)], "coingecko")
            .unwrap();
        store
            .store_bars("BTC_USDT", "1d", &[bar(200, 2.0), bar(300, 3.0)], "gate")
            .unwrap();

        let summary = store.coverage_summary().unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].source, "gate");
        assert_eq!(summary[0].count, 2);
    }

    #[test]
    fn missing_symbol_has_no_coverage() {
        let (_dir, store) = temp_store();
        assert!(store.get_bar_coverage("XRP_USDT", "1d").unwrap().is_none());
    }
}
