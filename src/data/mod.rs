pub mod cache;
pub mod coingecko;
pub mod gate;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Immutable OHLCV sample. `ts` (epoch seconds) identifies the bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Kline provider. Returns bars oldest→newest with `limit` as a hard upper
/// bound. Implementors are expected to cache at least briefly.
#[async_trait]
pub trait DataProvider: Send + Sync {
    async fn history(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Bar>>;

    /// Latest `(ts, close)` for a symbol. Defaults to the last bar of a
    /// 1-bar history fetch.
    async fn last_price(&self, symbol: &str) -> Result<Option<(i64, f64)>> {
        let bars = self.history(symbol, "1m", 1).await?;
        Ok(bars.last().map(|b| (b.ts, b.close)))
    }
}

/// Recognized timeframes and their bar durations in seconds.
const TIMEFRAMES: &[(&str, i64)] = &[
    ("1m", 60),
    ("3m", 180),
    ("5m", 300),
    ("15m", 900),
    ("30m", 1800),
    ("1h", 3600),
    ("4h", 14_400),
    ("8h", 28_800),
    ("1d", 86_400),
    ("7d", 604_800),
    ("1w", 604_800),
];

pub fn timeframe_seconds(tf: &str) -> Option<i64> {
    TIMEFRAMES.iter().find(|(k, _)| *k == tf).map(|(_, s)| *s)
}

pub fn known_timeframes() -> Vec<&'static str> {
    TIMEFRAMES.iter().map(|(k, _)| *k).collect()
}
