//! Gate.io public candlestick adapter.
//!
//! Uses `/api/v4/spot/candlesticks`. Keeps a short-TTL in-memory cache per
//! `(symbol, timeframe)` to avoid hammering the API, and falls back to the
//! last good response on network failure so a transient vendor error only
//! skips a step instead of failing it.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{timeframe_seconds, Bar, DataProvider};

const BASE_URL: &str = "https://api.gateio.ws/api/v4";
const REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_TTL_SECS: u64 = 5;

pub struct GateProvider {
    client: Client,
    ttl: Duration,
    cache: Mutex<HashMap<(String, String), (Instant, Vec<Bar>)>>,
}

impl GateProvider {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(DEFAULT_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("reqwest client");
        Self {
            client,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, key: &(String, String), limit: usize) -> Option<Vec<Bar>> {
        let cache = self.cache.lock().expect("gate cache lock");
        cache.get(key).and_then(|(at, bars)| {
            (at.elapsed() < self.ttl).then(|| tail(bars, limit))
        })
    }

    fn last_good(&self, key: &(String, String), limit: usize) -> Option<Vec<Bar>> {
        let cache = self.cache.lock().expect("gate cache lock");
        cache.get(key).map(|(_, bars)| tail(bars, limit))
    }

    /// Gate returns rows of strings, newest first:
    /// `["1706745600", quote_vol, close, high, low, open, base_vol, ...]`.
    fn parse_bars(raw: &serde_json::Value) -> Vec<Bar> {
        let mut out = Vec::new();
        let Some(rows) = raw.as_array() else {
            return out;
        };
        for row in rows {
            let Some(cols) = row.as_array() else { continue };
            if cols.len() < 6 {
                continue;
            }
            let f = |i: usize| -> Option<f64> {
                let v = cols.get(i)?;
                v.as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .or_else(|| v.as_f64())
            };
            let (Some(ts), Some(volume), Some(close), Some(high), Some(low), Some(open)) =
                (f(0), f(1), f(2), f(3), f(4), f(5))
            else {
                continue;
            };
            out.push(Bar {
                ts: ts as i64,
                open,
                high,
                low,
                close,
                volume,
            });
        }
        out.sort_by_key(|b| b.ts);
        out
    }
}

impl Default for GateProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn tail(bars: &[Bar], limit: usize) -> Vec<Bar> {
    bars[bars.len().saturating_sub(limit)..].to_vec()
}

#[async_trait]
impl DataProvider for GateProvider {
    async fn history(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Bar>> {
        if timeframe_seconds(timeframe).is_none() {
            bail!("unsupported timeframe '{timeframe}'");
        }
        let key = (symbol.to_string(), timeframe.to_string());
        if let Some(bars) = self.cached(&key, limit) {
            return Ok(bars);
        }

        let url = format!("{BASE_URL}/spot/candlesticks");
        let response = self
            .client
            .get(&url)
            .query(&[
                ("currency_pair", symbol),
                ("interval", timeframe),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await;

        let raw: serde_json::Value = match response {
            Ok(r) => match r.error_for_status() {
                Ok(r) => r.json().await.context("decoding gate candlesticks")?,
                Err(e) => {
                    if let Some(bars) = self.last_good(&key, limit) {
                        tracing::warn!(%symbol, %timeframe, error = %e, "gate error, reusing cached bars");
                        return Ok(bars);
                    }
                    return Err(e).context("gate candlesticks request");
                }
            },
            Err(e) => {
                if let Some(bars) = self.last_good(&key, limit) {
                    tracing::warn!(%symbol, %timeframe, error = %e, "gate unreachable, reusing cached bars");
                    return Ok(bars);
                }
                return Err(e).context("gate candlesticks request");
            }
        };

        let bars = Self::parse_bars(&raw);
        let mut cache = self.cache.lock().expect("gate cache lock");
        cache.insert(key, (Instant::now(), bars.clone()));
        Ok(tail(&bars, limit))
    }
}
