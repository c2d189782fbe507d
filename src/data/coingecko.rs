//! CoinGecko daily OHLC adapter, used for long-range backfill.
//!
//! Free API, daily granularity only; the requested timeframe is ignored and
//! the `/coins/{id}/ohlc` endpoint reports no volume.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::{Bar, DataProvider};

const BASE_URL: &str = "https://api.coingecko.com/api/v3";
const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Exchange pair → CoinGecko coin id.
const SYMBOL_MAP: &[(&str, &str)] = &[
    ("BTC_USDT", "bitcoin"),
    ("ETH_USDT", "ethereum"),
    ("SOL_USDT", "solana"),
    ("BNB_USDT", "binancecoin"),
    ("XRP_USDT", "ripple"),
    ("ADA_USDT", "cardano"),
    ("AVAX_USDT", "avalanche-2"),
    ("DOGE_USDT", "dogecoin"),
    ("DOT_USDT", "polkadot"),
];

pub struct CoinGeckoProvider {
    client: Client,
}

impl CoinGeckoProvider {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent("botfarm/0.1")
            .build()
            .expect("reqwest client");
        Self { client }
    }

    fn coin_id(symbol: &str) -> Option<&'static str> {
        SYMBOL_MAP.iter().find(|(s, _)| *s == symbol).map(|(_, id)| *id)
    }

    /// Response rows: `[timestamp_ms, open, high, low, close]`.
    fn parse_bars(raw: &serde_json::Value) -> Vec<Bar> {
        let mut out = Vec::new();
        let Some(rows) = raw.as_array() else {
            return out;
        };
        for row in rows {
            let Some(cols) = row.as_array() else { continue };
            if cols.len() < 5 {
                continue;
            }
            let f = |i: usize| cols.get(i).and_then(serde_json::Value::as_f64);
            let (Some(ts_ms), Some(open), Some(high), Some(low), Some(close)) =
                (f(0), f(1), f(2), f(3), f(4))
            else {
                continue;
            };
            out.push(Bar {
                ts: (ts_ms / 1000.0) as i64,
                open,
                high,
                low,
                close,
                volume: 0.0,
            });
        }
        out.sort_by_key(|b| b.ts);
        out
    }
}

impl Default for CoinGeckoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataProvider for CoinGeckoProvider {
    async fn history(&self, symbol: &str, _timeframe: &str, limit: usize) -> Result<Vec<Bar>> {
        let Some(coin_id) = Self::coin_id(symbol) else {
            bail!("unsupported symbol '{symbol}' for coingecko");
        };
        let url = format!("{BASE_URL}/coins/{coin_id}/ohlc");
        let raw: serde_json::Value = self
            .client
            .get(&url)
            .query(&[("vs_currency", "usd"), ("days", &limit.to_string())])
            .send()
            .await
            .context("coingecko request")?
            .error_for_status()
            .context("coingecko response")?
            .json()
            .await
            .context("decoding coingecko ohlc")?;
        Ok(Self::parse_bars(&raw))
    }

    async fn last_price(&self, _symbol: &str) -> Result<Option<(i64, f64)>> {
        // Daily-only vendor; not suitable for live marks.
        Ok(None)
    }
}
