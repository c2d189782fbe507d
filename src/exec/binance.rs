//! Binance spot testnet adapter.
//!
//! Signed REST against `testnet.binance.vision`. Quantities are rounded
//! down to the per-symbol lot step and prices to the tick before
//! submission. Limit orders are polled every 2s up to the timeout, then
//! cancelled best-effort. Any network or authorization failure falls back
//! to paper semantics for that call, so a flaky testnet degrades the
//! session instead of stalling it.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

use super::{ExecutionClient, Fill, OrderStatus, PaperExec, Side, TAKER_FEE_RATE};
use crate::store::Store;

const BASE_URL: &str = "https://testnet.binance.vision";
const POLL_INTERVAL_SECS: u64 = 2;
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// `(pair, lot step, price tick)`; anything unlisted uses the defaults.
const SYMBOL_FILTERS: &[(&str, f64, f64)] = &[
    ("BTC_USDT", 0.00001, 0.01),
    ("ETH_USDT", 0.0001, 0.01),
    ("SOL_USDT", 0.01, 0.001),
];
const DEFAULT_LOT_STEP: f64 = 0.0001;
const DEFAULT_PRICE_TICK: f64 = 0.01;

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceTestnetExec {
    bot_name: String,
    store: Arc<Store>,
    client: Client,
    api_key: String,
    api_secret: String,
}

impl BinanceTestnetExec {
    pub fn new(
        bot_name: impl Into<String>,
        store: Arc<Store>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("reqwest client");
        Self {
            bot_name: bot_name.into(),
            store,
            client,
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    fn paper_fallback(&self) -> PaperExec {
        PaperExec::new(self.bot_name.clone(), self.store.clone())
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        mut query: Vec<(String, String)>,
    ) -> Result<serde_json::Value> {
        query.push((
            "timestamp".to_string(),
            chrono::Utc::now().timestamp_millis().to_string(),
        ));
        let encoded = encode_query(&query);
        let signature = self.sign(&encoded);
        let url = format!("{BASE_URL}{path}?{encoded}&signature={signature}");

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("binance testnet request")?;
        let status = response.status();
        let body: serde_json::Value = response.json().await.context("binance testnet body")?;
        if !status.is_success() {
            bail!("binance testnet {status}: {body}");
        }
        Ok(body)
    }

    fn round_to_filters(symbol: &str, qty: f64, price: Option<f64>) -> (f64, Option<f64>) {
        let (step, tick) = SYMBOL_FILTERS
            .iter()
            .find(|(s, _, _)| *s == symbol)
            .map_or((DEFAULT_LOT_STEP, DEFAULT_PRICE_TICK), |(_, s, t)| (*s, *t));
        let qty = (qty / step).floor() * step;
        let price = price.map(|p| (p / tick).round() * tick);
        (qty, price)
    }

    /// `BTC_USDT` → `BTCUSDT`.
    fn exchange_symbol(symbol: &str) -> String {
        symbol.replace('_', "")
    }

    fn fill_from_order(order: &serde_json::Value, fallback_price: f64) -> Fill {
        let executed: f64 = field_f64(order, "executedQty").unwrap_or(0.0);
        let quote: f64 = field_f64(order, "cummulativeQuoteQty").unwrap_or(0.0);
        let avg_price = if executed > 0.0 && quote > 0.0 {
            quote / executed
        } else {
            fallback_price
        };
        // Fee from the fills array if present, else the taker estimate.
        let reported: Option<f64> = order.get("fills").and_then(|fills| {
            let total: f64 = fills
                .as_array()?
                .iter()
                .filter_map(|f| field_f64(f, "commission"))
                .sum();
            Some(total)
        });
        let fee = reported.unwrap_or(executed * avg_price * TAKER_FEE_RATE);
        Fill {
            status: OrderStatus::Filled,
            filled_qty: executed,
            avg_price,
            fee,
            is_maker: order
                .get("isMaker")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(true),
        }
    }

    fn record(&self, symbol: &str, side: Side, fill: &Fill) -> Result<()> {
        self.store.record_trade(
            &self.bot_name,
            symbol,
            side,
            fill.filled_qty,
            fill.avg_price,
            fill.fee,
            fill.is_maker,
        )?;
        Ok(())
    }

    async fn place_market(&self, symbol: &str, side: Side, qty: f64, price_hint: f64) -> Result<Fill> {
        let (qty, _) = Self::round_to_filters(symbol, qty, None);
        if qty <= 0.0 {
            bail!("quantity rounds to zero for {symbol}");
        }
        let order = self
            .signed_request(
                reqwest::Method::POST,
                "/api/v3/order",
                vec![
                    ("symbol".to_string(), Self::exchange_symbol(symbol)),
                    ("side".to_string(), side.as_str().to_uppercase()),
                    ("type".to_string(), "MARKET".to_string()),
                    ("quantity".to_string(), format_qty(qty)),
                ],
            )
            .await?;
        let mut fill = Self::fill_from_order(&order, price_hint);
        fill.is_maker = false;
        if !fill.is_filled() {
            bail!("market order reported no fill: {order}");
        }
        self.record(symbol, side, &fill)?;
        Ok(fill)
    }

    async fn place_limit(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        limit_price: f64,
        timeout_secs: u64,
    ) -> Result<Fill> {
        let (qty, price) = Self::round_to_filters(symbol, qty, Some(limit_price));
        let price = price.ok_or_else(|| anyhow!("missing limit price"))?;
        if qty <= 0.0 {
            bail!("quantity rounds to zero for {symbol}");
        }
        let exchange_symbol = Self::exchange_symbol(symbol);
        let order = self
            .signed_request(
                reqwest::Method::POST,
                "/api/v3/order",
                vec![
                    ("symbol".to_string(), exchange_symbol.clone()),
                    ("side".to_string(), side.as_str().to_uppercase()),
                    ("type".to_string(), "LIMIT".to_string()),
                    ("timeInForce".to_string(), "GTC".to_string()),
                    ("quantity".to_string(), format_qty(qty)),
                    ("price".to_string(), format_qty(price)),
                ],
            )
            .await?;
        let order_id = order
            .get("orderId")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| anyhow!("limit order response missing orderId: {order}"))?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            let status_body = self
                .signed_request(
                    reqwest::Method::GET,
                    "/api/v3/order",
                    vec![
                        ("symbol".to_string(), exchange_symbol.clone()),
                        ("orderId".to_string(), order_id.to_string()),
                    ],
                )
                .await?;
            match status_body.get("status").and_then(serde_json::Value::as_str) {
                Some("FILLED") => {
                    let fill = Self::fill_from_order(&status_body, price);
                    self.record(symbol, side, &fill)?;
                    return Ok(fill);
                }
                Some("CANCELED" | "EXPIRED" | "REJECTED") => {
                    return Ok(Fill::unfilled(OrderStatus::Cancelled));
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;
        }

        // Timed out: cancel best-effort and report it.
        let cancel = self
            .signed_request(
                reqwest::Method::DELETE,
                "/api/v3/order",
                vec![
                    ("symbol".to_string(), exchange_symbol),
                    ("orderId".to_string(), order_id.to_string()),
                ],
            )
            .await;
        if let Err(e) = cancel {
            tracing::warn!(order_id, error = %e, "cancel after timeout failed");
        }
        Ok(Fill::unfilled(OrderStatus::Timeout))
    }
}

#[async_trait]
impl ExecutionClient for BinanceTestnetExec {
    async fn market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price_hint: f64,
    ) -> Result<Fill> {
        match self.place_market(symbol, side, qty, price_hint).await {
            Ok(fill) => Ok(fill),
            Err(e) => {
                tracing::warn!(%symbol, error = %e, "testnet market order failed, paper fallback");
                self.paper_fallback()
                    .market_order(symbol, side, qty, price_hint)
                    .await
            }
        }
    }

    async fn limit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        limit_price: f64,
        timeout_secs: u64,
    ) -> Result<Fill> {
        match self
            .place_limit(symbol, side, qty, limit_price, timeout_secs)
            .await
        {
            Ok(fill) => Ok(fill),
            Err(e) => {
                tracing::warn!(%symbol, error = %e, "testnet limit order failed, paper fallback");
                self.paper_fallback()
                    .limit_order(symbol, side, qty, limit_price, timeout_secs)
                    .await
            }
        }
    }
}

fn field_f64(value: &serde_json::Value, key: &str) -> Option<f64> {
    let v = value.get(key)?;
    v.as_f64().or_else(|| v.as_str()?.parse().ok())
}

fn format_qty(v: f64) -> String {
    // Trim float noise while keeping exchange-acceptable precision.
    let s = format!("{v:.8}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn encode_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}
