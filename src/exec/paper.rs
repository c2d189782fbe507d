//! Paper trading simulator with maker/taker fee stochastics.
//!
//! Market orders are always taker. Limit orders sit "on the book" and fill
//! at the limit price, classified maker with probability
//! `MAKER_FILL_PROBABILITY` (fee-free) and taker otherwise. All fills are
//! immediate; there is no queueing model.

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;

use super::{ExecutionClient, Fill, OrderStatus, Side, MAKER_FEE_RATE, TAKER_FEE_RATE};
use crate::store::Store;

/// Uncalibrated book-placement model: how often a resting limit order fills
/// passively rather than crossing the spread.
pub const MAKER_FILL_PROBABILITY: f64 = 0.80;

pub struct PaperExec {
    bot_name: String,
    store: Arc<Store>,
    maker_probability: f64,
}

impl PaperExec {
    pub fn new(bot_name: impl Into<String>, store: Arc<Store>) -> Self {
        Self {
            bot_name: bot_name.into(),
            store,
            maker_probability: MAKER_FILL_PROBABILITY,
        }
    }

    /// Pin the maker/taker coin flip, for deterministic tests.
    pub fn with_maker_probability(mut self, p: f64) -> Self {
        self.maker_probability = p;
        self
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
}

#[async_trait]
impl ExecutionClient for PaperExec {
    async fn market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price_hint: f64,
    ) -> Result<Fill> {
        let fill = Fill {
            status: OrderStatus::Filled,
            filled_qty: qty,
            avg_price: price_hint,
            fee: qty * price_hint * TAKER_FEE_RATE,
            is_maker: false,
        };
        self.record(symbol, side, &fill)?;
        Ok(fill)
    }

    async fn limit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        limit_price: f64,
        _timeout_secs: u64,
    ) -> Result<Fill> {
        let is_maker = rand::rng().random_bool(self.maker_probability.clamp(0.0, 1.0));
        let fee_rate = if is_maker { MAKER_FEE_RATE } else { TAKER_FEE_RATE };
        let fill = Fill {
            status: OrderStatus::Filled,
            filled_qty: qty,
            avg_price: limit_price,
            fee: qty * limit_price * fee_rate,
            is_maker,
        };
        self.record(symbol, side, &fill)?;
        Ok(fill)
    }
}
