//! Worker: the smallest independently-scheduled trading unit.
//!
//! One worker pairs one strategy with one instrument and timeframe, and
//! translates the strategy's target exposure into orders under no-leverage
//! sizing, per-bar idempotency, a trade cooldown, and the global pause
//! gate.

use anyhow::Result;
use std::sync::Arc;

use super::{
    Decision, DecisionKind, DecisionLog, HISTORY_LIMIT, LIMIT_PRICE_OFFSET, MIN_NOTIONAL,
    SCORE_CLAMP, SCORE_EMA_ALPHA, TRADE_COOLDOWN_SECS,
};
use crate::data::DataProvider;
use crate::exec::{ExecutionClient, Side, DEFAULT_LIMIT_TIMEOUT_SECS, TAKER_FEE_RATE};
use crate::store::{BotRow, Store};

pub struct Worker {
    pub name: String,
    pub symbol: String,
    pub tf: String,
    pub strategy: crate::strategy::Strategy,

    /// Current capital budget; rewritten by the allocator.
    pub allocation: f64,
    /// Fixed P&L baseline; only an explicit reset rewrites it.
    pub starting_allocation: f64,
    pub cash: f64,
    pub pos_qty: f64,
    pub avg_price: f64,
    pub equity: f64,
    pub cum_pnl: f64,
    pub trades: i64,
    pub score: f64,

    pub last_bar_ts: Option<i64>,
    pub last_trade_ts: Option<i64>,

    data: Arc<dyn DataProvider>,
    exec: Arc<dyn ExecutionClient>,
    store: Arc<Store>,
    decisions: Arc<DecisionLog>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        symbol: impl Into<String>,
        tf: impl Into<String>,
        strategy: crate::strategy::Strategy,
        allocation: f64,
        data: Arc<dyn DataProvider>,
        exec: Arc<dyn ExecutionClient>,
        store: Arc<Store>,
        decisions: Arc<DecisionLog>,
    ) -> Self {
        Self {
            name: name.into(),
            symbol: symbol.into(),
            tf: tf.into(),
            strategy,
            allocation,
            starting_allocation: allocation,
            cash: allocation,
            pos_qty: 0.0,
            avg_price: 0.0,
            equity: allocation,
            cum_pnl: 0.0,
            trades: 0,
            score: 0.0,
            last_bar_ts: None,
            last_trade_ts: None,
            data,
            exec,
            store,
            decisions,
        }
    }

    /// Restore persisted state from a snapshot row.
    pub fn hydrate(&mut self, row: &BotRow) {
        self.allocation = row.allocation;
        self.starting_allocation = if row.starting_allocation > 0.0 {
            row.starting_allocation
        } else {
            row.allocation
        };
        self.cash = row.cash;
        self.pos_qty = row.pos_qty;
        self.avg_price = row.avg_price;
        self.equity = row.equity;
        self.score = row.score;
        self.trades = row.trades;
    }

    pub fn snapshot(&self, manager: &str) -> BotRow {
        BotRow {
            name: self.name.clone(),
            manager: Some(manager.to_string()),
            symbol: self.symbol.clone(),
            tf: self.tf.clone(),
            strategy: self.strategy.kind().to_string(),
            params: self.strategy.params(),
            allocation: self.allocation,
            starting_allocation: self.starting_allocation,
            cash: self.cash,
            pos_qty: self.pos_qty,
            avg_price: self.avg_price,
            equity: self.equity,
            score: self.score,
            trades: self.trades,
        }
    }

    /// One bar-aligned step. Never called twice for the same bar timestamp;
    /// a repeat invocation within a tick is a no-op.
    pub async fn step(&mut self) -> Result<()> {
        let bars = self
            .data
            .history(&self.symbol, &self.tf, HISTORY_LIMIT)
            .await?;
        let Some(last) = bars.last().copied() else {
            return Ok(());
        };
        if self.last_bar_ts == Some(last.ts) {
            return Ok(());
        }
        self.last_bar_ts = Some(last.ts);
        let price = last.close;
        if price <= 0.0 {
            return Ok(());
        }

        let target_exp = self.strategy.on_bar(&bars).clamp(-1.0, 1.0);
        self.decide(DecisionKind::Signal, price, Some(target_exp), None);

        let equity_now = self.cash + self.pos_qty * price;
        let target_qty = equity_now * target_exp / price;
        let mut delta = target_qty - self.pos_qty;

        // Mark to market before any gate, so skipped bars stay fresh.
        self.avg_price = price;
        self.equity = self.cash + self.pos_qty * price;

        if delta.abs() * price < MIN_NOTIONAL {
            self.decide(DecisionKind::SkipMinNotional, price, Some(target_exp), None);
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp();
        if let Some(last_trade) = self.last_trade_ts {
            if now - last_trade < TRADE_COOLDOWN_SECS {
                self.decide(
                    DecisionKind::SkipCooldown,
                    price,
                    Some(target_exp),
                    Some(format!("{}s since last trade", now - last_trade)),
                );
                return Ok(());
            }
        }

        if self.store.get_setting_or("trading_paused", true)? {
            self.decide(DecisionKind::SkipTradingPaused, price, Some(target_exp), None);
            return Ok(());
        }

        let side = if delta > 0.0 { Side::Buy } else { Side::Sell };

        // No leverage: cap buys by available cash, with headroom for the
        // worst-case taker fee so cash stays non-negative after the fill.
        if side == Side::Buy {
            let affordable = self.cash / (price * (1.0 + TAKER_FEE_RATE));
            if delta > affordable {
                delta = affordable;
            }
        }
        let qty = delta.abs();
        if qty <= 0.0 {
            return Ok(());
        }

        let limit_price = match side {
            Side::Buy => price * (1.0 - LIMIT_PRICE_OFFSET),
            Side::Sell => price * (1.0 + LIMIT_PRICE_OFFSET),
        };
        let fill = self
            .exec
            .limit_order(
                &self.symbol,
                side,
                qty,
                limit_price,
                DEFAULT_LIMIT_TIMEOUT_SECS,
            )
            .await?;

        if fill.is_filled() {
            self.apply_fill(side, fill.filled_qty, fill.avg_price, fill.fee);
            self.last_trade_ts = Some(now);
            self.decide(
                DecisionKind::TradeExecuted,
                fill.avg_price,
                Some(target_exp),
                Some(format!(
                    "{side} {:.6} @ {:.4} fee {:.4} ({})",
                    fill.filled_qty,
                    fill.avg_price,
                    fill.fee,
                    if fill.is_maker { "maker" } else { "taker" }
                )),
            );
        }

        // End-of-bar mark; this is the equity the scorer sees.
        self.equity = self.cash + self.pos_qty * price;
        let ret = (self.equity - self.allocation) / self.allocation.max(1e-9);
        self.score = ((1.0 - SCORE_EMA_ALPHA) * self.score + SCORE_EMA_ALPHA * ret)
            .clamp(-SCORE_CLAMP, SCORE_CLAMP);
        Ok(())
    }

    pub fn apply_fill(&mut self, side: Side, qty: f64, price: f64, fee: f64) {
        match side {
            Side::Buy => {
                self.cash -= qty * price + fee;
                self.pos_qty += qty;
            }
            Side::Sell => {
                self.cash += qty * price - fee;
                self.pos_qty -= qty;
            }
        }
        self.trades += 1;
    }

    /// Close any open position with a market order. Used by emergency
    /// liquidation; returns the closing fill if one was needed.
    pub async fn close_position(&mut self, mark_price: f64) -> Result<Option<crate::exec::Fill>> {
        if self.pos_qty.abs() < 1e-12 {
            return Ok(None);
        }
        let side = if self.pos_qty > 0.0 {
            Side::Sell
        } else {
            Side::Buy
        };
        let qty = self.pos_qty.abs();
        let fill = self
            .exec
            .market_order(&self.symbol, side, qty, mark_price)
            .await?;
        if fill.is_filled() {
            self.apply_fill(side, fill.filled_qty, fill.avg_price, fill.fee);
            self.equity = self.cash + self.pos_qty * fill.avg_price;
            self.avg_price = 0.0;
            return Ok(Some(fill));
        }
        Ok(None)
    }

    /// Reset to a fresh baseline. The only operation that rewrites
    /// `starting_allocation`.
    pub fn reset(&mut self, initial_capital: f64) {
        self.allocation = initial_capital;
        self.starting_allocation = initial_capital;
        self.cash = initial_capital;
        self.pos_qty = 0.0;
        self.avg_price = 0.0;
        self.equity = initial_capital;
        self.cum_pnl = 0.0;
        self.trades = 0;
        self.score = 0.0;
        self.last_trade_ts = None;
    }

    fn decide(
        &self,
        kind: DecisionKind,
        price: f64,
        target_exposure: Option<f64>,
        detail: Option<String>,
    ) {
        self.decisions.push(Decision {
            ts: chrono::Utc::now().timestamp(),
            bot: self.name.clone(),
            symbol: self.symbol.clone(),
            kind,
            price,
            target_exposure,
            detail,
        });
    }
}
