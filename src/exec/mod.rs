//! Order execution clients.
//!
//! Both variants expose the same two entry points: `market_order` is the
//! taker-only fast path, `limit_order` the maker-biased path. Every fill is
//! recorded to the trade log via the store before the call returns.

pub mod binance;
pub mod paper;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use binance::BinanceTestnetExec;
pub use paper::PaperExec;

/// Standard taker fee estimate used by the paper simulator and as the
/// fallback when the exchange does not report a fee.
pub const TAKER_FEE_RATE: f64 = 0.0010;
pub const MAKER_FEE_RATE: f64 = 0.0;

pub const DEFAULT_LIMIT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }

}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Filled,
    Cancelled,
    Timeout,
}

/// Unified fill shape across the market and limit paths.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Fill {
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub avg_price: f64,
    pub fee: f64,
    pub is_maker: bool,
}

impl Fill {
    pub fn unfilled(status: OrderStatus) -> Fill {
        Fill {
            status,
            filled_qty: 0.0,
            avg_price: 0.0,
            fee: 0.0,
            is_maker: false,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled && self.filled_qty > 0.0
    }
}

#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Immediate taker execution at (or near) `price_hint`.
    async fn market_order(&self, symbol: &str, side: Side, qty: f64, price_hint: f64)
        -> Result<Fill>;

    /// Limit order with a fill-or-cancel window of `timeout_secs`.
    async fn limit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        limit_price: f64,
        timeout_secs: u64,
    ) -> Result<Fill>;
}

/// Execution modes the engine can be configured into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Paper,
    BinanceTestnet,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Paper => "paper",
            ExecutionMode::BinanceTestnet => "binance_testnet",
        }
    }

    pub fn parse(s: &str) -> Option<ExecutionMode> {
        match s {
            "paper" => Some(ExecutionMode::Paper),
            "binance_testnet" => Some(ExecutionMode::BinanceTestnet),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_parse() {
        assert_eq!(Side::parse("BUY"), Some(Side::Buy));
        assert_eq!(Side::parse("sell"), Some(Side::Sell));
        assert_eq!(Side::parse("hold"), None);
    }

    #[test]
    fn execution_mode_round_trip() {
        assert_eq!(ExecutionMode::parse("paper"), Some(ExecutionMode::Paper));
        assert_eq!(
            ExecutionMode::parse("binance_testnet"),
            Some(ExecutionMode::BinanceTestnet)
        );
        assert_eq!(ExecutionMode::parse("live"), None);
        assert_eq!(ExecutionMode::BinanceTestnet.as_str(), "binance_testnet");
    }

    #[test]
    fn unfilled_fill_is_not_filled() {
        assert!(!Fill::unfilled(OrderStatus::Timeout).is_filled());
        let f = Fill {
            status: OrderStatus::Filled,
            filled_qty: 1.0,
            avg_price: 10.0,
            fee: 0.0,
            is_maker: true,
        };
        assert!(f.is_filled());
    }
}
