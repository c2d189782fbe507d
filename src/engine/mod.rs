//! The closed control loop: workers, managers, portfolio, scheduler.

pub mod decision;
pub mod manager;
pub mod portfolio;
pub mod scheduler;
pub mod worker;

pub use decision::{Decision, DecisionKind, DecisionLog};
pub use manager::StrategyManager;
pub use portfolio::{build_portfolio, Portfolio, PortfolioConfig};
pub use worker::Worker;

/// Minimum trade notional in quote currency; smaller rebalance deltas are
/// skipped (equity still marks to market).
pub const MIN_NOTIONAL: f64 = 100.0;

/// Minimum wall-clock interval between a worker's consecutive trades.
pub const TRADE_COOLDOWN_SECS: i64 = 300;

/// Bars fetched per worker step.
pub const HISTORY_LIMIT: usize = 200;

/// Limit-order price improvement over the mark, in fraction (5 bps).
pub const LIMIT_PRICE_OFFSET: f64 = 0.0005;

/// Score EMA weight for the newest return observation.
pub const SCORE_EMA_ALPHA: f64 = 0.1;

/// Score clamp bound.
pub const SCORE_CLAMP: f64 = 0.2;

/// Capital share computation used at both allocator levels.
///
/// Negative scores contribute nothing; a scoreless set splits uniformly.
/// Shares are clamped to `[min_frac, max_frac]` and renormalized; entries
/// the renormalization pushes back outside the bounds are pinned there and
/// the remaining mass is redistributed over the free entries, so the bounds
/// hold post-normalization and the total is preserved.
pub(crate) fn bounded_shares(scores: &[f64], min_frac: f64, max_frac: f64) -> Vec<f64> {
    let n = scores.len();
    if n == 0 {
        return Vec::new();
    }
    let positive: Vec<f64> = scores.iter().map(|s| s.max(0.0)).collect();
    let sum: f64 = positive.iter().sum();
    let mut shares: Vec<f64> = if sum > 0.0 {
        positive.iter().map(|s| s / sum).collect()
    } else {
        vec![1.0 / n as f64; n]
    };

    for s in &mut shares {
        *s = s.clamp(min_frac, max_frac);
    }

    let mut pinned = vec![false; n];
    for _ in 0..n {
        let pinned_mass: f64 = shares
            .iter()
            .zip(&pinned)
            .filter(|(_, p)| **p)
            .map(|(s, _)| s)
            .sum();
        let free_mass: f64 = shares
            .iter()
            .zip(&pinned)
            .filter(|(_, p)| !**p)
            .map(|(s, _)| s)
            .sum();
        if free_mass <= 0.0 {
            break;
        }
        let scale = (1.0 - pinned_mass) / free_mass;
        let mut changed = false;
        for i in 0..n {
            if pinned[i] {
                continue;
            }
            let scaled = shares[i] * scale;
            if scaled < min_frac {
                shares[i] = min_frac;
                pinned[i] = true;
                changed = true;
            } else if scaled > max_frac {
                shares[i] = max_frac;
                pinned[i] = true;
                changed = true;
            } else {
                shares[i] = scaled;
            }
        }
        if !changed {
            break;
        }
    }
    shares
}
