//! Strategy evaluators.
//!
//! Contract: `on_bar(bars) → target exposure ∈ [-1, +1]` over bars given
//! oldest→newest. -1 = fully short, 0 = flat, +1 = fully long. Evaluators
//! are stateful; feeding the same bar twice (by timestamp) has no effect.

pub mod genome;
pub mod indicators;
pub mod parametric;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::data::Bar;
pub use genome::{Genome, GenomeStrategy};
pub use parametric::{
    breakout_grid, mean_reversion_grid, trend_follow_grid, Breakout, BreakoutParams,
    MeanReversion, MeanReversionParams, TrendFollow, TrendFollowParams,
};

/// The three parametric families that seed the fallback portfolio and the
/// grid optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    MeanReversion,
    Breakout,
    TrendFollow,
}

impl Family {
    pub const ALL: [Family; 3] = [Family::MeanReversion, Family::Breakout, Family::TrendFollow];

    pub fn as_str(self) -> &'static str {
        match self {
            Family::MeanReversion => "MeanReversion",
            Family::Breakout => "Breakout",
            Family::TrendFollow => "TrendFollow",
        }
    }

    /// Manager name this family's workers live under.
    pub fn manager_name(self) -> &'static str {
        match self {
            Family::MeanReversion => "mean_reversion",
            Family::Breakout => "breakout",
            Family::TrendFollow => "trend_follow",
        }
    }

    /// Short prefix used in worker names (`mr_btc_usdt_1d_p1`).
    pub fn name_prefix(self) -> &'static str {
        match self {
            Family::MeanReversion => "mr",
            Family::Breakout => "bo",
            Family::TrendFollow => "tf",
        }
    }

    pub fn parse(name: &str) -> Option<Family> {
        Family::ALL.into_iter().find(|f| f.as_str() == name)
    }

    pub fn grid(self) -> Vec<serde_json::Value> {
        match self {
            Family::MeanReversion => mean_reversion_grid(),
            Family::Breakout => breakout_grid(),
            Family::TrendFollow => trend_follow_grid(),
        }
    }
}

/// Tagged strategy variant with a shared `on_bar` capability.
#[derive(Debug)]
pub enum Strategy {
    MeanReversion(MeanReversion),
    Breakout(Breakout),
    TrendFollow(TrendFollow),
    Genome(GenomeStrategy),
}

impl Strategy {
    pub fn on_bar(&mut self, bars: &[Bar]) -> f64 {
        match self {
            Strategy::MeanReversion(s) => s.on_bar(bars),
            Strategy::Breakout(s) => s.on_bar(bars),
            Strategy::TrendFollow(s) => s.on_bar(bars),
            Strategy::Genome(s) => s.on_bar(bars),
        }
    }

    /// Strategy tag as persisted in bot snapshots and saved configurations.
    pub fn kind(&self) -> &'static str {
        match self {
            Strategy::MeanReversion(_) => "MeanReversion",
            Strategy::Breakout(_) => "Breakout",
            Strategy::TrendFollow(_) => "TrendFollow",
            Strategy::Genome(_) => "GenomeStrategy",
        }
    }

    /// Parameters in the persisted shape; genomes nest under `"genome"`.
    pub fn params(&self) -> serde_json::Value {
        match self {
            Strategy::MeanReversion(s) => serde_json::to_value(&s.params),
            Strategy::Breakout(s) => serde_json::to_value(&s.params),
            Strategy::TrendFollow(s) => serde_json::to_value(&s.params),
            Strategy::Genome(s) => {
                serde_json::to_value(serde_json::json!({ "genome": s.genome.to_value() }))
            }
        }
        .expect("strategy params serialize")
    }

    /// Rebuild a strategy from its persisted `(kind, params)` pair. Fresh
    /// evaluator state: indicators warm up again from the next bars.
    pub fn from_params(kind: &str, params: &serde_json::Value) -> Result<Strategy> {
        match kind {
            "MeanReversion" => {
                let p: MeanReversionParams = serde_json::from_value(params.clone())
                    .context("MeanReversion params")?;
                Ok(Strategy::MeanReversion(MeanReversion::new(p)))
            }
            "Breakout" => {
                let p: BreakoutParams =
                    serde_json::from_value(params.clone()).context("Breakout params")?;
                Ok(Strategy::Breakout(Breakout::new(p)))
            }
            "TrendFollow" => {
                let p: TrendFollowParams =
                    serde_json::from_value(params.clone()).context("TrendFollow params")?;
                Ok(Strategy::TrendFollow(TrendFollow::new(p)))
            }
            "GenomeStrategy" => {
                let raw = params.get("genome").unwrap_or(params);
                let genome = Genome::from_value(raw).context("genome params")?;
                Ok(Strategy::Genome(GenomeStrategy::new(genome)))
            }
            other => bail!("unknown strategy '{other}'"),
        }
    }

    pub fn from_genome(genome: Genome) -> Strategy {
        Strategy::Genome(GenomeStrategy::new(genome))
    }
}
