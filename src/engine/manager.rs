//! Strategy manager: a set of workers sharing one strategy family, with
//! within-strategy capital reweighting.

use std::sync::Arc;

use super::{bounded_shares, Worker};
use crate::store::Store;

pub const DEFAULT_MIN_ALLOC_FRAC: f64 = 0.05;
pub const DEFAULT_MAX_ALLOC_FRAC: f64 = 0.80;

pub struct StrategyManager {
    pub name: String,
    pub workers: Vec<Worker>,
    pub min_alloc_frac: f64,
    pub max_alloc_frac: f64,
    step_counter: u64,
}

impl StrategyManager {
    pub fn new(name: impl Into<String>, workers: Vec<Worker>) -> Self {
        Self {
            name: name.into(),
            workers,
            min_alloc_frac: DEFAULT_MIN_ALLOC_FRAC,
            max_alloc_frac: DEFAULT_MAX_ALLOC_FRAC,
            step_counter: 0,
        }
    }

    /// One bar tick: persist rows (so trade FKs resolve), step every
    /// worker, reweight every `rebalance_every` ticks, persist again.
    /// A failing worker is logged and skipped; the next tick retries it.
    pub async fn step(&mut self, store: &Arc<Store>, rebalance_every: u64) {
        for w in &self.workers {
            if let Err(e) = store.upsert_bot(&w.snapshot(&self.name)) {
                tracing::warn!(worker = %w.name, error = %e, "bot snapshot failed");
            }
        }

        for w in &mut self.workers {
            if let Err(e) = w.step().await {
                tracing::warn!(worker = %w.name, error = %e, "worker step failed, skipping this tick");
            }
        }

        if self.step_counter % rebalance_every.max(1) == 0 {
            self.rebalance_within();
        }
        self.step_counter += 1;

        for w in &self.workers {
            if let Err(e) = store.upsert_bot(&w.snapshot(&self.name)) {
                tracing::warn!(worker = %w.name, error = %e, "bot snapshot failed");
            }
        }
    }

    /// Reweight worker allocations by positive score within the manager's
    /// bounds. Total manager equity is preserved; `starting_allocation` is
    /// not touched.
    pub fn rebalance_within(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        let scores: Vec<f64> = self.workers.iter().map(|w| w.score).collect();
        let shares = bounded_shares(&scores, self.min_alloc_frac, self.max_alloc_frac);
        let total_equity: f64 = self.workers.iter().map(|w| w.equity).sum();
        for (w, share) in self.workers.iter_mut().zip(shares) {
            w.allocation = total_equity * share;
        }
    }

    pub fn equity(&self) -> f64 {
        self.workers.iter().map(|w| w.equity).sum()
    }

    /// Mean worker score, floored at zero for allocator use.
    pub fn positive_mean_score(&self) -> f64 {
        if self.workers.is_empty() {
            return 0.0;
        }
        let mean = self.workers.iter().map(|w| w.score).sum::<f64>() / self.workers.len() as f64;
        mean.max(0.0)
    }
}
