//! Continuous grid optimization of the parametric families.

pub mod evolve;

use anyhow::Result;
use std::sync::Arc;

use crate::backtest::{BacktestMetrics, Backtester};
use crate::data::DataProvider;
use crate::engine::portfolio::SYMBOLS;
use crate::store::Store;
use crate::strategy::{Family, Strategy};

/// Results kept per `(strategy, symbol)` sweep.
const TOP_RESULTS_PER_SWEEP: usize = 5;

pub const DEFAULT_WINDOW_DAYS: i64 = 365;
pub const DEFAULT_OPTIMIZER_TIMEFRAME: &str = "1d";

/// Composite candidate score. Priority: low drawdown, then Sharpe, then
/// raw return. A candidate that never trades is worthless.
///
/// `100 − max_drawdown% + sharpe × 10 + total_return% × 0.1`
pub fn fitness(metrics: &BacktestMetrics) -> f64 {
    if metrics.total_trades == 0 {
        return 0.0;
    }
    100.0 - metrics.max_drawdown + metrics.sharpe_ratio * 10.0 + metrics.total_return * 0.1
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub params: serde_json::Value,
    pub metrics: BacktestMetrics,
    pub score: f64,
}

pub struct Optimizer {
    store: Arc<Store>,
    provider: Arc<dyn DataProvider>,
    pub symbols: Vec<String>,
    pub timeframe: String,
    pub window_days: i64,
    backtester: Backtester,
}

impl Optimizer {
    pub fn new(store: Arc<Store>, provider: Arc<dyn DataProvider>) -> Self {
        Self {
            store,
            provider,
            symbols: SYMBOLS.iter().map(ToString::to_string).collect(),
            timeframe: DEFAULT_OPTIMIZER_TIMEFRAME.to_string(),
            window_days: DEFAULT_WINDOW_DAYS,
            backtester: Backtester::default(),
        }
    }

    /// Sweep every family × symbol, persisting the top candidates of each.
    /// Returns the number of rows saved.
    pub async fn run_full_sweep(&self) -> Result<usize> {
        let mut saved = 0;
        for family in Family::ALL {
            for symbol in &self.symbols {
                let candidates = self.sweep(family, symbol).await;
                for c in candidates.iter().take(TOP_RESULTS_PER_SWEEP) {
                    self.store.save_optimization_result(
                        family.as_str(),
                        symbol,
                        &self.timeframe,
                        &c.params,
                        c.score,
                        &c.metrics,
                        self.window_days,
                    )?;
                    saved += 1;
                }
                if let Some(best) = candidates.first() {
                    tracing::info!(
                        strategy = family.as_str(),
                        %symbol,
                        score = format!("{:.1}", best.score),
                        total_return = format!("{:.1}%", best.metrics.total_return),
                        "sweep complete"
                    );
                }
            }
        }
        Ok(saved)
    }

    /// Backtest every grid entry for one family on one symbol, best first.
    /// A failing candidate scores zero instead of aborting the sweep.
    pub async fn sweep(&self, family: Family, symbol: &str) -> Vec<Candidate> {
        let end_ts = chrono::Utc::now().timestamp();
        let start_ts = end_ts - self.window_days * 86_400;

        let mut out = Vec::new();
        for params in family.grid() {
            let candidate = match self.evaluate(family, symbol, &params, start_ts, end_ts).await {
                Ok(metrics) => Candidate {
                    score: fitness(&metrics),
                    params,
                    metrics,
                },
                Err(e) => {
                    tracing::warn!(
                        strategy = family.as_str(),
                        %symbol,
                        error = %e,
                        "candidate evaluation failed"
                    );
                    Candidate {
                        params,
                        metrics: BacktestMetrics::default(),
                        score: 0.0,
                    }
                }
            };
            out.push(candidate);
        }
        out.sort_by(|a, b| b.score.total_cmp(&a.score));
        out
    }

    async fn evaluate(
        &self,
        family: Family,
        symbol: &str,
        params: &serde_json::Value,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<BacktestMetrics> {
        let mut strategy = Strategy::from_params(family.as_str(), params)?;
        let run = self
            .backtester
            .run(
                &mut strategy,
                self.provider.as_ref(),
                symbol,
                &self.timeframe,
                Some(start_ts),
                Some(end_ts),
            )
            .await?;
        Ok(run.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Bar;
    use crate::store::testutil::temp_store;
    use async_trait::async_trait;

    #[test]
    fn zero_trades_is_worthless() {
        let m = BacktestMetrics::default();
        assert!((fitness(&m) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fitness_weighs_drawdown_sharpe_return() {
        let m = BacktestMetrics {
            total_trades: 10,
            max_drawdown: 5.0,
            sharpe_ratio: 2.0,
            total_return: 50.0,
            ..BacktestMetrics::default()
        };
        // 100 − 5 + 20 + 5 = 120
        assert!((fitness(&m) - 120.0).abs() < 1e-9);

        let worse = BacktestMetrics {
            total_trades: 10,
            max_drawdown: 20.0,
            sharpe_ratio: 1.0,
            total_return: 100.0,
            ..BacktestMetrics::default()
        };
        // 100 − 20 + 10 + 10 = 100
        assert!((fitness(&worse) - 100.0).abs() < 1e-9);
        assert!(fitness(&m) > fitness(&worse), "drawdown and sharpe dominate return");
    }

    struct SyntheticTrend;

    #[async_trait]
    impl DataProvider for SyntheticTrend {
        async fn history(&self, _s: &str, _tf: &str, limit: usize) -> Result<Vec<Bar>> {
            // A year of gently rising dailies with periodic dips.
            let now = chrono::Utc::now().timestamp();
            let n = limit.min(400);
            Ok((0..n)
                .map(|i| {
                    let ts = now - (n as i64 - 1 - i as i64) * 86_400;
                    let base = 100.0 + i as f64 * 0.5;
                    let dip = if i % 40 < 3 { -20.0 } else { 0.0 };
                    let close = base + dip;
                    Bar {
                        ts,
                        open: close,
                        high: close + 1.0,
                        low: close - 1.0,
                        close,
                        volume: 1.0,
                    }
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn sweep_ranks_and_persists_top_candidates() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        let optimizer = Optimizer::new(store.clone(), Arc::new(SyntheticTrend));

        let candidates = optimizer.sweep(Family::MeanReversion, "BTC_USDT").await;
        assert_eq!(candidates.len(), 3, "one per grid entry");
        for pair in candidates.windows(2) {
            assert!(pair[0].score >= pair[1].score, "sorted best-first");
        }

        let saved = optimizer.run_full_sweep().await.unwrap();
        // 3 families × 3 symbols × 3 grid entries (grid smaller than top-5)
        assert_eq!(saved, 27);
        let rows = store
            .list_optimization_results(Some("MeanReversion"), Some("BTC_USDT"), 10)
            .unwrap();
        assert_eq!(rows.len(), 3);

        // Re-running dedups rather than duplicating.
        optimizer.run_full_sweep().await.unwrap();
        let rows = store.list_optimization_results(None, None, 1000).unwrap();
        assert_eq!(rows.len(), 27);
    }
}
