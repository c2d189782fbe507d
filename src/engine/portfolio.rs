//! Portfolio: ordered strategy managers, across-strategy reweighting, and
//! the build/promotion path that turns evolved strategies into live
//! workers.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{bounded_shares, DecisionLog, StrategyManager, Worker};
use crate::data::DataProvider;
use crate::exec::{BinanceTestnetExec, ExecutionClient, ExecutionMode, PaperExec};
use crate::store::Store;
use crate::strategy::{Family, Strategy};

/// Instruments the engine trades and optimizes over.
pub const SYMBOLS: &[&str] = &["BTC_USDT", "ETH_USDT", "SOL_USDT"];

/// Fresh capital budget per worker when no USDT cap is configured.
pub const DEFAULT_ALLOCATION_PER_BOT: f64 = 1000.0;

pub const DEFAULT_TIMEFRAME: &str = "1d";
pub const DEFAULT_NUM_ACTIVE_STRATEGIES: usize = 5;

/// Bot row kept out of portfolio bookkeeping; operator trades hang off it.
pub const MANUAL_TRADE_BOT: &str = "manual_trade";

#[derive(Debug, Clone)]
pub struct PortfolioConfig {
    pub min_alloc_frac: f64,
    pub max_alloc_frac: f64,
    /// Reweight cadence in ticks, both allocator levels.
    pub rebalance_every: u64,
    /// Auto-rebalance (worker reassignment) cadence in ticks.
    pub auto_rebalance_every: u64,
    /// Worst fraction of workers moved by auto-rebalance.
    pub reassign_frac: f64,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            min_alloc_frac: 0.10,
            max_alloc_frac: 0.70,
            rebalance_every: 5,
            auto_rebalance_every: 60,
            reassign_frac: 0.20,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LiquidatedPosition {
    pub bot: String,
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub price: f64,
    pub value: f64,
}

pub struct Portfolio {
    pub managers: Vec<StrategyManager>,
    pub config: PortfolioConfig,
    pub execution_mode: ExecutionMode,
    pub timeframe: String,
    step_counter: u64,
    auto_rebalance_counter: u64,
    store: Arc<Store>,
    provider: Arc<dyn DataProvider>,
    decisions: Arc<DecisionLog>,
}

impl Portfolio {
    /// One bar tick across the whole population.
    pub async fn step(&mut self) {
        for manager in &mut self.managers {
            manager.step(&self.store, self.config.rebalance_every).await;
        }

        if self.step_counter % self.config.rebalance_every.max(1) == 0 {
            self.rebalance_across();
        }
        self.step_counter += 1;

        self.auto_rebalance_counter += 1;
        if self.auto_rebalance_counter >= self.config.auto_rebalance_every {
            self.auto_rebalance_counter = 0;
            let enabled = self
                .store
                .get_setting_or("auto_rebalance_enabled", false)
                .unwrap_or(false);
            if enabled {
                if let Err(e) = self.auto_rebalance() {
                    tracing::warn!(error = %e, "auto-rebalance failed");
                }
            }
        }

        let managers: Vec<(String, f64)> = self
            .managers
            .iter()
            .map(|m| (m.name.clone(), m.equity()))
            .collect();
        let bots: Vec<(String, f64)> = self
            .managers
            .iter()
            .flat_map(|m| m.workers.iter().map(|w| (w.name.clone(), w.equity)))
            .collect();
        if let Err(e) = self.store.snapshot_equity("portfolio", &managers, &bots) {
            tracing::warn!(error = %e, "equity snapshot failed");
        }
    }

    /// Across-strategy reweighting: manager shares by average positive
    /// score within the portfolio bounds, pushed down to workers in
    /// proportion to their share of manager equity.
    pub fn rebalance_across(&mut self) {
        if self.managers.is_empty() {
            return;
        }
        let scores: Vec<f64> = self
            .managers
            .iter()
            .map(StrategyManager::positive_mean_score)
            .collect();
        let shares = bounded_shares(&scores, self.config.min_alloc_frac, self.config.max_alloc_frac);
        let total_equity: f64 = self.managers.iter().map(StrategyManager::equity).sum();

        for (manager, share) in self.managers.iter_mut().zip(shares) {
            let target = total_equity * share;
            let manager_equity = manager.equity();
            let worker_count = manager.workers.len();
            for w in &mut manager.workers {
                let worker_share = if manager_equity > 0.0 {
                    w.equity / manager_equity
                } else if worker_count == 0 {
                    0.0
                } else {
                    1.0 / worker_count as f64
                };
                w.allocation = target * worker_share;
            }
        }
    }

    /// Move the worst-performing `reassign_frac` of workers onto the
    /// best-scoring parametric family, preserving symbol and mapping the
    /// parameter index from the worker's `_p<k>` name suffix.
    pub fn auto_rebalance(&mut self) -> Result<()> {
        let best = self
            .managers
            .iter()
            .filter(|m| Family::ALL.iter().any(|f| f.manager_name() == m.name))
            .max_by(|a, b| {
                a.positive_mean_score()
                    .total_cmp(&b.positive_mean_score())
            })
            .map(|m| m.name.clone());
        let Some(best_name) = best else {
            // Evolved-only portfolios have no parametric target to move to.
            return Ok(());
        };
        let family = Family::ALL
            .into_iter()
            .find(|f| f.manager_name() == best_name)
            .expect("filtered above");

        let mut ranked: Vec<(usize, usize, f64)> = self
            .managers
            .iter()
            .enumerate()
            .flat_map(|(mi, m)| {
                m.workers
                    .iter()
                    .enumerate()
                    .map(move |(wi, w)| (mi, wi, w.score))
            })
            .collect();
        ranked.sort_by(|a, b| a.2.total_cmp(&b.2));
        let to_move = ((ranked.len() as f64 * self.config.reassign_frac) as usize).max(1);

        let mut moved = 0usize;
        for (mi, wi, _) in ranked.into_iter().take(to_move) {
            let manager_name = self.managers[mi].name.clone();
            let worker = &mut self.managers[mi].workers[wi];
            if worker.strategy.kind() == family.as_str() {
                continue;
            }
            let grid = family.grid();
            let idx = param_index_from_name(&worker.name).min(grid.len() - 1);
            worker.strategy = Strategy::from_params(family.as_str(), &grid[idx])?;

            self.store
                .record_params(&worker.name, family.as_str(), &grid[idx])?;
            let snapshot = worker.snapshot(&manager_name);
            self.store.upsert_bot(&snapshot)?;
            moved += 1;
        }
        if moved > 0 {
            tracing::info!(moved, target = %best_name, "auto-rebalance reassigned workers");
        }
        Ok(())
    }

    /// Aggregate snapshot for `/portfolio.json`.
    pub fn snapshot(&self) -> Result<serde_json::Value> {
        let counts = self.store.trade_counts()?;
        let total_starting: f64 = self
            .managers
            .iter()
            .flat_map(|m| m.workers.iter().map(|w| w.starting_allocation))
            .sum();
        let total_equity: f64 = self.managers.iter().map(StrategyManager::equity).sum();
        let total_pnl = total_equity - total_starting;
        let realized = self.store.realized_pnl(true)?;
        let unrealized = total_pnl - realized;
        let todays = self.store.todays_pnl(true)?;

        Ok(json!({
            "portfolio_metrics": {
                "starting_capital": total_starting,
                "current_value": total_equity,
                "total_pnl": total_pnl,
                "realized_pnl": realized,
                "unrealized_pnl": unrealized,
                "total_return_pct": if total_starting > 0.0 { total_pnl / total_starting * 100.0 } else { 0.0 },
                "todays_pnl": todays,
            },
            "strategies": self.managers.iter().map(|m| json!({
                "name": m.name,
                "equity": m.equity(),
                "bots": m.workers.iter().map(|w| json!({
                    "name": w.name,
                    "symbol": w.symbol,
                    "tf": w.tf,
                    "strategy": w.strategy.kind(),
                    "allocation": w.allocation,
                    "equity": w.equity,
                    "score": w.score,
                    "pos_qty": w.pos_qty,
                    "trades": w.trades,
                    "trades_db": counts.get(&w.name).copied().unwrap_or(0),
                })).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
            "execution_mode": self.execution_mode.as_str(),
        }))
    }

    /// Emergency close: pause trading, then market-close every open
    /// position at the latest mark.
    pub async fn liquidate_all(&mut self) -> Result<Vec<LiquidatedPosition>> {
        self.store.set_setting("trading_paused", &true)?;
        let mut closed = Vec::new();
        for manager in &mut self.managers {
            let manager_name = manager.name.clone();
            for w in &mut manager.workers {
                if w.pos_qty.abs() < 1e-12 {
                    continue;
                }
                let bars = self.provider.history(&w.symbol, &w.tf, 1).await;
                let Ok(bars) = bars else {
                    tracing::warn!(worker = %w.name, "no mark price, skipping liquidation");
                    continue;
                };
                let Some(mark) = bars.last().map(|b| b.close) else {
                    continue;
                };
                let was_long = w.pos_qty > 0.0;
                match w.close_position(mark).await {
                    Ok(Some(fill)) => {
                        closed.push(LiquidatedPosition {
                            bot: w.name.clone(),
                            symbol: w.symbol.clone(),
                            side: if was_long { "sell" } else { "buy" }.to_string(),
                            quantity: fill.filled_qty,
                            price: fill.avg_price,
                            value: fill.filled_qty * fill.avg_price,
                        });
                        let snapshot = w.snapshot(&manager_name);
                        self.store.upsert_bot(&snapshot)?;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(worker = %w.name, error = %e, "liquidation failed");
                    }
                }
            }
        }
        Ok(closed)
    }

    /// Clear trades/equity history and reset every worker to a fresh
    /// capital baseline. Caller must have verified trading is paused.
    pub fn reset_for_testing(&mut self) -> Result<(usize, f64)> {
        self.store.clear_trades_for_reset()?;
        self.decisions.clear();

        let keep: Vec<String> = self
            .managers
            .iter()
            .flat_map(|m| m.workers.iter().map(|w| w.name.clone()))
            .chain(std::iter::once(MANUAL_TRADE_BOT.to_string()))
            .collect();
        let keep_refs: Vec<&str> = keep.iter().map(String::as_str).collect();
        let orphans = self.store.delete_bots_except(&keep_refs)?;
        if orphans > 0 {
            tracing::info!(orphans, "removed stale bot rows");
        }

        let total_bots: usize = self.managers.iter().map(|m| m.workers.len()).sum();
        let capital = capital_per_bot(&self.store, total_bots)?;
        for manager in &mut self.managers {
            let manager_name = manager.name.clone();
            for w in &mut manager.workers {
                w.reset(capital);
                self.store.upsert_bot(&w.snapshot(&manager_name))?;
            }
        }
        Ok((total_bots, capital))
    }

    /// Swap a worker's strategy in place. The caller has already built and
    /// validated the replacement.
    pub fn set_worker_strategy(
        &mut self,
        worker_name: &str,
        strategy: Strategy,
        strategy_label: &str,
    ) -> Result<()> {
        for manager in &mut self.managers {
            let manager_name = manager.name.clone();
            if let Some(w) = manager.workers.iter_mut().find(|w| w.name == worker_name) {
                let params = strategy.params();
                w.strategy = strategy;
                self.store.record_params(&w.name, strategy_label, &params)?;
                self.store.upsert_bot(&w.snapshot(&manager_name))?;
                return Ok(());
            }
        }
        bail!("worker '{worker_name}' not found");
    }

    pub fn find_worker(&self, name: &str) -> Option<&Worker> {
        self.managers
            .iter()
            .flat_map(|m| m.workers.iter())
            .find(|w| w.name == name)
    }

    /// Distinct symbols across the population, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let set: BTreeSet<String> = self
            .managers
            .iter()
            .flat_map(|m| m.workers.iter().map(|w| w.symbol.clone()))
            .collect();
        set.into_iter().collect()
    }
}

/// Parameter index from a `_p<k>` worker-name suffix (1-based → 0-based).
pub fn param_index_from_name(name: &str) -> usize {
    name.rsplit_once("_p")
        .and_then(|(_, digits)| digits.parse::<usize>().ok())
        .map_or(0, |k| k.saturating_sub(1))
}

fn capital_per_bot(store: &Store, total_bots: usize) -> Result<f64> {
    let limit: Option<f64> = store.get_setting("capital_limit_usdt")?;
    Ok(match limit {
        Some(limit) if total_bots > 0 => limit / total_bots as f64,
        _ => DEFAULT_ALLOCATION_PER_BOT,
    })
}

fn exec_for(
    mode: ExecutionMode,
    bot_name: &str,
    store: &Arc<Store>,
    binance_creds: Option<&(String, String)>,
) -> Result<Arc<dyn ExecutionClient>> {
    Ok(match mode {
        ExecutionMode::Paper => Arc::new(PaperExec::new(bot_name, store.clone())),
        ExecutionMode::BinanceTestnet => {
            let Some((key, secret)) = binance_creds else {
                bail!("binance_testnet mode requires BINANCE_TESTNET_API_KEY/SECRET");
            };
            Arc::new(BinanceTestnetExec::new(
                bot_name,
                store.clone(),
                key.clone(),
                secret.clone(),
            ))
        }
    })
}

/// Build the live portfolio.
///
/// Prefers the top-N evolved strategies by score; falls back to the
/// parametric grid × symbols product when none exist yet. Worker state is
/// hydrated from persisted snapshots so a restart resumes where it left
/// off.
pub fn build_portfolio(
    store: &Arc<Store>,
    provider: Arc<dyn DataProvider>,
    decisions: &Arc<DecisionLog>,
    binance_creds: Option<(String, String)>,
) -> Result<Portfolio> {
    let timeframe: String = store.get_setting_or("trading_timeframe", DEFAULT_TIMEFRAME.to_string())?;
    let mode_name: String =
        store.get_setting_or("execution_mode", ExecutionMode::Paper.as_str().to_string())?;
    let mode = ExecutionMode::parse(&mode_name)
        .with_context(|| format!("unknown execution_mode '{mode_name}'"))?;
    let top_n: usize =
        store.get_setting_or("num_active_strategies", DEFAULT_NUM_ACTIVE_STRATEGIES)?;
    let min_score: f64 = store.get_setting_or("min_strategy_score", 0.0)?;

    let evolved = store.top_evolved_for_portfolio(top_n, min_score)?;

    let mut managers = Vec::new();
    if evolved.is_empty() {
        // Parametric fallback: family × symbol × grid entry.
        let total = Family::ALL.len() * SYMBOLS.len() * 3;
        let capital = capital_per_bot(store, total)?;
        for family in Family::ALL {
            let mut workers = Vec::new();
            for symbol in SYMBOLS {
                for (idx, params) in family.grid().iter().enumerate() {
                    let name = format!(
                        "{}_{}_{}_p{}",
                        family.name_prefix(),
                        symbol.to_lowercase(),
                        timeframe,
                        idx + 1
                    );
                    let strategy = Strategy::from_params(family.as_str(), params)?;
                    let exec = exec_for(mode, &name, store, binance_creds.as_ref())?;
                    workers.push(Worker::new(
                        name,
                        *symbol,
                        timeframe.clone(),
                        strategy,
                        capital,
                        provider.clone(),
                        exec,
                        store.clone(),
                        decisions.clone(),
                    ));
                }
            }
            managers.push(StrategyManager::new(family.manager_name(), workers));
        }
        tracing::info!(
            workers = total,
            capital_per_bot = capital,
            "no evolved strategies yet, built parametric fallback portfolio"
        );
    } else {
        let capital = capital_per_bot(store, evolved.len())?;
        let mut workers = Vec::new();
        for row in &evolved {
            let name = format!("evo{}_{}_{}", row.id, row.symbol.to_lowercase(), row.timeframe);
            let strategy = Strategy::from_params("GenomeStrategy", &row.genome)?;
            let exec = exec_for(mode, &name, store, binance_creds.as_ref())?;
            workers.push(Worker::new(
                name,
                row.symbol.clone(),
                // Live workers run the configured trading timeframe, not
                // the timeframe the genome was scored on.
                timeframe.clone(),
                strategy,
                capital,
                provider.clone(),
                exec,
                store.clone(),
                decisions.clone(),
            ));
        }
        tracing::info!(workers = workers.len(), "built portfolio from top evolved strategies");
        managers.push(StrategyManager::new("evolved", workers));
    }

    // Hydrate persisted worker state.
    let rows = store.load_bots()?;
    for manager in &mut managers {
        for w in &mut manager.workers {
            if let Some(row) = rows.get(&w.name) {
                w.hydrate(row);
            }
        }
    }

    // Make sure rows exist (and FK targets) before the first tick trades.
    for manager in &managers {
        for w in &manager.workers {
            store.upsert_bot(&w.snapshot(&manager.name))?;
        }
    }

    Ok(Portfolio {
        managers,
        config: PortfolioConfig::default(),
        execution_mode: mode,
        timeframe,
        step_counter: 0,
        auto_rebalance_counter: 0,
        store: store.clone(),
        provider,
        decisions: decisions.clone(),
    })
}

/// Ensure the manual-trade bot row exists so operator fills satisfy the
/// trades→bots foreign key.
pub fn ensure_manual_trade_bot(store: &Store) -> Result<()> {
    if store.load_bots()?.contains_key(MANUAL_TRADE_BOT) {
        return Ok(());
    }
    store.upsert_bot(&crate::store::BotRow {
        name: MANUAL_TRADE_BOT.to_string(),
        manager: Some("manual".to_string()),
        symbol: "MULTI".to_string(),
        tf: "manual".to_string(),
        strategy: "Manual".to_string(),
        params: json!({}),
        allocation: 0.0,
        starting_allocation: 0.0,
        cash: 0.0,
        pos_qty: 0.0,
        avg_price: 0.0,
        equity: 0.0,
        score: 0.0,
        trades: 0,
    })
}

/// Seed the quick-preset saved configurations on first boot.
pub fn initialize_presets(store: &Store) -> Result<()> {
    let existing: BTreeSet<String> = store
        .list_saved_backtests()?
        .into_iter()
        .map(|s| s.name)
        .collect();
    let presets = [
        (
            "Mean Reversion • BTC • 5m",
            "MeanReversion",
            "BTC_USDT",
            "5m",
            json!({"lookback": 50, "band": 2.0, "confirm_bars": 2}),
        ),
        (
            "Breakout • ETH • 5m",
            "Breakout",
            "ETH_USDT",
            "5m",
            json!({"lookback": 60, "confirm_bars": 2}),
        ),
        (
            "Trend Follow • SOL • 5m",
            "TrendFollow",
            "SOL_USDT",
            "5m",
            json!({"fast": 20, "slow": 100, "confirm_bars": 2}),
        ),
    ];
    for (name, strategy, symbol, tf, params) in presets {
        if !existing.contains(name) {
            store.save_backtest(name, strategy, symbol, tf, &params, 1000.0, 100.0, 365)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::BacktestMetrics;
    use crate::data::Bar;
    use crate::store::testutil::temp_store;
    use async_trait::async_trait;

    struct NoBars;

    #[async_trait]
    impl DataProvider for NoBars {
        async fn history(&self, _s: &str, _tf: &str, _l: usize) -> anyhow::Result<Vec<Bar>> {
            Ok(Vec::new())
        }
    }

    fn build(store: &Arc<Store>) -> Portfolio {
        build_portfolio(
            store,
            Arc::new(NoBars),
            &Arc::new(DecisionLog::new()),
            None,
        )
        .unwrap()
    }

    #[test]
    fn fallback_portfolio_spans_families_and_symbols() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        let portfolio = build(&store);

        assert_eq!(portfolio.managers.len(), 3);
        for manager in &portfolio.managers {
            assert_eq!(manager.workers.len(), 9, "3 symbols × 3 grid entries");
        }
        assert_eq!(portfolio.symbols(), vec!["BTC_USDT", "ETH_USDT", "SOL_USDT"]);
        let names: Vec<&str> = portfolio.managers.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["mean_reversion", "breakout", "trend_follow"]);
        assert!(portfolio.find_worker("mr_btc_usdt_1d_p1").is_some());
    }

    #[test]
    fn evolved_strategies_take_precedence() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        let genome = crate::strategy::genome::seed_genomes()[0].to_value();
        for (score, symbol) in [(150.0, "BTC_USDT"), (140.0, "ETH_USDT")] {
            store
                .save_evolved_strategy(
                    &genome,
                    symbol,
                    "1d",
                    score,
                    &BacktestMetrics::default(),
                    3,
                    365,
                )
                .unwrap();
        }

        let portfolio = build(&store);
        assert_eq!(portfolio.managers.len(), 1);
        assert_eq!(portfolio.managers[0].name, "evolved");
        assert_eq!(portfolio.managers[0].workers.len(), 2);
        assert_eq!(portfolio.managers[0].workers[0].strategy.kind(), "GenomeStrategy");
    }

    #[test]
    fn restart_hydrates_worker_state() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        {
            let mut portfolio = build(&store);
            let manager_name = portfolio.managers[0].name.clone();
            let w = &mut portfolio.managers[0].workers[0];
            w.cash = 123.0;
            w.pos_qty = 0.5;
            w.equity = 400.0;
            w.score = 0.07;
            w.trades = 9;
            let snap = w.snapshot(&manager_name);
            store.upsert_bot(&snap).unwrap();
        }

        let rebuilt = build(&store);
        let w = &rebuilt.managers[0].workers[0];
        assert!((w.cash - 123.0).abs() < 1e-9);
        assert!((w.pos_qty - 0.5).abs() < 1e-9);
        assert_eq!(w.trades, 9);
        assert!((w.score - 0.07).abs() < 1e-9);
    }

    #[test]
    fn param_index_parsing() {
        assert_eq!(param_index_from_name("mr_btc_usdt_1d_p1"), 0);
        assert_eq!(param_index_from_name("tf_sol_usdt_1h_p3"), 2);
        assert_eq!(param_index_from_name("evo7_btc_usdt_1d"), 0);
    }

    #[test]
    fn capital_splits_configured_limit() {
        let (_dir, store) = temp_store();
        store.set_setting("capital_limit_usdt", &5400.0).unwrap();
        assert!((capital_per_bot(&store, 27).unwrap() - 200.0).abs() < 1e-9);
        store.delete_setting("capital_limit_usdt").unwrap();
        assert!((capital_per_bot(&store, 27).unwrap() - DEFAULT_ALLOCATION_PER_BOT).abs() < 1e-9);
    }

    #[test]
    fn across_rebalance_preserves_total() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        let mut portfolio = build(&store);
        for (i, manager) in portfolio.managers.iter_mut().enumerate() {
            for w in &mut manager.workers {
                w.score = 0.02 * i as f64;
            }
        }
        let before: f64 = portfolio.managers.iter().map(StrategyManager::equity).sum();
        portfolio.rebalance_across();
        let after: f64 = portfolio
            .managers
            .iter()
            .flat_map(|m| m.workers.iter().map(|w| w.allocation))
            .sum();
        assert!((before - after).abs() < 1e-6);
    }

    #[test]
    fn presets_seed_once() {
        let (_dir, store) = temp_store();
        initialize_presets(&store).unwrap();
        initialize_presets(&store).unwrap();
        assert_eq!(store.list_saved_backtests().unwrap().len(), 3);
    }

    #[test]
    fn manual_trade_bot_is_created_once() {
        let (_dir, store) = temp_store();
        ensure_manual_trade_bot(&store).unwrap();
        ensure_manual_trade_bot(&store).unwrap();
        let rows = store.load_bots().unwrap();
        assert!(rows.contains_key(MANUAL_TRADE_BOT));
        assert_eq!(rows.len(), 1);
    }
}
