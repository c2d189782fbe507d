//! Genetic evolution of strategy genomes.
//!
//! Maintains a genome population across the configured symbols. Each
//! generation: evaluate every genome per symbol through the backtester,
//! rank by fitness, persist the best, and breed the next population from
//! the survivors by mutation and crossover.

use anyhow::Result;
use rand::prelude::IndexedRandom;
use rand::Rng;
use std::sync::Arc;

use super::{fitness, DEFAULT_OPTIMIZER_TIMEFRAME, DEFAULT_WINDOW_DAYS};
use crate::backtest::{BacktestMetrics, Backtester};
use crate::data::DataProvider;
use crate::engine::portfolio::SYMBOLS;
use crate::store::Store;
use crate::strategy::genome::{seed_genomes, Genome};
use crate::strategy::Strategy;

/// Best performers persisted per generation.
const PERSIST_TOP: usize = 10;

#[derive(Debug, Clone)]
pub struct EvolverConfig {
    pub population_size: usize,
    pub survivors: usize,
    pub mutation_rate: f64,
    pub crossover_rate: f64,
}

impl Default for EvolverConfig {
    fn default() -> Self {
        Self {
            population_size: 20,
            survivors: 5,
            mutation_rate: 0.7,
            crossover_rate: 0.3,
        }
    }
}

struct Evaluated {
    genome: Genome,
    symbol: String,
    metrics: BacktestMetrics,
    score: f64,
}

pub struct Evolver {
    store: Arc<Store>,
    provider: Arc<dyn DataProvider>,
    pub config: EvolverConfig,
    pub symbols: Vec<String>,
    pub timeframe: String,
    pub window_days: i64,
    backtester: Backtester,
    population: Vec<Genome>,
    generation: i64,
}

impl Evolver {
    pub fn new(store: Arc<Store>, provider: Arc<dyn DataProvider>, config: EvolverConfig) -> Self {
        Self {
            store,
            provider,
            config,
            symbols: SYMBOLS.iter().map(ToString::to_string).collect(),
            timeframe: DEFAULT_OPTIMIZER_TIMEFRAME.to_string(),
            window_days: DEFAULT_WINDOW_DAYS,
            backtester: Backtester::default(),
            population: Vec::new(),
            generation: 0,
        }
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn population_len(&self) -> usize {
        self.population.len()
    }

    /// Seeds plus mutated seeds up to the population size.
    pub fn initialize_population(&mut self) {
        let seeds = seed_genomes();
        self.population = seeds.clone();
        let mut rng = rand::rng();
        while self.population.len() < self.config.population_size {
            let parent = seeds.choose(&mut rng).expect("seeds are non-empty");
            self.population.push(parent.mutate(&mut rng));
        }
        tracing::info!(size = self.population.len(), "initialized genome population");
    }

    /// Run one full generation. Returns the best fitness seen, or `None`
    /// when nothing evaluated.
    pub async fn evolve_generation(&mut self) -> Result<Option<f64>> {
        if self.population.is_empty() {
            self.initialize_population();
        }
        self.generation += 1;

        let end_ts = chrono::Utc::now().timestamp();
        let start_ts = end_ts - self.window_days * 86_400;

        let mut results: Vec<Evaluated> = Vec::new();
        for symbol in self.symbols.clone() {
            for genome in self.population.clone() {
                // A failed evaluation records zero fitness; the generation
                // always completes.
                let metrics = match self.evaluate(&genome, &symbol, start_ts, end_ts).await {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(%symbol, error = %e, "genome evaluation failed");
                        BacktestMetrics::default()
                    }
                };
                results.push(Evaluated {
                    score: fitness(&metrics),
                    genome,
                    symbol: symbol.clone(),
                    metrics,
                });
            }
        }
        if results.is_empty() {
            return Ok(None);
        }

        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        let best_score = results.first().map(|r| r.score);

        for r in results.iter().take(PERSIST_TOP) {
            self.store.save_evolved_strategy(
                &r.genome.to_value(),
                &r.symbol,
                &self.timeframe,
                r.score,
                &r.metrics,
                self.generation,
                self.window_days,
            )?;
        }

        let survivors: Vec<Genome> = results
            .iter()
            .take(self.config.survivors)
            .map(|r| r.genome.clone())
            .collect();
        self.breed_next_generation(&survivors);

        Ok(best_score)
    }

    /// Survivors carry over; the rest of the population is offspring.
    fn breed_next_generation(&mut self, survivors: &[Genome]) {
        if survivors.is_empty() {
            return;
        }
        let mut rng = rand::rng();
        let mut next: Vec<Genome> = survivors.to_vec();
        while next.len() < self.config.population_size {
            let roll: f64 = rng.random();
            let child = if roll < self.config.mutation_rate {
                survivors.choose(&mut rng).expect("non-empty").mutate(&mut rng)
            } else if roll < self.config.mutation_rate + self.config.crossover_rate {
                let a = survivors.choose(&mut rng).expect("non-empty");
                let b = survivors.choose(&mut rng).expect("non-empty");
                Genome::crossover(a, b, &mut rng)
            } else {
                next.choose(&mut rng).expect("non-empty").mutate(&mut rng)
            };
            next.push(child);
        }
        next.truncate(self.config.population_size);
        self.population = next;
    }

    async fn evaluate(
        &self,
        genome: &Genome,
        symbol: &str,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<BacktestMetrics> {
        let mut strategy = Strategy::from_genome(genome.clone());
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

    struct Choppy;

    #[async_trait]
    impl DataProvider for Choppy {
        async fn history(&self, _s: &str, _tf: &str, limit: usize) -> Result<Vec<Bar>> {
            let now = chrono::Utc::now().timestamp();
            let n = limit.min(365);
            Ok((0..n)
                .map(|i| {
                    let ts = now - (n as i64 - 1 - i as i64) * 86_400;
                    let cycle = (i as f64 / 15.0).sin() * 25.0;
                    let close = 120.0 + cycle + i as f64 * 0.1;
                    Bar {
                        ts,
                        open: close,
                        high: close + 2.0,
                        low: close - 2.0,
                        close,
                        volume: 1.0,
                    }
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn generation_persists_ranked_strategies() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        let config = EvolverConfig {
            population_size: 6,
            survivors: 2,
            ..EvolverConfig::default()
        };
        let mut evolver = Evolver::new(store.clone(), Arc::new(Choppy), config);
        evolver.symbols = vec!["BTC_USDT".to_string()];

        let best = evolver.evolve_generation().await.unwrap();
        assert!(best.is_some());
        assert_eq!(evolver.generation(), 1);
        assert_eq!(evolver.population_len(), 6, "population refilled");

        let rows = store.list_evolved_strategies(None, None, 100).unwrap();
        assert!(!rows.is_empty());
        assert!(rows.len() <= PERSIST_TOP);
        assert_eq!(rows[0].generation, 1);
        for pair in rows.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        // Every persisted genome decodes back into a runnable strategy.
        for row in &rows {
            assert!(Genome::from_value(&row.genome).is_ok());
        }
    }

    #[tokio::test]
    async fn survivors_carry_over() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        let config = EvolverConfig {
            population_size: 8,
            survivors: 3,
            ..EvolverConfig::default()
        };
        let mut evolver = Evolver::new(store.clone(), Arc::new(Choppy), config);
        evolver.symbols = vec!["BTC_USDT".to_string()];
        evolver.evolve_generation().await.unwrap();

        let top = store.list_evolved_strategies(None, None, 3).unwrap();
        let best_genome = Genome::from_value(&top[0].genome).unwrap();
        assert!(
            evolver.population.contains(&best_genome),
            "best survivor present in the next population"
        );
    }

    #[test]
    fn population_initializes_from_seeds() {
        let (_dir, store) = temp_store();
        let mut evolver = Evolver::new(
            Arc::new(store),
            Arc::new(Choppy),
            EvolverConfig::default(),
        );
        evolver.initialize_population();
        assert_eq!(evolver.population_len(), 20);
        let seeds = seed_genomes();
        for seed in &seeds {
            assert!(evolver.population.contains(seed), "seeds carried verbatim");
        }
    }
}
