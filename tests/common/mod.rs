#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use botfarm::data::{Bar, DataProvider};
use botfarm::engine::DecisionLog;
use botfarm::exec::PaperExec;
use botfarm::store::Store;
use botfarm::strategy::{Breakout, BreakoutParams, Strategy};

/// Provider that serves whatever bars the test scripted, ignoring limits
/// below the scripted length.
pub struct ScriptedProvider {
    bars: Mutex<Vec<Bar>>,
}

impl ScriptedProvider {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self {
            bars: Mutex::new(bars),
        }
    }

    pub fn set_bars(&self, bars: Vec<Bar>) {
        *self.bars.lock().unwrap() = bars;
    }
}

#[async_trait]
impl DataProvider for ScriptedProvider {
    async fn history(&self, _symbol: &str, _tf: &str, limit: usize) -> Result<Vec<Bar>> {
        let bars = self.bars.lock().unwrap().clone();
        let start = bars.len().saturating_sub(limit);
        Ok(bars[start..].to_vec())
    }
}

/// Bar where every price field is the close, so a 1-bar Breakout always
/// fires long, and `low == close` fires short when forced below.
pub fn flat_bar(ts: i64, close: f64) -> Bar {
    Bar {
        ts,
        open: close,
        high: close,
        low: close,
        close,
        volume: 1.0,
    }
}

pub fn temp_store() -> (TempDir, Arc<Store>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(Store::open(dir.path().join("test.db")).expect("open store"));
    (dir, store)
}

/// A strategy that emits +1 on every flat bar: 1-bar breakout with 1-bar
/// confirmation over bars whose close equals their high.
pub fn always_long() -> Strategy {
    Strategy::Breakout(Breakout::new(BreakoutParams {
        lookback: 1,
        confirm_bars: 1,
    }))
}

/// Deterministic (maker-only, fee-free) paper client for a worker.
pub fn maker_exec(name: &str, store: &Arc<Store>) -> Arc<PaperExec> {
    Arc::new(PaperExec::new(name, store.clone()).with_maker_probability(1.0))
}

/// Deterministic taker-only paper client (0.1% fee on every fill).
pub fn taker_exec(name: &str, store: &Arc<Store>) -> Arc<PaperExec> {
    Arc::new(PaperExec::new(name, store.clone()).with_maker_probability(0.0))
}

pub fn decision_log() -> Arc<DecisionLog> {
    Arc::new(DecisionLog::new())
}
