//! Bounded in-memory log of per-bar trading decisions.
//!
//! Observability only: the log never feeds back into trading and is lost on
//! restart.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

const DECISION_LOG_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Signal,
    SkipMinNotional,
    SkipCooldown,
    SkipTradingPaused,
    TradeExecuted,
}

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub ts: i64,
    pub bot: String,
    pub symbol: String,
    pub kind: DecisionKind,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_exposure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Default)]
pub struct DecisionLog {
    entries: Mutex<VecDeque<Decision>>,
}

impl DecisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, decision: Decision) {
        let mut entries = self.entries.lock().expect("decision log lock");
        if entries.len() == DECISION_LOG_CAP {
            entries.pop_front();
        }
        entries.push_back(decision);
    }

    /// Newest-first snapshot.
    pub fn snapshot(&self) -> Vec<Decision> {
        let entries = self.entries.lock().expect("decision log lock");
        entries.iter().rev().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().expect("decision log lock").clear();
    }
}
