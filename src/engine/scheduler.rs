//! Background loops: bar-aligned portfolio stepping plus the slow
//! optimizer/evolver cadences.
//!
//! Every loop observes the shutdown token between sleeps, so the process
//! exits within one polling interval of ctrl-c. At most one portfolio step
//! is in flight, and steps across bars happen in timestamp order.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::Portfolio;
use crate::optimize::{evolve::Evolver, Optimizer};

/// Seconds past the bar close before stepping, giving the vendor time to
/// publish the bar.
const BAR_CLOSE_BUFFER_SECS: i64 = 2;

/// Backoff after a failed step.
const STEP_ERROR_BACKOFF_SECS: u64 = 5;

/// Backoff after a failed optimizer/evolver cycle.
const CYCLE_ERROR_BACKOFF_SECS: u64 = 3600;

/// Step the portfolio once a few seconds after each bar boundary.
pub async fn run_trading_loop(
    portfolio: Arc<Mutex<Portfolio>>,
    tf_seconds: i64,
    token: CancellationToken,
) {
    tracing::info!(tf_seconds, "trading loop started");
    loop {
        let now = chrono::Utc::now().timestamp();
        let next_bar = (now / tf_seconds + 1) * tf_seconds + BAR_CLOSE_BUFFER_SECS;
        let sleep_secs = (next_bar - now).max(1) as u64;

        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
        }

        let mut portfolio = portfolio.lock().await;
        portfolio.step().await;
        drop(portfolio);

        // A step that overran its bar backs off briefly rather than
        // spinning on the already-passed boundary.
        if chrono::Utc::now().timestamp() >= next_bar + tf_seconds {
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(Duration::from_secs(STEP_ERROR_BACKOFF_SECS)) => {}
            }
        }
    }
    tracing::info!("trading loop stopped");
}

/// Grid-optimize continuously on a slow cadence.
pub async fn run_optimizer_loop(optimizer: Optimizer, interval_hours: u64, token: CancellationToken) {
    tracing::info!(interval_hours, "optimizer loop started");
    loop {
        let sleep_secs = match optimizer.run_full_sweep().await {
            Ok(saved) => {
                tracing::info!(saved, "optimization cycle complete");
                interval_hours * 3600
            }
            Err(e) => {
                tracing::warn!(error = %e, "optimization cycle failed");
                CYCLE_ERROR_BACKOFF_SECS
            }
        };
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
        }
    }
    tracing::info!("optimizer loop stopped");
}

/// Evolve generations continuously on a slow cadence.
pub async fn run_evolver_loop(mut evolver: Evolver, interval_hours: u64, token: CancellationToken) {
    tracing::info!(interval_hours, "evolver loop started");
    loop {
        let sleep_secs = match evolver.evolve_generation().await {
            Ok(best) => {
                tracing::info!(
                    generation = evolver.generation(),
                    best_score = best.map(|s| format!("{s:.1}")).unwrap_or_default(),
                    "evolution generation complete"
                );
                interval_hours * 3600
            }
            Err(e) => {
                tracing::warn!(error = %e, "evolution generation failed");
                CYCLE_ERROR_BACKOFF_SECS
            }
        };
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
        }
    }
    tracing::info!("evolver loop stopped");
}
