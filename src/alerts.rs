//! Price-alert monitor.
//!
//! Fast out-of-band loop (independent of the trading timeframe): every
//! minute, mark each active alert against the latest close and flip it to
//! triggered when its condition holds. Delivery is a log line; the stored
//! email is informational.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::data::DataProvider;
use crate::store::Store;

const CHECK_INTERVAL_SECS: u64 = 60;

pub struct PriceAlertMonitor {
    store: Arc<Store>,
    provider: Arc<dyn DataProvider>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CheckOutcome {
    pub checked: usize,
    pub triggered: usize,
}

impl PriceAlertMonitor {
    pub fn new(store: Arc<Store>, provider: Arc<dyn DataProvider>) -> Self {
        Self { store, provider }
    }

    pub async fn run(self, token: CancellationToken) {
        tracing::info!(interval_secs = CHECK_INTERVAL_SECS, "price alert monitor started");
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(Duration::from_secs(CHECK_INTERVAL_SECS)) => {}
            }
            match self.check_once().await {
                Ok(outcome) if outcome.triggered > 0 => {
                    tracing::info!(
                        checked = outcome.checked,
                        triggered = outcome.triggered,
                        "price alerts triggered"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "price alert check failed"),
            }
        }
        tracing::info!("price alert monitor stopped");
    }

    pub async fn check_once(&self) -> Result<CheckOutcome> {
        let mut outcome = CheckOutcome::default();
        for alert in self.store.list_price_alerts(Some("active"))? {
            outcome.checked += 1;
            let Some((_, price)) = self.provider.last_price(&alert.symbol).await? else {
                continue;
            };
            let hit = match alert.condition.as_str() {
                "above" => price > alert.target_price,
                "below" => price < alert.target_price,
                _ => false,
            };
            if hit {
                self.store.update_alert_status(alert.id, "triggered")?;
                outcome.triggered += 1;
                tracing::info!(
                    symbol = %alert.symbol,
                    condition = %alert.condition,
                    target = alert.target_price,
                    price,
                    email = %alert.email,
                    "price alert triggered"
                );
            }
        }
        Ok(outcome)
    }
}
