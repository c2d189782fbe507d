//! Read-through bar cache over the persistence store.
//!
//! Historical bars never change, so cached rows never expire; the cache is
//! only bypassed when it holds fewer bars than requested.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use super::{Bar, DataProvider};
use crate::store::Store;

pub struct CachedProvider {
    inner: Arc<dyn DataProvider>,
    store: Arc<Store>,
    source: String,
}

impl CachedProvider {
    pub fn new(inner: Arc<dyn DataProvider>, store: Arc<Store>, source: impl Into<String>) -> Self {
        Self {
            inner,
            store,
            source: source.into(),
        }
    }
}

#[async_trait]
impl DataProvider for CachedProvider {
    async fn history(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Bar>> {
        if let Some(coverage) = self.store.get_bar_coverage(symbol, timeframe)? {
            if coverage.count >= limit {
                let cached = self.store.get_bars(symbol, timeframe, None, None, None)?;
                if cached.len() >= limit {
                    return Ok(cached[cached.len() - limit..].to_vec());
                }
            }
        }

        let bars = match self.inner.history(symbol, timeframe, limit).await {
            Ok(bars) => bars,
            Err(e) => {
                // Vendor failure: serve whatever the cache holds, if
                // anything, so a step is skipped softly rather than failed.
                let cached = self.store.get_bars(symbol, timeframe, None, None, None)?;
                if cached.is_empty() {
                    return Err(e);
                }
                tracing::warn!(%symbol, %timeframe, error = %e, "vendor fetch failed, serving cached bars");
                return Ok(cached[cached.len().saturating_sub(limit)..].to_vec());
            }
        };
        if !bars.is_empty() {
            self.store
                .store_bars(symbol, timeframe, &bars, &self.source)?;
        }
        Ok(bars)
    }

    async fn last_price(&self, symbol: &str) -> Result<Option<(i64, f64)>> {
        // Live marks always come from the underlying vendor.
        self.inner.last_price(symbol).await
    }
}
