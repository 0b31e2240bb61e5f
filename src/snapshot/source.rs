// =============================================================================
// Read-through snapshot source
// =============================================================================
//
// The REST collaborator that fetches history and catalog data lives outside
// this crate; it only has to implement `SnapshotSource`. `CachedSource` sits in
// front of it and answers from the cache while entries are fresh.
//
// Catalog data is normalised on the way through:
//   symbols    -> trimmed, upper-cased, empty and duplicate entries removed
//   timeframes -> kept as delivered; names the time grid cannot resolve are
//                 logged
// =============================================================================

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::cache::{self, SnapshotCache};
use crate::market_data::time_grid;
use crate::runtime_config::CacheConfig;
use crate::types::{Candle, Snapshot, TimeframeInfo};

/// Fetch side of the REST collaborator.
pub trait SnapshotSource: Send + Sync {
    fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        count: usize,
    ) -> impl Future<Output = Result<Vec<Candle>>> + Send;

    fn fetch_symbols(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn fetch_timeframes(&self) -> impl Future<Output = Result<Vec<TimeframeInfo>>> + Send;

    fn fetch_price(&self, symbol: &str) -> impl Future<Output = Result<f64>> + Send;
}

/// Everything the cache holds for a source.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotPayload {
    Candles(Vec<Candle>),
    Symbols(Vec<String>),
    Timeframes(Vec<TimeframeInfo>),
    Price(f64),
}

/// Caching wrapper around a [`SnapshotSource`].
pub struct CachedSource<S> {
    source: S,
    cache: Arc<SnapshotCache<SnapshotPayload>>,
    price_ttl: Duration,
}

impl<S: SnapshotSource> CachedSource<S> {
    /// Wrap `source` with a cache built from `config` (sweep started).
    pub fn new(source: S, config: &CacheConfig) -> Self {
        Self {
            source,
            cache: SnapshotCache::spawn(config),
            price_ttl: config.price_ttl(),
        }
    }

    /// Wrap `source` with an existing cache.
    pub fn with_cache(source: S, cache: Arc<SnapshotCache<SnapshotPayload>>, price_ttl: Duration) -> Self {
        Self {
            source,
            cache,
            price_ttl,
        }
    }

    pub fn cache(&self) -> &Arc<SnapshotCache<SnapshotPayload>> {
        &self.cache
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Last `count` candles for `symbol`/`timeframe` as a snapshot.
    pub async fn candles(&self, symbol: &str, timeframe: &str, count: usize) -> Result<Snapshot> {
        let key = cache::candles_key(symbol, timeframe, count);
        let candles = match self.cache.get(&key) {
            Some(SnapshotPayload::Candles(candles)) => candles,
            _ => {
                debug!(key, "cache miss, fetching candles");
                let candles = self
                    .source
                    .fetch_candles(symbol, timeframe, count)
                    .await
                    .with_context(|| format!("failed to fetch candles for {symbol}@{timeframe}"))?;
                self.cache.insert(key, SnapshotPayload::Candles(candles.clone()));
                candles
            }
        };

        Ok(Snapshot {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            candles,
        })
    }

    /// Normalised symbol catalog.
    pub async fn symbols(&self) -> Result<Vec<String>> {
        let key = cache::symbols_key();
        if let Some(SnapshotPayload::Symbols(symbols)) = self.cache.get(&key) {
            return Ok(symbols);
        }

        let raw = self
            .source
            .fetch_symbols()
            .await
            .context("failed to fetch symbol catalog")?;
        let symbols = normalize_symbols(raw);
        self.cache.insert(key, SnapshotPayload::Symbols(symbols.clone()));
        Ok(symbols)
    }

    /// Timeframe catalog; unresolvable names are logged, not dropped.
    pub async fn timeframes(&self) -> Result<Vec<TimeframeInfo>> {
        let key = cache::timeframes_key();
        if let Some(SnapshotPayload::Timeframes(timeframes)) = self.cache.get(&key) {
            return Ok(timeframes);
        }

        let timeframes = self
            .source
            .fetch_timeframes()
            .await
            .context("failed to fetch timeframe catalog")?;
        for tf in &timeframes {
            if time_grid::lookup(&tf.name).is_none() {
                warn!(timeframe = %tf.name, label = %tf.label, "catalog timeframe not on the time grid");
            }
        }
        self.cache
            .insert(key, SnapshotPayload::Timeframes(timeframes.clone()));
        Ok(timeframes)
    }

    /// Last traded price, cached for the shorter price TTL.
    pub async fn price(&self, symbol: &str) -> Result<f64> {
        let key = cache::price_key(symbol);
        if let Some(SnapshotPayload::Price(price)) = self.cache.get(&key) {
            return Ok(price);
        }

        let price = self
            .source
            .fetch_price(symbol)
            .await
            .with_context(|| format!("failed to fetch price for {symbol}"))?;
        self.cache
            .set(key, SnapshotPayload::Price(price), self.price_ttl);
        Ok(price)
    }

    /// Stop the cache sweep.
    pub fn close(&self) {
        self.cache.close();
    }
}

/// Trim, upper-case, drop empties and duplicates (first occurrence wins).
pub fn normalize_symbols(raw: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for symbol in raw {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() || !seen.insert(symbol.clone()) {
            continue;
        }
        out.push(symbol);
    }
    out
}
