// =============================================================================
// Snapshot Cache — TTL-bounded store for REST-fetched snapshots
// =============================================================================
//
// Entries are keyed by a deterministic request signature:
//
//   candles:BTCUSDT:M1:500    symbols    timeframes    price:BTCUSDT
//
// Expiry is enforced three ways:
//   - `get` removes an expired entry and reports a miss
//   - a background sweep (owned by the cache, stopped by `close`) removes
//     every expired entry on a fixed schedule
//   - inserting a new key into a full cache evicts the oldest insertion
//     (insertion order, not LRU)
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::runtime_config::CacheConfig;

pub fn candles_key(symbol: &str, timeframe: &str, count: usize) -> String {
    format!("candles:{symbol}:{timeframe}:{count}")
}

pub fn symbols_key() -> String {
    "symbols".to_string()
}

pub fn timeframes_key() -> String {
    "timeframes".to_string()
}

pub fn price_key(symbol: &str) -> String {
    format!("price:{symbol}")
}

/// A cached value with its lifetime.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub inserted_at: Instant,
    pub expires_at: Instant,
    seq: u64,
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Hit/miss/eviction counters for dashboards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evicted: u64,
}

struct CacheInner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    /// Insertion sequence -> key, oldest first.
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl<T> CacheInner<T> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }
}

/// TTL key-value store. Construct explicitly, tear down with [`SnapshotCache::close`].
pub struct SnapshotCache<T> {
    default_ttl: Duration,
    capacity: usize,
    inner: Mutex<CacheInner<T>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
}

impl<T> SnapshotCache<T>
where
    T: Clone + Send + 'static,
{
    /// Cache without a background sweep. `capacity` is clamped to at least 1.
    pub fn new(default_ttl: Duration, capacity: usize) -> Self {
        Self {
            default_ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
            sweeper: Mutex::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Build from config and start the periodic sweep. Must be called from
    /// within a tokio runtime.
    pub fn spawn(config: &CacheConfig) -> Arc<Self> {
        let cache = Arc::new(Self::new(config.ttl(), config.capacity));
        cache.start_sweeper(config.sweep_interval());
        cache
    }

    /// Start (or restart) the background sweep every `every`.
    pub fn start_sweeper(self: &Arc<Self>, every: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    return;
                };
                let removed = cache.sweep();
                if removed > 0 {
                    debug!(removed, remaining = cache.len(), "cache sweep");
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
        info!(every_ms = every.as_millis() as u64, "snapshot cache sweeper started");
    }

    /// Value for `key` if present and not expired. Expired entries are
    /// removed on the spot.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.remove(key);
            self.expired.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key, "cache entry expired on read");
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        inner.entries.get(key).map(|e| e.data.clone())
    }

    /// Full entry for `key` without expiry handling or stats.
    pub fn peek(&self, key: &str) -> Option<CacheEntry<T>> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Insert with the default TTL.
    pub fn insert(&self, key: impl Into<String>, value: T) {
        self.set(key, value, self.default_ttl);
    }

    /// Insert with an explicit TTL. Inserting a new key into a full cache
    /// evicts the oldest-inserted entry first; overwriting a key moves it to
    /// the back of the insertion order.
    pub fn set(&self, key: impl Into<String>, value: T, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let replaced = inner.remove(&key).is_some();
        if !replaced && inner.entries.len() >= self.capacity {
            let oldest = inner.order.iter().next().map(|(_, k)| k.clone());
            if let Some(oldest) = oldest {
                inner.remove(&oldest);
                self.evicted.fetch_add(1, Ordering::Relaxed);
                debug!(evicted = %oldest, "cache full, oldest entry evicted");
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                data: value,
                inserted_at: now,
                expires_at: now + ttl,
                seq,
            },
        );
    }

    pub fn remove(&self, key: &str) -> Option<T> {
        self.inner.lock().remove(key).map(|e| e.data)
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let stale: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            inner.remove(key);
        }
        self.expired.fetch_add(stale.len() as u64, Ordering::Relaxed);
        stale.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().is_some()
    }

    /// Stop the background sweep. Cached data stays readable.
    pub fn close(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            info!("snapshot cache sweeper stopped");
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

impl<T> Drop for SnapshotCache<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}
