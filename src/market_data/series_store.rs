use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SeriesError;
use crate::types::{Candle, SeriesKey};

// ---------------------------------------------------------------------------
// Change signal
// ---------------------------------------------------------------------------

/// What a mutation did to the series. Indicator refresh uses this to decide
/// between a tail recompute and a full recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SeriesChange {
    /// Whole sequence swapped.
    Replaced,
    /// A new period was inserted at `index`; `evicted` old candles were
    /// dropped from the front to respect the capacity window.
    Inserted { index: usize, evicted: usize },
    /// An existing period was overwritten in place.
    Amended { index: usize },
    /// Nothing stored: the candle predates a full window.
    Unchanged,
}

impl SeriesChange {
    pub fn is_insert(&self) -> bool {
        matches!(self, Self::Inserted { .. })
    }
}

// ---------------------------------------------------------------------------
// SeriesStore -- copy-on-write candle sequence for one (symbol, timeframe)
// ---------------------------------------------------------------------------

/// Ordered, duplicate-free, capacity-bounded candle sequence for one series.
///
/// The sequence lives behind an `Arc` so [`SeriesStore::snapshot`] is a cheap
/// pointer clone. Writers go through `Arc::make_mut`: when a reader still holds
/// the previous snapshot the writer works on a private copy and swaps it in, so
/// readers only ever see a fully replaced or fully upserted state.
pub struct SeriesStore {
    key: SeriesKey,
    interval: i64,
    capacity: usize,
    candles: RwLock<Arc<Vec<Candle>>>,
    version: AtomicU64,
}

impl SeriesStore {
    /// Create an empty store. `capacity` is clamped to at least one candle.
    pub fn new(key: SeriesKey, interval: i64, capacity: usize) -> Self {
        Self {
            key,
            interval,
            capacity: capacity.max(1),
            candles: RwLock::new(Arc::new(Vec::new())),
            version: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn interval(&self) -> i64 {
        self.interval
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Monotonic counter bumped on every successful mutation.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Replace the whole sequence.
    ///
    /// Candles are validated first; a single bad candle rejects the call and
    /// leaves the current sequence untouched. Duplicates keep the last
    /// occurrence, and only the newest `capacity` candles are retained.
    pub fn replace(&self, candles: Vec<Candle>) -> Result<SeriesChange, SeriesError> {
        for candle in &candles {
            if let Err(e) = candle.validate(self.interval) {
                warn!(key = %self.key, error = %e, "snapshot rejected");
                return Err(e);
            }
        }

        let received = candles.len();
        // Stable sort keeps arrival order among equal keys, so the dedup below
        // can keep the last one.
        let mut sorted = candles;
        sorted.sort_by_key(|c| c.period_start);

        let mut deduped: Vec<Candle> = Vec::with_capacity(sorted.len());
        for candle in sorted {
            match deduped.last_mut() {
                Some(last) if last.period_start == candle.period_start => *last = candle,
                _ => deduped.push(candle),
            }
        }

        if deduped.len() > self.capacity {
            let excess = deduped.len() - self.capacity;
            deduped.drain(..excess);
        }

        let kept = deduped.len();
        {
            let mut guard = self.candles.write();
            *guard = Arc::new(deduped);
            self.version.fetch_add(1, Ordering::AcqRel);
        }

        info!(key = %self.key, received, kept, "series replaced");
        Ok(SeriesChange::Replaced)
    }

    /// Insert a new period or overwrite an existing one.
    ///
    /// Fails with [`SeriesError::EmptySeries`] until the series has been
    /// seeded through [`SeriesStore::replace`]. A new period older than the
    /// oldest candle of a full window would be evicted on arrival, so it is
    /// not stored and the version stays put.
    pub fn upsert(&self, candle: Candle) -> Result<SeriesChange, SeriesError> {
        candle.validate(self.interval)?;

        let mut guard = self.candles.write();
        if guard.is_empty() {
            debug!(key = %self.key, period_start = candle.period_start, "upsert on empty series");
            return Err(SeriesError::EmptySeries);
        }

        let position = guard.binary_search_by_key(&candle.period_start, |c| c.period_start);
        if position == Err(0) && guard.len() >= self.capacity {
            debug!(key = %self.key, period_start = candle.period_start, "candle older than window ignored");
            return Ok(SeriesChange::Unchanged);
        }

        let ring = Arc::make_mut(&mut guard);
        let change = match position {
            Ok(index) => {
                ring[index] = candle;
                SeriesChange::Amended { index }
            }
            Err(index) => {
                ring.insert(index, candle);
                let evicted = ring.len().saturating_sub(self.capacity);
                if evicted > 0 {
                    ring.drain(..evicted);
                }
                SeriesChange::Inserted {
                    index: index.saturating_sub(evicted),
                    evicted,
                }
            }
        };
        self.version.fetch_add(1, Ordering::AcqRel);
        drop(guard);

        Ok(change)
    }

    /// Most recent candle, if any.
    pub fn latest(&self) -> Option<Candle> {
        self.candles.read().last().copied()
    }

    /// Oldest retained candle, if any.
    pub fn first(&self) -> Option<Candle> {
        self.candles.read().first().copied()
    }

    /// Candle for an exact `period_start`.
    pub fn get(&self, period_start: i64) -> Option<Candle> {
        let guard = self.candles.read();
        guard
            .binary_search_by_key(&period_start, |c| c.period_start)
            .ok()
            .map(|i| guard[i])
    }

    /// Immutable view of the current sequence (oldest first).
    pub fn snapshot(&self) -> Arc<Vec<Candle>> {
        Arc::clone(&self.candles.read())
    }

    /// Snapshot together with the version it corresponds to.
    pub fn snapshot_versioned(&self) -> (u64, Arc<Vec<Candle>>) {
        let guard = self.candles.read();
        (self.version.load(Ordering::Acquire), Arc::clone(&guard))
    }

    /// Close prices of the current sequence (oldest first).
    pub fn closes(&self) -> Vec<f64> {
        self.candles.read().iter().map(|c| c.close).collect()
    }

    pub fn len(&self) -> usize {
        self.candles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.read().is_empty()
    }
}

impl std::fmt::Debug for SeriesStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesStore")
            .field("key", &self.key)
            .field("interval", &self.interval)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("version", &self.version())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_candle(period_start: i64, close: f64) -> Candle {
        Candle {
            period_start,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
        }
    }

    fn store(capacity: usize) -> SeriesStore {
        SeriesStore::new(SeriesKey::new("BTCUSDT", "M1"), 60, capacity)
    }

    fn assert_strictly_increasing(candles: &[Candle]) {
        for w in candles.windows(2) {
            assert!(w[0].period_start < w[1].period_start, "{:?}", w);
        }
    }

    #[test]
    fn replace_sorts_and_keeps_last_duplicate() {
        let s = store(10);
        s.replace(vec![
            sample_candle(120, 3.0),
            sample_candle(0, 1.0),
            sample_candle(60, 2.0),
            sample_candle(0, 9.0),
        ])
        .unwrap();

        let snap = s.snapshot();
        assert_eq!(snap.len(), 3);
        assert_strictly_increasing(&snap);
        assert_eq!(snap[0].close, 9.0);
    }

    #[test]
    fn replace_trims_to_capacity_keeping_newest() {
        let s = store(3);
        s.replace((0..5).map(|i| sample_candle(i * 60, 100.0 + i as f64)).collect())
            .unwrap();
        assert_eq!(s.closes(), vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn replace_with_invalid_candle_keeps_previous_state() {
        let s = store(10);
        s.replace(vec![sample_candle(0, 1.0)]).unwrap();
        let version = s.version();

        let mut bad = sample_candle(60, 2.0);
        bad.high = f64::NAN;
        let err = s.replace(vec![sample_candle(120, 3.0), bad]).unwrap_err();
        assert!(matches!(err, SeriesError::InvalidCandle { period_start: 60, .. }));
        assert_eq!(s.closes(), vec![1.0]);
        assert_eq!(s.version(), version);
    }

    #[test]
    fn upsert_on_empty_series_fails() {
        let s = store(10);
        assert_eq!(s.upsert(sample_candle(0, 1.0)), Err(SeriesError::EmptySeries));
        assert!(s.is_empty());
    }

    #[test]
    fn upsert_amends_or_inserts_in_order() {
        let s = store(10);
        s.replace(vec![sample_candle(0, 1.0), sample_candle(120, 3.0)]).unwrap();

        assert_eq!(
            s.upsert(sample_candle(120, 4.0)).unwrap(),
            SeriesChange::Amended { index: 1 }
        );
        assert_eq!(
            s.upsert(sample_candle(60, 2.0)).unwrap(),
            SeriesChange::Inserted { index: 1, evicted: 0 }
        );
        assert_eq!(
            s.upsert(sample_candle(180, 5.0)).unwrap(),
            SeriesChange::Inserted { index: 3, evicted: 0 }
        );
        assert_eq!(s.closes(), vec![1.0, 2.0, 4.0, 5.0]);
        assert_strictly_increasing(&s.snapshot());
    }

    #[test]
    fn upsert_evicts_oldest_beyond_capacity() {
        let s = store(2);
        s.replace(vec![sample_candle(0, 1.0), sample_candle(60, 2.0)]).unwrap();
        let change = s.upsert(sample_candle(120, 3.0)).unwrap();
        assert_eq!(change, SeriesChange::Inserted { index: 1, evicted: 1 });
        assert_eq!(s.closes(), vec![2.0, 3.0]);
    }

    #[test]
    fn upsert_older_than_full_window_is_unchanged() {
        let s = store(2);
        s.replace(vec![sample_candle(60, 2.0), sample_candle(120, 3.0)]).unwrap();
        let version = s.version();

        assert_eq!(s.upsert(sample_candle(0, 1.0)).unwrap(), SeriesChange::Unchanged);
        assert_eq!(s.closes(), vec![2.0, 3.0]);
        assert_eq!(s.version(), version);

        // With room left the same candle is inserted at the front.
        let roomy = store(3);
        roomy.replace(vec![sample_candle(60, 2.0), sample_candle(120, 3.0)]).unwrap();
        assert_eq!(
            roomy.upsert(sample_candle(0, 1.0)).unwrap(),
            SeriesChange::Inserted { index: 0, evicted: 0 }
        );
    }

    #[test]
    fn concurrent_readers_see_whole_sequences() {
        let s = store(400);
        s.replace(vec![sample_candle(0, 1.0)]).unwrap();
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..3 {
                scope.spawn(|| {
                    let mut last_len = 0;
                    while !done.load(Ordering::Acquire) {
                        let (version, snap) = s.snapshot_versioned();
                        assert!(snap.len() <= 400);
                        assert!(snap.len() >= last_len);
                        assert_eq!(snap.len() as u64, version);
                        assert_strictly_increasing(&snap);
                        last_len = snap.len();
                    }
                });
            }

            // Every write is an append, so the version equals the length.
            for i in 1..300_i64 {
                s.upsert(sample_candle(i * 60, 1.0 + i as f64)).unwrap();
            }
            done.store(true, Ordering::Release);
        });

        assert_eq!(s.len(), 300);
        assert_strictly_increasing(&s.snapshot());
    }

    #[test]
    fn upsert_rejects_invalid_candle() {
        let s = store(10);
        s.replace(vec![sample_candle(0, 1.0)]).unwrap();
        let mut bad = sample_candle(60, 2.0);
        bad.low = 5.0;
        assert!(s.upsert(bad).is_err());
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let s = store(10);
        s.replace(vec![sample_candle(0, 1.0)]).unwrap();
        let before = s.snapshot();
        s.upsert(sample_candle(60, 2.0)).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(s.snapshot().len(), 2);
    }

    #[test]
    fn random_upserts_keep_order() {
        let s = store(50);
        s.replace(vec![sample_candle(0, 1.0)]).unwrap();
        // Deterministic scramble of 40 periods, with repeats.
        for i in 0..120_i64 {
            let slot = (i * 37) % 40;
            s.upsert(sample_candle(slot * 60, i as f64 + 1.0)).unwrap();
        }
        let snap = s.snapshot();
        assert_eq!(snap.len(), 40);
        assert_strictly_increasing(&snap);
    }

    #[test]
    fn versioned_snapshot_tracks_mutations() {
        let s = store(10);
        s.replace(vec![sample_candle(0, 1.0)]).unwrap();
        let (v1, snap1) = s.snapshot_versioned();
        s.upsert(sample_candle(60, 2.0)).unwrap();
        let (v2, snap2) = s.snapshot_versioned();
        assert_eq!(v2, v1 + 1);
        assert_eq!((snap1.len(), snap2.len()), (1, 2));
    }

    #[test]
    fn latest_and_get() {
        let s = store(10);
        assert!(s.latest().is_none());
        s.replace(vec![sample_candle(0, 1.0), sample_candle(60, 2.0)]).unwrap();
        assert_eq!(s.latest().map(|c| c.close), Some(2.0));
        assert_eq!(s.get(0).map(|c| c.close), Some(1.0));
        assert!(s.get(30).is_none());
    }
}
