// =============================================================================
// Tick Folder — folds live price ticks into the candle series
// =============================================================================
//
// For a tick at period p (aligned on the series grid) and series head `last`:
//
//   series empty          => dropped (a snapshot must seed the series first)
//   p == last.start       => amendment: close = price, high/low widened,
//                            volume accumulated, open untouched
//   p >  last.start       => new period: forward-fill (last.start, p) at
//                            last.close, then open a flat candle at price
//   p <  last.start       => stale: dropped and counted, never applied
//
// A period opened by a tick is remembered for the session and never opened a
// second time; later ticks for it can only amend.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SeriesError;
use crate::market_data::gap_engine::{self, FillPolicy};
use crate::market_data::series_store::{SeriesChange, SeriesStore};
use crate::market_data::time_grid;
use crate::types::{Candle, Tick};

/// Where a tick should go, decided against the current series head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickRoute {
    /// No series yet.
    Empty,
    /// Price or volume unusable.
    Rejected,
    /// Older than the open period.
    Stale,
    /// Period already opened once this session and no longer the head.
    Duplicate,
    /// Amend the open candle at `period_start`.
    Amend { period_start: i64 },
    /// Open a new candle at `period_start`.
    Open { period_start: i64 },
}

/// Coalescable in-period update. Merging keeps the price envelope and the
/// summed volume so no extreme is lost while amendments are throttled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Amendment {
    pub period_start: i64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
}

impl Amendment {
    pub fn from_tick(period_start: i64, tick: &Tick) -> Self {
        Self {
            period_start,
            close: tick.price,
            high: tick.price,
            low: tick.price,
            volume: tick.volume.unwrap_or(0.0),
        }
    }

    /// Fold a newer amendment into this one. Amendments for different
    /// periods do not merge; the newer one wins.
    pub fn merge(self, newer: Amendment) -> Amendment {
        if newer.period_start != self.period_start {
            return newer;
        }
        Amendment {
            period_start: self.period_start,
            close: newer.close,
            high: self.high.max(newer.high),
            low: self.low.min(newer.low),
            volume: self.volume + newer.volume,
        }
    }
}

/// Result of folding one tick (or one coalesced amendment).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FoldOutcome {
    Ignored,
    Rejected,
    Stale,
    Duplicate,
    Amended(SeriesChange),
    Opened { change: SeriesChange, filled: usize },
}

/// Serialisable view of the per-series feed counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedStats {
    pub late_ticks: u64,
    pub late_candles: u64,
    pub duplicate_opens: u64,
    pub rejected_ticks: u64,
    pub dropped_empty: u64,
    pub amendments: u64,
    pub opens: u64,
    pub filled: u64,
}

/// Per-series tick folding state.
pub struct TickFolder {
    policy: FillPolicy,
    opened: Mutex<BTreeSet<i64>>,
    late_ticks: AtomicU64,
    late_candles: AtomicU64,
    duplicate_opens: AtomicU64,
    rejected_ticks: AtomicU64,
    dropped_empty: AtomicU64,
    amendments: AtomicU64,
    opens: AtomicU64,
    filled: AtomicU64,
}

impl TickFolder {
    pub fn new(policy: FillPolicy) -> Self {
        Self {
            policy,
            opened: Mutex::new(BTreeSet::new()),
            late_ticks: AtomicU64::new(0),
            late_candles: AtomicU64::new(0),
            duplicate_opens: AtomicU64::new(0),
            rejected_ticks: AtomicU64::new(0),
            dropped_empty: AtomicU64::new(0),
            amendments: AtomicU64::new(0),
            opens: AtomicU64::new(0),
            filled: AtomicU64::new(0),
        }
    }

    /// Classify `tick` against the head of `store`. Counts drops but does not
    /// mutate the series.
    pub fn route(&self, store: &SeriesStore, tick: &Tick) -> TickRoute {
        let volume_ok = tick.volume.map_or(true, |v| v.is_finite() && v >= 0.0);
        if !tick.price.is_finite() || tick.price <= 0.0 || !volume_ok {
            self.rejected_ticks.fetch_add(1, Ordering::Relaxed);
            warn!(key = %store.key(), price = tick.price, "tick rejected");
            return TickRoute::Rejected;
        }

        let Some(last) = store.latest() else {
            self.dropped_empty.fetch_add(1, Ordering::Relaxed);
            return TickRoute::Empty;
        };

        let period_start = time_grid::align_ms(tick.ts_ms, store.interval());
        if period_start == last.period_start {
            TickRoute::Amend { period_start }
        } else if period_start > last.period_start {
            if self.opened.lock().contains(&period_start) {
                self.duplicate_opens.fetch_add(1, Ordering::Relaxed);
                debug!(key = %store.key(), period_start, "period already opened this session");
                return TickRoute::Duplicate;
            }
            TickRoute::Open { period_start }
        } else {
            let late = self.late_ticks.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                key = %store.key(),
                period_start,
                head = last.period_start,
                late_ticks = late,
                "stale tick dropped"
            );
            TickRoute::Stale
        }
    }

    /// Route and apply `tick` immediately (no throttling).
    pub fn apply(&self, store: &SeriesStore, tick: &Tick) -> Result<FoldOutcome, SeriesError> {
        match self.route(store, tick) {
            TickRoute::Empty => Ok(FoldOutcome::Ignored),
            TickRoute::Rejected => Ok(FoldOutcome::Rejected),
            TickRoute::Stale => Ok(FoldOutcome::Stale),
            TickRoute::Duplicate => Ok(FoldOutcome::Duplicate),
            TickRoute::Amend { period_start } => {
                self.amend(store, Amendment::from_tick(period_start, tick))
            }
            TickRoute::Open { period_start } => self.open(store, period_start, tick),
        }
    }

    /// Apply a (possibly coalesced) amendment to the candle it targets.
    ///
    /// The target may no longer be the head if a newer period opened in the
    /// meantime; it is still amended as long as it is stored.
    pub fn amend(&self, store: &SeriesStore, amendment: Amendment) -> Result<FoldOutcome, SeriesError> {
        let Some(current) = store.get(amendment.period_start) else {
            self.late_ticks.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %store.key(),
                period_start = amendment.period_start,
                "amendment target no longer stored"
            );
            return Ok(FoldOutcome::Stale);
        };

        let candle = Candle {
            period_start: current.period_start,
            open: current.open,
            high: current.high.max(amendment.high),
            low: current.low.min(amendment.low),
            close: amendment.close,
            volume: current.volume + amendment.volume,
        };
        let change = store.upsert(candle)?;
        self.amendments.fetch_add(1, Ordering::Relaxed);
        Ok(FoldOutcome::Amended(change))
    }

    /// Open the period `period_start` with `tick`, forward-filling the slots
    /// between the current head and it.
    pub fn open(
        &self,
        store: &SeriesStore,
        period_start: i64,
        tick: &Tick,
    ) -> Result<FoldOutcome, SeriesError> {
        let last = store.latest().ok_or(SeriesError::EmptySeries)?;
        if period_start < last.period_start {
            // Head moved past the tick since routing.
            let late = self.late_ticks.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                key = %store.key(),
                period_start,
                head = last.period_start,
                late_ticks = late,
                "stale open dropped"
            );
            return Ok(FoldOutcome::Stale);
        }
        if period_start == last.period_start {
            return self.amend(store, Amendment::from_tick(period_start, tick));
        }

        let filled =
            gap_engine::fill_between(store, last.period_start, period_start, last.close, self.policy)?;
        let change = store.upsert(Candle::flat(
            period_start,
            tick.price,
            tick.volume.unwrap_or(0.0),
        ))?;

        {
            let mut opened = self.opened.lock();
            opened.insert(period_start);
            if let Some(first) = store.first() {
                let keep = opened.split_off(&first.period_start);
                *opened = keep;
            }
        }

        self.opens.fetch_add(1, Ordering::Relaxed);
        self.filled.fetch_add(filled as u64, Ordering::Relaxed);
        debug!(key = %store.key(), period_start, filled, "period opened by tick");
        Ok(FoldOutcome::Opened { change, filled })
    }

    /// Count a live candle dropped for arriving past its delay tolerance.
    pub fn record_late_candle(&self) -> u64 {
        self.late_candles.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            late_ticks: self.late_ticks.load(Ordering::Relaxed),
            late_candles: self.late_candles.load(Ordering::Relaxed),
            duplicate_opens: self.duplicate_opens.load(Ordering::Relaxed),
            rejected_ticks: self.rejected_ticks.load(Ordering::Relaxed),
            dropped_empty: self.dropped_empty.load(Ordering::Relaxed),
            amendments: self.amendments.load(Ordering::Relaxed),
            opens: self.opens.load(Ordering::Relaxed),
            filled: self.filled.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for TickFolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickFolder")
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SeriesKey;

    fn tick(ts_secs: i64, price: f64) -> Tick {
        Tick {
            symbol: "BTCUSDT".into(),
            ts_ms: ts_secs * 1_000,
            price,
            volume: None,
        }
    }

    fn seeded(candles: Vec<Candle>) -> SeriesStore {
        let s = SeriesStore::new(SeriesKey::new("BTCUSDT", "M1"), 60, 500);
        s.replace(candles).unwrap();
        s
    }

    #[test]
    fn ticks_on_empty_series_are_dropped() {
        let s = SeriesStore::new(SeriesKey::new("BTCUSDT", "M1"), 60, 500);
        let folder = TickFolder::new(FillPolicy::default());
        assert_eq!(folder.apply(&s, &tick(0, 100.0)).unwrap(), FoldOutcome::Ignored);
        assert!(s.is_empty());
        assert_eq!(folder.stats().dropped_empty, 1);
    }

    #[test]
    fn amend_then_open_scenario() {
        // Seeded with the period at 0 opened at 100.
        let s = seeded(vec![Candle::flat(0, 100.0, 0.0)]);
        let folder = TickFolder::new(FillPolicy::default());

        folder.apply(&s, &tick(30, 105.0)).unwrap();
        let outcome = folder.apply(&s, &tick(61, 103.0)).unwrap();
        assert!(matches!(outcome, FoldOutcome::Opened { filled: 0, .. }));

        let snap = s.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(
            snap[0],
            Candle {
                period_start: 0,
                open: 100.0,
                high: 105.0,
                low: 100.0,
                close: 105.0,
                volume: 0.0,
            }
        );
        assert_eq!(snap[1].period_start, 60);
        assert_eq!(snap[1].open, 103.0);
    }

    #[test]
    fn amendment_never_touches_open() {
        let s = seeded(vec![Candle {
            period_start: 0,
            open: 50.0,
            high: 52.0,
            low: 49.0,
            close: 51.0,
            volume: 1.0,
        }]);
        let folder = TickFolder::new(FillPolicy::default());
        let mut t = tick(10, 45.0);
        t.volume = Some(2.0);
        folder.apply(&s, &t).unwrap();

        let c = s.latest().unwrap();
        assert_eq!(c.open, 50.0);
        assert_eq!(c.low, 45.0);
        assert_eq!(c.high, 52.0);
        assert_eq!(c.close, 45.0);
        assert_eq!(c.volume, 3.0);
    }

    #[test]
    fn new_period_forward_fills_from_last_close() {
        let s = seeded(vec![Candle::flat(0, 10.0, 1.0)]);
        let folder = TickFolder::new(FillPolicy::default());
        let outcome = folder.apply(&s, &tick(245, 12.0)).unwrap();
        assert!(matches!(outcome, FoldOutcome::Opened { filled: 3, .. }));

        let snap = s.snapshot();
        let starts: Vec<i64> = snap.iter().map(|c| c.period_start).collect();
        assert_eq!(starts, vec![0, 60, 120, 180, 240]);
        assert!(snap[1..4].iter().all(|c| c.is_synthetic() && c.close == 10.0));
    }

    #[test]
    fn stale_ticks_are_counted_and_dropped() {
        let s = seeded(vec![Candle::flat(0, 10.0, 1.0), Candle::flat(60, 11.0, 1.0)]);
        let folder = TickFolder::new(FillPolicy::default());
        let before = s.snapshot();

        assert_eq!(folder.apply(&s, &tick(30, 99.0)).unwrap(), FoldOutcome::Stale);
        assert_eq!(folder.apply(&s, &tick(5, 1.0)).unwrap(), FoldOutcome::Stale);
        assert_eq!(*s.snapshot(), *before);
        assert_eq!(folder.stats().late_ticks, 2);
    }

    #[test]
    fn open_after_head_moved_only_amends_the_head() {
        let s = seeded(vec![Candle::flat(0, 10.0, 1.0)]);
        let folder = TickFolder::new(FillPolicy::default());
        let early = tick(65, 11.0);
        let route = folder.route(&s, &early);
        assert_eq!(route, TickRoute::Open { period_start: 60 });

        // A live candle lands two periods ahead before the open runs.
        s.upsert(Candle::flat(120, 12.0, 2.0)).unwrap();
        let before = s.snapshot();
        assert_eq!(folder.open(&s, 60, &early).unwrap(), FoldOutcome::Stale);
        assert_eq!(*s.snapshot(), *before);
        assert_eq!(folder.stats().late_ticks, 1);

        // Same period as the head folds into it.
        let outcome = folder.open(&s, 120, &tick(130, 13.0)).unwrap();
        assert!(matches!(outcome, FoldOutcome::Amended(_)));
        assert_eq!(s.latest().map(|c| c.close), Some(13.0));
    }

    #[test]
    fn period_is_not_reopened_after_rollback() {
        let s = seeded(vec![Candle::flat(0, 10.0, 1.0)]);
        let folder = TickFolder::new(FillPolicy::default());
        folder.apply(&s, &tick(60, 11.0)).unwrap();

        // A snapshot rolls the head back behind the tick-opened period.
        s.replace(vec![Candle::flat(0, 10.0, 1.0)]).unwrap();
        assert_eq!(folder.apply(&s, &tick(70, 12.0)).unwrap(), FoldOutcome::Duplicate);
        assert_eq!(folder.stats().duplicate_opens, 1);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn invalid_ticks_are_rejected() {
        let s = seeded(vec![Candle::flat(0, 10.0, 1.0)]);
        let folder = TickFolder::new(FillPolicy::default());
        assert_eq!(folder.apply(&s, &tick(10, f64::NAN)).unwrap(), FoldOutcome::Rejected);
        let mut t = tick(10, 10.0);
        t.volume = Some(-1.0);
        assert_eq!(folder.apply(&s, &t).unwrap(), FoldOutcome::Rejected);
        assert_eq!(folder.stats().rejected_ticks, 2);
    }

    #[test]
    fn merged_amendments_keep_envelope() {
        let a = Amendment::from_tick(0, &tick(1, 10.0));
        let b = Amendment::from_tick(0, &tick(2, 14.0));
        let c = Amendment::from_tick(0, &tick(3, 8.0));
        let d = Amendment::from_tick(0, &tick(4, 11.0));
        let merged = a.merge(b).merge(c).merge(d);
        assert_eq!(merged.close, 11.0);
        assert_eq!(merged.high, 14.0);
        assert_eq!(merged.low, 8.0);
    }

    #[test]
    fn sub_second_timestamps_truncate() {
        let s = seeded(vec![Candle::flat(0, 10.0, 1.0)]);
        let folder = TickFolder::new(FillPolicy::default());
        let t = Tick {
            symbol: "BTCUSDT".into(),
            ts_ms: 59_999,
            price: 10.5,
            volume: None,
        };
        assert!(matches!(folder.apply(&s, &t).unwrap(), FoldOutcome::Amended(_)));
        assert_eq!(s.len(), 1);
    }
}
