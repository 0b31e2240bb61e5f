// =============================================================================
// Market Engine — application-facing facade over every candle series
// =============================================================================
//
// Owns one slot per (symbol, timeframe). A slot bundles the candle store, the
// tick folder, a writer mutex and the cached indicator map for that series.
//
// Inbound:
//   apply_snapshot(Snapshot)        -> replace + gap fill
//   on_candle(key, Candle, recv_at) -> arrival classification -> upsert
//   on_tick(Tick)                   -> fan out to every timeframe of the symbol
//                                      amendments: throttled (100 ms)
//                                      new periods: applied immediately
//
// Outbound:
//   snapshot / indicators / timing_stats / feed_stats per key, plus a
//   coalesced `SeriesUpdate` stream (16 ms) for renderers.
//
// Thread safety:
//   - the key map is only locked to look up, insert or remove a slot `Arc`
//   - one writer per slot (`SeriesSlot::writer`), readers use copy-on-write
//     snapshots and never wait on a writer
//   - AtomicU64 for lock-free version tracking
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SeriesError;
use crate::indicators::{self, IndicatorMap, IndicatorSpec};
use crate::market_data::gap_engine::{self, Arrival};
use crate::market_data::time_grid::{self, Resolution};
use crate::market_data::{
    Amendment, FeedStats, FillPolicy, FoldOutcome, SeriesChange, SeriesStore, TickFolder,
    TickRoute, TimingStats,
};
use crate::runtime_config::EngineConfig;
use crate::snapshot::{CachedSource, SnapshotSource};
use crate::throttle::{Sink, UpdateThrottle};
use crate::types::{Candle, SeriesKey, Snapshot, Tick};

// =============================================================================
// Outbound notification
// =============================================================================

/// Coalesced change notification for renderers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesUpdate {
    pub key: SeriesKey,
    /// Store version after the change.
    pub version: u64,
    pub change: SeriesChange,
}

impl SeriesUpdate {
    /// Fold a newer update into a pending one. Only repeated amendments of
    /// the same candle stay incremental; anything else asks for a full redraw.
    fn coalesce(self, newer: SeriesUpdate) -> SeriesUpdate {
        let change = match (self.change, newer.change) {
            (SeriesChange::Amended { index: a }, SeriesChange::Amended { index: b }) if a == b => {
                newer.change
            }
            _ => SeriesChange::Replaced,
        };
        SeriesUpdate { change, ..newer }
    }
}

/// What happened to a live candle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CandleOutcome {
    /// Existing slot overwritten (or back-filled) within the delay tolerance.
    Applied(SeriesChange),
    /// New head; `filled` synthetic candles were written before it.
    Opened { change: SeriesChange, filled: usize },
    /// Past the delay tolerance; dropped.
    Late,
}

/// Per-series result of routing one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickDisposition {
    /// In-period amendment queued on the throttle.
    Queued,
    /// Applied or dropped synchronously.
    Applied(FoldOutcome),
    /// The series rejected the mutation.
    Failed(SeriesError),
}

// =============================================================================
// SeriesSlot
// =============================================================================

struct IndicatorCache {
    version: u64,
    map: Arc<IndicatorMap>,
}

/// Everything the engine keeps for one series.
struct SeriesSlot {
    store: SeriesStore,
    resolution: Resolution,
    folder: TickFolder,
    /// Serialises compound mutations (gap fill + upsert).
    writer: Mutex<()>,
    /// Change that produced `(version)`, for incremental indicator refresh.
    last_change: Mutex<Option<(u64, SeriesChange)>>,
    indicators: Mutex<Option<IndicatorCache>>,
}

// =============================================================================
// MarketEngine
// =============================================================================

pub struct MarketEngine {
    config: EngineConfig,
    fill_policy: FillPolicy,

    // ── Series ──────────────────────────────────────────────────────────
    series: RwLock<HashMap<SeriesKey, Arc<SeriesSlot>>>,

    // ── Throttles ───────────────────────────────────────────────────────
    amendments: UpdateThrottle<SeriesKey, Amendment>,
    notifications: UpdateThrottle<SeriesKey, SeriesUpdate>,
    updates_tx: mpsc::UnboundedSender<SeriesUpdate>,

    // ── Version tracking ────────────────────────────────────────────────
    /// Bumped on every mutation of any series.
    state_version: AtomicU64,
}

impl MarketEngine {
    /// Build an engine and the receiving end of its notification stream.
    pub fn new(config: EngineConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<SeriesUpdate>) {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let engine = Arc::new_cyclic(|weak: &Weak<MarketEngine>| {
            let weak = weak.clone();
            let amend_sink: Sink<SeriesKey, Amendment> =
                Arc::new(move |key: SeriesKey, amendment: Amendment| {
                    if let Some(engine) = weak.upgrade() {
                        engine.apply_amendment(&key, amendment);
                    }
                });

            let notify_tx = updates_tx.clone();
            let notify_sink: Sink<SeriesKey, SeriesUpdate> =
                Arc::new(move |key: SeriesKey, update: SeriesUpdate| {
                    if notify_tx.send(update).is_err() {
                        debug!(key = %key, "no notification receiver");
                    }
                });

            MarketEngine {
                fill_policy: config.fill_policy(),
                amendments: UpdateThrottle::new("amendments", config.amend_window(), amend_sink),
                notifications: UpdateThrottle::new("render", config.render_window(), notify_sink),
                config,
                series: RwLock::new(HashMap::new()),
                updates_tx,
                state_version: AtomicU64::new(0),
            }
        });

        info!(
            series_capacity = engine.config.series_capacity,
            indicators = engine.config.indicators.len(),
            "market engine started"
        );
        (engine, updates_rx)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state_version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed)
    }

    /// Every loaded series, sorted.
    pub fn keys(&self) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = self.series.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Replace a series with a REST snapshot and forward-fill its gaps. The
    /// series is created on its first valid snapshot. Returns the number of
    /// synthetic candles written.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Result<usize, SeriesError> {
        let key = snapshot.key();
        let interval =
            time_grid::lookup(&key.timeframe).unwrap_or(time_grid::FALLBACK_INTERVAL_SECS);
        for candle in &snapshot.candles {
            candle.validate(interval)?;
        }

        let slot = self.slot_or_create(&key);
        let _writer = slot.writer.lock();

        // The snapshot supersedes anything still waiting in the window.
        self.amendments.cancel(&key);
        slot.store.replace(snapshot.candles)?;
        let filled = gap_engine::fill(&slot.store, self.fill_policy)?;
        self.record(&slot, SeriesChange::Replaced);

        info!(key = %key, len = slot.store.len(), filled, "snapshot applied");
        Ok(filled)
    }

    /// Fetch `count` candles through the cached source and apply them.
    pub async fn load<S: SnapshotSource>(
        &self,
        source: &CachedSource<S>,
        key: &SeriesKey,
        count: usize,
    ) -> anyhow::Result<usize> {
        let snapshot = source.candles(&key.symbol, &key.timeframe, count).await?;
        Ok(self.apply_snapshot(snapshot)?)
    }

    /// Live candle received now.
    pub fn on_live_candle(&self, key: &SeriesKey, candle: Candle) -> Result<CandleOutcome, SeriesError> {
        self.on_candle(key, candle, Utc::now().timestamp())
    }

    /// Live candle received at `received_at` (seconds).
    pub fn on_candle(
        &self,
        key: &SeriesKey,
        candle: Candle,
        received_at: i64,
    ) -> Result<CandleOutcome, SeriesError> {
        let slot = self
            .slot(key)
            .ok_or_else(|| SeriesError::UnknownSeries(key.clone()))?;
        let _writer = slot.writer.lock();

        let latest = slot.store.latest().ok_or(SeriesError::EmptySeries)?;
        let interval = slot.store.interval();
        let arrival = gap_engine::classify_arrival(
            latest.period_start,
            candle.period_start,
            received_at,
            interval,
            self.config.max_delay(interval),
        );

        match arrival {
            Arrival::Late => {
                let late = slot.folder.record_late_candle();
                warn!(
                    key = %key,
                    period_start = candle.period_start,
                    received_at,
                    late_candles = late,
                    "late candle dropped"
                );
                Ok(CandleOutcome::Late)
            }
            Arrival::OnTime => {
                candle.validate(interval)?;
                // Ticks queued for this period predate the live candle.
                if let Some(pending) = self.amendments.flush(key) {
                    if pending.period_start == candle.period_start {
                        debug!(key = %key, period_start = candle.period_start, "pending amendment superseded");
                    } else {
                        self.amend_locked(key, &slot, pending);
                    }
                }
                let change = slot.store.upsert(candle)?;
                self.record(&slot, change);
                Ok(CandleOutcome::Applied(change))
            }
            Arrival::NewPeriod => {
                candle.validate(interval)?;
                self.flush_pending_locked(key, &slot);
                let filled = gap_engine::fill_between(
                    &slot.store,
                    latest.period_start,
                    candle.period_start,
                    latest.close,
                    self.fill_policy,
                )?;
                let change = slot.store.upsert(candle)?;
                self.record(&slot, change);
                debug!(key = %key, period_start = candle.period_start, filled, "candle opened period");
                Ok(CandleOutcome::Opened { change, filled })
            }
        }
    }

    /// Route a tick to every loaded timeframe of its symbol.
    pub fn on_tick(&self, tick: &Tick) -> Vec<(SeriesKey, TickDisposition)> {
        let slots: Vec<(SeriesKey, Arc<SeriesSlot>)> = self
            .series
            .read()
            .iter()
            .filter(|(k, _)| k.symbol == tick.symbol)
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();

        slots
            .into_iter()
            .map(|(key, slot)| {
                let disposition = self.fold_tick(&key, &slot, tick);
                (key, disposition)
            })
            .collect()
    }

    fn fold_tick(&self, key: &SeriesKey, slot: &SeriesSlot, tick: &Tick) -> TickDisposition {
        match slot.folder.route(&slot.store, tick) {
            TickRoute::Empty => TickDisposition::Applied(FoldOutcome::Ignored),
            TickRoute::Rejected => TickDisposition::Applied(FoldOutcome::Rejected),
            TickRoute::Stale => TickDisposition::Applied(FoldOutcome::Stale),
            TickRoute::Duplicate => TickDisposition::Applied(FoldOutcome::Duplicate),
            TickRoute::Amend { period_start } => {
                let amendment = Amendment::from_tick(period_start, tick);
                if self
                    .amendments
                    .push_with(key.clone(), amendment, Amendment::merge)
                {
                    TickDisposition::Queued
                } else {
                    TickDisposition::Applied(FoldOutcome::Ignored)
                }
            }
            TickRoute::Open { period_start } => {
                let _writer = slot.writer.lock();
                self.flush_pending_locked(key, slot);
                match slot.folder.open(&slot.store, period_start, tick) {
                    Ok(outcome) => {
                        match outcome {
                            FoldOutcome::Opened { change, .. } | FoldOutcome::Amended(change) => {
                                self.record(slot, change)
                            }
                            _ => {}
                        }
                        TickDisposition::Applied(outcome)
                    }
                    Err(e) => {
                        warn!(key = %key, period_start, error = %e, "tick open failed");
                        TickDisposition::Failed(e)
                    }
                }
            }
        }
    }

    /// Throttle sink: apply a coalesced amendment.
    fn apply_amendment(&self, key: &SeriesKey, amendment: Amendment) {
        let Some(slot) = self.slot(key) else {
            debug!(key = %key, "amendment for unloaded series dropped");
            return;
        };
        let _writer = slot.writer.lock();
        self.amend_locked(key, &slot, amendment);
    }

    /// Apply the pending amendment for `key` before a period transition so the
    /// closing candle keeps its final values. Caller holds the slot writer.
    fn flush_pending_locked(&self, key: &SeriesKey, slot: &SeriesSlot) {
        if let Some(pending) = self.amendments.flush(key) {
            self.amend_locked(key, slot, pending);
        }
    }

    fn amend_locked(&self, key: &SeriesKey, slot: &SeriesSlot, amendment: Amendment) {
        match slot.folder.amend(&slot.store, amendment) {
            Ok(FoldOutcome::Amended(change)) => self.record(slot, change),
            Ok(_) => {}
            Err(e) => warn!(
                key = %key,
                period_start = amendment.period_start,
                error = %e,
                "amendment failed"
            ),
        }
    }

    /// Apply everything waiting in the amendment window, then emit every
    /// pending notification.
    pub fn flush_all(&self) {
        for (key, amendment) in self.amendments.flush_all() {
            self.apply_amendment(&key, amendment);
        }
        for (key, update) in self.notifications.flush_all() {
            if self.updates_tx.send(update).is_err() {
                debug!(key = %key, "no notification receiver");
            }
        }
    }

    /// Drop a series and everything pending for it.
    pub fn unsubscribe(&self, key: &SeriesKey) -> bool {
        self.amendments.cancel(key);
        self.notifications.cancel(key);
        let removed = self.series.write().remove(key).is_some();
        if removed {
            self.state_version.fetch_add(1, Ordering::Relaxed);
            info!(key = %key, "series unsubscribed");
        }
        removed
    }

    /// Stop both throttles. Pending amendments and notifications are
    /// discarded; call [`MarketEngine::flush_all`] first to keep them.
    pub fn close(&self) {
        self.amendments.close();
        self.notifications.close();
        info!(series = self.series.read().len(), "market engine closed");
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Immutable view of a series.
    pub fn snapshot(&self, key: &SeriesKey) -> Option<Arc<Vec<Candle>>> {
        self.slot(key).map(|s| s.store.snapshot())
    }

    /// Store version of a series.
    pub fn version(&self, key: &SeriesKey) -> Option<u64> {
        self.slot(key).map(|s| s.store.version())
    }

    pub fn latest(&self, key: &SeriesKey) -> Option<Candle> {
        self.slot(key).and_then(|s| s.store.latest())
    }

    /// Grid interval of a series and whether its timeframe fell back to the
    /// default because it was not recognised.
    pub fn resolution(&self, key: &SeriesKey) -> Option<Resolution> {
        self.slot(key).map(|s| s.resolution)
    }

    /// Indicator map for the current version of a series, computed lazily.
    ///
    /// When the cached map is exactly one version behind, the last change is
    /// applied through the tail-refresh path; otherwise everything is
    /// recomputed.
    pub fn indicators(&self, key: &SeriesKey) -> Result<Arc<IndicatorMap>, SeriesError> {
        let slot = self
            .slot(key)
            .ok_or_else(|| SeriesError::UnknownSeries(key.clone()))?;
        let (version, candles) = slot.store.snapshot_versioned();

        let mut cache = slot.indicators.lock();
        if let Some(cached) = cache.as_ref() {
            if cached.version == version {
                return Ok(Arc::clone(&cached.map));
            }
        }

        let specs: &[IndicatorSpec] = &self.config.indicators;
        let last_change = *slot.last_change.lock();
        let map = match (cache.as_ref(), last_change) {
            (Some(cached), Some((changed_at, change)))
                if changed_at == version && cached.version + 1 == version =>
            {
                indicators::refresh_all(specs, &cached.map, &candles, change)
            }
            _ => indicators::compute_all(specs, &candles),
        };

        let map = Arc::new(map);
        *cache = Some(IndicatorCache {
            version,
            map: Arc::clone(&map),
        });
        Ok(map)
    }

    pub fn timing_stats(&self, key: &SeriesKey) -> Option<TimingStats> {
        self.slot(key)
            .map(|s| gap_engine::timing_stats(&s.store.snapshot(), s.store.interval()))
    }

    pub fn feed_stats(&self, key: &SeriesKey) -> Option<FeedStats> {
        self.slot(key).map(|s| s.folder.stats())
    }

    /// Values currently waiting in the amendment window.
    pub fn pending_amendments(&self) -> usize {
        self.amendments.pending_len()
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn slot(&self, key: &SeriesKey) -> Option<Arc<SeriesSlot>> {
        self.series.read().get(key).cloned()
    }

    fn slot_or_create(&self, key: &SeriesKey) -> Arc<SeriesSlot> {
        if let Some(slot) = self.slot(key) {
            return slot;
        }

        let mut series = self.series.write();
        let slot = series.entry(key.clone()).or_insert_with(|| {
            let resolution = time_grid::resolve(&key.timeframe);
            info!(
                key = %key,
                interval = resolution.interval,
                fallback = resolution.fallback,
                "series created"
            );
            Arc::new(SeriesSlot {
                store: SeriesStore::new(key.clone(), resolution.interval, self.config.series_capacity),
                resolution,
                folder: TickFolder::new(self.fill_policy),
                writer: Mutex::new(()),
                last_change: Mutex::new(None),
                indicators: Mutex::new(None),
            })
        });
        Arc::clone(slot)
    }

    /// Remember the change behind the current version and notify renderers.
    /// Caller holds the slot writer.
    fn record(&self, slot: &SeriesSlot, change: SeriesChange) {
        if change == SeriesChange::Unchanged {
            return;
        }
        let version = slot.store.version();
        *slot.last_change.lock() = Some((version, change));
        self.state_version.fetch_add(1, Ordering::Relaxed);

        let key = slot.store.key().clone();
        let update = SeriesUpdate {
            key: key.clone(),
            version,
            change,
        };
        self.notifications
            .push_with(key, update, SeriesUpdate::coalesce);
    }
}

impl Drop for MarketEngine {
    fn drop(&mut self) {
        self.amendments.close();
        self.notifications.close();
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(tf: &str) -> SeriesKey {
        SeriesKey::new("BTCUSDT", tf)
    }

    fn tick(ts_secs: i64, price: f64) -> Tick {
        Tick {
            symbol: "BTCUSDT".into(),
            ts_ms: ts_secs * 1_000,
            price,
            volume: None,
        }
    }

    fn real(period_start: i64, close: f64) -> Candle {
        Candle {
            period_start,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 3.0,
        }
    }

    fn snapshot(tf: &str, candles: Vec<Candle>) -> Snapshot {
        Snapshot {
            symbol: "BTCUSDT".into(),
            timeframe: tf.into(),
            candles,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_amend_then_open_next_period() {
        let (engine, _rx) = MarketEngine::new(EngineConfig::default());
        engine
            .apply_snapshot(snapshot("M1", vec![Candle::flat(-60, 100.0, 1.0)]))
            .unwrap();

        engine.on_tick(&tick(0, 100.0));
        let routed = engine.on_tick(&tick(30, 105.0));
        assert_eq!(routed, vec![(key("M1"), TickDisposition::Queued)]);
        engine.on_tick(&tick(61, 103.0));

        // The queued amendment was flushed before period 60 opened.
        let snap = engine.snapshot(&key("M1")).unwrap();
        assert_eq!(snap.len(), 3);
        let closed = snap[1];
        assert_eq!(
            (closed.period_start, closed.open, closed.high, closed.low, closed.close),
            (0, 100.0, 105.0, 100.0, 105.0)
        );
        assert_eq!(snap[2], Candle::flat(60, 103.0, 0.0));
        assert_eq!(engine.pending_amendments(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn amendments_are_coalesced_per_window() {
        let (engine, _rx) = MarketEngine::new(EngineConfig::default());
        engine
            .apply_snapshot(snapshot("M1", vec![Candle::flat(0, 100.0, 1.0)]))
            .unwrap();

        for i in 1..=50 {
            let price = if i == 25 { 200.0 } else { 100.0 + i as f64 };
            engine.on_tick(&tick(i, price));
        }
        assert_eq!(engine.pending_amendments(), 1);
        assert_eq!(engine.latest(&key("M1")).unwrap().close, 100.0);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let head = engine.latest(&key("M1")).unwrap();
        assert_eq!(head.close, 150.0);
        assert_eq!(head.high, 200.0);
        assert_eq!(head.low, 100.0);
        assert_eq!(head.open, 100.0);
        assert_eq!(engine.feed_stats(&key("M1")).unwrap().amendments, 1);
    }

    #[test]
    fn live_candles_fill_gaps_and_drop_late_arrivals() {
        let (engine, _rx) = MarketEngine::new(EngineConfig::default());
        let k = key("M1");
        engine.apply_snapshot(snapshot("M1", vec![real(0, 10.0)])).unwrap();

        let outcome = engine.on_candle(&k, real(180, 12.0), 240).unwrap();
        assert!(matches!(outcome, CandleOutcome::Opened { filled: 2, .. }));
        let snap = engine.snapshot(&k).unwrap();
        let starts: Vec<i64> = snap.iter().map(|c| c.period_start).collect();
        assert_eq!(starts, vec![0, 60, 120, 180]);
        assert!(snap[1].is_synthetic() && snap[2].is_synthetic());
        assert_eq!(snap[1].close, 10.0);

        // Slot 120 closes at 180; tolerance is two intervals.
        let on_time = engine.on_candle(&k, real(120, 11.0), 300).unwrap();
        assert!(matches!(on_time, CandleOutcome::Applied(SeriesChange::Amended { index: 2 })));
        let version = engine.version(&k);
        let late = engine.on_candle(&k, real(60, 11.0), 400).unwrap();
        assert_eq!(late, CandleOutcome::Late);
        assert_eq!(engine.version(&k), version);
        assert!(engine.snapshot(&k).unwrap()[1].is_synthetic());
        assert_eq!(engine.feed_stats(&k).unwrap().late_candles, 1);

        let stats = engine.timing_stats(&k).unwrap();
        assert_eq!(stats.synthetic_count, 1);
        assert_eq!(stats.real_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn live_candle_supersedes_pending_tick_amendment() {
        let (engine, _rx) = MarketEngine::new(EngineConfig::default());
        let k = key("M1");
        engine
            .apply_snapshot(snapshot("M1", vec![Candle::flat(0, 100.0, 1.0)]))
            .unwrap();

        let mut t = tick(10, 101.0);
        t.volume = Some(1.0);
        assert_eq!(engine.on_tick(&t), vec![(k.clone(), TickDisposition::Queued)]);

        let live = Candle {
            period_start: 0,
            open: 100.0,
            high: 102.0,
            low: 98.0,
            close: 99.0,
            volume: 20.0,
        };
        let outcome = engine.on_candle(&k, live, 30).unwrap();
        assert_eq!(outcome, CandleOutcome::Applied(SeriesChange::Amended { index: 0 }));
        assert_eq!(engine.pending_amendments(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(engine.latest(&k), Some(live));
        assert_eq!(engine.feed_stats(&k).unwrap().amendments, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn live_candle_keeps_pending_amendment_of_other_period() {
        let (engine, _rx) = MarketEngine::new(EngineConfig::default());
        let k = key("M1");
        engine
            .apply_snapshot(snapshot("M1", vec![real(0, 10.0), Candle::flat(60, 100.0, 1.0)]))
            .unwrap();

        engine.on_tick(&tick(70, 104.0));
        engine.on_candle(&k, real(0, 10.5), 100).unwrap();

        assert_eq!(engine.pending_amendments(), 0);
        assert_eq!(engine.latest(&k).map(|c| c.close), Some(104.0));
        assert_eq!(engine.snapshot(&k).unwrap()[0].close, 10.5);
    }

    #[test]
    fn unknown_timeframe_reports_fallback_resolution() {
        let (engine, _rx) = MarketEngine::new(EngineConfig::default());
        engine.apply_snapshot(snapshot("X9", vec![real(0, 10.0)])).unwrap();
        engine.apply_snapshot(snapshot("M5", vec![real(0, 10.0)])).unwrap();

        let fallback = engine.resolution(&key("X9")).unwrap();
        assert!(fallback.fallback);
        assert_eq!(fallback.interval, 60);

        let known = engine.resolution(&key("M5")).unwrap();
        assert!(!known.fallback);
        assert_eq!(known.interval, 300);
        assert!(engine.resolution(&key("H4")).is_none());
    }

    #[test]
    fn snapshot_with_gaps_is_filled() {
        let (engine, _rx) = MarketEngine::new(EngineConfig::default());
        let filled = engine
            .apply_snapshot(snapshot("M1", vec![real(0, 10.0), real(180, 12.0)]))
            .unwrap();
        assert_eq!(filled, 2);
        assert_eq!(engine.snapshot(&key("M1")).unwrap().len(), 4);
    }

    #[test]
    fn invalid_snapshot_creates_no_series() {
        let (engine, _rx) = MarketEngine::new(EngineConfig::default());
        let mut bad = real(0, 10.0);
        bad.low = 20.0;
        assert!(engine.apply_snapshot(snapshot("M1", vec![bad])).is_err());
        assert!(engine.keys().is_empty());
        assert_eq!(
            engine.on_candle(&key("M1"), real(60, 1.0), 60),
            Err(SeriesError::UnknownSeries(key("M1")))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tick_fans_out_to_every_timeframe() {
        let (engine, _rx) = MarketEngine::new(EngineConfig::default());
        engine.apply_snapshot(snapshot("M1", vec![real(0, 10.0)])).unwrap();
        engine.apply_snapshot(snapshot("M5", vec![real(0, 10.0)])).unwrap();

        let routed = engine.on_tick(&tick(360, 11.0));
        assert_eq!(routed.len(), 2);
        assert_eq!(engine.latest(&key("M1")).unwrap().period_start, 360);
        assert_eq!(engine.latest(&key("M5")).unwrap().period_start, 300);
        // M1 forward-filled 60..=300, M5 was adjacent.
        assert_eq!(engine.feed_stats(&key("M1")).unwrap().filled, 5);
        assert_eq!(engine.feed_stats(&key("M5")).unwrap().filled, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_discards_pending_updates() {
        let (engine, mut rx) = MarketEngine::new(EngineConfig::default());
        engine
            .apply_snapshot(snapshot("M1", vec![Candle::flat(0, 100.0, 1.0)]))
            .unwrap();
        engine.on_tick(&tick(10, 101.0));
        assert!(engine.unsubscribe(&key("M1")));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(engine.keys().is_empty());
        assert!(rx.try_recv().is_err());
        assert!(engine.on_tick(&tick(20, 102.0)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_are_coalesced_for_renderers() {
        let (engine, mut rx) = MarketEngine::new(EngineConfig::default());
        let k = key("M1");
        engine.apply_snapshot(snapshot("M1", vec![real(0, 10.0)])).unwrap();
        engine.on_candle(&k, real(0, 10.5), 60).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let update = rx.try_recv().unwrap();
        assert_eq!(update.key, k);
        assert_eq!(update.change, SeriesChange::Replaced);
        assert_eq!(Some(update.version), engine.version(&k));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn indicators_track_series_versions() {
        let (engine, _rx) = MarketEngine::new(EngineConfig::default());
        let k = key("M1");
        let candles: Vec<Candle> = (0..40).map(|i| real(i * 60, 100.0 + (i % 7) as f64)).collect();
        engine.apply_snapshot(snapshot("M1", candles)).unwrap();

        let first = engine.indicators(&k).unwrap();
        assert!(Arc::ptr_eq(&first, &engine.indicators(&k).unwrap()));

        engine.on_tick(&tick(39 * 60 + 5, 150.0));
        engine.flush_all();
        let refreshed = engine.indicators(&k).unwrap();
        let expected = indicators::compute_all(&engine.config().indicators, &engine.snapshot(&k).unwrap());
        assert_eq!(*refreshed, expected);
        assert_eq!(refreshed.len(), 6);

        assert!(matches!(
            engine.indicators(&key("H1")),
            Err(SeriesError::UnknownSeries(_))
        ));
    }

    #[test]
    fn close_rejects_further_amendments() {
        let (engine, _rx) = MarketEngine::new(EngineConfig::default());
        engine
            .apply_snapshot(snapshot("M1", vec![Candle::flat(0, 100.0, 1.0)]))
            .unwrap();
        engine.close();
        let routed = engine.on_tick(&tick(5, 101.0));
        assert_eq!(routed, vec![(key("M1"), TickDisposition::Applied(FoldOutcome::Ignored))]);
    }
}
