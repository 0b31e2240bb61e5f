// =============================================================================
// Gap Engine — missing-period detection and forward fill
// =============================================================================
//
// A gap is any grid slot strictly between two consecutive candles that are
// more than one interval apart:
//
//   prev = 0, next = 180, interval = 60   =>   gaps = [60, 120]
//
// Fillers are flat candles at the close of the candle *preceding* the gap with
// zero volume. Filling never looks ahead (no backward fill), never touches an
// existing candle, and is idempotent: a second pass writes nothing. Without a
// run cap a filled series has no gaps left.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SeriesError;
use crate::market_data::series_store::{SeriesChange, SeriesStore};
use crate::market_data::time_grid;
use crate::types::Candle;

/// How gaps are handled once detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FillPolicy {
    /// Synthesize flat candles at the previous close. A run spans from a
    /// candle to the next real one, with fillers already written for it
    /// counted in. At most `max_run` slots of a run are ever filled, always
    /// the newest ones, so a capped run stays capped on every later pass.
    ForwardFill { max_run: usize },
    /// Detect and report only.
    Disabled,
}

impl Default for FillPolicy {
    fn default() -> Self {
        Self::ForwardFill { max_run: 500 }
    }
}

/// Completeness diagnostics for one series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimingStats {
    pub real_count: usize,
    pub synthetic_count: usize,
    pub missing_count: usize,
    pub completeness_percent: f64,
}

/// Classification of a live candle relative to the series head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Same or earlier slot, within the delay tolerance.
    OnTime,
    /// Same or earlier slot, but older than the tolerance allows.
    Late,
    /// A newer slot; periods between the head and it are gaps.
    NewPeriod,
}

/// Every missing grid slot in `candles` (which must be sorted ascending).
pub fn find_gaps(candles: &[Candle], interval: i64) -> Vec<i64> {
    if interval <= 0 {
        return Vec::new();
    }
    let mut gaps = Vec::new();
    for pair in candles.windows(2) {
        let mut slot = time_grid::next_period(pair[0].period_start, interval);
        while slot < pair[1].period_start {
            gaps.push(slot);
            slot = time_grid::next_period(slot, interval);
        }
    }
    gaps
}

/// Fill every gap of `store` according to `policy`. Returns the number of
/// synthetic candles written.
pub fn fill(store: &SeriesStore, policy: FillPolicy) -> Result<usize, SeriesError> {
    let max_run = match policy {
        FillPolicy::ForwardFill { max_run } => max_run,
        FillPolicy::Disabled => return Ok(0),
    };

    let snapshot = store.snapshot();
    let interval = store.interval();
    let mut written = 0;

    let mut i = 0;
    while i + 1 < snapshot.len() {
        let anchor = snapshot[i];
        // Earlier fillers of this anchor belong to its run.
        let mut j = i + 1;
        while j + 1 < snapshot.len()
            && snapshot[j].is_synthetic()
            && snapshot[j].close == anchor.close
        {
            j += 1;
        }
        let boundary = snapshot[j];
        if boundary.period_start - anchor.period_start > interval {
            written += fill_run(store, anchor.period_start, boundary.period_start, anchor.close, max_run)?;
        }
        i = j;
    }

    if written > 0 {
        debug!(key = %store.key(), written, "gaps forward-filled");
    }
    Ok(written)
}

/// Fill the slots strictly between `from` and `to` with flat candles at
/// `price`. Used when a tick opens a period beyond the current head.
pub fn fill_between(
    store: &SeriesStore,
    from: i64,
    to: i64,
    price: f64,
    policy: FillPolicy,
) -> Result<usize, SeriesError> {
    match policy {
        FillPolicy::ForwardFill { max_run } => fill_run(store, from, to, price, max_run),
        FillPolicy::Disabled => Ok(0),
    }
}

fn fill_run(
    store: &SeriesStore,
    from: i64,
    to: i64,
    price: f64,
    max_run: usize,
) -> Result<usize, SeriesError> {
    let interval = store.interval();
    if interval <= 0 || to - from <= interval || max_run == 0 {
        return Ok(0);
    }

    let slots = ((to - from) / interval - 1) as usize;
    let skip = slots.saturating_sub(max_run) as i64;
    let mut slot = from + (skip + 1) * interval;
    let mut written = 0;
    while slot < to {
        if store.get(slot).is_none()
            && store.upsert(Candle::flat(slot, price, 0.0))? != SeriesChange::Unchanged
        {
            written += 1;
        }
        slot = time_grid::next_period(slot, interval);
    }
    Ok(written)
}

/// Completeness of `candles`: `real / (real + missing) * 100`, where synthetic
/// fillers count as missing. Series of length 0 or 1 are 100 % complete.
pub fn timing_stats(candles: &[Candle], interval: i64) -> TimingStats {
    let synthetic_count = candles.iter().filter(|c| c.is_synthetic()).count();
    let real_count = candles.len() - synthetic_count;
    let missing_count = find_gaps(candles, interval).len() + synthetic_count;

    let completeness_percent = if candles.len() <= 1 || real_count + missing_count == 0 {
        100.0
    } else {
        real_count as f64 / (real_count + missing_count) as f64 * 100.0
    };

    TimingStats {
        real_count,
        synthetic_count,
        missing_count,
        completeness_percent,
    }
}

/// Default delay tolerance: two intervals.
pub fn default_max_delay(interval: i64) -> i64 {
    2 * interval
}

/// Decide how a live candle for `period_start`, received at `received_at`
/// (seconds), relates to the series head `latest`.
///
/// A slot is on time until `max_delay` seconds after it closes.
pub fn classify_arrival(
    latest: i64,
    period_start: i64,
    received_at: i64,
    interval: i64,
    max_delay: i64,
) -> Arrival {
    if period_start > latest {
        return Arrival::NewPeriod;
    }
    let slot_end = period_start + interval;
    if received_at - slot_end <= max_delay {
        Arrival::OnTime
    } else {
        Arrival::Late
    }
}
