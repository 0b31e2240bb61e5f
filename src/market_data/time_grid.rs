// =============================================================================
// Time Grid — timeframe lookup and period alignment
// =============================================================================
//
// Every candle series lives on a fixed grid anchored at the Unix epoch:
//
//   period_start = floor(ts / interval) * interval
//
// All arithmetic is integer seconds. Millisecond feed timestamps are truncated
// (floored) to whole seconds before alignment, never rounded.
//
// The one-month timeframe uses a fixed 30-day period (2 592 000 s) so that the
// grid stays uniform; calendar months are not modelled.
// =============================================================================

use tracing::warn;

/// Interval used when a timeframe identifier is not recognised.
pub const FALLBACK_INTERVAL_SECS: i64 = 60;

/// Fixed 30-day month.
pub const MONTH_SECS: i64 = 30 * 86_400;

const TIMEFRAMES: &[(&str, &str, i64)] = &[
    ("M1", "1m", 60),
    ("M3", "3m", 180),
    ("M5", "5m", 300),
    ("M15", "15m", 900),
    ("M30", "30m", 1_800),
    ("H1", "1h", 3_600),
    ("H2", "2h", 7_200),
    ("H4", "4h", 14_400),
    ("H6", "6h", 21_600),
    ("H8", "8h", 28_800),
    ("H12", "12h", 43_200),
    ("D1", "1d", 86_400),
    ("W1", "1w", 604_800),
    ("MN1", "1M", MONTH_SECS),
];

/// Outcome of resolving a timeframe identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub interval: i64,
    /// `true` when the identifier was unknown and the 60 s fallback was used.
    pub fallback: bool,
}

/// Look up a timeframe without logging. Accepts both `M1`-style names and
/// exchange aliases such as `1m` / `1h`. `1M` (upper-case) is one month.
pub fn lookup(timeframe: &str) -> Option<i64> {
    let tf = timeframe.trim();
    TIMEFRAMES
        .iter()
        .find(|(name, alias, _)| name.eq_ignore_ascii_case(tf) || *alias == tf)
        .map(|(_, _, secs)| *secs)
}

/// Resolve a timeframe, falling back to 60 s (and warning) when unknown.
pub fn resolve(timeframe: &str) -> Resolution {
    match lookup(timeframe) {
        Some(interval) => Resolution {
            interval,
            fallback: false,
        },
        None => {
            warn!(
                timeframe = %timeframe,
                fallback_secs = FALLBACK_INTERVAL_SECS,
                "unknown timeframe, using fallback interval"
            );
            Resolution {
                interval: FALLBACK_INTERVAL_SECS,
                fallback: true,
            }
        }
    }
}

/// Interval length in seconds for `timeframe`.
pub fn interval_seconds(timeframe: &str) -> i64 {
    resolve(timeframe).interval
}

/// Align `ts` (seconds) down to the start of its containing period.
///
/// Uses Euclidean division so the result never exceeds `ts`, also for
/// timestamps before the epoch.
pub fn align_to_period(ts: i64, interval: i64) -> i64 {
    if interval <= 0 {
        return ts;
    }
    ts.div_euclid(interval) * interval
}

/// Truncate a millisecond timestamp to seconds, then align it.
pub fn align_ms(ts_ms: i64, interval: i64) -> i64 {
    align_to_period(ts_ms.div_euclid(1_000), interval)
}

/// Start of the period following `period_start`.
pub fn next_period(period_start: i64, interval: i64) -> i64 {
    period_start + interval
}

pub fn is_aligned(ts: i64, interval: i64) -> bool {
    interval > 0 && ts.rem_euclid(interval) == 0
}
