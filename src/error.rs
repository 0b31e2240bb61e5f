use thiserror::Error;

use crate::types::SeriesKey;

/// Errors surfaced by series mutations.
///
/// Stale ticks, unknown timeframes and cache misses are not errors; they are
/// counted or logged where they happen.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SeriesError {
    #[error("invalid candle at {period_start}: {reason}")]
    InvalidCandle { period_start: i64, reason: String },

    #[error("update-failed: empty series")]
    EmptySeries,

    #[error("no series loaded for {0}")]
    UnknownSeries(SeriesKey),
}
