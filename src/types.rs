// =============================================================================
// Shared types used across the Aurora series core
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SeriesError;

/// A single OHLCV candle on the fixed time grid.
///
/// `period_start` is in whole seconds and is always a multiple of the owning
/// series' interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub period_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Candle {
    /// A flat candle where every price equals `price`.
    pub fn flat(period_start: i64, price: f64, volume: f64) -> Self {
        Self {
            period_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    /// Gap fillers carry zero volume and a flat body.
    pub fn is_synthetic(&self) -> bool {
        self.volume == 0.0
            && self.open == self.close
            && self.high == self.close
            && self.low == self.close
    }

    /// Opening time of the period as a UTC timestamp.
    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.period_start, 0).single()
    }

    /// Check the OHLC invariants and grid alignment for `interval` seconds.
    pub fn validate(&self, interval: i64) -> Result<(), SeriesError> {
        let invalid = |reason: &str| SeriesError::InvalidCandle {
            period_start: self.period_start,
            reason: reason.to_string(),
        };

        let prices = [self.open, self.high, self.low, self.close, self.volume];
        if prices.iter().any(|v| !v.is_finite()) {
            return Err(invalid("non-finite value"));
        }
        if self.high < self.low {
            return Err(invalid("high below low"));
        }
        if self.open.min(self.close) < self.low || self.open.max(self.close) > self.high {
            return Err(invalid("open/close outside [low, high]"));
        }
        if self.volume < 0.0 {
            return Err(invalid("negative volume"));
        }
        if interval > 0 && self.period_start.rem_euclid(interval) != 0 {
            return Err(invalid("period_start not on the time grid"));
        }
        Ok(())
    }
}

impl std::fmt::Display for Candle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} O={} H={} L={} C={} V={}",
            self.period_start, self.open, self.high, self.low, self.close, self.volume
        )
    }
}

/// A single trade/price print from the live feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    /// Exchange timestamp in milliseconds since the epoch.
    pub ts_ms: i64,
    pub price: f64,
    #[serde(default)]
    pub volume: Option<f64>,
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub timeframe: String,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// Full historical snapshot delivered by the REST collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub symbol: String,
    pub timeframe: String,
    pub candles: Vec<Candle>,
}

impl Snapshot {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.symbol.clone(), self.timeframe.clone())
    }
}

/// Catalog entry describing a selectable timeframe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeframeInfo {
    pub name: String,
    pub label: String,
}
