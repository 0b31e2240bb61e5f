// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators rendered next to
// the candle series. Every function returns output of exactly the input's
// length so results can be aligned with the series by index; insufficient
// history degrades to documented neutral values instead of failing.
//
// `IndicatorSpec` names one configured indicator, `IndicatorResult` is the
// closed set of output shapes consumers match on.

pub mod adx;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;
pub mod sma;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::market_data::SeriesChange;
use crate::types::Candle;

pub use adx::AdxSeries;
pub use bollinger::BollingerSeries;
pub use macd::MacdSeries;

/// Indicator outputs keyed by [`IndicatorSpec::id`].
pub type IndicatorMap = BTreeMap<String, IndicatorResult>;

/// One configured indicator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndicatorSpec {
    Sma { period: usize },
    Ema { period: usize },
    Rsi { period: usize },
    Macd { fast: usize, slow: usize, signal: usize },
    Bollinger { period: usize, std_dev: f64 },
    Adx { period: usize },
}

/// Output of one indicator, aligned 1:1 with the candle series.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndicatorResult {
    Line { values: Vec<f64> },
    Macd(MacdSeries),
    Bollinger(BollingerSeries),
    Adx(AdxSeries),
}

impl IndicatorResult {
    pub fn len(&self) -> usize {
        match self {
            Self::Line { values } => values.len(),
            Self::Macd(m) => m.len(),
            Self::Bollinger(b) => b.len(),
            Self::Adx(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IndicatorSpec {
    /// Stable identifier, e.g. `rsi_14`, `macd_12_26_9`, `bb_20_2`.
    pub fn id(&self) -> String {
        match self {
            Self::Sma { period } => format!("sma_{period}"),
            Self::Ema { period } => format!("ema_{period}"),
            Self::Rsi { period } => format!("rsi_{period}"),
            Self::Macd { fast, slow, signal } => format!("macd_{fast}_{slow}_{signal}"),
            Self::Bollinger { period, std_dev } => format!("bb_{period}_{std_dev}"),
            Self::Adx { period } => format!("adx_{period}"),
        }
    }

    /// Full computation over `candles`.
    pub fn compute(&self, candles: &[Candle]) -> IndicatorResult {
        let closes = closes(candles);
        match *self {
            Self::Sma { period } => IndicatorResult::Line {
                values: sma::calculate_sma(&closes, period),
            },
            Self::Ema { period } => IndicatorResult::Line {
                values: ema::calculate_ema(&closes, period),
            },
            Self::Rsi { period } => IndicatorResult::Line {
                values: rsi::calculate_rsi(&closes, period),
            },
            Self::Macd { fast, slow, signal } => {
                IndicatorResult::Macd(macd::calculate_macd(&closes, fast, slow, signal))
            }
            Self::Bollinger { period, std_dev } => {
                IndicatorResult::Bollinger(bollinger::calculate_bollinger(&closes, period, std_dev))
            }
            Self::Adx { period } => IndicatorResult::Adx(adx::calculate_adx(candles, period)),
        }
    }

    /// Bring `previous` up to date after `change`.
    ///
    /// When the change only touched the last candle (an amendment of the head
    /// or an append without eviction), SMA, EMA and Bollinger recompute just
    /// that index with the same arithmetic as [`IndicatorSpec::compute`], so
    /// the result is identical to a full pass. Everything else is recomputed
    /// in full.
    pub fn refresh(
        &self,
        previous: &IndicatorResult,
        candles: &[Candle],
        change: SeriesChange,
    ) -> IndicatorResult {
        let n = candles.len();
        let kept = match change {
            SeriesChange::Amended { index } if n > 0 && index + 1 == n => n - 1,
            SeriesChange::Inserted { index, evicted: 0 } if n > 0 && index + 1 == n => n - 1,
            _ => return self.compute(candles),
        };
        let expected_prev_len = if change.is_insert() { n - 1 } else { n };
        if previous.len() != expected_prev_len {
            return self.compute(candles);
        }

        let last = n - 1;
        match (*self, previous) {
            (Self::Sma { period }, IndicatorResult::Line { values }) => {
                let closes = closes(candles);
                let mut values = values[..kept].to_vec();
                values.push(sma::sma_at(&closes, period, last));
                IndicatorResult::Line { values }
            }
            (Self::Ema { period }, IndicatorResult::Line { values }) => {
                let closes = closes(candles);
                let prev = if last > 0 { values.get(last - 1).copied() } else { None };
                let mut values = values[..kept].to_vec();
                values.push(ema::ema_step(&closes, period, last, prev));
                IndicatorResult::Line { values }
            }
            (Self::Bollinger { period, std_dev }, IndicatorResult::Bollinger(prev)) => {
                let closes = closes(candles);
                let mut bands = prev.clone();
                bands.truncate(kept);
                bands.push(bollinger::bands_at(&closes, period, std_dev, last));
                IndicatorResult::Bollinger(bands)
            }
            _ => self.compute(candles),
        }
    }

    /// Indicator set used when the configuration does not name one.
    pub fn default_set() -> Vec<IndicatorSpec> {
        vec![
            Self::Rsi { period: 14 },
            Self::Sma { period: 20 },
            Self::Ema { period: 20 },
            Self::Macd {
                fast: 12,
                slow: 26,
                signal: 9,
            },
            Self::Bollinger {
                period: 20,
                std_dev: 2.0,
            },
            Self::Adx { period: 14 },
        ]
    }
}

/// Compute every indicator in `specs` over `candles`.
pub fn compute_all(specs: &[IndicatorSpec], candles: &[Candle]) -> IndicatorMap {
    specs.iter().map(|s| (s.id(), s.compute(candles))).collect()
}

/// Refresh every indicator in `specs`, reusing `previous` where possible.
pub fn refresh_all(
    specs: &[IndicatorSpec],
    previous: &IndicatorMap,
    candles: &[Candle],
    change: SeriesChange,
) -> IndicatorMap {
    specs
        .iter()
        .map(|s| {
            let id = s.id();
            let result = match previous.get(&id) {
                Some(prev) => s.refresh(prev, candles, change),
                None => s.compute(candles),
            };
            (id, result)
        })
        .collect()
}

fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}
