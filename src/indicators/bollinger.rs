// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Bollinger Bands consist of a middle band (SMA), an upper band (SMA + k*σ),
// and a lower band (SMA - k*σ). σ is the population standard deviation over
// the same trailing window as the SMA (divisor = period).
//
// Before the first full window σ is taken as zero, so all three bands sit on
// the raw close and the output stays index-aligned with the input.

use serde::Serialize;

use super::sma::sma_at;

/// Upper/middle/lower bands, each as long as the input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BollingerSeries {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

impl BollingerSeries {
    pub fn len(&self) -> usize {
        self.middle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middle.is_empty()
    }

    pub(crate) fn push(&mut self, (upper, middle, lower): (f64, f64, f64)) {
        self.upper.push(upper);
        self.middle.push(middle);
        self.lower.push(lower);
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.upper.truncate(len);
        self.middle.truncate(len);
        self.lower.truncate(len);
    }
}

/// Calculate the band series for the given closing prices.
///
/// `num_std` is used by magnitude; a non-finite multiplier collapses the
/// bands onto the middle line.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> BollingerSeries {
    let mut bands = BollingerSeries {
        upper: Vec::with_capacity(closes.len()),
        middle: Vec::with_capacity(closes.len()),
        lower: Vec::with_capacity(closes.len()),
    };
    for i in 0..closes.len() {
        bands.push(bands_at(closes, period, num_std, i));
    }
    bands
}

/// `(upper, middle, lower)` at index `i`.
pub(crate) fn bands_at(closes: &[f64], period: usize, num_std: f64, i: usize) -> (f64, f64, f64) {
    let middle = sma_at(closes, period, i);
    if period == 0 || i + 1 < period {
        return (middle, middle, middle);
    }

    let window = &closes[i + 1 - period..=i];
    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();
    let k = if num_std.is_finite() { num_std.abs() } else { 0.0 };

    (middle + k * std_dev, middle, middle - k * std_dev)
}
