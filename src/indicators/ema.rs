// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the Simple Moving Average (SMA).
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The first EMA value, at index `period - 1`, is seeded with the SMA of the
// first `period` closes. Earlier indices carry the raw close, the same
// alignment contract as the SMA.
// =============================================================================

/// Compute the EMA series for `closes` and look-back `period`.
///
/// The output always has `closes.len()` elements.
///
/// # Edge cases
/// - `period == 0` => the closes themselves
/// - `closes.len() < period` => the closes themselves (no seed yet)
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    let mut result: Vec<f64> = Vec::with_capacity(closes.len());
    for i in 0..closes.len() {
        let prev = result.last().copied();
        result.push(ema_step(closes, period, i, prev));
    }
    result
}

/// EMA value at index `i`, given the EMA at `i - 1`.
pub(crate) fn ema_step(closes: &[f64], period: usize, i: usize, prev: Option<f64>) -> f64 {
    if period == 0 || i + 1 < period {
        return closes[i];
    }
    if i + 1 == period {
        return closes[..period].iter().sum::<f64>() / period as f64;
    }
    let multiplier = 2.0 / (period + 1) as f64;
    let prev = prev.unwrap_or(closes[i - 1]);
    closes[i] * multiplier + prev * (1.0 - multiplier)
}
