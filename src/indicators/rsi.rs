// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// RSI measures the speed and magnitude of recent price changes to evaluate
// whether an asset is overbought or oversold.
//
// Step 1 — Compute price changes (deltas) from consecutive closes.
// Step 2 — Seed average gain / average loss with the SMA of the first `period`
//          gains / losses. The first RSI lands at index `period`.
// Step 3 — Apply Wilder's exponential smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + current_gain) / period
//            avg_loss = (prev_avg_loss * (period - 1) + current_loss) / period
// Step 4 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
//
// Indices before `period` hold the neutral value 50.
// =============================================================================

/// Neutral RSI used where there is not enough history.
pub const NEUTRAL_RSI: f64 = 50.0;

/// Compute the full RSI series for the given `closes` and `period`.
///
/// The returned vector always has `closes.len()` elements.
///
/// # Edge cases
/// - `period == 0` or `closes.len() <= period` => all 50.0
/// - If average loss is zero, RSI is 100.0.
/// - Non-finite intermediate values degrade to 50.0.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let mut result = vec![NEUTRAL_RSI; closes.len()];
    if period == 0 || closes.len() <= period {
        return result;
    }

    // --- Seed averages with SMA of first `period` deltas ---------------------
    let (sum_gain, sum_loss) = closes[..=period]
        .windows(2)
        .map(|w| w[1] - w[0])
        .fold((0.0_f64, 0.0_f64), |(g, l), d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;
    result[period] = rsi_from_averages(avg_gain, avg_loss);

    // --- Wilder's smoothing for subsequent values ----------------------------
    for i in period + 1..closes.len() {
        let delta = closes[i] - closes[i - 1];
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
        result[i] = rsi_from_averages(avg_gain, avg_loss);
    }

    result
}

/// Convert average gain / average loss into an RSI value in [0, 100].
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    let rsi = if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    if rsi.is_finite() {
        rsi.clamp(0.0, 100.0)
    } else {
        NEUTRAL_RSI
    }
}
