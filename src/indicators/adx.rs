// =============================================================================
// Average Directional Index (ADX)
// =============================================================================
//
// ADX quantifies trend **strength** regardless of direction.
//
// Calculation pipeline:
//   1. Compute +DM (positive directional movement) and -DM per bar.
//   2. Compute True Range (TR) per bar.
//   3. Apply Wilder's smoothing (period) to +DM, -DM, and TR. The first
//      smoothed value is the plain sum of bars 1..=period.
//   4. Derive +DI = smoothed(+DM) / smoothed(TR) * 100
//            -DI = smoothed(-DM) / smoothed(TR) * 100
//   5. DX  = |+DI - -DI| / (+DI + -DI) * 100
//   6. ADX = mean of the first `period` DX values, then Wilder-smoothed.
//
// Output alignment: +DI/-DI start at index `period`, ADX at `2 * period - 1`;
// earlier indices are 0. With fewer than `period + 10` candles every line is 0.
// =============================================================================

use serde::Serialize;

use crate::types::Candle;

/// Extra history required beyond `period` before anything is computed.
const MIN_EXTRA_CANDLES: usize = 10;

/// ADX with its two directional lines, each as long as the input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdxSeries {
    pub adx: Vec<f64>,
    pub plus_di: Vec<f64>,
    pub minus_di: Vec<f64>,
}

impl AdxSeries {
    fn zeros(len: usize) -> Self {
        Self {
            adx: vec![0.0; len],
            plus_di: vec![0.0; len],
            minus_di: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.adx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adx.is_empty()
    }
}

/// Compute the ADX, +DI and -DI lines for `candles` (oldest first).
pub fn calculate_adx(candles: &[Candle], period: usize) -> AdxSeries {
    let n = candles.len();
    let mut out = AdxSeries::zeros(n);
    if period == 0 || n < period + MIN_EXTRA_CANDLES {
        return out;
    }

    let period_f = period as f64;

    // ------------------------------------------------------------------
    // Step 1 & 2: Raw +DM, -DM, and True Range; index 0 has no predecessor
    // ------------------------------------------------------------------
    let mut plus_dm = vec![0.0; n];
    let mut minus_dm = vec![0.0; n];
    let mut tr_vals = vec![0.0; n];

    for i in 1..n {
        let (cur, prev) = (&candles[i], &candles[i - 1]);

        tr_vals[i] = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());

        let up_move = cur.high - prev.high;
        let down_move = prev.low - cur.low;
        if up_move > down_move && up_move > 0.0 {
            plus_dm[i] = up_move;
        }
        if down_move > up_move && down_move > 0.0 {
            minus_dm[i] = down_move;
        }
    }

    // ------------------------------------------------------------------
    // Step 3-5: Wilder's smoothing, DI and DX from index `period` onwards
    // ------------------------------------------------------------------
    let mut smooth_plus_dm: f64 = plus_dm[1..=period].iter().sum();
    let mut smooth_minus_dm: f64 = minus_dm[1..=period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[1..=period].iter().sum();

    let mut dx = vec![0.0; n];
    for i in period..n {
        if i > period {
            smooth_plus_dm = smooth_plus_dm - smooth_plus_dm / period_f + plus_dm[i];
            smooth_minus_dm = smooth_minus_dm - smooth_minus_dm / period_f + minus_dm[i];
            smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];
        }
        let (plus_di, minus_di, value) = directional(smooth_plus_dm, smooth_minus_dm, smooth_tr);
        out.plus_di[i] = plus_di;
        out.minus_di[i] = minus_di;
        dx[i] = value;
    }

    // ------------------------------------------------------------------
    // Step 6: ADX = Wilder's smoothed average of DX
    // ------------------------------------------------------------------
    let first_adx = 2 * period - 1;
    if first_adx >= n {
        return out;
    }

    let mut adx = dx[period..=first_adx].iter().sum::<f64>() / period_f;
    out.adx[first_adx] = finite_or_zero(adx);
    for i in first_adx + 1..n {
        adx = (adx * (period_f - 1.0) + dx[i]) / period_f;
        out.adx[i] = finite_or_zero(adx);
    }

    out
}

// =============================================================================
// Internal helpers
// =============================================================================

/// `(+DI, -DI, DX)` from smoothed +DM, -DM and TR. A zero range yields zeros.
fn directional(smooth_plus_dm: f64, smooth_minus_dm: f64, smooth_tr: f64) -> (f64, f64, f64) {
    if smooth_tr == 0.0 {
        return (0.0, 0.0, 0.0);
    }

    let plus_di = finite_or_zero(smooth_plus_dm / smooth_tr * 100.0);
    let minus_di = finite_or_zero(smooth_minus_dm / smooth_tr * 100.0);

    let di_sum = plus_di + minus_di;
    if di_sum == 0.0 {
        // Both +DI and -DI are zero: no directional movement.
        return (plus_di, minus_di, 0.0);
    }

    let dx = finite_or_zero((plus_di - minus_di).abs() / di_sum * 100.0);
    (plus_di, minus_di, dx)
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}
