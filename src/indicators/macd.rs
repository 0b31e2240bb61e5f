// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   macd      = EMA(fast) - EMA(slow)          (index-wise)
//   signal    = EMA(signal) of the macd line
//   histogram = macd - signal
//
// Both EMAs share the raw-close prefix convention, so the macd line is 0
// until the fast EMA seeds and partially defined until the slow one does.
// With fewer than `slow` candles every output is zero.
// =============================================================================

use serde::Serialize;

use super::ema::calculate_ema;

/// Three parallel lines, each as long as the input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MacdSeries {
    pub macd: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

impl MacdSeries {
    fn zeros(len: usize) -> Self {
        Self {
            macd: vec![0.0; len],
            signal: vec![0.0; len],
            histogram: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.macd.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macd.is_empty()
    }
}

pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> MacdSeries {
    let n = closes.len();
    if slow == 0 || n < slow {
        return MacdSeries::zeros(n);
    }

    let fast_ema = calculate_ema(closes, fast);
    let slow_ema = calculate_ema(closes, slow);
    let macd: Vec<f64> = fast_ema.iter().zip(&slow_ema).map(|(f, s)| f - s).collect();
    let signal_line = calculate_ema(&macd, signal);
    let histogram = macd.iter().zip(&signal_line).map(|(m, s)| m - s).collect();

    MacdSeries {
        macd,
        signal: signal_line,
        histogram,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_short_input_is_zero_filled() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let m = calculate_macd(&closes, 12, 26, 9);
        assert_eq!(m.len(), 20);
        assert!(m.macd.iter().chain(&m.signal).chain(&m.histogram).all(|&v| v == 0.0));
        assert!(calculate_macd(&[], 12, 26, 9).is_empty());
    }

    #[test]
    fn macd_lines_are_consistent() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + (i as f64 * 0.2).sin() * 5.0).collect();
        let m = calculate_macd(&closes, 12, 26, 9);
        assert_eq!(m.len(), 80);

        let fast = calculate_ema(&closes, 12);
        let slow = calculate_ema(&closes, 26);
        for i in 0..80 {
            assert!((m.macd[i] - (fast[i] - slow[i])).abs() < 1e-12);
            assert!((m.histogram[i] - (m.macd[i] - m.signal[i])).abs() < 1e-12);
        }
    }

    #[test]
    fn macd_positive_in_uptrend() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        let m = calculate_macd(&closes, 12, 26, 9);
        assert!(m.macd[59] > 0.0);
    }
}
