// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================
//
//   SMA_i = (close_{i-period+1} + ... + close_i) / period      for i >= period-1
//   SMA_i = close_i                                            for i <  period-1
//
// The raw-close prefix keeps the output index-aligned with the input. Each
// window is summed directly, so recomputing a single index gives exactly the
// same bits as a full pass.
// =============================================================================

/// Full SMA series, same length as `closes`. `period == 0` yields the closes.
pub fn calculate_sma(closes: &[f64], period: usize) -> Vec<f64> {
    (0..closes.len()).map(|i| sma_at(closes, period, i)).collect()
}

/// SMA value at index `i`.
pub(crate) fn sma_at(closes: &[f64], period: usize, i: usize) -> f64 {
    if period == 0 || i + 1 < period {
        return closes[i];
    }
    let window = &closes[i + 1 - period..=i];
    window.iter().sum::<f64>() / period as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_raw_prefix_then_rolling_mean() {
        let sma = calculate_sma(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert_eq!(sma, vec![1.0, 2.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn sma_short_input_is_raw() {
        assert_eq!(calculate_sma(&[7.0, 8.0], 5), vec![7.0, 8.0]);
        assert!(calculate_sma(&[], 5).is_empty());
        assert_eq!(calculate_sma(&[3.0], 1), vec![3.0]);
    }

    #[test]
    fn sma_period_zero_returns_closes() {
        assert_eq!(calculate_sma(&[1.0, 2.0], 0), vec![1.0, 2.0]);
    }
}
