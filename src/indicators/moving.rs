use super::{nan_vec, warm};

/// Simple moving average.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.is_empty() {
        return nan_vec(values.len());
    }
    let mut out = nan_vec(values.len());
    let mut sum = 0.0;
    for i in 0..values.len() {
        sum += values[i];
        if i >= period {
            sum -= values[i - period];
        }
        if warm(i, period) {
            out[i] = sum / period as f64;
        }
    }
    out
}

/// Exponential moving average seeded with the SMA of the first window.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return nan_vec(values.len());
    }
    let mut out = nan_vec(values.len());
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = seed;
    let mut prev = seed;
    for i in period..values.len() {
        prev = alpha * values[i] + (1.0 - alpha) * prev;
        out[i] = prev;
    }
    out
}

/// Linearly weighted moving average, newest bar heaviest.
pub fn wma(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.is_empty() {
        return nan_vec(values.len());
    }
    let mut out = nan_vec(values.len());
    let denom = (period * (period + 1)) as f64 / 2.0;
    for i in 0..values.len() {
        if !warm(i, period) {
            continue;
        }
        let mut acc = 0.0;
        for (j, value) in values[i + 1 - period..=i].iter().enumerate() {
            acc += value * (j + 1) as f64;
        }
        out[i] = acc / denom;
    }
    out
}

/// Volume-weighted average price, cumulative from the first bar.
pub fn vwap(high: &[f64], low: &[f64], close: &[f64], volume: &[f64]) -> Vec<f64> {
    let len = close.len().min(high.len()).min(low.len()).min(volume.len());
    let mut out = nan_vec(close.len());
    let mut pv = 0.0;
    let mut v = 0.0;
    for i in 0..len {
        let typical = (high[i] + low[i] + close[i]) / 3.0;
        pv += typical * volume[i];
        v += volume[i];
        if v > 0.0 {
            out[i] = pv / v;
        }
    }
    out
}

/// Kaufman efficiency ratio: net change over the window divided by the sum
/// of bar-to-bar changes. 1.0 is a straight line, 0.0 pure noise.
pub fn efficiency_ratio(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.is_empty() {
        return nan_vec(values.len());
    }
    let mut out = nan_vec(values.len());
    for i in period..values.len() {
        let net = (values[i] - values[i - period]).abs();
        let mut path = 0.0;
        for j in i - period + 1..=i {
            path += (values[j] - values[j - 1]).abs();
        }
        out[i] = if path > 0.0 { net / path } else { 0.0 };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_reference_values() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let out = sma(&values, 3);
        assert!(out[0].is_nan() && out[1].is_nan());
        assert_eq!(out[2], 2.0);
        assert_eq!(out[3], 3.0);
        assert_eq!(out[4], 4.0);
    }

    #[test]
    fn sma_empty_input_is_empty() {
        assert!(sma(&[], 5).is_empty());
    }

    #[test]
    fn sma_shorter_than_period_is_all_nan() {
        let out = sma(&[1.0, 2.0], 5);
        assert!(out.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn ema_reference_values() {
        let values = [22.27, 22.19, 22.08, 22.17, 22.18, 22.13, 22.23, 22.43, 22.24, 22.29];
        let out = ema(&values, 10);
        assert!(out[8].is_nan());
        // Seed equals the 10-bar SMA.
        assert!((out[9] - 22.221).abs() < 1e-9);
    }

    #[test]
    fn wma_weights_newest_heaviest() {
        let out = wma(&[1.0, 2.0, 3.0], 3);
        // (1*1 + 2*2 + 3*3) / 6
        assert!((out[2] - 14.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn vwap_cumulative() {
        let high = [11.0, 21.0];
        let low = [9.0, 19.0];
        let close = [10.0, 20.0];
        let volume = [1.0, 3.0];
        let out = vwap(&high, &low, &close, &volume);
        assert!((out[0] - 10.0).abs() < 1e-12);
        assert!((out[1] - (10.0 + 20.0 * 3.0) / 4.0).abs() < 1e-12);
    }

    #[test]
    fn efficiency_ratio_straight_line_is_one() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let out = efficiency_ratio(&values, 4);
        assert!((out[5] - 1.0).abs() < 1e-12);
    }
}
