use super::moving::{ema, sma};
use super::nan_vec;
use super::stats::rolling_std;

/// True range series: `max(h-l, |h-pc|, |l-pc|)`.
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let len = close.len();
    let mut out = nan_vec(len);
    for i in 0..len {
        out[i] = if i == 0 {
            high[i] - low[i]
        } else {
            let prev_close = close[i - 1];
            (high[i] - low[i])
                .max((high[i] - prev_close).abs())
                .max((low[i] - prev_close).abs())
        };
    }
    out
}

/// Wilder average true range.
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let tr = true_range(high, low, close);
    let len = tr.len();
    let mut out = nan_vec(len);
    if period == 0 || len < period {
        return out;
    }
    let mut value: f64 = tr[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = value;
    for i in period..len {
        value = (value * (period as f64 - 1.0) + tr[i]) / period as f64;
        out[i] = value;
    }
    out
}

/// Bollinger bands: `(upper, middle, lower)` at `k` population standard
/// deviations around the SMA.
pub fn bollinger(values: &[f64], period: usize, k: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let middle = sma(values, period);
    let std = rolling_std(values, period);
    let len = values.len();
    let mut upper = nan_vec(len);
    let mut lower = nan_vec(len);
    for i in 0..len {
        if !middle[i].is_nan() && !std[i].is_nan() {
            upper[i] = middle[i] + k * std[i];
            lower[i] = middle[i] - k * std[i];
        }
    }
    (upper, middle, lower)
}

/// Bollinger %B: position of price within the bands (0 at lower, 1 at
/// upper).
pub fn percent_b(values: &[f64], period: usize, k: f64) -> Vec<f64> {
    let (upper, _middle, lower) = bollinger(values, period, k);
    let mut out = nan_vec(values.len());
    for i in 0..values.len() {
        if !upper[i].is_nan() {
            let width = upper[i] - lower[i];
            out[i] = if width > 0.0 {
                (values[i] - lower[i]) / width
            } else {
                0.5
            };
        }
    }
    out
}

/// Bollinger bandwidth: band width relative to the middle band.
pub fn bandwidth(values: &[f64], period: usize, k: f64) -> Vec<f64> {
    let (upper, middle, lower) = bollinger(values, period, k);
    let mut out = nan_vec(values.len());
    for i in 0..values.len() {
        if !upper[i].is_nan() && middle[i] != 0.0 {
            out[i] = (upper[i] - lower[i]) / middle[i];
        }
    }
    out
}

/// Keltner channels: EMA middle line with ATR bands.
pub fn keltner(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    period: usize,
    multiplier: f64,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let middle = ema(close, period);
    let ranges = atr(high, low, close, period);
    let len = close.len();
    let mut upper = nan_vec(len);
    let mut lower = nan_vec(len);
    for i in 0..len {
        if !middle[i].is_nan() && !ranges[i].is_nan() {
            upper[i] = middle[i] + multiplier * ranges[i];
            lower[i] = middle[i] - multiplier * ranges[i];
        }
    }
    (upper, middle, lower)
}

/// Choppiness index, 0..=100. High values mean a range-bound market.
pub fn choppiness(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let tr = true_range(high, low, close);
    let len = close.len();
    let mut out = nan_vec(len);
    if period < 2 || len < period {
        return out;
    }
    let log_period = (period as f64).log10();
    for i in period - 1..len {
        let window = i + 1 - period..=i;
        let tr_sum: f64 = tr[window.clone()].iter().sum();
        let hh = high[window.clone()].iter().cloned().fold(f64::MIN, f64::max);
        let ll = low[window].iter().cloned().fold(f64::MAX, f64::min);
        let range = hh - ll;
        if range > 0.0 && tr_sum > 0.0 {
            out[i] = 100.0 * (tr_sum / range).log10() / log_period;
        }
    }
    out
}

/// Standard error of the mean over a rolling window.
pub fn standard_error(values: &[f64], period: usize) -> Vec<f64> {
    let std = rolling_std(values, period);
    let mut out = nan_vec(values.len());
    if period == 0 {
        return out;
    }
    let sqrt_n = (period as f64).sqrt();
    for i in 0..values.len() {
        if !std[i].is_nan() {
            out[i] = std[i] / sqrt_n;
        }
    }
    out
}

/// Mass index: EMA-ratio of the bar range summed over `sum_period`.
/// Conventionally 9/25.
pub fn mass_index(high: &[f64], low: &[f64], ema_period: usize, sum_period: usize) -> Vec<f64> {
    let len = high.len().min(low.len());
    let ranges: Vec<f64> = (0..len).map(|i| high[i] - low[i]).collect();
    let single = ema(&ranges, ema_period);
    let valid_from = single.iter().position(|v| !v.is_nan()).unwrap_or(len);
    let mut ratio = nan_vec(len);
    if valid_from < len {
        let double = ema(&single[valid_from..], ema_period);
        for (offset, value) in double.into_iter().enumerate() {
            let i = valid_from + offset;
            if !value.is_nan() && value != 0.0 {
                ratio[i] = single[i] / value;
            }
        }
    }
    let mut out = nan_vec(len);
    for i in 0..len {
        if i + 1 < sum_period {
            continue;
        }
        let window = &ratio[i + 1 - sum_period..=i];
        if window.iter().all(|v| !v.is_nan()) {
            out[i] = window.iter().sum();
        }
    }
    out
}

/// Rolling volatility of simple returns, in percent.
pub fn volatility_index(values: &[f64], period: usize) -> Vec<f64> {
    let len = values.len();
    let mut returns = nan_vec(len);
    for i in 1..len {
        if values[i - 1] != 0.0 {
            returns[i] = values[i] / values[i - 1] - 1.0;
        }
    }
    let mut out = nan_vec(len);
    if period == 0 || len <= period {
        return out;
    }
    for i in period..len {
        let window = &returns[i + 1 - period..=i];
        if window.iter().any(|v| v.is_nan()) {
            continue;
        }
        let mean: f64 = window.iter().sum::<f64>() / period as f64;
        let variance: f64 =
            window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
        out[i] = variance.sqrt() * 100.0;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atr_reference() {
        let high = [10.0, 11.0, 12.0, 11.5];
        let low = [9.0, 10.0, 10.5, 10.0];
        let close = [9.5, 10.5, 11.5, 10.2];
        let out = atr(&high, &low, &close, 3);
        assert!(out[1].is_nan());
        // TRs: 1.0, 1.5, 1.5 -> first ATR = 4/3
        assert!((out[2] - 4.0 / 3.0).abs() < 1e-12);
        // Wilder smoothing: (4/3 * 2 + 1.5) / 3
        assert!((out[3] - (4.0 / 3.0 * 2.0 + 1.5) / 3.0).abs() < 1e-12);
    }

    #[test]
    fn bollinger_bands_are_symmetric() {
        let values = [2.0, 4.0, 6.0, 8.0, 10.0];
        let (upper, middle, lower) = bollinger(&values, 5, 2.0);
        assert!((middle[4] - 6.0).abs() < 1e-12);
        assert!((upper[4] + lower[4] - 2.0 * middle[4]).abs() < 1e-12);
        assert!(upper[3].is_nan());
    }

    #[test]
    fn percent_b_at_middle_is_half() {
        let values = [5.0, 5.0, 5.0, 5.0, 5.0];
        let out = percent_b(&values, 5, 2.0);
        // Zero-width bands collapse to 0.5.
        assert!((out[4] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn choppiness_is_bounded() {
        let high = [10.0, 10.5, 10.2, 10.8, 10.4, 10.9, 10.6];
        let low = [9.5, 9.8, 9.7, 10.0, 9.9, 10.2, 10.1];
        let close = [9.8, 10.2, 10.0, 10.5, 10.1, 10.7, 10.3];
        let out = choppiness(&high, &low, &close, 5);
        for value in out.iter().filter(|v| !v.is_nan()) {
            assert!((0.0..=100.0).contains(value), "choppiness {}", value);
        }
    }

    #[test]
    fn empty_inputs_yield_empty_outputs() {
        assert!(atr(&[], &[], &[], 14).is_empty());
        let (u, m, l) = bollinger(&[], 20, 2.0);
        assert!(u.is_empty() && m.is_empty() && l.is_empty());
        assert!(volatility_index(&[], 10).is_empty());
    }
}
