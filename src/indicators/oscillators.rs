use super::moving::{ema, sma, wma};
use super::nan_vec;

/// Wilder RSI. Output range 0..=100; flat input converges to 100 (no
/// losses) by convention.
pub fn rsi(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = nan_vec(values.len());
    if period == 0 || values.len() <= period {
        return out;
    }
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = values[i] - values[i - 1];
        if change >= 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = rsi_value(avg_gain, avg_loss);
    for i in period + 1..values.len() {
        let change = values[i] - values[i - 1];
        let (gain, loss) = if change >= 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = rsi_value(avg_gain, avg_loss);
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

/// MACD line, signal line and histogram.
pub fn macd(
    values: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let fast_ema = ema(values, fast);
    let slow_ema = ema(values, slow);
    let mut line = nan_vec(values.len());
    for i in 0..values.len() {
        if !fast_ema[i].is_nan() && !slow_ema[i].is_nan() {
            line[i] = fast_ema[i] - slow_ema[i];
        }
    }
    // Signal is an EMA over the valid tail of the MACD line.
    let mut signal_line = nan_vec(values.len());
    if let Some(first_valid) = line.iter().position(|v| !v.is_nan()) {
        let tail = ema(&line[first_valid..], signal);
        for (offset, value) in tail.into_iter().enumerate() {
            signal_line[first_valid + offset] = value;
        }
    }
    let mut histogram = nan_vec(values.len());
    for i in 0..values.len() {
        if !line[i].is_nan() && !signal_line[i].is_nan() {
            histogram[i] = line[i] - signal_line[i];
        }
    }
    (line, signal_line, histogram)
}

/// Stochastic oscillator: raw %K plus its SMA smoothing %D.
pub fn stochastic(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    k_period: usize,
    d_period: usize,
) -> (Vec<f64>, Vec<f64>) {
    let len = close.len();
    let mut k = nan_vec(len);
    if k_period == 0 {
        return (k.clone(), k);
    }
    for i in 0..len {
        if i + 1 < k_period {
            continue;
        }
        let window = i + 1 - k_period..=i;
        let hh = high[window.clone()].iter().cloned().fold(f64::MIN, f64::max);
        let ll = low[window].iter().cloned().fold(f64::MAX, f64::min);
        let range = hh - ll;
        k[i] = if range > 0.0 {
            100.0 * (close[i] - ll) / range
        } else {
            50.0
        };
    }
    let valid_from = k.iter().position(|v| !v.is_nan()).unwrap_or(len);
    let mut d = nan_vec(len);
    if valid_from < len {
        let tail = sma(&k[valid_from..], d_period);
        for (offset, value) in tail.into_iter().enumerate() {
            d[valid_from + offset] = value;
        }
    }
    (k, d)
}

/// Williams %R, range -100..=0.
pub fn williams_r(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let len = close.len();
    let mut out = nan_vec(len);
    if period == 0 {
        return out;
    }
    for i in 0..len {
        if i + 1 < period {
            continue;
        }
        let window = i + 1 - period..=i;
        let hh = high[window.clone()].iter().cloned().fold(f64::MIN, f64::max);
        let ll = low[window].iter().cloned().fold(f64::MAX, f64::min);
        let range = hh - ll;
        out[i] = if range > 0.0 {
            -100.0 * (hh - close[i]) / range
        } else {
            -50.0
        };
    }
    out
}

/// Commodity channel index with the conventional 0.015 scaling constant.
pub fn cci(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let len = close.len();
    let mut out = nan_vec(len);
    if period == 0 {
        return out;
    }
    let typical: Vec<f64> = (0..len).map(|i| (high[i] + low[i] + close[i]) / 3.0).collect();
    let means = sma(&typical, period);
    for i in 0..len {
        if means[i].is_nan() {
            continue;
        }
        let window = &typical[i + 1 - period..=i];
        let dev: f64 =
            window.iter().map(|v| (v - means[i]).abs()).sum::<f64>() / period as f64;
        out[i] = if dev > 0.0 {
            (typical[i] - means[i]) / (0.015 * dev)
        } else {
            0.0
        };
    }
    out
}

/// Money flow index: volume-weighted RSI over the typical price.
pub fn mfi(high: &[f64], low: &[f64], close: &[f64], volume: &[f64], period: usize) -> Vec<f64> {
    let len = close.len();
    let mut out = nan_vec(len);
    if period == 0 || len <= period {
        return out;
    }
    let typical: Vec<f64> = (0..len).map(|i| (high[i] + low[i] + close[i]) / 3.0).collect();
    for i in period..len {
        let mut positive = 0.0;
        let mut negative = 0.0;
        for j in i + 1 - period..=i {
            let flow = typical[j] * volume[j];
            if typical[j] > typical[j - 1] {
                positive += flow;
            } else if typical[j] < typical[j - 1] {
                negative += flow;
            }
        }
        out[i] = if negative == 0.0 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + positive / negative)
        };
    }
    out
}

/// Price rate of change, percent.
pub fn roc(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = nan_vec(values.len());
    if period == 0 {
        return out;
    }
    for i in period..values.len() {
        if values[i - period] != 0.0 {
            out[i] = 100.0 * (values[i] / values[i - period] - 1.0);
        }
    }
    out
}

/// Percentage price oscillator: MACD normalized by the slow EMA.
pub fn ppo(values: &[f64], fast: usize, slow: usize) -> Vec<f64> {
    let fast_ema = ema(values, fast);
    let slow_ema = ema(values, slow);
    let mut out = nan_vec(values.len());
    for i in 0..values.len() {
        if !fast_ema[i].is_nan() && !slow_ema[i].is_nan() && slow_ema[i] != 0.0 {
            out[i] = 100.0 * (fast_ema[i] - slow_ema[i]) / slow_ema[i];
        }
    }
    out
}

/// Relative vigor index with the standard symmetric 4-bar weighting.
pub fn rvi(open: &[f64], high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let len = close.len();
    let mut out = nan_vec(len);
    if period == 0 || len < period + 3 {
        return out;
    }
    let weight = |series: &dyn Fn(usize) -> f64, i: usize| -> f64 {
        (series(i) + 2.0 * series(i - 1) + 2.0 * series(i - 2) + series(i - 3)) / 6.0
    };
    let co = |i: usize| close[i] - open[i];
    let hl = |i: usize| high[i] - low[i];
    for i in period + 2..len {
        let mut num = 0.0;
        let mut den = 0.0;
        for j in i + 1 - period..=i {
            num += weight(&co, j);
            den += weight(&hl, j);
        }
        out[i] = if den != 0.0 { num / den } else { 0.0 };
    }
    out
}

/// Coppock curve: WMA of the sum of two long ROCs.
pub fn coppock(values: &[f64], roc_long: usize, roc_short: usize, wma_period: usize) -> Vec<f64> {
    let long = roc(values, roc_long);
    let short = roc(values, roc_short);
    let mut sum = nan_vec(values.len());
    for i in 0..values.len() {
        if !long[i].is_nan() && !short[i].is_nan() {
            sum[i] = long[i] + short[i];
        }
    }
    let valid_from = sum.iter().position(|v| !v.is_nan()).unwrap_or(values.len());
    let mut out = nan_vec(values.len());
    if valid_from < values.len() {
        let tail = wma(&sum[valid_from..], wma_period);
        for (offset, value) in tail.into_iter().enumerate() {
            out[valid_from + offset] = value;
        }
    }
    out
}
