use super::nan_vec;
use super::volatility::true_range;

/// Wilder directional movement system: `(adx, plus_di, minus_di)`.
/// DI lines warm up after `period` bars, ADX after `2 * period - 1`.
pub fn adx(high: &[f64], low: &[f64], close: &[f64], period: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let len = close.len();
    let mut adx_out = nan_vec(len);
    let mut plus_out = nan_vec(len);
    let mut minus_out = nan_vec(len);
    if period == 0 || len <= period {
        return (adx_out, plus_out, minus_out);
    }

    let tr = true_range(high, low, close);
    let mut plus_dm = vec![0.0; len];
    let mut minus_dm = vec![0.0; len];
    for i in 1..len {
        let up = high[i] - high[i - 1];
        let down = low[i - 1] - low[i];
        if up > down && up > 0.0 {
            plus_dm[i] = up;
        }
        if down > up && down > 0.0 {
            minus_dm[i] = down;
        }
    }

    // Wilder-smoothed sums, seeded over the first `period` bars.
    let mut tr_s: f64 = tr[1..=period].iter().sum();
    let mut plus_s: f64 = plus_dm[1..=period].iter().sum();
    let mut minus_s: f64 = minus_dm[1..=period].iter().sum();

    let mut dx_history = Vec::with_capacity(len);
    for i in period..len {
        if i > period {
            tr_s = tr_s - tr_s / period as f64 + tr[i];
            plus_s = plus_s - plus_s / period as f64 + plus_dm[i];
            minus_s = minus_s - minus_s / period as f64 + minus_dm[i];
        }
        let (plus_di, minus_di) = if tr_s > 0.0 {
            (100.0 * plus_s / tr_s, 100.0 * minus_s / tr_s)
        } else {
            (0.0, 0.0)
        };
        plus_out[i] = plus_di;
        minus_out[i] = minus_di;

        let di_sum = plus_di + minus_di;
        let dx = if di_sum > 0.0 {
            100.0 * (plus_di - minus_di).abs() / di_sum
        } else {
            0.0
        };
        dx_history.push(dx);

        if dx_history.len() == period {
            adx_out[i] = dx_history.iter().sum::<f64>() / period as f64;
        } else if dx_history.len() > period {
            let prev = adx_out[i - 1];
            adx_out[i] = (prev * (period as f64 - 1.0) + dx) / period as f64;
        }
    }
    (adx_out, plus_out, minus_out)
}

/// Aroon `(up, down)`: bars since window extremes, scaled to 0..=100.
pub fn aroon(high: &[f64], low: &[f64], period: usize) -> (Vec<f64>, Vec<f64>) {
    let len = high.len().min(low.len());
    let mut up = nan_vec(len);
    let mut down = nan_vec(len);
    if period == 0 {
        return (up, down);
    }
    for i in 0..len {
        if i + 1 < period + 1 {
            continue;
        }
        let window = i - period..=i;
        let mut hi_idx = i - period;
        let mut lo_idx = i - period;
        for j in window {
            if high[j] >= high[hi_idx] {
                hi_idx = j;
            }
            if low[j] <= low[lo_idx] {
                lo_idx = j;
            }
        }
        up[i] = 100.0 * (period - (i - hi_idx)) as f64 / period as f64;
        down[i] = 100.0 * (period - (i - lo_idx)) as f64 / period as f64;
    }
    (up, down)
}

/// Parabolic SAR with acceleration `af_step` stepping to `af_max`.
pub fn parabolic_sar(high: &[f64], low: &[f64], af_step: f64, af_max: f64) -> Vec<f64> {
    let len = high.len().min(low.len());
    let mut out = nan_vec(len);
    if len < 2 {
        return out;
    }

    let mut rising = high[1] + low[1] >= high[0] + low[0];
    let mut sar = if rising { low[0] } else { high[0] };
    let mut extreme = if rising { high[1] } else { low[1] };
    let mut af = af_step;

    out[1] = sar;
    for i in 2..len {
        sar += af * (extreme - sar);
        // SAR may not enter the prior two bars' range.
        if rising {
            sar = sar.min(low[i - 1]).min(low[i - 2]);
        } else {
            sar = sar.max(high[i - 1]).max(high[i - 2]);
        }

        if rising && low[i] < sar {
            rising = false;
            sar = extreme;
            extreme = low[i];
            af = af_step;
        } else if !rising && high[i] > sar {
            rising = true;
            sar = extreme;
            extreme = high[i];
            af = af_step;
        } else if rising && high[i] > extreme {
            extreme = high[i];
            af = (af + af_step).min(af_max);
        } else if !rising && low[i] < extreme {
            extreme = low[i];
            af = (af + af_step).min(af_max);
        }
        out[i] = sar;
    }
    out
}

/// Ichimoku cloud:
/// `(tenkan, kijun, senkou_a, senkou_b, chikou)`. Senkou values are the
/// bar's cloud reading, i.e. the midpoints computed `kijun_period` bars
/// earlier; chikou is the close displaced back by `kijun_period`.
pub fn ichimoku(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    tenkan_period: usize,
    kijun_period: usize,
    senkou_b_period: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
    let len = close.len();
    let midpoint = |i: usize, period: usize| -> f64 {
        let window = i + 1 - period..=i;
        let hh = high[window.clone()].iter().cloned().fold(f64::MIN, f64::max);
        let ll = low[window].iter().cloned().fold(f64::MAX, f64::min);
        (hh + ll) / 2.0
    };

    let mut tenkan = nan_vec(len);
    let mut kijun = nan_vec(len);
    let mut senkou_b_raw = nan_vec(len);
    for i in 0..len {
        if i + 1 >= tenkan_period {
            tenkan[i] = midpoint(i, tenkan_period);
        }
        if i + 1 >= kijun_period {
            kijun[i] = midpoint(i, kijun_period);
        }
        if i + 1 >= senkou_b_period {
            senkou_b_raw[i] = midpoint(i, senkou_b_period);
        }
    }

    let mut senkou_a = nan_vec(len);
    let mut senkou_b = nan_vec(len);
    let mut chikou = nan_vec(len);
    for i in 0..len {
        if i >= kijun_period {
            let j = i - kijun_period;
            if !tenkan[j].is_nan() && !kijun[j].is_nan() {
                senkou_a[i] = (tenkan[j] + kijun[j]) / 2.0;
            }
            if !senkou_b_raw[j].is_nan() {
                senkou_b[i] = senkou_b_raw[j];
            }
        }
        if i + kijun_period < len {
            chikou[i] = close[i + kijun_period];
        }
    }
    (tenkan, kijun, senkou_a, senkou_b, chikou)
}

/// ZigZag: confirmed swing extremes on a `threshold_pct` reversal, NaN on
/// every other bar. The most recent provisional swing stays unmarked until
/// a reversal confirms it.
pub fn zigzag(values: &[f64], threshold_pct: f64) -> Vec<f64> {
    let len = values.len();
    let mut out = nan_vec(len);
    if len < 2 || threshold_pct <= 0.0 {
        return out;
    }
    let threshold = threshold_pct / 100.0;

    let mut pivot_idx = 0;
    let mut pivot = values[0];
    let mut rising: Option<bool> = None;

    for i in 1..len {
        let value = values[i];
        match rising {
            None => {
                if value >= pivot * (1.0 + threshold) {
                    rising = Some(true);
                    out[pivot_idx] = pivot;
                    pivot_idx = i;
                    pivot = value;
                } else if value <= pivot * (1.0 - threshold) {
                    rising = Some(false);
                    out[pivot_idx] = pivot;
                    pivot_idx = i;
                    pivot = value;
                } else if value > pivot {
                    // Still undecided; drag the candidate along.
                    pivot_idx = i;
                    pivot = value;
                }
            }
            Some(true) => {
                if value > pivot {
                    pivot_idx = i;
                    pivot = value;
                } else if value <= pivot * (1.0 - threshold) {
                    out[pivot_idx] = pivot;
                    rising = Some(false);
                    pivot_idx = i;
                    pivot = value;
                }
            }
            Some(false) => {
                if value < pivot {
                    pivot_idx = i;
                    pivot = value;
                } else if value >= pivot * (1.0 + threshold) {
                    out[pivot_idx] = pivot;
                    rising = Some(true);
                    pivot_idx = i;
                    pivot = value;
                }
            }
        }
    }
    out
}

/// Rolling least-squares regression over the trailing window:
/// `(slope, intercept, r_squared)` per bar, x measured in bars.
pub fn linreg(values: &[f64], period: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let len = values.len();
    let mut slope_out = nan_vec(len);
    let mut intercept_out = nan_vec(len);
    let mut r2_out = nan_vec(len);
    if period < 2 {
        return (slope_out, intercept_out, r2_out);
    }
    let n = period as f64;
    let x_mean = (n - 1.0) / 2.0;
    let x_var: f64 = (0..period)
        .map(|x| (x as f64 - x_mean).powi(2))
        .sum();

    for i in 0..len {
        if i + 1 < period {
            continue;
        }
        let window = &values[i + 1 - period..=i];
        let y_mean: f64 = window.iter().sum::<f64>() / n;
        let mut cov = 0.0;
        let mut y_var = 0.0;
        for (x, y) in window.iter().enumerate() {
            let dx = x as f64 - x_mean;
            let dy = y - y_mean;
            cov += dx * dy;
            y_var += dy * dy;
        }
        let slope = cov / x_var;
        slope_out[i] = slope;
        intercept_out[i] = y_mean - slope * x_mean;
        r2_out[i] = if y_var > 0.0 {
            (cov * cov) / (x_var * y_var)
        } else {
            1.0
        };
    }
    (slope_out, intercept_out, r2_out)
}
