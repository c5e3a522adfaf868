use super::nan_vec;

/// Classic floor-trader pivots computed from the previous bar:
/// `(pivot, r1, r2, r3, s1, s2, s3)`, each one series per input bar.
#[allow(clippy::type_complexity)]
pub fn pivot_points(
    high: &[f64],
    low: &[f64],
    close: &[f64],
) -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
    let len = close.len();
    let mut pivot = nan_vec(len);
    let mut r1 = nan_vec(len);
    let mut r2 = nan_vec(len);
    let mut r3 = nan_vec(len);
    let mut s1 = nan_vec(len);
    let mut s2 = nan_vec(len);
    let mut s3 = nan_vec(len);
    for i in 1..len {
        let (h, l, c) = (high[i - 1], low[i - 1], close[i - 1]);
        let p = (h + l + c) / 3.0;
        pivot[i] = p;
        r1[i] = 2.0 * p - l;
        s1[i] = 2.0 * p - h;
        r2[i] = p + (h - l);
        s2[i] = p - (h - l);
        r3[i] = h + 2.0 * (p - l);
        s3[i] = l - 2.0 * (h - p);
    }
    (pivot, r1, r2, r3, s1, s2, s3)
}

/// Fibonacci retracement levels between a swing high and a swing low,
/// high-to-low order: 0%, 23.6%, 38.2%, 50%, 61.8%, 78.6%, 100%.
pub fn fibonacci_retracement(swing_high: f64, swing_low: f64) -> Vec<f64> {
    const RATIOS: [f64; 7] = [0.0, 0.236, 0.382, 0.5, 0.618, 0.786, 1.0];
    let range = swing_high - swing_low;
    RATIOS.iter().map(|r| swing_high - range * r).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pivots_from_previous_bar() {
        let high = [12.0, 13.0];
        let low = [10.0, 11.0];
        let close = [11.0, 12.0];
        let (pivot, r1, _r2, _r3, s1, _s2, _s3) = pivot_points(&high, &low, &close);
        assert!(pivot[0].is_nan());
        assert!((pivot[1] - 11.0).abs() < 1e-12);
        assert!((r1[1] - 12.0).abs() < 1e-12);
        assert!((s1[1] - 10.0).abs() < 1e-12);
    }

    #[test]
    fn fibonacci_levels_span_the_range() {
        let levels = fibonacci_retracement(110.0, 100.0);
        assert_eq!(levels.len(), 7);
        assert_eq!(levels[0], 110.0);
        assert_eq!(levels[6], 100.0);
        assert!((levels[3] - 105.0).abs() < 1e-12);
        // Monotone descending.
        for pair in levels.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
    }
}
