use crate::domain::market::Kline;
use rust_decimal::prelude::ToPrimitive;
use std::collections::VecDeque;

/// Rolling window of the most recent klines for one `(symbol, interval)`.
/// An update for the bar already at the tail replaces it in place, so the
/// window holds at most one entry per open_time.
pub struct KlineWindow {
    capacity: usize,
    klines: VecDeque<Kline>,
}

impl KlineWindow {
    pub fn new(capacity: usize) -> Self {
        KlineWindow {
            capacity: capacity.max(1),
            klines: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, kline: Kline) {
        if let Some(last) = self.klines.back_mut()
            && last.open_time == kline.open_time
        {
            *last = kline;
            return;
        }
        self.klines.push_back(kline);
        while self.klines.len() > self.capacity {
            self.klines.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.klines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.klines.is_empty()
    }

    pub fn last(&self) -> Option<&Kline> {
        self.klines.back()
    }

    fn series(&self, f: impl Fn(&Kline) -> rust_decimal::Decimal) -> Vec<f64> {
        self.klines
            .iter()
            .map(|k| f(k).to_f64().unwrap_or(f64::NAN))
            .collect()
    }

    pub fn opens(&self) -> Vec<f64> {
        self.series(|k| k.open)
    }

    pub fn highs(&self) -> Vec<f64> {
        self.series(|k| k.high)
    }

    pub fn lows(&self) -> Vec<f64> {
        self.series(|k| k.low)
    }

    pub fn closes(&self) -> Vec<f64> {
        self.series(|k| k.close)
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.series(|k| k.volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::Interval;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    fn kline(minute: u32, close: i64) -> Kline {
        Kline {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::M1,
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
            open: Decimal::from(close),
            high: Decimal::from(close),
            low: Decimal::from(close),
            close: Decimal::from(close),
            volume: Decimal::ONE,
            closed: true,
        }
    }

    #[test]
    fn capacity_is_enforced() {
        let mut window = KlineWindow::new(3);
        for minute in 0..5 {
            window.push(kline(minute, i64::from(minute) + 10));
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.closes(), vec![12.0, 13.0, 14.0]);
    }

    #[test]
    fn same_bar_update_replaces_tail() {
        let mut window = KlineWindow::new(10);
        window.push(kline(0, 10));
        let mut update = kline(0, 11);
        update.closed = false;
        window.push(update);
        assert_eq!(window.len(), 1);
        assert_eq!(window.closes(), vec![11.0]);
    }
}
