use crate::domain::errors::CoreError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Candlestick interval. The set is closed; venue adapters map each variant
/// to their own wire code on subscribe and back on ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H12,
    D1,
    W1,
}

impl Interval {
    pub fn as_duration(&self) -> Duration {
        let secs = match self {
            Interval::M1 => 60,
            Interval::M3 => 3 * 60,
            Interval::M5 => 5 * 60,
            Interval::M15 => 15 * 60,
            Interval::M30 => 30 * 60,
            Interval::H1 => 3600,
            Interval::H2 => 2 * 3600,
            Interval::H4 => 4 * 3600,
            Interval::H6 => 6 * 3600,
            Interval::H12 => 12 * 3600,
            Interval::D1 => 86_400,
            Interval::W1 => 7 * 86_400,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Interval::M1 => "1m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H4 => "4h",
            Interval::H6 => "6h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
            Interval::W1 => "1w",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Interval {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Interval::M1),
            "3m" => Ok(Interval::M3),
            "5m" => Ok(Interval::M5),
            "15m" => Ok(Interval::M15),
            "30m" => Ok(Interval::M30),
            "1h" => Ok(Interval::H1),
            "2h" => Ok(Interval::H2),
            "4h" => Ok(Interval::H4),
            "6h" => Ok(Interval::H6),
            "12h" => Ok(Interval::H12),
            "1d" => Ok(Interval::D1),
            "1w" => Ok(Interval::W1),
            other => Err(CoreError::Config(format!(
                "unsupported interval '{}'",
                other
            ))),
        }
    }
}

/// A closed or still-updating candlestick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    pub interval: Interval,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// False while the venue is still updating the bar.
    pub closed: bool,
}

impl Kline {
    /// Candle shape invariant: low <= open, close <= high.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.low > self.high
            || self.open < self.low
            || self.open > self.high
            || self.close < self.low
            || self.close > self.high
        {
            return Err(CoreError::Protocol(format!(
                "kline {} {} violates OHLC ordering (o={} h={} l={} c={})",
                self.symbol, self.open_time, self.open, self.high, self.low, self.close
            )));
        }
        if self.volume < Decimal::ZERO {
            return Err(CoreError::Protocol(format!(
                "kline {} {} has negative volume {}",
                self.symbol, self.open_time, self.volume
            )));
        }
        Ok(())
    }

    /// Rescale all OHLC fields by `ratio`, preserving candle shape. Used by
    /// venues whose local last-price is badly scaled against the index price.
    pub fn scaled(&self, ratio: Decimal) -> Kline {
        Kline {
            open: self.open * ratio,
            high: self.high * ratio,
            low: self.low * ratio,
            close: self.close * ratio,
            ..self.clone()
        }
    }
}

/// One price level of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Point-in-time order book. May be one-sided; consumers must tolerate a
/// missing side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    /// Price-descending.
    pub bids: Vec<BookLevel>,
    /// Price-ascending.
    pub asks: Vec<BookLevel>,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Midpoint of best bid/ask, falling back to the best available side
    /// when the book is one-sided.
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            (Some(bid), None) => Some(bid),
            (None, Some(ask)) => Some(ask),
            (None, None) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// 24h rolling ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: Decimal,
    pub volume_24h: Decimal,
    pub change: Decimal,
    pub change_percent: Decimal,
    /// Venue index price, when published. Drives the price-sanity ratio.
    pub index_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

/// Fan-out envelope produced by the exchange session.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Kline(Kline),
    OrderBook(OrderBookSnapshot),
    Ticker(Ticker),
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Kline(k) => &k.symbol,
            MarketEvent::OrderBook(b) => &b.symbol,
            MarketEvent::Ticker(t) => &t.symbol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn kline(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Kline {
        Kline {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::M1,
            open_time: Utc::now(),
            open,
            high,
            low,
            close,
            volume: dec!(1),
            closed: true,
        }
    }

    #[test]
    fn interval_round_trips_through_str() {
        for s in ["1m", "5m", "1h", "4h", "1d", "1w"] {
            let interval: Interval = s.parse().unwrap();
            assert_eq!(interval.to_string(), s);
        }
        assert!("7m".parse::<Interval>().is_err());
    }

    #[test]
    fn kline_shape_invariant() {
        assert!(kline(dec!(10), dec!(12), dec!(9), dec!(11)).validate().is_ok());
        assert!(kline(dec!(10), dec!(9), dec!(11), dec!(10)).validate().is_err());
        assert!(kline(dec!(13), dec!(12), dec!(9), dec!(11)).validate().is_err());
    }

    #[test]
    fn kline_scaling_preserves_shape() {
        let k = kline(dec!(10), dec!(12), dec!(9), dec!(11)).scaled(dec!(2));
        assert_eq!(k.open, dec!(20));
        assert_eq!(k.high, dec!(24));
        assert_eq!(k.low, dec!(18));
        assert_eq!(k.close, dec!(22));
        assert!(k.validate().is_ok());
    }

    #[test]
    fn mid_price_two_sided_and_fallbacks() {
        let mut book = OrderBookSnapshot {
            symbol: "BTCUSDT".to_string(),
            timestamp: Utc::now(),
            bids: vec![BookLevel {
                price: dec!(100),
                quantity: dec!(1),
            }],
            asks: vec![BookLevel {
                price: dec!(102),
                quantity: dec!(2),
            }],
        };
        assert_eq!(book.mid_price(), Some(dec!(101)));

        book.asks.clear();
        assert_eq!(book.mid_price(), Some(dec!(100)));

        book.bids.clear();
        assert_eq!(book.mid_price(), None);
        assert!(book.is_empty());
    }
}
