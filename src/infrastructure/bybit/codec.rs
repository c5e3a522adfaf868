//! Wire codec for the venue's public WebSocket stream.
//!
//! Topics follow `kline.{interval-code}.{symbol}`,
//! `orderbook.{depth}.{symbol}` and `tickers.{symbol}`; pushes arrive as
//! `{topic, type, data, ts}` frames. Interval codes are mapped symmetrically
//! on egress (subscribe) and ingress (decode).

use crate::domain::errors::CoreError;
use crate::domain::market::{BookLevel, Interval, Kline, MarketEvent, OrderBookSnapshot, Ticker};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub fn interval_code(interval: Interval) -> &'static str {
    match interval {
        Interval::M1 => "1",
        Interval::M3 => "3",
        Interval::M5 => "5",
        Interval::M15 => "15",
        Interval::M30 => "30",
        Interval::H1 => "60",
        Interval::H2 => "120",
        Interval::H4 => "240",
        Interval::H6 => "360",
        Interval::H12 => "720",
        Interval::D1 => "D",
        Interval::W1 => "W",
    }
}

pub fn interval_from_code(code: &str) -> Result<Interval, CoreError> {
    match code {
        "1" => Ok(Interval::M1),
        "3" => Ok(Interval::M3),
        "5" => Ok(Interval::M5),
        "15" => Ok(Interval::M15),
        "30" => Ok(Interval::M30),
        "60" => Ok(Interval::H1),
        "120" => Ok(Interval::H2),
        "240" => Ok(Interval::H4),
        "360" => Ok(Interval::H6),
        "720" => Ok(Interval::H12),
        "D" => Ok(Interval::D1),
        "W" => Ok(Interval::W1),
        other => Err(CoreError::Protocol(format!(
            "unknown interval code '{}'",
            other
        ))),
    }
}

pub fn kline_topic(symbol: &str, interval: Interval) -> String {
    format!("kline.{}.{}", interval_code(interval), symbol)
}

pub fn orderbook_topic(symbol: &str, depth: u16) -> String {
    format!("orderbook.{}.{}", depth, symbol)
}

pub fn ticker_topic(symbol: &str) -> String {
    format!("tickers.{}", symbol)
}

#[derive(Debug, Serialize)]
struct OpFrame<'a> {
    op: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
}

pub fn encode_subscribe(topics: &[String]) -> String {
    serde_json::to_string(&OpFrame {
        op: "subscribe",
        args: topics.to_vec(),
    })
    .expect("subscribe frame serializes")
}

pub fn encode_unsubscribe(topics: &[String]) -> String {
    serde_json::to_string(&OpFrame {
        op: "unsubscribe",
        args: topics.to_vec(),
    })
    .expect("unsubscribe frame serializes")
}

pub fn encode_ping() -> String {
    serde_json::to_string(&OpFrame {
        op: "ping",
        args: Vec::new(),
    })
    .expect("ping frame serializes")
}

#[derive(Debug, Serialize, Deserialize)]
struct PushFrame {
    topic: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    ts: Option<i64>,
    data: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct KlinePayload {
    start: i64,
    end: i64,
    interval: String,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    confirm: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderBookPayload {
    s: String,
    b: Vec<[String; 2]>,
    a: Vec<[String; 2]>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TickerPayload {
    symbol: String,
    #[serde(rename = "lastPrice")]
    last_price: String,
    #[serde(rename = "prevPrice24h", default)]
    prev_price_24h: Option<String>,
    #[serde(rename = "price24hPcnt", default)]
    price_24h_pcnt: Option<String>,
    #[serde(rename = "volume24h", default)]
    volume_24h: Option<String>,
    #[serde(rename = "indexPrice", default)]
    index_price: Option<String>,
}

fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, CoreError> {
    Decimal::from_str(raw)
        .map_err(|e| CoreError::Protocol(format!("bad decimal in {}: '{}' ({})", field, raw, e)))
}

fn frame_timestamp(ts: Option<i64>) -> DateTime<Utc> {
    ts.and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

/// Decode one text frame. Returns `Ok(None)` for operational frames
/// (subscribe acks, pongs) that carry no market data.
pub fn decode_frame(text: &str) -> Result<Vec<MarketEvent>, CoreError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    // Operational acks carry "op" or "success" instead of a topic.
    if value.get("topic").is_none() {
        return Ok(Vec::new());
    }
    let frame: PushFrame = serde_json::from_value(value)?;

    let mut parts = frame.topic.splitn(3, '.');
    let channel = parts.next().unwrap_or_default();
    match channel {
        "kline" => {
            let code = parts
                .next()
                .ok_or_else(|| CoreError::Protocol(format!("bad topic '{}'", frame.topic)))?;
            let symbol = parts
                .next()
                .ok_or_else(|| CoreError::Protocol(format!("bad topic '{}'", frame.topic)))?;
            let interval = interval_from_code(code)?;
            let payloads: Vec<KlinePayload> = serde_json::from_value(frame.data)?;
            payloads
                .into_iter()
                .map(|p| {
                    let kline = Kline {
                        symbol: symbol.to_string(),
                        interval,
                        open_time: DateTime::<Utc>::from_timestamp_millis(p.start)
                            .ok_or_else(|| {
                                CoreError::Protocol(format!("bad kline start {}", p.start))
                            })?,
                        open: parse_decimal(&p.open, "open")?,
                        high: parse_decimal(&p.high, "high")?,
                        low: parse_decimal(&p.low, "low")?,
                        close: parse_decimal(&p.close, "close")?,
                        volume: parse_decimal(&p.volume, "volume")?,
                        closed: p.confirm,
                    };
                    kline.validate()?;
                    Ok(MarketEvent::Kline(kline))
                })
                .collect()
        }
        "orderbook" => {
            // Depth segment is part of the topic, not the payload.
            let _depth = parts.next();
            let payload: OrderBookPayload = serde_json::from_value(frame.data)?;
            let parse_side = |levels: &[[String; 2]]| -> Result<Vec<BookLevel>, CoreError> {
                levels
                    .iter()
                    .map(|[price, quantity]| {
                        Ok(BookLevel {
                            price: parse_decimal(price, "price")?,
                            quantity: parse_decimal(quantity, "quantity")?,
                        })
                    })
                    .collect()
            };
            Ok(vec![MarketEvent::OrderBook(OrderBookSnapshot {
                symbol: payload.s.clone(),
                timestamp: frame_timestamp(frame.ts),
                bids: parse_side(&payload.b)?,
                asks: parse_side(&payload.a)?,
            })])
        }
        "tickers" => {
            let payload: TickerPayload = serde_json::from_value(frame.data)?;
            let price = parse_decimal(&payload.last_price, "lastPrice")?;
            let prev = payload
                .prev_price_24h
                .as_deref()
                .map(|p| parse_decimal(p, "prevPrice24h"))
                .transpose()?;
            let pcnt = payload
                .price_24h_pcnt
                .as_deref()
                .map(|p| parse_decimal(p, "price24hPcnt"))
                .transpose()?
                .unwrap_or(Decimal::ZERO);
            Ok(vec![MarketEvent::Ticker(Ticker {
                symbol: payload.symbol,
                price,
                volume_24h: payload
                    .volume_24h
                    .as_deref()
                    .map(|v| parse_decimal(v, "volume24h"))
                    .transpose()?
                    .unwrap_or(Decimal::ZERO),
                change: prev.map(|p| price - p).unwrap_or(Decimal::ZERO),
                change_percent: pcnt * Decimal::ONE_HUNDRED,
                index_price: payload
                    .index_price
                    .as_deref()
                    .map(|v| parse_decimal(v, "indexPrice"))
                    .transpose()?,
                timestamp: frame_timestamp(frame.ts),
            })])
        }
        other => Err(CoreError::Protocol(format!(
            "unknown topic channel '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn interval_codes_are_symmetric() {
        for interval in [
            Interval::M1,
            Interval::M5,
            Interval::H1,
            Interval::H4,
            Interval::D1,
            Interval::W1,
        ] {
            assert_eq!(interval_from_code(interval_code(interval)).unwrap(), interval);
        }
        assert!(interval_from_code("42").is_err());
    }

    #[test]
    fn subscribe_frame_shape() {
        let json = encode_subscribe(&["kline.1.BTCUSDT".to_string()]);
        assert_eq!(json, r#"{"op":"subscribe","args":["kline.1.BTCUSDT"]}"#);
    }

    #[test]
    fn kline_frame_round_trip() {
        let frame = PushFrame {
            topic: "kline.1.BTCUSDT".to_string(),
            kind: Some("snapshot".to_string()),
            ts: Some(1_700_000_060_000),
            data: serde_json::to_value(vec![KlinePayload {
                start: 1_700_000_000_000,
                end: 1_700_000_059_999,
                interval: "1".to_string(),
                open: "100.5".to_string(),
                high: "101".to_string(),
                low: "99.9".to_string(),
                close: "100.7".to_string(),
                volume: "12.34".to_string(),
                confirm: true,
            }])
            .unwrap(),
        };
        let text = serde_json::to_string(&frame).unwrap();

        let events = decode_frame(&text).unwrap();
        assert_eq!(events.len(), 1);
        let MarketEvent::Kline(kline) = &events[0] else {
            panic!("expected kline");
        };
        assert_eq!(kline.symbol, "BTCUSDT");
        assert_eq!(kline.interval, Interval::M1);
        assert_eq!(kline.open, dec!(100.5));
        assert_eq!(kline.high, dec!(101));
        assert_eq!(kline.low, dec!(99.9));
        assert_eq!(kline.close, dec!(100.7));
        assert_eq!(kline.volume, dec!(12.34));
        assert!(kline.closed);
    }

    #[test]
    fn orderbook_frame_decodes_one_sided() {
        let text = r#"{
            "topic": "orderbook.50.ETHUSDT",
            "type": "delta",
            "ts": 1700000000000,
            "data": {"s": "ETHUSDT", "b": [["2000.1", "3"]], "a": []}
        }"#;
        let events = decode_frame(text).unwrap();
        let MarketEvent::OrderBook(book) = &events[0] else {
            panic!("expected order book");
        };
        assert_eq!(book.bids.len(), 1);
        assert!(book.asks.is_empty());
        assert_eq!(book.mid_price(), Some(dec!(2000.1)));
    }

    #[test]
    fn ticker_frame_decodes_index_price() {
        let text = r#"{
            "topic": "tickers.BTCUSDT",
            "type": "snapshot",
            "ts": 1700000000000,
            "data": {
                "symbol": "BTCUSDT",
                "lastPrice": "30000",
                "prevPrice24h": "29000",
                "price24hPcnt": "0.0344",
                "volume24h": "1000",
                "indexPrice": "30100"
            }
        }"#;
        let events = decode_frame(text).unwrap();
        let MarketEvent::Ticker(ticker) = &events[0] else {
            panic!("expected ticker");
        };
        assert_eq!(ticker.price, dec!(30000));
        assert_eq!(ticker.change, dec!(1000));
        assert_eq!(ticker.change_percent, dec!(3.44));
        assert_eq!(ticker.index_price, Some(dec!(30100)));
    }

    #[test]
    fn operational_frames_are_skipped() {
        let ack = r#"{"success":true,"op":"subscribe","conn_id":"x"}"#;
        assert!(decode_frame(ack).unwrap().is_empty());
        let pong = r#"{"op":"pong"}"#;
        assert!(decode_frame(pong).unwrap().is_empty());
    }

    #[test]
    fn malformed_kline_is_a_protocol_error() {
        let text = r#"{
            "topic": "kline.1.BTCUSDT",
            "type": "snapshot",
            "ts": 1,
            "data": [{"start": 0, "end": 1, "interval": "1", "open": "ten",
                      "high": "1", "low": "1", "close": "1", "volume": "0", "confirm": true}]
        }"#;
        assert!(matches!(decode_frame(text), Err(CoreError::Protocol(_))));
    }
}
