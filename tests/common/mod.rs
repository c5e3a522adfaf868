//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use helmsman::domain::errors::CoreError;
use helmsman::domain::market::{Interval, Kline, Ticker};
use helmsman::domain::portfolio::{Balance, Position};
use helmsman::domain::ports::{ExchangeAck, ExchangeClient, ExchangeOrder, OrderRequest};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Scriptable venue double: records placements, serves canned responses.
#[derive(Default)]
pub struct MockExchangeClient {
    pub balances: Mutex<Vec<Balance>>,
    pub positions: Mutex<Vec<Position>>,
    pub open_orders: Mutex<Vec<ExchangeOrder>>,
    pub placed: Mutex<Vec<OrderRequest>>,
    /// Popped front-first on each place; empty means auto-accept.
    pub place_responses: Mutex<VecDeque<Result<ExchangeAck, CoreError>>>,
    next_id: AtomicU64,
}

impl MockExchangeClient {
    pub fn with_cash(amount: Decimal) -> Self {
        let client = MockExchangeClient::default();
        client.balances.lock().unwrap().push(Balance {
            asset: "USDT".to_string(),
            available: amount,
            locked: Decimal::ZERO,
            updated_at: Utc::now(),
        });
        client
    }

    pub fn placed_count(&self) -> usize {
        self.placed.lock().unwrap().len()
    }

    pub fn queue_place_response(&self, response: Result<ExchangeAck, CoreError>) {
        self.place_responses.lock().unwrap().push_back(response);
    }
}

#[async_trait]
impl ExchangeClient for MockExchangeClient {
    fn venue(&self) -> &str {
        "bybit"
    }

    async fn validate_credentials(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn balances(&self) -> Result<Vec<Balance>, CoreError> {
        Ok(self.balances.lock().unwrap().clone())
    }

    async fn positions(&self) -> Result<Vec<Position>, CoreError> {
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn open_orders(&self) -> Result<Vec<ExchangeOrder>, CoreError> {
        Ok(self.open_orders.lock().unwrap().clone())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<ExchangeAck, CoreError> {
        self.placed.lock().unwrap().push(request.clone());
        if let Some(response) = self.place_responses.lock().unwrap().pop_front() {
            return response;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ExchangeAck {
            exchange_id: format!("mock-{}", id),
        })
    }

    async fn cancel_order(&self, _symbol: &str, _exchange_id: &str) -> Result<(), CoreError> {
        Ok(())
    }

    async fn klines(
        &self,
        _symbol: &str,
        _interval: Interval,
        _limit: u32,
    ) -> Result<Vec<Kline>, CoreError> {
        Ok(Vec::new())
    }

    async fn ticker(&self, symbol: &str) -> Result<Ticker, CoreError> {
        Ok(Ticker {
            symbol: symbol.to_string(),
            price: dec!(100),
            volume_24h: Decimal::ZERO,
            change: Decimal::ZERO,
            change_percent: Decimal::ZERO,
            index_price: None,
            timestamp: Utc::now(),
        })
    }
}

/// Poll `check` until it returns true or the deadline passes.
pub async fn wait_until<F>(mut check: F, what: &str)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

pub fn closed_kline(symbol: &str, minute: u32, close: Decimal) -> Kline {
    use chrono::TimeZone;
    Kline {
        symbol: symbol.to_string(),
        interval: Interval::M1,
        open_time: chrono::Utc
            .with_ymd_and_hms(2024, 1, 1, 0, minute, 0)
            .unwrap(),
        open: close,
        high: close,
        low: close,
        close,
        volume: Decimal::ONE,
        closed: true,
    }
}
