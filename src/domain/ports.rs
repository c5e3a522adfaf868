use crate::domain::errors::CoreError;
use crate::domain::market::{Interval, Kline, Ticker};
use crate::domain::order::{OrderSide, OrderStatus, OrderType, TimeInForce};
use crate::domain::portfolio::{Balance, Position};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Order submission as the venue sees it. Only native order types reach the
/// venue; locally managed trigger orders submit one of these when they fire.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    /// Client order id echoed back by the venue; ties acks to local records.
    pub client_order_id: String,
}

/// Acceptance acknowledgment for a placed order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeAck {
    pub exchange_id: String,
}

/// An order as reported by the venue's open-orders endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeOrder {
    pub exchange_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
}

/// Exchange-side order change: a fill or a status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub exchange_id: String,
    pub symbol: String,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub fill_price: Option<Decimal>,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// REST surface of one venue. Implementations sign requests, map venue
/// errors into `CoreError` kinds and respect the venue's rate limits.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn venue(&self) -> &str;

    /// Cheap authenticated call used to validate credentials on connect.
    async fn validate_credentials(&self) -> Result<(), CoreError>;

    async fn balances(&self) -> Result<Vec<Balance>, CoreError>;

    async fn positions(&self) -> Result<Vec<Position>, CoreError>;

    async fn open_orders(&self) -> Result<Vec<ExchangeOrder>, CoreError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<ExchangeAck, CoreError>;

    async fn cancel_order(&self, symbol: &str, exchange_id: &str) -> Result<(), CoreError>;

    async fn klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: u32,
    ) -> Result<Vec<Kline>, CoreError>;

    async fn ticker(&self, symbol: &str) -> Result<Ticker, CoreError>;
}

/// A portfolio snapshot persisted once per sync cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioSnapshotRecord {
    pub exchange: String,
    pub equity: Decimal,
    pub cash: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub taken_at: DateTime<Utc>,
}
