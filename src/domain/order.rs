use crate::domain::errors::CoreError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for OrderSide {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(CoreError::Config(format!("invalid order side '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    StopLimit,
    TrailingStop,
}

impl OrderType {
    /// Order types the venue itself accepts. Everything else is a local
    /// state machine that submits one of these on trigger.
    pub fn is_native(&self) -> bool {
        matches!(self, OrderType::Market | OrderType::Limit)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::StopMarket => "stop_market",
            OrderType::StopLimit => "stop_limit",
            OrderType::TrailingStop => "trailing_stop",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for OrderType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "market" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            "stop_market" => Ok(OrderType::StopMarket),
            "stop_limit" => Ok(OrderType::StopLimit),
            "trailing_stop" => Ok(OrderType::TrailingStop),
            other => Err(CoreError::Config(format!("invalid order type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    PostOnly,
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
            TimeInForce::PostOnly => "PostOnly",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Terminal statuses are immutable once set.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for OrderStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "open" => Ok(OrderStatus::Open),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "rejected" => Ok(OrderStatus::Rejected),
            other => Err(CoreError::Config(format!(
                "invalid order status '{}'",
                other
            ))),
        }
    }
}

/// Durable order record. `local_id` is monotonic per exchange;
/// `(exchange, exchange_id)` is unique when the exchange id is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub local_id: u64,
    pub exchange_id: Option<String>,
    pub exchange: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub trail_amount: Option<Decimal>,
    pub trail_percent: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub status: OrderStatus,
    /// Most favorable price seen since a trailing stop activated.
    pub high_water_mark: Option<Decimal>,
    /// Last computed trigger price for price-triggered orders.
    pub trigger_price: Option<Decimal>,
    pub is_triggered: bool,
    /// Local id of the advanced order that spawned this child order.
    pub parent_local_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn from_intent(local_id: u64, exchange: &str, intent: &OrderIntent, now: DateTime<Utc>) -> Order {
        Order {
            local_id,
            exchange_id: None,
            exchange: exchange.to_string(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            order_type: intent.order_type,
            quantity: intent.quantity,
            filled_quantity: Decimal::ZERO,
            limit_price: intent.limit_price,
            stop_price: intent.stop_price,
            trail_amount: intent.trail_amount,
            trail_percent: intent.trail_percent,
            time_in_force: intent.time_in_force,
            status: OrderStatus::Pending,
            high_water_mark: None,
            trigger_price: None,
            is_triggered: false,
            parent_local_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Field requirements per order type.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.quantity <= Decimal::ZERO {
            return Err(CoreError::Validation(format!(
                "Order quantity must be positive, got {}",
                self.quantity
            )));
        }
        match self.order_type {
            OrderType::Limit => {
                if self.limit_price.is_none() {
                    return Err(CoreError::Validation(
                        "Limit order requires a limit price".to_string(),
                    ));
                }
            }
            OrderType::StopMarket => {
                if self.stop_price.is_none() {
                    return Err(CoreError::Validation(
                        "Stop order requires a stop price".to_string(),
                    ));
                }
            }
            OrderType::StopLimit => {
                if self.stop_price.is_none() || self.limit_price.is_none() {
                    return Err(CoreError::Validation(
                        "Stop-limit order requires both a stop price and a limit price".to_string(),
                    ));
                }
            }
            OrderType::TrailingStop => {
                if self.trail_amount.is_none() && self.trail_percent.is_none() {
                    return Err(CoreError::Validation(
                        "Trailing stop requires a trail amount or a trail percent".to_string(),
                    ));
                }
                if let Some(amount) = self.trail_amount
                    && amount <= Decimal::ZERO
                {
                    return Err(CoreError::Validation(format!(
                        "Trail amount must be positive, got {}",
                        amount
                    )));
                }
                if let Some(percent) = self.trail_percent
                    && (percent <= Decimal::ZERO || percent >= Decimal::ONE_HUNDRED)
                {
                    return Err(CoreError::Validation(format!(
                        "Trail percent must be in (0, 100), got {}",
                        percent
                    )));
                }
            }
            OrderType::Market => {}
        }
        Ok(())
    }

    /// Transition to `next`, refusing to mutate a terminal status.
    pub fn transition(&mut self, next: OrderStatus, now: DateTime<Utc>) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::Integrity(format!(
                "order {} is {} and cannot transition to {}",
                self.local_id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_price_triggered_type(&self) -> bool {
        matches!(
            self.order_type,
            OrderType::StopMarket | OrderType::StopLimit | OrderType::TrailingStop
        )
    }
}

/// A trade intent emitted by a strategy or rebalancer script, before risk
/// validation has seen it.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub trail_amount: Option<Decimal>,
    pub trail_percent: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub reason: String,
}

impl OrderIntent {
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> OrderIntent {
        OrderIntent {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
            stop_price: None,
            trail_amount: None,
            trail_percent: None,
            time_in_force: None,
            reason: String::new(),
        }
    }
}
