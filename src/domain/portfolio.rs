use crate::domain::order::OrderSide;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-asset balance as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub available: Decimal,
    pub locked: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }
}

/// Open position derived from executed trades. `quantity` is signed:
/// positive long, negative short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub average_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn mark(&mut self, price: Decimal, now: DateTime<Utc>) {
        self.current_price = price;
        self.unrealized_pnl = (price - self.average_price) * self.quantity;
        self.updated_at = now;
    }

    pub fn notional(&self) -> Decimal {
        (self.quantity * self.current_price).abs()
    }
}

/// Immutable fill record; the append-only source of position and PnL state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub exchange: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
    pub order_local_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn balance_total_is_available_plus_locked() {
        let balance = Balance {
            asset: "USDT".to_string(),
            available: dec!(900),
            locked: dec!(100),
            updated_at: Utc::now(),
        };
        assert_eq!(balance.total(), dec!(1000));
    }

    #[test]
    fn mark_to_market_recomputes_unrealized() {
        let mut position = Position {
            symbol: "BTCUSDT".to_string(),
            quantity: dec!(2),
            average_price: dec!(100),
            current_price: dec!(100),
            unrealized_pnl: Decimal::ZERO,
            updated_at: Utc::now(),
        };
        position.mark(dec!(110), Utc::now());
        assert_eq!(position.unrealized_pnl, dec!(20));

        position.quantity = dec!(-2);
        position.mark(dec!(110), Utc::now());
        assert_eq!(position.unrealized_pnl, dec!(-20));
    }
}
