//! SQLite repositories. Decimals are stored as text to avoid lossy float
//! round-trips; timestamps as epoch milliseconds.

use crate::domain::errors::CoreError;
use crate::domain::order::Order;
use crate::domain::portfolio::Trade;
use crate::domain::ports::PortfolioSnapshotRecord;
use crate::domain::repositories::{
    OrderRepository, SettingsRepository, SnapshotRepository, TradeRepository,
};
use crate::infrastructure::persistence::database::Database;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::str::FromStr;
use uuid::Uuid;

fn decimal_column(row: &SqliteRow, column: &str) -> Result<Decimal, CoreError> {
    let raw: String = row.get(column);
    Decimal::from_str(&raw)
        .map_err(|e| CoreError::Integrity(format!("corrupt decimal in {}: {}", column, e)))
}

fn optional_decimal_column(row: &SqliteRow, column: &str) -> Result<Option<Decimal>, CoreError> {
    let raw: Option<String> = row.get(column);
    raw.map(|s| {
        Decimal::from_str(&s)
            .map_err(|e| CoreError::Integrity(format!("corrupt decimal in {}: {}", column, e)))
    })
    .transpose()
}

fn millis_column(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, CoreError> {
    let millis: i64 = row.get(column);
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| CoreError::Integrity(format!("corrupt timestamp in {}", column)))
}

pub struct SqliteOrderRepository {
    database: Database,
}

impl SqliteOrderRepository {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    fn row_to_order(row: &SqliteRow) -> Result<Order, CoreError> {
        let side: String = row.get("side");
        let order_type: String = row.get("order_type");
        let status: String = row.get("status");
        let time_in_force: Option<String> = row.get("time_in_force");
        Ok(Order {
            local_id: row.get::<i64, _>("local_id") as u64,
            exchange_id: row.get("exchange_order_id"),
            exchange: row.get("exchange"),
            symbol: row.get("symbol"),
            side: side.parse()?,
            order_type: order_type.parse()?,
            quantity: decimal_column(row, "quantity")?,
            filled_quantity: decimal_column(row, "filled_quantity")?,
            limit_price: optional_decimal_column(row, "limit_price")?,
            stop_price: optional_decimal_column(row, "stop_price")?,
            trail_amount: optional_decimal_column(row, "trail_amount")?,
            trail_percent: optional_decimal_column(row, "trail_percent")?,
            time_in_force: match time_in_force.as_deref() {
                Some("GTC") => Some(crate::domain::order::TimeInForce::Gtc),
                Some("IOC") => Some(crate::domain::order::TimeInForce::Ioc),
                Some("FOK") => Some(crate::domain::order::TimeInForce::Fok),
                Some("PostOnly") => Some(crate::domain::order::TimeInForce::PostOnly),
                _ => None,
            },
            status: status.parse()?,
            high_water_mark: optional_decimal_column(row, "high_water_mark")?,
            trigger_price: optional_decimal_column(row, "trigger_price")?,
            is_triggered: row.get::<i64, _>("is_triggered") != 0,
            parent_local_id: row
                .get::<Option<i64>, _>("parent_local_id")
                .map(|v| v as u64),
            created_at: millis_column(row, "created_at")?,
            updated_at: millis_column(row, "updated_at")?,
        })
    }
}

#[async_trait]
impl OrderRepository for SqliteOrderRepository {
    async fn upsert(&self, order: &Order) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO orders (
                exchange, local_id, exchange_order_id, symbol, side, order_type,
                quantity, filled_quantity, limit_price, stop_price,
                trail_amount, trail_percent, time_in_force, status,
                high_water_mark, trigger_price, is_triggered, parent_local_id,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(exchange, local_id) DO UPDATE SET
                exchange_order_id = excluded.exchange_order_id,
                filled_quantity = excluded.filled_quantity,
                status = excluded.status,
                high_water_mark = excluded.high_water_mark,
                trigger_price = excluded.trigger_price,
                is_triggered = excluded.is_triggered,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&order.exchange)
        .bind(order.local_id as i64)
        .bind(&order.exchange_id)
        .bind(&order.symbol)
        .bind(order.side.to_string().to_ascii_lowercase())
        .bind(order.order_type.to_string())
        .bind(order.quantity.to_string())
        .bind(order.filled_quantity.to_string())
        .bind(order.limit_price.map(|d| d.to_string()))
        .bind(order.stop_price.map(|d| d.to_string()))
        .bind(order.trail_amount.map(|d| d.to_string()))
        .bind(order.trail_percent.map(|d| d.to_string()))
        .bind(order.time_in_force.map(|t| t.to_string()))
        .bind(order.status.to_string())
        .bind(order.high_water_mark.map(|d| d.to_string()))
        .bind(order.trigger_price.map(|d| d.to_string()))
        .bind(i64::from(order.is_triggered))
        .bind(order.parent_local_id.map(|v| v as i64))
        .bind(order.created_at.timestamp_millis())
        .bind(order.updated_at.timestamp_millis())
        .execute(&self.database.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(CoreError::Integrity(format!(
                    "duplicate exchange order id {:?} on {}",
                    order.exchange_id, order.exchange
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load_open(&self, exchange: &str) -> Result<Vec<Order>, CoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM orders
            WHERE exchange = ? AND status IN ('pending', 'open', 'partially_filled')
            ORDER BY local_id ASC
            "#,
        )
        .bind(exchange)
        .fetch_all(&self.database.pool)
        .await?;
        rows.iter().map(Self::row_to_order).collect()
    }

    async fn max_local_id(&self, exchange: &str) -> Result<u64, CoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(local_id), 0) AS max_id FROM orders WHERE exchange = ?")
            .bind(exchange)
            .fetch_one(&self.database.pool)
            .await?;
        Ok(row.get::<i64, _>("max_id") as u64)
    }

    async fn recent(
        &self,
        exchange: &str,
        symbol: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Order>, CoreError> {
        let rows = match symbol {
            Some(symbol) => {
                sqlx::query(
                    r#"
                    SELECT * FROM orders
                    WHERE exchange = ? AND symbol = ?
                    ORDER BY local_id DESC LIMIT ?
                    "#,
                )
                .bind(exchange)
                .bind(symbol)
                .bind(i64::from(limit))
                .fetch_all(&self.database.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM orders WHERE exchange = ? ORDER BY local_id DESC LIMIT ?",
                )
                .bind(exchange)
                .bind(i64::from(limit))
                .fetch_all(&self.database.pool)
                .await?
            }
        };
        rows.iter().map(Self::row_to_order).collect()
    }
}

pub struct SqliteTradeRepository {
    database: Database,
}

impl SqliteTradeRepository {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

#[async_trait]
impl TradeRepository for SqliteTradeRepository {
    async fn append(&self, trade: &Trade) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades (id, exchange, symbol, side, quantity, price, fee, timestamp, order_local_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(trade.id.to_string())
        .bind(&trade.exchange)
        .bind(&trade.symbol)
        .bind(trade.side.to_string().to_ascii_lowercase())
        .bind(trade.quantity.to_string())
        .bind(trade.price.to_string())
        .bind(trade.fee.to_string())
        .bind(trade.timestamp.timestamp_millis())
        .bind(trade.order_local_id as i64)
        .execute(&self.database.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                CoreError::Integrity(format!("duplicate trade id {}", trade.id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn recent(&self, exchange: &str, limit: u32) -> Result<Vec<Trade>, CoreError> {
        let rows = sqlx::query(
            "SELECT * FROM trades WHERE exchange = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(exchange)
        .bind(i64::from(limit))
        .fetch_all(&self.database.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let side: String = row.get("side");
                Ok(Trade {
                    id: Uuid::parse_str(&id)
                        .map_err(|e| CoreError::Integrity(format!("corrupt trade id: {}", e)))?,
                    exchange: row.get("exchange"),
                    symbol: row.get("symbol"),
                    side: side.parse()?,
                    quantity: decimal_column(row, "quantity")?,
                    price: decimal_column(row, "price")?,
                    fee: decimal_column(row, "fee")?,
                    timestamp: millis_column(row, "timestamp")?,
                    order_local_id: row.get::<i64, _>("order_local_id") as u64,
                })
            })
            .collect()
    }
}

pub struct SqliteSettingsRepository {
    database: Database,
}

impl SqliteSettingsRepository {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

#[async_trait]
impl SettingsRepository for SqliteSettingsRepository {
    async fn get(&self, exchange: &str, key: &str) -> Result<Option<String>, CoreError> {
        let row = sqlx::query("SELECT value FROM settings WHERE exchange = ? AND key = ?")
            .bind(exchange)
            .bind(key)
            .fetch_optional(&self.database.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn set(&self, exchange: &str, key: &str, value: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO settings (exchange, key, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(exchange, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(exchange)
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }
}

pub struct SqliteSnapshotRepository {
    database: Database,
}

impl SqliteSnapshotRepository {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

#[async_trait]
impl SnapshotRepository for SqliteSnapshotRepository {
    async fn append(&self, snapshot: &PortfolioSnapshotRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO portfolio_snapshots (exchange, equity, cash, realized_pnl, unrealized_pnl, taken_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.exchange)
        .bind(snapshot.equity.to_string())
        .bind(snapshot.cash.to_string())
        .bind(snapshot.realized_pnl.to_string())
        .bind(snapshot.unrealized_pnl.to_string())
        .bind(snapshot.taken_at.timestamp_millis())
        .execute(&self.database.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{OrderIntent, OrderSide, OrderType};
    use rust_decimal_macros::dec;

    async fn database() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn sample_order(local_id: u64) -> Order {
        let mut intent = OrderIntent::market("BTCUSDT", OrderSide::Sell, dec!(1));
        intent.order_type = OrderType::TrailingStop;
        intent.trail_percent = Some(dec!(2));
        Order::from_intent(local_id, "bybit", &intent, Utc::now())
    }

    #[tokio::test]
    async fn order_upsert_round_trips_trigger_state() {
        let db = database().await;
        let repo = SqliteOrderRepository::new(db);

        let mut order = sample_order(1);
        order.high_water_mark = Some(dec!(112));
        order.trigger_price = Some(dec!(109.76));
        repo.upsert(&order).await.unwrap();

        order.is_triggered = true;
        order.exchange_id = Some("abc-1".to_string());
        repo.upsert(&order).await.unwrap();

        let open = repo.load_open("bybit").await.unwrap();
        assert_eq!(open.len(), 1);
        let loaded = &open[0];
        assert_eq!(loaded.high_water_mark, Some(dec!(112)));
        assert_eq!(loaded.trigger_price, Some(dec!(109.76)));
        assert!(loaded.is_triggered);
        assert_eq!(loaded.exchange_id.as_deref(), Some("abc-1"));
        assert_eq!(repo.max_local_id("bybit").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_exchange_order_id_is_integrity_error() {
        let db = database().await;
        let repo = SqliteOrderRepository::new(db);

        let mut first = sample_order(1);
        first.exchange_id = Some("dup".to_string());
        repo.upsert(&first).await.unwrap();

        let mut second = sample_order(2);
        second.exchange_id = Some("dup".to_string());
        let err = repo.upsert(&second).await.unwrap_err();
        assert!(matches!(err, CoreError::Integrity(_)));
    }

    #[tokio::test]
    async fn settings_set_get_round_trip() {
        let db = database().await;
        let repo = SqliteSettingsRepository::new(db);

        assert_eq!(repo.get("bybit", "max_drawdown").await.unwrap(), None);
        repo.set("bybit", "max_drawdown", "0.15").await.unwrap();
        assert_eq!(
            repo.get("bybit", "max_drawdown").await.unwrap().as_deref(),
            Some("0.15")
        );
        // Last write wins.
        repo.set("bybit", "max_drawdown", "0.20").await.unwrap();
        assert_eq!(
            repo.get("bybit", "max_drawdown").await.unwrap().as_deref(),
            Some("0.20")
        );
    }

    #[tokio::test]
    async fn trades_are_append_only() {
        let db = database().await;
        let repo = SqliteTradeRepository::new(db);
        let trade = Trade {
            id: Uuid::new_v4(),
            exchange: "bybit".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(0.5),
            price: dec!(30000),
            fee: dec!(0.3),
            timestamp: Utc::now(),
            order_local_id: 9,
        };
        repo.append(&trade).await.unwrap();
        let err = repo.append(&trade).await.unwrap_err();
        assert!(matches!(err, CoreError::Integrity(_)));

        let recent = repo.recent("bybit", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].price, dec!(30000));
    }
}
