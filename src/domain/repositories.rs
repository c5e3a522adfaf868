//! Repository traits separating the trading core from storage.
//!
//! The live in-memory state owned by each component is authoritative; the
//! persisted rows exist for crash recovery and operator queries.

use crate::domain::errors::CoreError;
use crate::domain::order::Order;
use crate::domain::portfolio::Trade;
use crate::domain::ports::PortfolioSnapshotRecord;
use async_trait::async_trait;

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Insert or update by `(exchange, local_id)`. The
    /// `(exchange, exchange_order_id)` pair is enforced unique by schema.
    async fn upsert(&self, order: &Order) -> Result<(), CoreError>;

    /// All non-terminal orders for one exchange, oldest first.
    async fn load_open(&self, exchange: &str) -> Result<Vec<Order>, CoreError>;

    /// Highest local id ever issued for one exchange; 0 when none.
    async fn max_local_id(&self, exchange: &str) -> Result<u64, CoreError>;

    async fn recent(
        &self,
        exchange: &str,
        symbol: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Order>, CoreError>;
}

#[async_trait]
pub trait TradeRepository: Send + Sync {
    /// Append-only; a duplicate trade id is an integrity violation.
    async fn append(&self, trade: &Trade) -> Result<(), CoreError>;

    async fn recent(&self, exchange: &str, limit: u32) -> Result<Vec<Trade>, CoreError>;
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get(&self, exchange: &str, key: &str) -> Result<Option<String>, CoreError>;

    /// Last-write-wins upsert on `(exchange, key)`.
    async fn set(&self, exchange: &str, key: &str, value: &str) -> Result<(), CoreError>;
}

#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn append(&self, snapshot: &PortfolioSnapshotRecord) -> Result<(), CoreError>;
}
