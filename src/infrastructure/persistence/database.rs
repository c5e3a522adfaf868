use crate::domain::errors::CoreError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Process-wide database handle. Cheap to clone; every repository borrows
/// the same pool.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) and run pending migrations. A migration
    /// failure aborts startup.
    pub async fn open(db_path: &str) -> Result<Self, CoreError> {
        let url = if db_path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            if let Some(parent) = Path::new(db_path).parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                fs::create_dir_all(parent).await.map_err(|e| {
                    CoreError::Config(format!(
                        "failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            format!("sqlite://{}", db_path)
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| CoreError::Config(format!("invalid database path '{}': {}", db_path, e)))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        // A shared in-memory database exists per connection; cap the pool at
        // one so tests see a single schema.
        let max_connections = if db_path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!(path = db_path, "database opened");

        let db = Self { pool };
        super::migrations::apply(&db.pool).await?;
        Ok(db)
    }

    /// In-memory database for tests.
    #[doc(hidden)]
    pub async fn open_in_memory() -> Result<Self, CoreError> {
        Self::open(":memory:").await
    }
}
