//! Versioned forward-only schema migrations.
//!
//! Each migration is applied inside a dirty-flagged ledger row: the row is
//! written with `dirty = 1`, the statements run, then the flag clears. A
//! crash mid-migration leaves a dirty row for the latest version; recovery
//! drops that version's objects and reapplies it. A dirty row for anything
//! other than the latest pending version aborts startup.

use crate::domain::errors::CoreError;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::{info, warn};

struct Migration {
    version: i64,
    name: &'static str,
    up: &'static [&'static str],
    /// Objects to drop when recovering an interrupted run of this version.
    created_objects: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "orders",
        up: &[
            r#"
            CREATE TABLE orders (
                exchange TEXT NOT NULL,
                local_id INTEGER NOT NULL,
                exchange_order_id TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                quantity TEXT NOT NULL,
                filled_quantity TEXT NOT NULL DEFAULT '0',
                limit_price TEXT,
                stop_price TEXT,
                trail_amount TEXT,
                trail_percent TEXT,
                time_in_force TEXT,
                status TEXT NOT NULL,
                high_water_mark TEXT,
                trigger_price TEXT,
                is_triggered INTEGER NOT NULL DEFAULT 0,
                parent_local_id INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (exchange, local_id)
            )
            "#,
            r#"
            CREATE UNIQUE INDEX idx_orders_exchange_order_id
            ON orders (exchange, exchange_order_id)
            WHERE exchange_order_id IS NOT NULL
            "#,
            r#"
            CREATE INDEX idx_orders_exchange_status ON orders (exchange, status)
            "#,
        ],
        created_objects: &["orders"],
    },
    Migration {
        version: 2,
        name: "settings",
        up: &[r#"
            CREATE TABLE settings (
                actor_type TEXT NOT NULL DEFAULT '',
                actor_id TEXT NOT NULL DEFAULT '',
                exchange TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (exchange, key)
            )
            "#],
        created_objects: &["settings"],
    },
    Migration {
        version: 3,
        name: "trades",
        up: &[
            r#"
            CREATE TABLE trades (
                id TEXT PRIMARY KEY,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                fee TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                order_local_id INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE INDEX idx_trades_exchange_time ON trades (exchange, timestamp)
            "#,
        ],
        created_objects: &["trades"],
    },
    Migration {
        version: 4,
        name: "portfolio_snapshots",
        up: &[r#"
            CREATE TABLE portfolio_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange TEXT NOT NULL,
                equity TEXT NOT NULL,
                cash TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                taken_at INTEGER NOT NULL
            )
            "#],
        created_objects: &["portfolio_snapshots"],
    },
];

pub async fn apply(pool: &SqlitePool) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            dirty INTEGER NOT NULL DEFAULT 0,
            applied_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    recover_dirty(pool).await?;

    let current = current_version(pool).await?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        run_migration(pool, migration).await?;
    }
    Ok(())
}

async fn current_version(pool: &SqlitePool) -> Result<i64, CoreError> {
    let row = sqlx::query("SELECT COALESCE(MAX(version), 0) AS v FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    Ok(row.get::<i64, _>("v"))
}

/// A dirty row means a previous process died mid-migration. Only the latest
/// version is recoverable: drop whatever it created and let `apply` rerun
/// it. Anything else indicates a ledger that no longer matches this binary.
async fn recover_dirty(pool: &SqlitePool) -> Result<(), CoreError> {
    let dirty: Vec<i64> = sqlx::query("SELECT version FROM schema_migrations WHERE dirty = 1")
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|row| row.get::<i64, _>("version"))
        .collect();

    let Some(&version) = dirty.first() else {
        return Ok(());
    };
    let latest_known = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
    if dirty.len() > 1 || version > latest_known {
        return Err(CoreError::Integrity(format!(
            "unrecoverable migration ledger: dirty versions {:?}",
            dirty
        )));
    }
    let Some(migration) = MIGRATIONS.iter().find(|m| m.version == version) else {
        return Err(CoreError::Integrity(format!(
            "dirty migration version {} unknown to this binary",
            version
        )));
    };

    warn!(version, name = migration.name, "recovering interrupted migration");
    for object in migration.created_objects {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", object))
            .execute(pool)
            .await?;
    }
    sqlx::query("DELETE FROM schema_migrations WHERE version = ?")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

async fn run_migration(pool: &SqlitePool, migration: &Migration) -> Result<(), CoreError> {
    let now = chrono::Utc::now().timestamp_millis();
    sqlx::query("INSERT INTO schema_migrations (version, name, dirty, applied_at) VALUES (?, ?, 1, ?)")
        .bind(migration.version)
        .bind(migration.name)
        .bind(now)
        .execute(pool)
        .await?;

    for statement in migration.up {
        sqlx::query(statement).execute(pool).await?;
    }

    sqlx::query("UPDATE schema_migrations SET dirty = 0 WHERE version = ?")
        .bind(migration.version)
        .execute(pool)
        .await?;
    info!(version = migration.version, name = migration.name, "migration applied");
    Ok(())
}
