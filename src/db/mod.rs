//! Database module - SQLite consumption store

mod consumption;

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::config::DatabaseConfig;
use crate::error::SyncError;

/// SQLite database wrapper
#[derive(Clone)]
pub struct ConsumptionStore {
    pool: SqlitePool,
}

impl ConsumptionStore {
    /// Open (creating if missing) the database file from configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, SyncError> {
        Self::open(&config.path).await
    }

    pub async fn open(path: &str) -> Result<Self, SyncError> {
        tracing::info!("[Store] Opening SQLite database at {}", path);

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .min_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), SyncError> {
        // UNIQUE(meter_serial, interval_start) is the merge's idempotence guarantee
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS consumption (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                meter_serial TEXT NOT NULL,
                meter_type TEXT NOT NULL,
                interval_start TEXT NOT NULL,
                interval_end TEXT NOT NULL,
                consumption_kwh REAL NOT NULL CHECK (consumption_kwh >= 0),
                created_at TEXT NOT NULL,
                UNIQUE(meter_serial, interval_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
