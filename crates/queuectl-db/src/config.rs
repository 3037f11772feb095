//! Config store backed by the `config` table.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::info;

use queuectl_core::{ConfigEntry, ConfigRepository, Error, Result};

/// SQLite implementation of ConfigRepository.
#[derive(Clone)]
pub struct SqliteConfigRepository {
    pool: SqlitePool,
}

impl SqliteConfigRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfigRepository for SqliteConfigRepository {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(Error::InvalidInput("config key must not be empty".to_string()));
        }

        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        info!(
            subsystem = "config",
            component = "store",
            op = "set",
            key,
            value,
            "Config updated"
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ConfigEntry>> {
        let rows = sqlx::query("SELECT key, value FROM config ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        rows.iter()
            .map(|row| {
                Ok(ConfigEntry {
                    key: row.try_get("key").map_err(Error::Database)?,
                    value: row.try_get("value").map_err(Error::Database)?,
                })
            })
            .collect()
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        if key.trim().is_empty() {
            return Err(Error::InvalidInput("config key must not be empty".to_string()));
        }

        // One statement so concurrent processes never lose an update.
        // CAST of a non-numeric value yields 0.
        let value: String = sqlx::query_scalar(
            "INSERT INTO config (key, value) VALUES (?1, CAST(MAX(?2, 0) AS TEXT))
             ON CONFLICT(key) DO UPDATE
                 SET value = CAST(MAX(CAST(value AS INTEGER) + ?2, 0) AS TEXT)
             RETURNING value",
        )
        .bind(key)
        .bind(delta)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        value
            .parse::<i64>()
            .map_err(|e| Error::Internal(format!("config counter '{key}' is not an integer: {e}")))
    }
}
