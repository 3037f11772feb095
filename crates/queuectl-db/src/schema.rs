//! Schema creation and config seeding.
//!
//! `initialize` is idempotent: tables and indexes are created if missing and
//! config defaults are inserted only when the key is absent, so operator
//! overrides survive restarts.

use sqlx::SqlitePool;
use tracing::{debug, info};

use queuectl_core::{defaults, Error, Result};

const CREATE_JOBS: &str = "CREATE TABLE IF NOT EXISTS jobs (
    id          TEXT PRIMARY KEY,
    command     TEXT NOT NULL,
    state       TEXT NOT NULL DEFAULT 'pending'
                CHECK (state IN ('pending', 'processing', 'completed')),
    attempts    INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    locked_by   TEXT,
    locked_at   TEXT,
    run_after   TEXT,
    output      TEXT
)";

const CREATE_JOBS_CLAIM_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (state, created_at)";

const CREATE_DEAD_LETTERS: &str = "CREATE TABLE IF NOT EXISTS dead_letters (
    id          TEXT PRIMARY KEY,
    command     TEXT NOT NULL,
    attempts    INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    failed_at   TEXT NOT NULL,
    last_error  TEXT,
    created_at  TEXT NOT NULL
)";

const CREATE_CONFIG: &str = "CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";

/// Config keys seeded on first initialisation.
pub fn seed_entries() -> [(&'static str, String); 3] {
    [
        (defaults::CONFIG_BACKOFF_BASE, defaults::BACKOFF_BASE.to_string()),
        (
            defaults::CONFIG_BASE_DELAY_SECONDS,
            defaults::BASE_DELAY_SECONDS.to_string(),
        ),
        (
            defaults::CONFIG_MAX_RETRIES,
            defaults::JOB_MAX_RETRIES.to_string(),
        ),
    ]
}

/// Create tables and seed config defaults.
pub async fn initialize(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await.map_err(Error::Database)?;

    for statement in [
        CREATE_JOBS,
        CREATE_JOBS_CLAIM_INDEX,
        CREATE_DEAD_LETTERS,
        CREATE_CONFIG,
    ] {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
    }

    let mut seeded = 0u64;
    for (key, value) in seed_entries() {
        let result = sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)")
            .bind(key)
            .bind(&value)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        if result.rows_affected() > 0 {
            debug!(
                subsystem = "database",
                component = "schema",
                key,
                value = %value,
                "Seeded config default"
            );
        }
        seeded += result.rows_affected();
    }

    tx.commit().await.map_err(Error::Database)?;

    info!(
        subsystem = "database",
        component = "schema",
        op = "initialize",
        seeded,
        "Schema ready"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_entries_match_defaults() {
        let seeds = seed_entries();
        assert_eq!(seeds[0], ("backoff_base", "2".to_string()));
        assert_eq!(seeds[1], ("base_delay_seconds", "1".to_string()));
        assert_eq!(seeds[2], ("max_retries", "3".to_string()));
    }
}
