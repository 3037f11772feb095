//! # queuectl-db
//!
//! SQLite storage layer for queuectl.
//!
//! This crate provides:
//! - Connection pool management (WAL journal, busy timeout)
//! - Schema creation and config seeding
//! - The job repository: enqueue, atomic claim, complete, fail-with-policy,
//!   dead-letter queue
//! - The key/value config store
//!
//! ## Example
//!
//! ```rust,ignore
//! use queuectl_db::{Database, JobRepository, NewJob};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("data/queuectl.db").await?;
//!     let job = db.jobs.enqueue(NewJob::new("echo hello")).await?;
//!     println!("Enqueued {}", job.id);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod jobs;
pub mod pool;
pub mod schema;

// Always compiled so integration tests in other crates can open throwaway stores.
pub mod test_fixtures;

// Re-export core types
pub use queuectl_core::*;

pub use config::SqliteConfigRepository;
pub use jobs::SqliteJobRepository;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};

use std::path::Path;

use sqlx::SqlitePool;

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: SqlitePool,
    /// Job and dead-letter repository.
    pub jobs: SqliteJobRepository,
    /// Key/value config store.
    pub config: SqliteConfigRepository,
}

impl Database {
    /// Create a database context from an existing pool.
    ///
    /// Does not touch the schema; call [`Database::initialize`] first on a
    /// fresh file.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            jobs: SqliteJobRepository::new(pool.clone()),
            config: SqliteConfigRepository::new(pool.clone()),
            pool,
        }
    }

    /// Open (creating if needed) the store at `path` and initialise it.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect_with_config(path, PoolConfig::default()).await
    }

    /// Open the store with custom pool configuration and initialise it.
    pub async fn connect_with_config(path: impl AsRef<Path>, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(path, config).await?;
        let db = Self::new(pool);
        db.initialize().await?;
        Ok(db)
    }

    /// Create tables and seed config defaults. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        schema::initialize(&self.pool).await
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
