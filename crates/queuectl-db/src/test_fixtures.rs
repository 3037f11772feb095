//! Test fixtures for database integration tests.
//!
//! Every [`TestDatabase`] is a fresh SQLite file inside its own temporary
//! directory, so tests never share state and can run in parallel.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use queuectl_db::test_fixtures::TestDatabase;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let test_db = TestDatabase::new().await;
//!     let job = test_db.db.jobs.enqueue(NewJob::new("true")).await.unwrap();
//!     // ...
//! }
//! ```

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::{Database, PoolConfig};

/// Throwaway database removed when dropped.
pub struct TestDatabase {
    pub db: Database,
    path: PathBuf,
    // Held for its Drop; deletes the file plus -wal/-shm siblings.
    _dir: TempDir,
}

impl TestDatabase {
    /// Create and initialise a fresh database.
    ///
    /// Panics if the temporary file cannot be created; only meant for tests.
    pub async fn new() -> Self {
        Self::with_config(PoolConfig::default()).await
    }

    /// Create a fresh database with custom pool settings.
    pub async fn with_config(config: PoolConfig) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir for test database");
        let path = dir.path().join("queuectl-test.db");
        let db = Database::connect_with_config(&path, config)
            .await
            .expect("open test database");
        Self {
            db,
            path,
            _dir: dir,
        }
    }

    /// Path of the database file, for opening a second connection pool
    /// the way a separate worker process would.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open an independent `Database` on the same file.
    pub async fn reopen(&self) -> Database {
        Database::connect(&self.path)
            .await
            .expect("reopen test database")
    }
}
