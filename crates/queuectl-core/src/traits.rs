//! Core traits for queuectl abstractions.
//!
//! These traits define the interfaces that concrete store implementations
//! must satisfy, enabling pluggable backends and testability.

use async_trait::async_trait;
use chrono::Duration;

use crate::error::Result;
use crate::models::*;
use crate::retry::RetryPolicy;

// =============================================================================
// JOB REPOSITORY
// =============================================================================

/// Repository for job queue operations.
///
/// The only component allowed to mutate jobs and dead letters. Workers call
/// [`claim`](JobRepository::claim) and then report exactly one outcome.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a pending job.
    ///
    /// Fails with `InvalidInput` if the command is missing or blank.
    async fn enqueue(&self, job: NewJob) -> Result<Job>;

    /// Atomically claim the oldest eligible pending job for `worker_id`.
    ///
    /// Concurrent callers never receive the same job.
    async fn claim(&self, worker_id: &str) -> Result<Option<Job>>;

    /// Mark a job completed and store its output.
    ///
    /// Only applies while `worker_id` still holds the job's lock. Returns
    /// `false` (and changes nothing) for unknown ids or a lost lock.
    async fn complete(&self, job_id: &str, worker_id: &str, output: &str) -> Result<bool>;

    /// Record a failed attempt: schedule a retry after `backoff_seconds`, or
    /// move the job to the dead-letter queue once it exceeds its own
    /// `max_retries` or `max_retries_ceiling`.
    ///
    /// Returns [`FailOutcome::Missing`] when the job is gone or no longer
    /// locked by `worker_id`.
    async fn fail_with_policy(
        &self,
        job_id: &str,
        worker_id: &str,
        last_error: &str,
        backoff_seconds: f64,
        max_retries_ceiling: i64,
    ) -> Result<FailOutcome>;

    /// Get a job by id.
    async fn get(&self, job_id: &str) -> Result<Option<Job>>;

    /// List jobs, newest first, optionally filtered by state.
    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>>;

    /// List dead letters, most recently failed first.
    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>>;

    /// Get a dead letter by id.
    async fn get_dead_letter(&self, job_id: &str) -> Result<Option<DeadLetterEntry>>;

    /// Move a dead letter back to the queue as a pending job.
    ///
    /// Attempts are preserved. Fails with `NotFound` if no entry exists.
    async fn retry_dead_letter(&self, job_id: &str) -> Result<Job>;

    /// Count jobs per state plus dead letters.
    async fn queue_stats(&self) -> Result<QueueStats>;

    /// Release processing jobs locked longer than `older_than` back to
    /// pending. Returns the number of jobs released.
    async fn reclaim_stale(&self, older_than: Duration) -> Result<u64>;
}

// =============================================================================
// CONFIG STORE
// =============================================================================

/// Key/value configuration store.
#[async_trait]
pub trait ConfigRepository: Send + Sync {
    /// Get a config value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a config value, inserting or replacing.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// List all entries ordered by key.
    async fn list(&self) -> Result<Vec<ConfigEntry>>;

    /// Atomically add `delta` to an integer value (missing or non-numeric
    /// counts as 0), never going below 0. Returns the new value.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64>;

    /// Current retry policy, with defaults for missing or bad values.
    async fn retry_policy(&self) -> Result<RetryPolicy> {
        let entries = self.list().await?;
        Ok(RetryPolicy::from_entries(&entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory config store for exercising the provided method.
    #[derive(Default)]
    struct MemoryConfig {
        entries: Mutex<BTreeMap<String, String>>,
    }

    #[async_trait]
    impl ConfigRepository for MemoryConfig {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn list(&self) -> Result<Vec<ConfigEntry>> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .iter()
                .map(|(key, value)| ConfigEntry {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect())
        }

        async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
            let mut entries = self.entries.lock().unwrap();
            let current = entries
                .get(key)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            let next = (current + delta).max(0);
            entries.insert(key.to_string(), next.to_string());
            Ok(next)
        }
    }

    #[tokio::test]
    async fn test_retry_policy_defaults_when_empty() {
        let store = MemoryConfig::default();
        let policy = store.retry_policy().await.unwrap();
        assert_eq!(policy, RetryPolicy::default());
    }

    #[tokio::test]
    async fn test_retry_policy_reads_overrides() {
        let store = MemoryConfig::default();
        store.set("backoff_base", "4").await.unwrap();
        store.set("max_retries", "1").await.unwrap();

        let policy = store.retry_policy().await.unwrap();
        assert_eq!(policy.backoff_base, 4.0);
        assert_eq!(policy.base_delay_seconds, 1.0);
        assert_eq!(policy.max_retries, 1);
    }

    #[tokio::test]
    async fn test_increment_floors_at_zero() {
        let store = MemoryConfig::default();
        assert_eq!(store.increment("active_workers", 2).await.unwrap(), 2);
        assert_eq!(store.increment("active_workers", -5).await.unwrap(), 0);
    }
}
