//! Job repository implementation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use queuectl_core::{
    backoff_delay, defaults, new_job_id, should_dead_letter, truncate_last_error,
    DeadLetterEntry, Error, FailOutcome, Job, JobRepository, JobState, NewJob, QueueStats, Result,
};

/// Columns returned by every job query, in `parse_job_row` order.
const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, created_at, updated_at, \
                           locked_by, locked_at, run_after, output";

const DEAD_LETTER_COLUMNS: &str =
    "id, command, attempts, max_retries, failed_at, last_error, created_at";

/// SQLite implementation of JobRepository.
#[derive(Clone)]
pub struct SqliteJobRepository {
    pool: SqlitePool,
    /// Wakes idle in-process workers when new work arrives.
    notify: Arc<Notify>,
}

impl SqliteJobRepository {
    /// Create a new repository with its own notify handle.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Create a repository sharing an existing notify handle.
    pub fn with_notify(pool: SqlitePool, notify: Arc<Notify>) -> Self {
        Self { pool, notify }
    }

    /// Get the notify handle signalled on enqueue and DLQ retry.
    ///
    /// Workers in other processes never see this; they rely on polling.
    pub fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: &SqliteRow) -> Result<Job> {
        let state: String = row.try_get("state").map_err(Error::Database)?;
        let state = state
            .parse::<JobState>()
            .map_err(|_| Error::Internal(format!("unrecognised job state '{state}' in store")))?;

        Ok(Job {
            id: row.try_get("id").map_err(Error::Database)?,
            command: row.try_get("command").map_err(Error::Database)?,
            state,
            attempts: row.try_get("attempts").map_err(Error::Database)?,
            max_retries: row.try_get("max_retries").map_err(Error::Database)?,
            created_at: row.try_get("created_at").map_err(Error::Database)?,
            updated_at: row.try_get("updated_at").map_err(Error::Database)?,
            locked_by: row.try_get("locked_by").map_err(Error::Database)?,
            locked_at: row.try_get("locked_at").map_err(Error::Database)?,
            run_after: row.try_get("run_after").map_err(Error::Database)?,
            output: row.try_get("output").map_err(Error::Database)?,
        })
    }

    fn parse_dead_letter_row(row: &SqliteRow) -> Result<DeadLetterEntry> {
        Ok(DeadLetterEntry {
            id: row.try_get("id").map_err(Error::Database)?,
            command: row.try_get("command").map_err(Error::Database)?,
            attempts: row.try_get("attempts").map_err(Error::Database)?,
            max_retries: row.try_get("max_retries").map_err(Error::Database)?,
            failed_at: row.try_get("failed_at").map_err(Error::Database)?,
            last_error: row.try_get("last_error").map_err(Error::Database)?,
            created_at: row.try_get("created_at").map_err(Error::Database)?,
        })
    }

    /// Validate an enqueue request, filling in defaults.
    fn normalize(job: NewJob) -> Result<(String, String, i64, i64)> {
        let command = job
            .command
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::InvalidInput("job command is required".to_string()))?;

        let id = job
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_job_id);

        let attempts = job.attempts.unwrap_or(0);
        if attempts < 0 {
            return Err(Error::InvalidInput(format!(
                "attempts must be non-negative, got {attempts}"
            )));
        }

        let max_retries = job.max_retries.unwrap_or(defaults::JOB_MAX_RETRIES);
        if max_retries < 0 {
            return Err(Error::InvalidInput(format!(
                "max_retries must be non-negative, got {max_retries}"
            )));
        }

        Ok((id, command, attempts, max_retries))
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn enqueue(&self, job: NewJob) -> Result<Job> {
        let now = Utc::now();
        let created_at = job.created_at.unwrap_or(now);
        let run_after = job.run_after;
        let (id, command, attempts, max_retries) = Self::normalize(job)?;

        let row = sqlx::query(&format!(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at, run_after)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(&id)
        .bind(&command)
        .bind(attempts)
        .bind(max_retries)
        .bind(created_at)
        .bind(now)
        .bind(run_after)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        let job = Self::parse_job_row(&row)?;

        info!(
            subsystem = "jobs",
            component = "repository",
            op = "enqueue",
            job_id = %job.id,
            max_retries = job.max_retries,
            "Job enqueued"
        );

        self.notify.notify_waiters();
        Ok(job)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        let now = Utc::now();

        // Single statement: SQLite serialises writers, and the outer
        // `state = 'pending'` guard makes a lost race update zero rows.
        let row = sqlx::query(&format!(
            "UPDATE jobs
             SET state = 'processing', locked_by = ?1, locked_at = ?2, updated_at = ?2
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE state = 'pending'
                   AND (run_after IS NULL OR run_after <= ?2)
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT 1
             )
               AND state = 'pending'
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        let job = row.as_ref().map(Self::parse_job_row).transpose()?;
        if let Some(job) = &job {
            debug!(
                subsystem = "jobs",
                component = "repository",
                op = "claim",
                job_id = %job.id,
                worker_id,
                attempts = job.attempts,
                "Job claimed"
            );
        }
        Ok(job)
    }

    async fn complete(&self, job_id: &str, worker_id: &str, output: &str) -> Result<bool> {
        let now = Utc::now();

        // Lock guard: a job reclaimed and re-claimed by another worker must
        // not be finished by the worker that lost it.
        let result = sqlx::query(
            "UPDATE jobs
             SET state = 'completed', output = ?3, locked_by = NULL, locked_at = NULL,
                 updated_at = ?4
             WHERE id = ?1 AND state = 'processing' AND locked_by = ?2",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(output)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            debug!(
                subsystem = "jobs",
                component = "repository",
                op = "complete",
                job_id,
                worker_id,
                "Complete ignored, job gone or locked by another worker"
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn fail_with_policy(
        &self,
        job_id: &str,
        worker_id: &str,
        last_error: &str,
        backoff_seconds: f64,
        max_retries_ceiling: i64,
    ) -> Result<FailOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Increment first so the transaction holds the write lock before
        // anything is read. Only the lock holder may record the failure.
        let row = sqlx::query(&format!(
            "UPDATE jobs SET attempts = attempts + 1, updated_at = ?3
             WHERE id = ?1 AND state = 'processing' AND locked_by = ?2
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(Error::Database)?;
            debug!(
                subsystem = "jobs",
                component = "repository",
                op = "fail",
                job_id,
                worker_id,
                "Failure ignored, job gone or locked by another worker"
            );
            return Ok(FailOutcome::Missing);
        };
        let job = Self::parse_job_row(&row)?;

        if should_dead_letter(job.attempts, job.max_retries, max_retries_ceiling) {
            sqlx::query("DELETE FROM jobs WHERE id = ?1")
                .bind(job_id)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;

            sqlx::query(
                "INSERT OR REPLACE INTO dead_letters
                     (id, command, attempts, max_retries, failed_at, last_error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(&job.id)
            .bind(&job.command)
            .bind(job.attempts)
            .bind(job.max_retries)
            .bind(now)
            .bind(truncate_last_error(last_error))
            .bind(job.created_at)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

            tx.commit().await.map_err(Error::Database)?;

            warn!(
                subsystem = "jobs",
                component = "repository",
                op = "dead_letter",
                job_id,
                attempts = job.attempts,
                max_retries = job.max_retries,
                max_retries_ceiling,
                "Job moved to dead-letter queue"
            );
            return Ok(FailOutcome::MovedToDeadLetter {
                attempts: job.attempts,
            });
        }

        let run_after = now + backoff_delay(backoff_seconds);
        sqlx::query(
            "UPDATE jobs
             SET state = 'pending', run_after = ?2, locked_by = NULL, locked_at = NULL,
                 updated_at = ?3
             WHERE id = ?1",
        )
        .bind(job_id)
        .bind(run_after)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "jobs",
            component = "repository",
            op = "retry",
            job_id,
            attempts = job.attempts,
            run_after = %run_after,
            "Job scheduled for retry"
        );
        Ok(FailOutcome::RetryScheduled {
            attempts: job.attempts,
            run_after,
        })
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let rows = match state {
            Some(state) => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1
                     ORDER BY created_at DESC, rowid DESC"
                ))
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, rowid DESC"
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_job_row).collect()
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters ORDER BY failed_at DESC, rowid DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_dead_letter_row).collect()
    }

    async fn get_dead_letter(&self, job_id: &str) -> Result<Option<DeadLetterEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = ?1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_dead_letter_row).transpose()
    }

    async fn retry_dead_letter(&self, job_id: &str) -> Result<Job> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(&format!(
            "DELETE FROM dead_letters WHERE id = ?1 RETURNING {DEAD_LETTER_COLUMNS}"
        ))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(Error::Database)?;
            return Err(Error::NotFound(format!(
                "dead-letter entry '{job_id}' not found"
            )));
        };
        let entry = Self::parse_dead_letter_row(&row)?;

        // Plain INSERT: a live job with the same id is a conflict the
        // operator has to resolve, so the DLQ entry stays put.
        let row = sqlx::query(&format!(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(&entry.id)
        .bind(&entry.command)
        .bind(entry.attempts)
        .bind(entry.max_retries)
        .bind(entry.created_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let job = Self::parse_job_row(&row)?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "jobs",
            component = "repository",
            op = "dlq_retry",
            job_id,
            attempts = job.attempts,
            "Dead-letter entry requeued"
        );

        self.notify.notify_waiters();
        Ok(job)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM jobs WHERE state = 'pending') AS pending,
                (SELECT COUNT(*) FROM jobs WHERE state = 'processing') AS processing,
                (SELECT COUNT(*) FROM jobs WHERE state = 'completed') AS completed,
                (SELECT COUNT(*) FROM dead_letters) AS dead",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.try_get("pending").map_err(Error::Database)?,
            processing: row.try_get("processing").map_err(Error::Database)?,
            completed: row.try_get("completed").map_err(Error::Database)?,
            dead: row.try_get("dead").map_err(Error::Database)?,
        })
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<u64> {
        let now = Utc::now();
        let cutoff = now - older_than;

        let result = sqlx::query(
            "UPDATE jobs
             SET state = 'pending', locked_by = NULL, locked_at = NULL, updated_at = ?2
             WHERE state = 'processing' AND locked_at <= ?1",
        )
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            warn!(
                subsystem = "jobs",
                component = "repository",
                op = "reclaim_stale",
                reclaimed,
                older_than_secs = older_than.num_seconds(),
                "Released stale processing jobs"
            );
            self.notify.notify_waiters();
        }
        Ok(reclaimed)
    }
}
