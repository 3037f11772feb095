//! Core data models for queuectl.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::defaults;
use crate::error::Error;

// =============================================================================
// JOB TYPES
// =============================================================================

/// Lifecycle state of a job row.
///
/// Dead jobs are not a state: they leave the jobs table and live on as a
/// [`DeadLetterEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
}

impl JobState {
    /// All states, in lifecycle order.
    pub const ALL: [JobState; 3] = [JobState::Pending, JobState::Processing, JobState::Completed];

    /// Database / CLI representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            other => Err(Error::InvalidInput(format!(
                "unknown job state '{other}' (expected pending, processing or completed)"
            ))),
        }
    }
}

/// A unit of work: a shell command plus its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Earliest time the job may be claimed (set by backoff).
    pub run_after: Option<DateTime<Utc>>,
    pub output: Option<String>,
}

impl Job {
    /// Whether the job may be claimed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.run_after.map_or(true, |at| at <= now)
    }

    /// Whether the job holds a worker lock.
    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }
}

/// Request to enqueue a job.
///
/// Every field except `command` is optional; the repository fills in an id,
/// zero attempts, the default retry ceiling and the current time. Overrides
/// exist mostly for tests and for importing jobs from elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub attempts: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_after: Option<DateTime<Utc>>,
}

impl NewJob {
    /// Create a request for the given command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::default()
        }
    }

    /// Use a caller-chosen id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Override the per-job retry ceiling.
    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Start with a non-zero attempt count.
    pub fn with_attempts(mut self, attempts: i64) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Override the creation timestamp (affects claim order).
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Delay eligibility until `run_after`.
    pub fn with_run_after(mut self, run_after: DateTime<Utc>) -> Self {
        self.run_after = Some(run_after);
        self
    }
}

/// Generate a fresh job id of the form `job-<uuid v4>`.
pub fn new_job_id() -> String {
    format!("{}-{}", defaults::JOB_ID_PREFIX, Uuid::new_v4())
}

// =============================================================================
// DEAD LETTERS
// =============================================================================

/// Terminal snapshot of a job that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub command: String,
    pub attempts: i64,
    pub max_retries: i64,
    pub failed_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Truncate an error message to [`defaults::LAST_ERROR_MAX_CHARS`] characters.
///
/// Counts characters, not bytes, so multi-byte text is never split.
pub fn truncate_last_error(message: &str) -> String {
    message.chars().take(defaults::LAST_ERROR_MAX_CHARS).collect()
}

/// Result of recording a failed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    /// Job returned to pending and becomes eligible at `run_after`.
    RetryScheduled {
        attempts: i64,
        run_after: DateTime<Utc>,
    },
    /// Job was removed from the queue and stored as a dead letter.
    MovedToDeadLetter { attempts: i64 },
    /// Job no longer existed, or another worker now holds its lock;
    /// nothing was written.
    Missing,
}

// =============================================================================
// CONFIG & STATS
// =============================================================================

/// A stored configuration key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
}

/// Queue statistics summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub dead: i64,
}

impl QueueStats {
    /// Jobs still in the queue table plus dead letters.
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.dead
    }
}
