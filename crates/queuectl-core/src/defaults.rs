//! Centralized default constants for queuectl.
//!
//! **This module is the single source of truth** for shared default values.
//! All crates and the CLI reference these constants instead of defining
//! their own magic numbers.

// =============================================================================
// CONFIG KEYS
// =============================================================================

/// Config key: exponent base for retry backoff.
pub const CONFIG_BACKOFF_BASE: &str = "backoff_base";

/// Config key: delay multiplier (seconds) for retry backoff.
pub const CONFIG_BASE_DELAY_SECONDS: &str = "base_delay_seconds";

/// Config key: global retry ceiling.
pub const CONFIG_MAX_RETRIES: &str = "max_retries";

/// Config key counting workers started by `worker start` and not yet
/// stopped. A process killed without cleanup leaves it too high.
pub const CONFIG_ACTIVE_WORKERS: &str = "active_workers";

/// Config key written by `worker stop`: RFC 3339 time of the last stop
/// request. Workers started before it stop after their current job.
pub const CONFIG_WORKER_STOP_REQUESTED_AT: &str = "worker_stop_requested_at";

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Default exponent base for backoff (`base ^ attempts * delay`).
pub const BACKOFF_BASE: f64 = 2.0;

/// Default backoff delay multiplier in seconds.
pub const BASE_DELAY_SECONDS: f64 = 1.0;

/// Default global retry ceiling, also the per-job default.
pub const JOB_MAX_RETRIES: i64 = 3;

/// Upper bound on a single backoff delay (30 days).
///
/// Large exponents overflow into infinity; this keeps `run_after` representable.
pub const MAX_BACKOFF_SECS: f64 = 30.0 * 24.0 * 3600.0;

/// Maximum characters of `last_error` kept on a dead-letter entry.
pub const LAST_ERROR_MAX_CHARS: usize = 1000;

// =============================================================================
// JOBS
// =============================================================================

/// Prefix for generated job ids (`job-<uuid>`).
pub const JOB_ID_PREFIX: &str = "job";

/// Default worker poll interval in milliseconds when the queue is empty.
pub const JOB_POLL_INTERVAL_MS: u64 = 1000;

/// Default command execution timeout in milliseconds (0 = no timeout).
pub const JOB_EXEC_TIMEOUT_MS: u64 = 0;

/// Attempts made to record a job outcome before giving up on a store error.
pub const JOB_REPORT_ATTEMPTS: u32 = 3;

/// Default worker event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// STORE
// =============================================================================

/// Default database file, relative to the working directory.
pub const DATABASE_PATH: &str = "data/queuectl.db";

/// SQLite busy timeout in seconds; writers wait this long for the lock.
pub const SQLITE_BUSY_TIMEOUT_SECS: u64 = 5;

/// Default maximum number of pooled connections.
pub const POOL_MAX_CONNECTIONS: u32 = 5;
