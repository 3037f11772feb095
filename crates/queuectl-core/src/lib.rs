//! # queuectl-core
//!
//! Core types, traits, and the retry policy for the queuectl job queue.
//!
//! This crate provides the data model (jobs, dead letters, config entries),
//! the error taxonomy, the repository traits that store implementations
//! satisfy, and the pure backoff / dead-letter decision functions.
//!
//! ## Logging
//!
//! Crates log through `tracing` with the fields `subsystem`, `component`,
//! `op`, `job_id`, `worker_id`, `attempts`, `duration_ms` and `error`.
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Job dead-lettered, outcome could not be recorded, loop iteration failed |
//! | WARN  | Job failed and will retry, stale locks released, lost job lock |
//! | INFO  | Worker start/stop, enqueue, completion, config writes |
//! | DEBUG | Claims, state transitions, command exit codes, pool metrics |

pub mod defaults;
pub mod error;
pub mod models;
pub mod retry;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use retry::{backoff_delay, backoff_seconds, should_dead_letter, RetryPolicy};
pub use traits::*;
