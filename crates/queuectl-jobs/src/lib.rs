//! # queuectl-jobs
//!
//! Worker side of the queuectl job queue.
//!
//! This crate provides:
//! - A command runner that executes job commands through the shell
//! - A polling worker that claims one job at a time, runs it, and records
//!   success, a backoff retry, or a move to the dead-letter queue
//! - Lifecycle events via broadcast channels and cooperative shutdown
//!
//! ## Example
//!
//! ```ignore
//! use queuectl_db::Database;
//! use queuectl_jobs::{WorkerBuilder, WorkerConfig};
//!
//! let db = Database::connect("data/queuectl.db").await?;
//!
//! let handle = WorkerBuilder::new(db)
//!     .with_config(WorkerConfig::default().with_poll_interval(500))
//!     .build()
//!     .start();
//!
//! // Listen for events
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! // Graceful shutdown: the in-flight job finishes first
//! let summary = handle.stop().await?;
//! ```

pub mod runner;
pub mod worker;

// Re-export core types
pub use queuectl_core::*;

pub use runner::{CommandOutput, CommandRunner, ShellRunner};
pub use worker::{
    default_worker_id, JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle,
    WorkerState, WorkerSummary,
};

/// Default polling interval for job processing (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = queuectl_core::defaults::JOB_POLL_INTERVAL_MS;
