//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use queuectl_core::{defaults, JobState};

#[derive(Debug, Parser)]
#[command(name = "queuectl")]
#[command(author, version, about = "Persistent background job queue for shell commands")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, global = true, env = "QUEUECTL_DB", default_value = defaults::DATABASE_PATH)]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Enqueue a job: a JSON object ({"command": "...", "max_retries": 2, ...})
    /// or a plain command string
    Enqueue {
        /// Job JSON or command
        job: String,
    },

    /// Run workers
    #[command(subcommand)]
    Worker(WorkerCommand),

    /// Show job counts per state and the active worker count
    Status,

    /// List jobs, newest first
    List {
        /// Only show jobs in this state (pending, processing, completed)
        #[arg(long, value_parser = parse_state)]
        state: Option<JobState>,
    },

    /// Dead-letter queue management
    #[command(subcommand)]
    Dlq(DlqCommand),

    /// Read and write runtime configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Enqueue one succeeding and one failing job and process both
    Demo,
}

#[derive(Debug, Subcommand)]
pub enum WorkerCommand {
    /// Start workers in this process; Ctrl-C stops them after their current job
    Start(WorkerStartArgs),
    /// Ask every running worker, in any process sharing the database, to stop
    /// after its current job
    Stop,
}

#[derive(Debug, Clone, Args)]
pub struct WorkerStartArgs {
    /// Number of workers to run
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub count: u32,

    /// Exit once the queue has nothing claimable
    #[arg(long)]
    pub once: bool,

    /// Sleep between empty polls (overrides QUEUECTL_POLL_INTERVAL_MS)
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Kill commands running longer than this; 0 disables (overrides QUEUECTL_EXEC_TIMEOUT_MS)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Release jobs locked longer than this back to pending (overrides QUEUECTL_STALE_LOCK_SECS)
    #[arg(long)]
    pub stale_lock_secs: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum DlqCommand {
    /// List dead-letter entries, most recent first
    List,
    /// Move a dead-letter entry back to the queue
    Retry {
        /// Job id
        id: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// Print all config values
    List,
}

fn parse_state(s: &str) -> Result<JobState, String> {
    s.parse::<JobState>().map_err(|e| e.to_string())
}
