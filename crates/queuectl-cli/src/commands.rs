//! Command implementations. Each returns a serialisable value that `main`
//! prints as JSON.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use queuectl_core::{
    defaults, ConfigEntry, ConfigRepository, DeadLetterEntry, Error, Job, JobRepository, JobState,
    NewJob, QueueStats, Result,
};
use queuectl_db::Database;
use queuectl_jobs::{WorkerBuilder, WorkerConfig, WorkerSummary};

use crate::cli::WorkerStartArgs;

/// Command for the demo job that succeeds.
pub const DEMO_SUCCESS_COMMAND: &str = "echo 'Hello from job!'";

/// Command for the demo job that always fails.
pub const DEMO_FAILING_COMMAND: &str = "nonexistent_command_abc_xyz";

/// Retry ceiling for both demo jobs.
pub const DEMO_MAX_RETRIES: i64 = 2;

const DEMO_POLL_INTERVAL_MS: u64 = 200;

/// Parse `enqueue` input: a JSON object, or anything else as a raw command.
pub fn parse_job_spec(input: &str) -> Result<NewJob> {
    if input.trim_start().starts_with('{') {
        serde_json::from_str::<NewJob>(input)
            .map_err(|e| Error::InvalidInput(format!("invalid job JSON: {e}")))
    } else {
        Ok(NewJob::new(input))
    }
}

pub async fn enqueue(db: &Database, input: &str) -> Result<Job> {
    let job = parse_job_spec(input)?;
    db.jobs.enqueue(job).await
}

/// Output of `status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub jobs: QueueStats,
    /// Workers started by `worker start` and not yet exited, across all
    /// processes. A process killed without cleanup leaves it too high.
    pub active_workers: i64,
}

pub async fn status(db: &Database) -> Result<StatusReport> {
    let jobs = db.jobs.queue_stats().await?;
    let active_workers = db
        .config
        .get(defaults::CONFIG_ACTIVE_WORKERS)
        .await?
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);
    Ok(StatusReport {
        jobs,
        active_workers,
    })
}

pub async fn list(db: &Database, state: Option<JobState>) -> Result<Vec<Job>> {
    db.jobs.list_jobs(state).await
}

pub async fn dlq_list(db: &Database) -> Result<Vec<DeadLetterEntry>> {
    db.jobs.list_dead_letters().await
}

pub async fn dlq_retry(db: &Database, id: &str) -> Result<Job> {
    db.jobs.retry_dead_letter(id).await
}

pub async fn config_get(db: &Database, key: &str) -> Result<ConfigEntry> {
    let value = db
        .config
        .get(key)
        .await?
        .ok_or_else(|| Error::NotFound(format!("config key '{key}' is not set")))?;
    Ok(ConfigEntry {
        key: key.to_string(),
        value,
    })
}

pub async fn config_set(db: &Database, key: &str, value: &str) -> Result<ConfigEntry> {
    db.config.set(key, value).await?;
    Ok(ConfigEntry {
        key: key.to_string(),
        value: value.to_string(),
    })
}

pub async fn config_list(db: &Database) -> Result<Vec<ConfigEntry>> {
    db.config.list().await
}

/// Worker config from the environment, overridden by command-line flags.
pub fn worker_config(args: &WorkerStartArgs) -> Result<WorkerConfig> {
    let mut config = WorkerConfig::from_env().with_exit_when_empty(args.once);
    if let Some(ms) = args.poll_interval_ms {
        config = config.with_poll_interval(ms);
    }
    if let Some(ms) = args.timeout_ms {
        config = config.with_exec_timeout(ms);
    }
    if let Some(secs) = args.stale_lock_secs {
        config = config.with_stale_lock_timeout(Some(secs).filter(|s| *s > 0));
    }
    config.validate()?;
    Ok(config)
}

/// Run `count` workers until `shutdown` fires, `worker stop` is issued, or
/// the queue drains with `--once`. Adds `count` to the shared active worker
/// counter while they run.
pub async fn start_workers(
    db: &Database,
    args: &WorkerStartArgs,
    shutdown: CancellationToken,
) -> Result<Vec<WorkerSummary>> {
    if args.count == 0 {
        return Err(Error::InvalidInput("worker count must be at least 1".to_string()));
    }
    let config = worker_config(args)?;
    let count = i64::from(args.count);

    db.config
        .increment(defaults::CONFIG_ACTIVE_WORKERS, count)
        .await?;

    let handles: Vec<_> = (0..args.count)
        .map(|i| {
            WorkerBuilder::new(db.clone())
                .with_config(config.clone())
                .with_worker_id(format!("worker-{}-{}", std::process::id(), i))
                .with_cancellation(shutdown.clone())
                .build()
                .start()
        })
        .collect();

    info!(
        count = args.count,
        once = args.once,
        poll_interval_ms = config.poll_interval_ms,
        "Started workers"
    );

    let results = futures::future::join_all(handles.into_iter().map(|h| h.wait())).await;

    if let Err(e) = db
        .config
        .increment(defaults::CONFIG_ACTIVE_WORKERS, -count)
        .await
    {
        warn!(error = %e, "Failed to decrement active worker count");
    }

    results.into_iter().collect()
}

/// Output of `worker stop`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopReport {
    pub requested_at: DateTime<Utc>,
    /// Workers that were running when the request was recorded.
    pub active_workers: i64,
}

/// Record a stop request in the store. Every worker started before it, in
/// any process, stops after its current job; workers started later ignore it.
pub async fn worker_stop(db: &Database) -> Result<StopReport> {
    let requested_at = Utc::now();
    db.config
        .set(
            defaults::CONFIG_WORKER_STOP_REQUESTED_AT,
            &requested_at.to_rfc3339(),
        )
        .await?;
    let active_workers = status(db).await?.active_workers;
    info!(active_workers, "Stop requested for running workers");
    Ok(StopReport {
        requested_at,
        active_workers,
    })
}

/// Output of `demo`.
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub succeeded: Job,
    pub dead_lettered: Option<DeadLetterEntry>,
    pub workers: Vec<WorkerSummary>,
}

/// Enqueue one job that succeeds and one that cannot, run two workers until
/// both reach a terminal state (or `shutdown` fires), and report.
pub async fn demo(db: &Database, shutdown: CancellationToken) -> Result<DemoReport> {
    let ok = db
        .jobs
        .enqueue(NewJob::new(DEMO_SUCCESS_COMMAND).with_max_retries(DEMO_MAX_RETRIES))
        .await?;
    let failing = db
        .jobs
        .enqueue(NewJob::new(DEMO_FAILING_COMMAND).with_max_retries(DEMO_MAX_RETRIES))
        .await?;
    info!(success_job = %ok.id, failing_job = %failing.id, "Enqueued demo jobs");

    let workers = shutdown.child_token();
    let handles: Vec<_> = ["demo-1", "demo-2"]
        .into_iter()
        .map(|id| {
            WorkerBuilder::new(db.clone())
                .with_config(WorkerConfig::default().with_poll_interval(DEMO_POLL_INTERVAL_MS))
                .with_worker_id(id)
                .with_cancellation(workers.clone())
                .build()
                .start()
        })
        .collect();

    let wait_result = wait_for_demo(db, &ok.id, &failing.id, &shutdown).await;
    workers.cancel();
    let results = futures::future::join_all(handles.into_iter().map(|h| h.wait())).await;
    wait_result?;

    let succeeded = db
        .jobs
        .get(&ok.id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("demo job '{}' vanished", ok.id)))?;
    let dead_lettered = db.jobs.get_dead_letter(&failing.id).await?;

    Ok(DemoReport {
        succeeded,
        dead_lettered,
        workers: results.into_iter().collect::<Result<Vec<_>>>()?,
    })
}

async fn wait_for_demo(
    db: &Database,
    ok_id: &str,
    failing_id: &str,
    shutdown: &CancellationToken,
) -> Result<()> {
    loop {
        let ok_done = db
            .jobs
            .get(ok_id)
            .await?
            .is_some_and(|j| j.state == JobState::Completed);
        let failing_dead = db.jobs.get_dead_letter(failing_id).await?.is_some();
        if ok_done && failing_dead {
            return Ok(());
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_millis(DEMO_POLL_INTERVAL_MS)) => {}
        }
    }
}
