//! Job worker: claims jobs one at a time, runs them, and reports the outcome.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use queuectl_core::{
    defaults, ConfigRepository, Error, FailOutcome, Job, JobRepository, Result, RetryPolicy,
};
use queuectl_db::Database;

use crate::runner::{CommandOutput, CommandRunner, ShellRunner};

/// Configuration for the job worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds when the queue is empty.
    pub poll_interval_ms: u64,
    /// Command timeout in milliseconds; 0 disables it.
    pub exec_timeout_ms: u64,
    /// Stop as soon as a claim finds nothing to do.
    pub exit_when_empty: bool,
    /// Release jobs locked longer than this back to pending.
    ///
    /// `None` leaves jobs of crashed workers stuck in processing. Must exceed
    /// `exec_timeout_ms`; with no command timeout a job that outlives it is
    /// reclaimed while still running and may execute twice (only its current
    /// lock holder can record the outcome).
    pub stale_lock_timeout_secs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            exec_timeout_ms: defaults::JOB_EXEC_TIMEOUT_MS,
            exit_when_empty: false,
            stale_lock_timeout_secs: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `QUEUECTL_POLL_INTERVAL_MS` | `1000` | Sleep between empty polls |
    /// | `QUEUECTL_EXEC_TIMEOUT_MS` | `0` | Command timeout, 0 = none |
    /// | `QUEUECTL_STALE_LOCK_SECS` | unset | Reclaim jobs locked longer than this |
    pub fn from_env() -> Self {
        let poll_interval_ms = std::env::var("QUEUECTL_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_POLL_INTERVAL_MS);

        let exec_timeout_ms = std::env::var("QUEUECTL_EXEC_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_EXEC_TIMEOUT_MS);

        let stale_lock_timeout_secs = std::env::var("QUEUECTL_STALE_LOCK_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0);

        Self {
            poll_interval_ms,
            exec_timeout_ms,
            exit_when_empty: false,
            stale_lock_timeout_secs,
        }
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the command timeout.
    pub fn with_exec_timeout(mut self, ms: u64) -> Self {
        self.exec_timeout_ms = ms;
        self
    }

    /// Stop once the queue has nothing claimable.
    pub fn with_exit_when_empty(mut self, exit: bool) -> Self {
        self.exit_when_empty = exit;
        self
    }

    /// Reclaim jobs whose lock is older than `secs`.
    pub fn with_stale_lock_timeout(mut self, secs: Option<u64>) -> Self {
        self.stale_lock_timeout_secs = secs;
        self
    }

    /// Reject a stale-lock timeout that would reclaim jobs still inside
    /// their command timeout.
    pub fn validate(&self) -> Result<()> {
        let Some(secs) = self.stale_lock_timeout_secs else {
            return Ok(());
        };
        if secs == 0 {
            return Err(Error::Config(
                "stale lock timeout must be at least 1 second".to_string(),
            ));
        }
        if self.exec_timeout_ms > 0 && secs.saturating_mul(1000) <= self.exec_timeout_ms {
            return Err(Error::Config(format!(
                "stale lock timeout ({secs}s) must be longer than the command timeout ({}ms)",
                self.exec_timeout_ms
            )));
        }
        Ok(())
    }
}

/// Observable lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Claiming,
    Executing,
    Stopping,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Claiming => "claiming",
            WorkerState::Executing => "executing",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Worker started.
    WorkerStarted { worker_id: String },
    /// A job was claimed and its command started.
    JobStarted { job_id: String, attempts: i64 },
    /// A job completed successfully.
    JobCompleted { job_id: String, duration_ms: u64 },
    /// A job failed and will be retried at `run_after`.
    JobRetryScheduled {
        job_id: String,
        attempts: i64,
        run_after: DateTime<Utc>,
        error: String,
    },
    /// A job failed for the last time and moved to the dead-letter queue.
    JobDeadLettered {
        job_id: String,
        attempts: i64,
        error: String,
    },
    /// Worker stopped.
    WorkerStopped { worker_id: String },
}

/// Counters reported when a worker stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl WorkerSummary {
    /// Jobs this worker finished processing, whatever the outcome.
    pub fn processed(&self) -> u64 {
        self.completed + self.retried + self.dead_lettered
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    worker_id: String,
    cancel: CancellationToken,
    state_rx: watch::Receiver<WorkerState>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: JoinHandle<WorkerSummary>,
}

impl WorkerHandle {
    /// Identity the worker claims jobs under.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Ask the worker to stop. An in-flight job still runs to completion
    /// and has its outcome recorded.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<WorkerState> {
        self.state_rx.clone()
    }

    /// Wait for the worker to stop on its own (drain mode or shutdown).
    pub async fn wait(self) -> Result<WorkerSummary> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("worker task failed: {e}")))
    }

    /// Shut down and wait for the worker to finish.
    pub async fn stop(self) -> Result<WorkerSummary> {
        self.shutdown();
        self.wait().await
    }
}

/// Job worker that processes jobs from the queue, one at a time.
pub struct JobWorker {
    db: Database,
    runner: Arc<dyn CommandRunner>,
    config: WorkerConfig,
    worker_id: String,
    cancel: CancellationToken,
    notify: Arc<Notify>,
    event_tx: broadcast::Sender<WorkerEvent>,
    state_tx: watch::Sender<WorkerState>,
}

impl JobWorker {
    /// Create a new job worker running commands through the shell.
    pub fn new(db: Database, config: WorkerConfig) -> Self {
        WorkerBuilder::new(db).with_config(config).build()
    }

    /// Identity the worker claims jobs under.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker on the runtime and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let worker_id = self.worker_id.clone();
        let cancel = self.cancel.clone();
        let state_rx = self.state_tx.subscribe();
        let event_rx = self.event_tx.subscribe();

        let task = tokio::spawn(async move { self.run().await });

        WorkerHandle {
            worker_id,
            cancel,
            state_rx,
            event_rx,
            task,
        }
    }

    /// Run the worker loop until shutdown (or until the queue is empty in
    /// drain mode).
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn run(self) -> WorkerSummary {
        let mut summary = WorkerSummary {
            worker_id: self.worker_id.clone(),
            ..WorkerSummary::default()
        };

        info!(
            subsystem = "jobs",
            component = "worker",
            poll_interval_ms = self.config.poll_interval_ms,
            exec_timeout_ms = self.config.exec_timeout_ms,
            exit_when_empty = self.config.exit_when_empty,
            "Job worker started"
        );
        if self.config.stale_lock_timeout_secs.is_some() && self.config.exec_timeout_ms == 0 {
            warn!(
                subsystem = "jobs",
                component = "worker",
                "Stale lock reclaim enabled without a command timeout; long jobs may run twice"
            );
        }
        let started_at = Utc::now();
        self.set_state(WorkerState::Idle);
        self.emit(WorkerEvent::WorkerStarted {
            worker_id: self.worker_id.clone(),
        });

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        while !self.cancel.is_cancelled() {
            if self.stop_requested(started_at).await {
                info!(
                    subsystem = "jobs",
                    component = "worker",
                    "Stop requested through the store"
                );
                self.cancel.cancel();
                break;
            }

            self.set_state(WorkerState::Claiming);
            match self.run_next_job(&mut summary).await {
                // Claimed and reported; go straight for the next one.
                Ok(true) => {}
                Ok(false) => {
                    if self.config.exit_when_empty {
                        info!(
                            subsystem = "jobs",
                            component = "worker",
                            "Queue empty, worker exiting"
                        );
                        break;
                    }
                    self.reclaim_stale().await;
                    self.set_state(WorkerState::Idle);
                    self.pause(poll_interval).await;
                }
                Err(e) => {
                    error!(
                        subsystem = "jobs",
                        component = "worker",
                        error = %e,
                        "Worker iteration failed, pausing before retry"
                    );
                    self.set_state(WorkerState::Idle);
                    self.pause(poll_interval).await;
                }
            }
        }

        self.set_state(WorkerState::Stopping);
        self.set_state(WorkerState::Stopped);
        self.emit(WorkerEvent::WorkerStopped {
            worker_id: self.worker_id.clone(),
        });
        info!(
            subsystem = "jobs",
            component = "worker",
            completed = summary.completed,
            retried = summary.retried,
            dead_lettered = summary.dead_lettered,
            "Job worker stopped"
        );
        summary
    }

    /// Claim and process at most one job. Returns whether a job was claimed.
    async fn run_next_job(&self, summary: &mut WorkerSummary) -> Result<bool> {
        let Some(job) = self.db.jobs.claim(&self.worker_id).await? else {
            return Ok(false);
        };

        self.set_state(WorkerState::Executing);
        info!(
            subsystem = "jobs",
            component = "worker",
            job_id = %job.id,
            attempts = job.attempts,
            command = %job.command,
            "Processing job"
        );
        self.emit(WorkerEvent::JobStarted {
            job_id: job.id.clone(),
            attempts: job.attempts,
        });

        let start = Instant::now();
        let output = self.execute(&job).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        if output.success {
            if self.report_success(&job, &output, duration_ms).await? {
                summary.completed += 1;
            }
        } else {
            match self.report_failure(&job, &output, duration_ms).await? {
                FailOutcome::RetryScheduled { .. } => summary.retried += 1,
                FailOutcome::MovedToDeadLetter { .. } => summary.dead_lettered += 1,
                FailOutcome::Missing => {}
            }
        }

        if !self.cancel.is_cancelled() {
            self.set_state(WorkerState::Idle);
        }
        Ok(true)
    }

    /// Run the job's command. A shutdown request only changes the state;
    /// the command always runs to completion (or its timeout).
    async fn execute(&self, job: &Job) -> CommandOutput {
        let mut exec = self
            .runner
            .execute(&job.command, self.config.exec_timeout_ms);

        tokio::select! {
            output = &mut exec => output,
            _ = self.cancel.cancelled() => {
                self.set_state(WorkerState::Stopping);
                info!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job.id,
                    "Shutdown requested, finishing in-flight job"
                );
                exec.await
            }
        }
    }

    /// Record a success. Returns `false` if this worker no longer held the
    /// job's lock, in which case nothing was written.
    async fn report_success(&self, job: &Job, output: &CommandOutput, duration_ms: u64) -> Result<bool> {
        let jobs = &self.db.jobs;
        let job_id = job.id.as_str();
        let worker_id = self.worker_id.as_str();
        let text = output.combined_output();
        let text = text.as_str();

        let recorded = self
            .with_report_retries(job_id, "complete", move || {
                jobs.complete(job_id, worker_id, text)
            })
            .await?;
        if !recorded {
            warn!(
                subsystem = "jobs",
                component = "worker",
                job_id,
                duration_ms,
                "Job lock lost before completion was recorded; result dropped"
            );
            return Ok(false);
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            job_id,
            duration_ms,
            "Job completed"
        );
        self.emit(WorkerEvent::JobCompleted {
            job_id: job.id.clone(),
            duration_ms,
        });
        Ok(true)
    }

    async fn report_failure(
        &self,
        job: &Job,
        output: &CommandOutput,
        duration_ms: u64,
    ) -> Result<FailOutcome> {
        let db = &self.db;
        let job_id = job.id.as_str();
        let worker_id = self.worker_id.as_str();
        let attempts_before = job.attempts;
        let message = output.failure_message();
        let message = message.as_str();

        // Policy is re-read for every failure so config changes apply to
        // the next job without restarting workers.
        let (policy, outcome) = self
            .with_report_retries(job_id, "fail", move || async move {
                let policy: RetryPolicy = db.config.retry_policy().await?;
                let outcome = db
                    .jobs
                    .fail_with_policy(
                        job_id,
                        worker_id,
                        message,
                        policy.backoff_seconds(attempts_before),
                        policy.max_retries,
                    )
                    .await?;
                Ok::<_, Error>((policy, outcome))
            })
            .await?;

        match &outcome {
            FailOutcome::RetryScheduled {
                attempts,
                run_after,
            } => {
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id,
                    attempts,
                    run_after = %run_after,
                    backoff_secs = policy.backoff_seconds(attempts_before),
                    duration_ms,
                    error = message,
                    "Job failed, retry scheduled"
                );
                self.emit(WorkerEvent::JobRetryScheduled {
                    job_id: job.id.clone(),
                    attempts: *attempts,
                    run_after: *run_after,
                    error: message.to_string(),
                });
            }
            FailOutcome::MovedToDeadLetter { attempts } => {
                error!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id,
                    attempts,
                    max_retries = job.max_retries,
                    max_retries_ceiling = policy.max_retries,
                    duration_ms,
                    error = message,
                    "Job failed permanently, moved to dead-letter queue"
                );
                self.emit(WorkerEvent::JobDeadLettered {
                    job_id: job.id.clone(),
                    attempts: *attempts,
                    error: message.to_string(),
                });
            }
            FailOutcome::Missing => {
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id,
                    "Job gone or lock lost before its failure was recorded"
                );
            }
        }
        Ok(outcome)
    }

    /// Retry an outcome write a few times so a briefly locked store does not
    /// strand the job in processing.
    async fn with_report_retries<T, F, Fut>(&self, job_id: &str, op: &str, mut report: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match report().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < defaults::JOB_REPORT_ATTEMPTS => {
                    warn!(
                        subsystem = "jobs",
                        component = "worker",
                        job_id,
                        op,
                        attempt,
                        error = %e,
                        "Failed to record job outcome, retrying"
                    );
                    sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        subsystem = "jobs",
                        component = "worker",
                        job_id,
                        op,
                        error = %e,
                        "Giving up on recording job outcome; job stays in processing"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Whether `worker stop` was issued after this worker started.
    async fn stop_requested(&self, started_at: DateTime<Utc>) -> bool {
        let value = match self
            .db
            .config
            .get(defaults::CONFIG_WORKER_STOP_REQUESTED_AT)
            .await
        {
            Ok(Some(value)) => value,
            Ok(None) => return false,
            Err(e) => {
                debug!(
                    subsystem = "jobs",
                    component = "worker",
                    error = %e,
                    "Could not read stop request"
                );
                return false;
            }
        };
        match DateTime::parse_from_rfc3339(&value) {
            Ok(requested_at) => requested_at.with_timezone(&Utc) >= started_at,
            Err(e) => {
                debug!(
                    subsystem = "jobs",
                    component = "worker",
                    value = %value,
                    error = %e,
                    "Ignoring malformed stop request"
                );
                false
            }
        }
    }

    async fn reclaim_stale(&self) {
        let Some(secs) = self.config.stale_lock_timeout_secs else {
            return;
        };
        let older_than = chrono::Duration::seconds(i64::from(u32::try_from(secs).unwrap_or(u32::MAX)));
        match self.db.jobs.reclaim_stale(older_than).await {
            Ok(0) => {}
            Ok(reclaimed) => debug!(
                subsystem = "jobs",
                component = "worker",
                reclaimed,
                "Reclaimed stale jobs"
            ),
            Err(e) => warn!(
                subsystem = "jobs",
                component = "worker",
                error = %e,
                "Stale lock reclaim failed"
            ),
        }
    }

    /// Sleep for the poll interval plus jitter, waking early on shutdown or
    /// when an in-process enqueue signals new work.
    async fn pause(&self, poll_interval: Duration) {
        let jitter_cap = (poll_interval.as_millis() as u64) / 10;
        let jitter = if jitter_cap > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
        } else {
            Duration::ZERO
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(subsystem = "jobs", component = "worker", "Job worker received shutdown signal");
            }
            _ = self.notify.notified() => {}
            _ = sleep(poll_interval + jitter) => {}
        }
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(
                subsystem = "jobs",
                component = "worker",
                from = %previous,
                to = %state,
                "Worker state changed"
            );
        }
    }

    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}

/// Generate a worker identity unique across processes on this host.
pub fn default_worker_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}", std::process::id(), &suffix[..8])
}

/// Builder for creating a job worker.
pub struct WorkerBuilder {
    db: Database,
    config: WorkerConfig,
    runner: Arc<dyn CommandRunner>,
    worker_id: Option<String>,
    parent_cancel: Option<CancellationToken>,
}

impl WorkerBuilder {
    /// Create a new worker builder.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            config: WorkerConfig::default(),
            runner: Arc::new(ShellRunner::new()),
            worker_id: None,
            parent_cancel: None,
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom command runner.
    pub fn with_runner<R: CommandRunner + 'static>(mut self, runner: R) -> Self {
        self.runner = Arc::new(runner);
        self
    }

    /// Claim jobs under this identity.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Stop this worker when `parent` is cancelled. The worker's own
    /// shutdown does not cancel the parent.
    pub fn with_cancellation(mut self, parent: CancellationToken) -> Self {
        self.parent_cancel = Some(parent);
        self
    }

    /// Build and return the worker.
    pub fn build(self) -> JobWorker {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        let (state_tx, _) = watch::channel(WorkerState::Idle);
        let cancel = match self.parent_cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        JobWorker {
            notify: self.db.jobs.job_notify(),
            db: self.db,
            runner: self.runner,
            config: self.config,
            worker_id: self.worker_id.unwrap_or_else(default_worker_id),
            cancel,
            event_tx,
            state_tx,
        }
    }
}
