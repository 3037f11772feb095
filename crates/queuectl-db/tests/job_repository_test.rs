//! Integration tests for the SQLite job repository.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use queuectl_db::test_fixtures::TestDatabase;
use queuectl_db::{Error, FailOutcome, JobRepository, JobState, NewJob};

/// Claim the only eligible job as "w" and report a failure for it.
async fn claim_and_fail(
    jobs: &impl JobRepository,
    job_id: &str,
    error: &str,
    backoff_seconds: f64,
    ceiling: i64,
) -> FailOutcome {
    let claimed = jobs.claim("w").await.unwrap().expect("job should be claimable");
    assert_eq!(claimed.id, job_id);
    jobs.fail_with_policy(job_id, "w", error, backoff_seconds, ceiling)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_enqueue_defaults() {
    let test_db = TestDatabase::new().await;
    let before = Utc::now();

    let job = test_db.db.jobs.enqueue(NewJob::new("echo hi")).await.unwrap();

    assert!(job.id.starts_with("job-"));
    assert_eq!(job.command, "echo hi");
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_retries, 3);
    assert!(job.created_at >= before);
    assert!(job.locked_by.is_none());
    assert!(job.locked_at.is_none());
    assert!(job.run_after.is_none());
    assert!(job.output.is_none());

    let stored = test_db.db.jobs.get(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.id, job.id);
    assert_eq!(stored.state, JobState::Pending);
}

#[tokio::test]
async fn test_enqueue_rejects_missing_command() {
    let test_db = TestDatabase::new().await;

    let err = test_db.db.jobs.enqueue(NewJob::default()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let err = test_db.db.jobs.enqueue(NewJob::new("")).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    assert!(test_db.db.jobs.list_jobs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_enqueue_duplicate_id_is_store_error() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;

    jobs.enqueue(NewJob::new("true").with_id("dup")).await.unwrap();
    let err = jobs
        .enqueue(NewJob::new("false").with_id("dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Database(_)));

    let stored = jobs.get("dup").await.unwrap().unwrap();
    assert_eq!(stored.command, "true");
}

#[tokio::test]
async fn test_claim_then_complete() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let job = jobs.enqueue(NewJob::new("echo done")).await.unwrap();

    let claimed = jobs.claim("worker-1").await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.state, JobState::Processing);
    assert_eq!(claimed.locked_by.as_deref(), Some("worker-1"));
    assert!(claimed.locked_at.is_some());

    // Nothing else to claim while it is processing.
    assert!(jobs.claim("worker-2").await.unwrap().is_none());

    assert!(jobs.complete(&job.id, "worker-1", "done\n").await.unwrap());

    let stored = jobs.get(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert!(stored.locked_by.is_none());
    assert!(stored.locked_at.is_none());
    assert_eq!(stored.output.as_deref(), Some("done\n"));

    // Completed jobs are never reclaimed.
    assert!(jobs.claim("worker-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_complete_missing_job_is_noop() {
    let test_db = TestDatabase::new().await;
    assert!(!test_db.db.jobs.complete("nope", "w", "out").await.unwrap());
    assert!(test_db.db.jobs.get("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_empty_queue_returns_none() {
    let test_db = TestDatabase::new().await;
    assert!(test_db.db.jobs.claim("w").await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_order_is_oldest_first() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let now = Utc::now();

    jobs.enqueue(NewJob::new("true").with_id("newer").with_created_at(now))
        .await
        .unwrap();
    jobs.enqueue(
        NewJob::new("true")
            .with_id("older")
            .with_created_at(now - Duration::minutes(5)),
    )
    .await
    .unwrap();

    assert_eq!(jobs.claim("w").await.unwrap().unwrap().id, "older");
    assert_eq!(jobs.claim("w").await.unwrap().unwrap().id, "newer");
}

#[tokio::test]
async fn test_claim_ties_break_by_insertion_order() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let at = Utc::now();

    for id in ["first", "second", "third"] {
        jobs.enqueue(NewJob::new("true").with_id(id).with_created_at(at))
            .await
            .unwrap();
    }

    for expected in ["first", "second", "third"] {
        assert_eq!(jobs.claim("w").await.unwrap().unwrap().id, expected);
    }
}

#[tokio::test]
async fn test_claim_skips_future_run_after() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let now = Utc::now();

    jobs.enqueue(
        NewJob::new("true")
            .with_id("later")
            .with_run_after(now + Duration::hours(1)),
    )
    .await
    .unwrap();
    assert!(jobs.claim("w").await.unwrap().is_none());

    jobs.enqueue(
        NewJob::new("true")
            .with_id("due")
            .with_run_after(now - Duration::seconds(1)),
    )
    .await
    .unwrap();
    assert_eq!(jobs.claim("w").await.unwrap().unwrap().id, "due");
    assert!(jobs.claim("w").await.unwrap().is_none());
}

#[tokio::test]
async fn test_fail_schedules_retry_with_backoff() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let job = jobs
        .enqueue(NewJob::new("false").with_max_retries(2))
        .await
        .unwrap();
    jobs.claim("w").await.unwrap().unwrap();

    let before = Utc::now();
    let outcome = jobs
        .fail_with_policy(&job.id, "w", "exit 1", 1.0, 3)
        .await
        .unwrap();
    let after = Utc::now();

    let FailOutcome::RetryScheduled {
        attempts,
        run_after,
    } = outcome
    else {
        panic!("expected retry, got {outcome:?}");
    };
    assert_eq!(attempts, 1);
    assert!(run_after >= before + Duration::seconds(1));
    assert!(run_after <= after + Duration::seconds(1));

    let stored = jobs.get(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Pending);
    assert_eq!(stored.attempts, 1);
    assert!(stored.locked_by.is_none());
    assert!(stored.locked_at.is_none());
    let stored_run_after = stored.run_after.unwrap();
    assert!((stored_run_after - run_after).num_milliseconds().abs() < 1);

    // Backoff keeps it out of reach until run_after passes.
    assert!(jobs.claim("w").await.unwrap().is_none());
}

#[tokio::test]
async fn test_zero_backoff_is_immediately_claimable() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let job = jobs.enqueue(NewJob::new("false")).await.unwrap();
    claim_and_fail(jobs, &job.id, "boom", 0.0, 3).await;

    let again = jobs.claim("w").await.unwrap().unwrap();
    assert_eq!(again.id, job.id);
    assert_eq!(again.attempts, 1);
}

#[tokio::test]
async fn test_repeated_failure_moves_to_dead_letter_once() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let job = jobs
        .enqueue(NewJob::new("false").with_max_retries(2))
        .await
        .unwrap();
    let long_error = "e".repeat(5000);

    for expected_attempts in 1..=2 {
        let outcome = claim_and_fail(jobs, &job.id, &long_error, 0.0, 3).await;
        assert!(
            matches!(outcome, FailOutcome::RetryScheduled { attempts, .. } if attempts == expected_attempts)
        );
    }

    let outcome = claim_and_fail(jobs, &job.id, &long_error, 0.0, 3).await;
    assert_eq!(outcome, FailOutcome::MovedToDeadLetter { attempts: 3 });

    assert!(jobs.get(&job.id).await.unwrap().is_none());
    let dead = jobs.list_dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    let entry = &dead[0];
    assert_eq!(entry.id, job.id);
    assert_eq!(entry.command, "false");
    assert_eq!(entry.attempts, 3);
    assert_eq!(entry.max_retries, 2);
    assert_eq!(entry.last_error.as_ref().unwrap().chars().count(), 1000);
    assert!((entry.created_at - job.created_at).num_milliseconds().abs() < 1);

    // Further reports for the vanished job are no-ops.
    let outcome = jobs
        .fail_with_policy(&job.id, "w", "late", 0.0, 3)
        .await
        .unwrap();
    assert_eq!(outcome, FailOutcome::Missing);
    assert_eq!(jobs.list_dead_letters().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_global_ceiling_dead_letters_early() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let job = jobs
        .enqueue(NewJob::new("false").with_max_retries(10))
        .await
        .unwrap();

    let outcome = claim_and_fail(jobs, &job.id, "x", 0.0, 1).await;
    assert!(matches!(outcome, FailOutcome::RetryScheduled { attempts: 1, .. }));

    let outcome = claim_and_fail(jobs, &job.id, "x", 0.0, 1).await;
    assert_eq!(outcome, FailOutcome::MovedToDeadLetter { attempts: 2 });
}

#[tokio::test]
async fn test_zero_max_retries_dead_letters_on_first_failure() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let job = jobs
        .enqueue(NewJob::new("false").with_max_retries(0))
        .await
        .unwrap();

    let outcome = claim_and_fail(jobs, &job.id, "x", 1.0, 3).await;
    assert_eq!(outcome, FailOutcome::MovedToDeadLetter { attempts: 1 });
}

#[tokio::test]
async fn test_fail_missing_job_returns_missing() {
    let test_db = TestDatabase::new().await;
    let outcome = test_db
        .db
        .jobs
        .fail_with_policy("ghost", "w", "err", 1.0, 3)
        .await
        .unwrap();
    assert_eq!(outcome, FailOutcome::Missing);
    assert!(test_db.db.jobs.list_dead_letters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_dead_letter_preserves_attempts() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let job = jobs
        .enqueue(NewJob::new("false").with_id("dlq-1").with_max_retries(0))
        .await
        .unwrap();
    claim_and_fail(jobs, &job.id, "boom", 0.0, 3).await;
    assert!(jobs.get_dead_letter("dlq-1").await.unwrap().is_some());

    let revived = jobs.retry_dead_letter("dlq-1").await.unwrap();
    assert_eq!(revived.id, "dlq-1");
    assert_eq!(revived.command, "false");
    assert_eq!(revived.state, JobState::Pending);
    assert_eq!(revived.attempts, 1);
    assert_eq!(revived.max_retries, 0);
    assert!(revived.run_after.is_none());
    assert!(jobs.get_dead_letter("dlq-1").await.unwrap().is_none());

    // Same ceiling: the next failure dead-letters it again.
    let outcome = claim_and_fail(jobs, "dlq-1", "boom", 0.0, 3).await;
    assert_eq!(outcome, FailOutcome::MovedToDeadLetter { attempts: 2 });
}

#[tokio::test]
async fn test_retry_dead_letter_not_found() {
    let test_db = TestDatabase::new().await;
    let err = test_db
        .db
        .jobs
        .retry_dead_letter("missing")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_retry_dead_letter_conflict_keeps_entry() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    jobs.enqueue(NewJob::new("false").with_id("x").with_max_retries(0))
        .await
        .unwrap();
    claim_and_fail(jobs, "x", "boom", 0.0, 3).await;
    jobs.enqueue(NewJob::new("true").with_id("x")).await.unwrap();

    let err = jobs.retry_dead_letter("x").await.unwrap_err();
    assert!(matches!(err, Error::Database(_)));

    // Rolled back: the entry is still there and the live job untouched.
    assert!(jobs.get_dead_letter("x").await.unwrap().is_some());
    assert_eq!(jobs.get("x").await.unwrap().unwrap().command, "true");
}

#[tokio::test]
async fn test_list_jobs_filters_and_orders_newest_first() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let now = Utc::now();

    for (i, id) in ["a", "b", "c"].into_iter().enumerate() {
        jobs.enqueue(
            NewJob::new("true")
                .with_id(id)
                .with_created_at(now + Duration::seconds(i as i64)),
        )
        .await
        .unwrap();
    }
    let claimed = jobs.claim("w").await.unwrap().unwrap();
    assert_eq!(claimed.id, "a");
    jobs.complete("a", "w", "").await.unwrap();

    let all: Vec<String> = jobs
        .list_jobs(None)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(all, vec!["c", "b", "a"]);

    let pending: Vec<String> = jobs
        .list_jobs(Some(JobState::Pending))
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(pending, vec!["c", "b"]);

    let completed = jobs.list_jobs(Some(JobState::Completed)).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert!(jobs
        .list_jobs(Some(JobState::Processing))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_queue_stats_counts_every_state() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;

    for _ in 0..4 {
        jobs.enqueue(NewJob::new("true")).await.unwrap();
    }
    let done = jobs.claim("w").await.unwrap().unwrap();
    jobs.complete(&done.id, "w", "").await.unwrap();
    jobs.claim("w").await.unwrap().unwrap();
    let dead = jobs.claim("w").await.unwrap().unwrap();
    jobs.fail_with_policy(&dead.id, "w", "x", 0.0, 0)
        .await
        .unwrap();

    let stats = jobs.queue_stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.dead, 1);
    assert_eq!(stats.total(), 4);
}

#[tokio::test]
async fn test_reclaim_stale_releases_old_locks_only() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let job = jobs.enqueue(NewJob::new("sleep 100")).await.unwrap();
    jobs.claim("crashed").await.unwrap().unwrap();

    assert_eq!(jobs.reclaim_stale(Duration::hours(1)).await.unwrap(), 0);
    assert_eq!(
        jobs.get(&job.id).await.unwrap().unwrap().state,
        JobState::Processing
    );

    assert_eq!(jobs.reclaim_stale(Duration::zero()).await.unwrap(), 1);
    let stored = jobs.get(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Pending);
    assert_eq!(stored.attempts, 0);
    assert!(stored.locked_by.is_none());

    let again = jobs.claim("rescuer").await.unwrap().unwrap();
    assert_eq!(again.locked_by.as_deref(), Some("rescuer"));
}

#[tokio::test]
async fn test_outcome_from_non_holder_is_ignored() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let job = jobs.enqueue(NewJob::new("true")).await.unwrap();
    jobs.claim("owner").await.unwrap().unwrap();

    assert!(!jobs.complete(&job.id, "intruder", "out").await.unwrap());
    let outcome = jobs
        .fail_with_policy(&job.id, "intruder", "err", 0.0, 3)
        .await
        .unwrap();
    assert_eq!(outcome, FailOutcome::Missing);

    let stored = jobs.get(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Processing);
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.locked_by.as_deref(), Some("owner"));
}

#[tokio::test]
async fn test_reclaimed_job_outcomes_cannot_reopen_completed_job() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let job = jobs.enqueue(NewJob::new("sleep 1")).await.unwrap();

    jobs.claim("worker-a").await.unwrap().unwrap();
    assert_eq!(jobs.reclaim_stale(Duration::zero()).await.unwrap(), 1);
    let second = jobs.claim("worker-b").await.unwrap().unwrap();
    assert_eq!(second.id, job.id);

    // The original holder lost its lock: its success is dropped.
    assert!(!jobs.complete(&job.id, "worker-a", "late").await.unwrap());
    assert_eq!(
        jobs.get(&job.id).await.unwrap().unwrap().state,
        JobState::Processing
    );

    // The current holder finishes the job.
    assert!(jobs.complete(&job.id, "worker-b", "done").await.unwrap());

    // A failure report arriving after completion changes nothing.
    for worker in ["worker-a", "worker-b"] {
        let outcome = jobs
            .fail_with_policy(&job.id, worker, "late failure", 0.0, 3)
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Missing);
    }

    let stored = jobs.get(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.output.as_deref(), Some("done"));
    assert!(jobs.claim("worker-c").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_job_race_has_exactly_one_winner() {
    let test_db = TestDatabase::new().await;
    const CLAIMANTS: usize = 8;
    const ROUNDS: usize = 10;

    let mut pools = Vec::new();
    for _ in 0..CLAIMANTS {
        pools.push(test_db.reopen().await);
    }

    for round in 0..ROUNDS {
        let job = test_db
            .db
            .jobs
            .enqueue(NewJob::new("true").with_id(format!("race-{round}")))
            .await
            .unwrap();

        let handles: Vec<_> = pools
            .iter()
            .cloned()
            .enumerate()
            .map(|(w, db)| {
                tokio::spawn(async move { db.jobs.claim(&format!("worker-{w}")).await.unwrap() })
            })
            .collect();

        let winners: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter_map(|r| r.unwrap())
            .collect();
        assert_eq!(winners.len(), 1, "round {round}: exactly one claimant wins");
        assert_eq!(winners[0].id, job.id);

        let winner = winners[0].locked_by.clone().unwrap();
        assert!(test_db.db.jobs.complete(&job.id, &winner, "").await.unwrap());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_share_a_job() {
    let test_db = TestDatabase::new().await;
    const JOBS: usize = 40;
    for _ in 0..JOBS {
        test_db.db.jobs.enqueue(NewJob::new("true")).await.unwrap();
    }

    // Separate pools stand in for separate worker processes.
    let mut handles = Vec::new();
    for w in 0..4 {
        let db = test_db.reopen().await;
        handles.push(tokio::spawn(async move {
            let worker_id = format!("worker-{w}");
            let mut claimed = Vec::new();
            while let Some(job) = db.jobs.claim(&worker_id).await.unwrap() {
                assert_eq!(job.locked_by.as_deref(), Some(worker_id.as_str()));
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for result in futures::future::join_all(handles).await {
        for id in result.unwrap() {
            total += 1;
            assert!(seen.insert(id), "job claimed twice");
        }
    }
    assert_eq!(total, JOBS);
    assert_eq!(seen.len(), JOBS);

    let stats = test_db.db.jobs.queue_stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, JOBS as i64);
}

#[tokio::test]
async fn test_enqueue_wakes_waiters() {
    let test_db = TestDatabase::new().await;
    let notify = test_db.db.jobs.job_notify();
    let notified = notify.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();

    test_db.db.jobs.enqueue(NewJob::new("true")).await.unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(1), notified)
        .await
        .expect("enqueue should notify waiters");
}
