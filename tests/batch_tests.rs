//! Tests for batch completion of pending jobs and the periodic sweeper.

use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

mod test_harness;

use jobwarden::config::SweepConfig;
use jobwarden::job::{JobRecord, JobStatus};
use jobwarden::scheduler::{BatchCompleter, BatchOutcome, Sweeper};
use test_harness::{assert_index_consistent, TestService};

fn completer(ts: &TestService) -> BatchCompleter {
    BatchCompleter::new(ts.store.clone(), ts.locks.clone())
}

#[tokio::test]
async fn test_completes_only_pending_jobs() {
    let ts = TestService::new();
    let a = ts.create("A", "gets canceled").await;
    let b = ts.create("B", "stays pending").await;
    ts.service.cancel(a.id).await.unwrap();

    let outcome = ts.service.complete_pending().await.unwrap();

    assert_eq!(
        outcome,
        BatchOutcome {
            count: 1,
            ids: vec![b.id],
        }
    );
    assert_eq!(ts.service.get(a.id).await.unwrap().status, JobStatus::Canceled);
    assert_eq!(ts.service.get(b.id).await.unwrap().status, JobStatus::Completed);
    assert!(!ts.locks.is_locked(&b.id.to_string()));
    assert_index_consistent(&ts.store);
}

#[tokio::test]
async fn test_second_run_finds_nothing() {
    let ts = TestService::new();
    for i in 0..5 {
        ts.create(&format!("job-{i}"), "pending").await;
    }

    let first = completer(&ts).run().await.unwrap();
    assert_eq!(first.count, 5);
    assert_eq!(first.ids.len(), 5);
    assert!(ts.store.find_ids_by_status(JobStatus::Pending).unwrap().is_empty());

    let second = completer(&ts).run().await.unwrap();
    assert_eq!(second, BatchOutcome::default());
    assert_index_consistent(&ts.store);
}

#[tokio::test]
async fn test_empty_store_returns_empty_outcome() {
    let ts = TestService::new();
    let outcome = completer(&ts).run().await.unwrap();
    assert_eq!(outcome.count, 0);
    assert!(outcome.ids.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_job_canceled_after_snapshot_is_skipped() {
    let ts = TestService::new();
    // Locks are taken in sorted order, so B is locked before the batch waits on A.
    let mut a = JobRecord::new("A", "canceled mid-batch").unwrap();
    a.id = Uuid::from_u128(u128::MAX);
    let mut b = JobRecord::new("B", "completed by batch").unwrap();
    b.id = Uuid::from_u128(1);
    let a = ts.store.create(a).unwrap();
    let b = ts.store.create(b).unwrap();

    let a_key = a.id.to_string();
    let owner = ts.locks.acquire(&a_key, Duration::from_secs(1)).await.unwrap();

    let batch = {
        let completer = completer(&ts);
        tokio::spawn(async move { completer.run().await })
    };

    // Wait until the batch has taken the locks it can get.
    let b_key = b.id.to_string();
    while !ts.locks.is_locked(&b_key) && !batch.is_finished() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // Cancel A while we still own its lock, then let the batch in.
    let mut canceled = ts.store.find_by_id(&a.id).unwrap().unwrap();
    canceled.cancel().unwrap();
    ts.store.update(canceled).unwrap();
    assert!(ts.locks.release(&a_key, owner));

    let outcome = batch.await.unwrap().unwrap();
    assert_eq!(outcome.count, 1);
    assert_eq!(outcome.ids, vec![b.id]);
    assert_eq!(ts.service.get(a.id).await.unwrap().status, JobStatus::Canceled);
    assert_eq!(ts.service.get(b.id).await.unwrap().status, JobStatus::Completed);
    assert_index_consistent(&ts.store);
}

#[tokio::test]
async fn test_batch_times_out_when_a_job_stays_locked() {
    let ts = TestService::with_lock_config(
        test_harness::fast_lock_config().with_default_timeout(Duration::from_millis(30)),
    );
    let a = ts.create("A", "held").await;
    let b = ts.create("B", "free").await;

    let _guard = ts
        .locks
        .lock(&a.id.to_string(), Duration::from_secs(1))
        .await
        .unwrap();

    let err = completer(&ts).run().await.unwrap_err();
    assert!(err.is_retryable());

    // All or nothing: B was not completed
    assert_eq!(ts.service.get(b.id).await.unwrap().status, JobStatus::Pending);
    assert!(!ts.locks.is_locked(&b.id.to_string()));
}

#[tokio::test]
async fn test_sweep_once_appends_log_line() {
    let ts = TestService::new();
    ts.create("A", "pending").await;
    ts.create("B", "pending").await;

    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("logs.txt");
    let sweeper = Sweeper::new(
        completer(&ts),
        SweepConfig {
            interval: Duration::from_secs(60),
            log_path: Some(log_path.clone()),
        },
    );

    let outcome = sweeper.sweep_once().await.unwrap();
    assert_eq!(outcome.count, 2);
    let outcome = sweeper.sweep_once().await.unwrap();
    assert_eq!(outcome.count, 0);

    let contents = std::fs::read_to_string(&log_path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with('['));
    assert!(lines[0].ends_with("] Updated 2 pending jobs to completed"));
    assert!(lines[1].ends_with("] Updated 0 pending jobs to completed"));
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_runs_on_interval_until_cancelled() {
    let ts = TestService::new();
    let first = ts.create("First", "before start").await;

    let shutdown = CancellationToken::new();
    let sweeper = Sweeper::new(
        completer(&ts),
        SweepConfig {
            interval: Duration::from_secs(60),
            log_path: None,
        },
    );
    let handle = tokio::spawn(sweeper.run(shutdown.clone()));

    // Nothing happens before the first full interval
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(ts.service.get(first.id).await.unwrap().status, JobStatus::Pending);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(ts.service.get(first.id).await.unwrap().status, JobStatus::Completed);

    let second = ts.create("Second", "after first sweep").await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(ts.service.get(second.id).await.unwrap().status, JobStatus::Completed);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("sweeper should stop after cancellation")
        .unwrap();
}
