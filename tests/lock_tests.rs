//! Tests for the resource lock table.
//!
//! These tests validate that:
//! - Protected bodies on the same resource never overlap
//! - Multi-resource acquisition is all-or-nothing
//! - Expired locks can be taken over, and stale owners cannot release them
//! - Locks are released on error and when the waiting future is dropped

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

mod test_harness;

use jobwarden::config::LockConfig;
use jobwarden::lock::LockManager;
use jobwarden::JobError;
use test_harness::fast_lock_config;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_exclusive_never_overlaps() {
    let locks = Arc::new(LockManager::new(fast_lock_config()));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let locks = locks.clone();
        let in_flight = in_flight.clone();
        let max_seen = max_seen.clone();
        let runs = runs.clone();
        handles.push(tokio::spawn(async move {
            locks
                .run_exclusive("job-1", || async {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, JobError>(())
                })
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(runs.load(Ordering::SeqCst), 10);
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert!(!locks.is_locked("job-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_and_single_locks_exclude_each_other() {
    let locks = Arc::new(LockManager::new(fast_lock_config()));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..8 {
        let locks = locks.clone();
        let in_flight = in_flight.clone();
        let max_seen = max_seen.clone();
        handles.push(tokio::spawn(async move {
            let body = || async {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, JobError>(())
            };
            if i % 2 == 0 {
                locks.run_exclusive("b", body).await
            } else {
                locks.run_exclusive_multi(["a", "b", "c"], body).await
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_release_requires_matching_owner() {
    let locks = LockManager::new(fast_lock_config());
    let owner = locks.acquire("x", Duration::from_millis(100)).await.unwrap();

    assert!(locks.is_locked("x"));
    assert!(!locks.release("x", uuid::Uuid::new_v4()));
    assert!(locks.is_locked("x"));

    assert!(locks.release("x", owner));
    assert!(!locks.is_locked("x"));
    // Second release is a no-op
    assert!(!locks.release("x", owner));
}

#[tokio::test(start_paused = true)]
async fn test_acquire_times_out_on_held_resource() {
    let locks = LockManager::new(LockConfig::default());
    let _holder = locks.lock("x", Duration::from_secs(1)).await.unwrap();

    let started = Instant::now();
    let err = locks.acquire("x", Duration::from_secs(1)).await.unwrap_err();

    assert!(matches!(err, JobError::LockTimeout { ref resource } if resource == "x"));
    assert!(err.is_retryable());
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_millis(1300));
}

#[tokio::test(start_paused = true)]
async fn test_waiter_gets_lock_after_release() {
    let locks = Arc::new(LockManager::new(LockConfig::default()));
    let owner = locks.acquire("x", Duration::from_secs(1)).await.unwrap();

    let waiter = {
        let locks = locks.clone();
        tokio::spawn(async move { locks.acquire("x", Duration::from_secs(5)).await })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(locks.release("x", owner));

    let second = waiter.await.unwrap().unwrap();
    assert_ne!(second, owner);
    assert_eq!(locks.holder("x").unwrap().owner, second);
}

#[tokio::test(start_paused = true)]
async fn test_expired_lock_is_taken_over() {
    let config = LockConfig::default();
    let locks = LockManager::new(config.clone());
    let stale = locks.acquire("x", Duration::from_secs(1)).await.unwrap();

    // Holder never releases
    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(!locks.is_locked("x"));

    let started = Instant::now();
    let fresh = locks.acquire("x", Duration::from_millis(1000)).await.unwrap();
    assert!(started.elapsed() < config.poll_interval);
    assert_ne!(stale, fresh);

    // The stale owner can no longer release the new holder's lock
    assert!(!locks.release("x", stale));
    assert!(locks.is_locked("x"));
    assert!(locks.release("x", fresh));
}

#[tokio::test(start_paused = true)]
async fn test_lock_inside_expiry_window_is_respected() {
    let locks = LockManager::new(LockConfig::default());
    let _holder = locks.acquire("x", Duration::from_secs(1)).await.unwrap();

    tokio::time::advance(Duration::from_secs(29)).await;
    let err = locks.acquire("x", Duration::from_millis(500)).await.unwrap_err();
    assert!(matches!(err, JobError::LockTimeout { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_multi_lock_is_all_or_nothing() {
    let locks = LockManager::new(LockConfig::default());
    let _held_c = locks.lock("c", Duration::from_secs(1)).await.unwrap();
    let ran = AtomicBool::new(false);

    let result = locks
        .run_exclusive_multi_with_timeout(["a", "b", "c"], Duration::from_millis(600), || async {
            ran.store(true, Ordering::SeqCst);
            Ok::<_, JobError>(())
        })
        .await;

    assert!(matches!(result, Err(JobError::LockTimeout { ref resource }) if resource == "c"));
    assert!(!ran.load(Ordering::SeqCst));
    assert!(!locks.is_locked("a"));
    assert!(!locks.is_locked("b"));
    assert!(locks.is_locked("c"));
}

#[tokio::test(start_paused = true)]
async fn test_multi_lock_releases_everything_after_run() {
    let locks = LockManager::new(LockConfig::default());

    let held = locks
        .run_exclusive_multi(vec!["b".to_string(), "a".to_string(), "b".to_string()], || async {
            Ok::<_, JobError>((locks.is_locked("a"), locks.is_locked("b")))
        })
        .await
        .unwrap();

    assert_eq!(held, (true, true));
    assert!(!locks.is_locked("a"));
    assert!(!locks.is_locked("b"));
}

#[tokio::test(start_paused = true)]
async fn test_lock_many_uses_sorted_order() {
    let locks = LockManager::new(LockConfig::default());
    let guard = locks
        .lock_many(["job-3", "job-1", "job-2", "job-1"], Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(guard.resources(), ["job-1", "job-2", "job-3"]);
    drop(guard);
    assert!(!locks.is_locked("job-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_opposite_order_multi_locks_do_not_deadlock() {
    let locks = Arc::new(LockManager::new(
        fast_lock_config().with_default_timeout(Duration::from_secs(2)),
    ));

    let mut handles = Vec::new();
    for round in 0..20 {
        let locks = locks.clone();
        let ids: Vec<&'static str> = if round % 2 == 0 {
            vec!["a", "b", "c"]
        } else {
            vec!["c", "b", "a"]
        };
        handles.push(tokio::spawn(async move {
            locks
                .run_exclusive_multi(ids, || async {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    Ok::<_, JobError>(())
                })
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_operation_error_is_propagated_and_lock_released() {
    let locks = LockManager::new(fast_lock_config());

    let result: Result<(), JobError> = locks
        .run_exclusive("job-9", || async { Err(JobError::NotFound("job-9".to_string())) })
        .await;

    assert!(matches!(result, Err(JobError::NotFound(ref id)) if id == "job-9"));
    assert!(!locks.is_locked("job-9"));
}

#[tokio::test]
async fn test_custom_error_type_passes_through() {
    #[derive(Debug)]
    enum AppError {
        Lock(JobError),
        Domain(&'static str),
    }

    impl From<JobError> for AppError {
        fn from(e: JobError) -> Self {
            AppError::Lock(e)
        }
    }

    let locks = LockManager::new(fast_lock_config());
    let result: Result<(), AppError> = locks
        .run_exclusive("r", || async { Err(AppError::Domain("boom")) })
        .await;

    assert!(matches!(result, Err(AppError::Domain("boom"))));
    assert!(!locks.is_locked("r"));

    let _held = locks.lock("busy", Duration::from_secs(1)).await.unwrap();
    let result: Result<(), AppError> = locks
        .run_exclusive_with_timeout("busy", Duration::from_millis(20), || async { Ok(()) })
        .await;
    assert!(matches!(result, Err(AppError::Lock(JobError::LockTimeout { .. }))));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_operation_releases_lock() {
    let locks = LockManager::new(LockConfig::default());

    let outcome = tokio::time::timeout(
        Duration::from_millis(100),
        locks.run_exclusive("slow", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, JobError>(())
        }),
    )
    .await;

    assert!(outcome.is_err());
    assert!(!locks.is_locked("slow"));
}

#[tokio::test]
async fn test_empty_multi_lock_runs_without_locking() {
    let locks = LockManager::new(fast_lock_config());
    let value = locks
        .run_exclusive_multi(Vec::<String>::new(), || async { Ok::<_, JobError>(42) })
        .await
        .unwrap();
    assert_eq!(value, 42);
}

#[tokio::test]
async fn test_unbounded_timeout_acquires_free_resource() {
    let locks = LockManager::default();

    let owner = locks.acquire("x", Duration::MAX).await.unwrap();
    assert!(locks.is_locked("x"));
    assert!(locks.release("x", owner));

    let value = locks
        .run_exclusive_multi_with_timeout(["a", "b"], Duration::MAX, || async {
            Ok::<_, JobError>(7)
        })
        .await
        .unwrap();
    assert_eq!(value, 7);
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_timeout_waits_for_release() {
    let locks = Arc::new(LockManager::new(LockConfig::default()));
    let owner = locks.acquire("x", Duration::from_secs(1)).await.unwrap();

    let waiter = {
        let locks = locks.clone();
        tokio::spawn(async move { locks.acquire("x", Duration::MAX).await })
    };

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(!waiter.is_finished());
    assert!(locks.release("x", owner));

    let second = waiter.await.unwrap().unwrap();
    assert_eq!(locks.holder("x").unwrap().owner, second);
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_expiry_never_expires() {
    let locks = LockManager::new(LockConfig::default().with_expiry(Duration::MAX));
    let owner = locks.acquire("x", Duration::from_secs(1)).await.unwrap();
    assert!(locks.holder("x").unwrap().expires_at.is_none());

    tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;
    assert!(locks.is_locked("x"));
    let err = locks.acquire("x", Duration::from_millis(500)).await.unwrap_err();
    assert!(matches!(err, JobError::LockTimeout { .. }));
    assert!(locks.release("x", owner));
}
