//! Shared fixtures for the job service integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use jobwarden::config::LockConfig;
use jobwarden::job::{JobRecord, JobService, JobStatus, NewJob};
use jobwarden::lock::LockManager;
use jobwarden::store::RecordStore;

/// Lock settings with short waits so contention tests finish quickly.
pub fn fast_lock_config() -> LockConfig {
    LockConfig::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_default_timeout(Duration::from_secs(5))
}

/// A service wired over an in-memory store.
pub struct TestService {
    pub store: Arc<RecordStore>,
    pub locks: Arc<LockManager>,
    pub service: JobService,
}

impl TestService {
    pub fn new() -> Self {
        Self::with_lock_config(fast_lock_config())
    }

    pub fn with_lock_config(config: LockConfig) -> Self {
        let store = Arc::new(RecordStore::in_memory().unwrap());
        let locks = Arc::new(LockManager::new(config));
        let service = JobService::new(store.clone(), locks.clone());
        Self {
            store,
            locks,
            service,
        }
    }

    pub async fn create(&self, title: &str, description: &str) -> JobRecord {
        self.service
            .create(NewJob {
                title: title.to_string(),
                description: description.to_string(),
            })
            .await
            .unwrap()
    }
}

/// Every stored id sits in exactly one bucket, the one matching its status,
/// and the buckets hold nothing else.
pub fn assert_index_consistent(store: &RecordStore) {
    let jobs = store.find_all().unwrap();
    let mut seen = HashSet::new();
    let mut bucket_total = 0;

    for status in JobStatus::ALL {
        let ids = store.find_ids_by_status(status).unwrap();
        bucket_total += ids.len();
        for id in ids {
            assert!(seen.insert(id), "id {id} appears in more than one bucket");
            let job = store
                .find_by_id(&id)
                .unwrap()
                .unwrap_or_else(|| panic!("bucket {status} holds dangling id {id}"));
            assert_eq!(job.status, status, "id {id} is in the wrong bucket");
        }
    }

    assert_eq!(bucket_total, jobs.len(), "buckets do not partition the job map");
    assert_eq!(store.len().unwrap(), jobs.len());
}
