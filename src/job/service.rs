use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::job::record::JobRecord;
use crate::lock::LockManager;
use crate::scheduler::batch::{BatchCompleter, BatchOutcome};
use crate::store::{Page, RecordStore, SearchQuery};

#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub title: String,
    pub description: String,
}

/// Partial edit. Absent fields are left alone; present ones must not be blank.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Job operations for the API and CLI.
///
/// Every mutation of an existing job runs under that job's lock and re-reads
/// the record inside the critical section before applying the change.
#[derive(Debug, Clone)]
pub struct JobService {
    store: Arc<RecordStore>,
    locks: Arc<LockManager>,
    batch: BatchCompleter,
}

impl JobService {
    pub fn new(store: Arc<RecordStore>, locks: Arc<LockManager>) -> Self {
        let batch = BatchCompleter::new(store.clone(), locks.clone());
        Self { store, locks, batch }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn batch_completer(&self) -> &BatchCompleter {
        &self.batch
    }

    pub async fn create(&self, new_job: NewJob) -> Result<JobRecord> {
        let job = JobRecord::new(new_job.title, new_job.description)?;
        let job = self.store.create(job)?;
        tracing::info!(job_id = %job.id, title = %job.title, "Job created");
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Result<JobRecord> {
        self.store
            .find_by_id(&id)?
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<JobRecord>> {
        self.store.find_all()
    }

    pub async fn list_paginated(&self, page: usize, size: usize) -> Result<Page<JobRecord>> {
        self.store.find_all_paginated(page, size)
    }

    pub async fn search(&self, query: SearchQuery) -> Result<Vec<JobRecord>> {
        self.store.search(&query)
    }

    pub async fn update(&self, id: Uuid, changes: JobUpdate) -> Result<JobRecord> {
        self.mutate(id, move |job| {
            if let Some(title) = changes.title {
                job.update_title(title)?;
            }
            if let Some(description) = changes.description {
                job.update_description(description)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn complete(&self, id: Uuid) -> Result<JobRecord> {
        self.mutate(id, JobRecord::complete).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<JobRecord> {
        self.mutate(id, JobRecord::cancel).await
    }

    pub async fn reopen(&self, id: Uuid) -> Result<JobRecord> {
        self.mutate(id, JobRecord::reopen).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        self.locks
            .run_exclusive(&id.to_string(), || async {
                let deleted = self.store.delete(&id)?;
                tracing::info!(job_id = %id, "Job deleted");
                Ok::<_, JobError>(deleted)
            })
            .await
    }

    /// Complete every job that is still pending.
    pub async fn complete_pending(&self) -> Result<BatchOutcome> {
        self.batch.run().await
    }

    async fn mutate<F>(&self, id: Uuid, apply: F) -> Result<JobRecord>
    where
        F: FnOnce(&mut JobRecord) -> Result<()> + Send,
    {
        self.locks
            .run_exclusive(&id.to_string(), || async move {
                let mut job = self
                    .store
                    .find_by_id(&id)?
                    .ok_or_else(|| JobError::NotFound(id.to_string()))?;
                apply(&mut job)?;
                let job = self.store.update(job)?;
                tracing::debug!(job_id = %id, status = %job.status, "Job mutated");
                Ok::<_, JobError>(job)
            })
            .await
    }
}
