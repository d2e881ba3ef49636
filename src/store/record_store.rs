use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::job::record::{JobRecord, JobStatus};
use crate::store::backend::{Backend, MemoryBackend, StoreError, WriteOp};

const JOBS_ROOT: &str = "/jobs";
const STATUS_ROOT: &str = "/status";

/// Largest page `find_all_paginated` will return.
pub const MAX_PAGE_SIZE: usize = 100;

fn job_key(id: &Uuid) -> String {
    format!("{JOBS_ROOT}/{id}")
}

fn bucket_key(status: JobStatus) -> String {
    format!("{STATUS_ROOT}/{status}")
}

fn index_key(status: JobStatus, id: &Uuid) -> String {
    format!("{STATUS_ROOT}/{status}/{id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetadata {
    pub total_elements: usize,
    pub total_pages: usize,
    pub size: usize,
    pub page: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub metadata: PageMetadata,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            data: self.data.into_iter().map(f).collect(),
            metadata: self.metadata,
        }
    }
}

/// Optional filters for [`RecordStore::search`]. A blank title counts as absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    pub status: Option<JobStatus>,
    pub title: Option<String>,
}

impl SearchQuery {
    fn title_filter(&self) -> Option<String> {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }
}

/// What `rebuild_status_index` had to fix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexRepair {
    /// Ids found in a bucket that did not match their record's status.
    pub moved: usize,
    /// Ids that were in no bucket at all.
    pub added: usize,
    /// Bucket entries with no record behind them.
    pub dropped: usize,
}

impl IndexRepair {
    pub fn is_clean(&self) -> bool {
        self.moved == 0 && self.added == 0 && self.dropped == 0
    }
}

/// Job records keyed by id, plus a status index partitioning those ids.
///
/// Every write path keeps the two consistent: each record id sits in exactly
/// one status bucket, the one matching its stored status. A record write and
/// its bucket moves go to the backend as one atomic commit.
///
/// The store does not serialize read-then-write sequences. Callers mutating a
/// given id must hold that id's lock in the [`LockManager`](crate::lock::LockManager).
#[derive(Debug)]
pub struct RecordStore {
    backend: Arc<dyn Backend>,
}

impl RecordStore {
    /// Open a store over `backend`, creating empty roots and repairing the
    /// status index from the records.
    pub fn open(backend: Arc<dyn Backend>) -> Result<Self> {
        let store = Self::new(backend)?;
        let repair = store.rebuild_status_index()?;
        if !repair.is_clean() {
            tracing::warn!(
                moved = repair.moved,
                added = repair.added,
                dropped = repair.dropped,
                "Repaired status index on startup"
            );
        }
        Ok(store)
    }

    /// Attach to `backend` without touching an existing index.
    pub fn new(backend: Arc<dyn Backend>) -> Result<Self> {
        let store = Self { backend };
        store.ensure_roots()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(Arc::new(MemoryBackend::new()))
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    fn ensure_roots(&self) -> Result<()> {
        let mut ops = Vec::new();
        if self.backend.get(JOBS_ROOT)?.is_none() {
            ops.push(WriteOp::set(JOBS_ROOT, Value::Object(Map::new())));
        }
        for status in JobStatus::ALL {
            let key = bucket_key(status);
            if self.backend.get(&key)?.is_none() {
                ops.push(WriteOp::set(key, Value::Object(Map::new())));
            }
        }
        if !ops.is_empty() {
            self.backend.commit(ops)?;
        }
        Ok(())
    }

    pub fn create(&self, record: JobRecord) -> Result<JobRecord> {
        if self.backend.get(&job_key(&record.id))?.is_some() {
            return Err(JobError::AlreadyExists(record.id.to_string()));
        }

        self.backend.commit(vec![
            WriteOp::set(job_key(&record.id), encode(&record)?),
            WriteOp::set(index_key(record.status, &record.id), Value::Bool(true)),
        ])?;
        tracing::debug!(job_id = %record.id, status = %record.status, "Job created");
        Ok(record)
    }

    pub fn find_by_id(&self, id: &Uuid) -> Result<Option<JobRecord>> {
        let key = job_key(id);
        match self.backend.get(&key)? {
            Some(value) => Ok(Some(decode(&key, value)?)),
            None => Ok(None),
        }
    }

    /// Replace an existing record, moving its id between buckets if the
    /// status changed.
    pub fn update(&self, record: JobRecord) -> Result<JobRecord> {
        let existing = self
            .find_by_id(&record.id)?
            .ok_or_else(|| JobError::NotFound(record.id.to_string()))?;

        let mut ops = Vec::with_capacity(3);
        if existing.status != record.status {
            ops.push(WriteOp::delete(index_key(existing.status, &record.id)));
        }
        ops.push(WriteOp::set(index_key(record.status, &record.id), Value::Bool(true)));
        ops.push(WriteOp::set(job_key(&record.id), encode(&record)?));
        self.backend.commit(ops)?;

        tracing::debug!(
            job_id = %record.id,
            from = %existing.status,
            to = %record.status,
            "Job updated"
        );
        Ok(record)
    }

    pub fn delete(&self, id: &Uuid) -> Result<bool> {
        let existing = self
            .find_by_id(id)?
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;

        self.backend.commit(vec![
            WriteOp::delete(job_key(id)),
            WriteOp::delete(index_key(existing.status, id)),
        ])?;
        tracing::debug!(job_id = %id, "Job deleted");
        Ok(true)
    }

    /// All records, oldest first.
    pub fn find_all(&self) -> Result<Vec<JobRecord>> {
        let Some(value) = self.backend.get(JOBS_ROOT)? else {
            return Ok(Vec::new());
        };
        let Value::Object(map) = value else {
            return Err(StoreError::Corrupt {
                key: JOBS_ROOT.to_string(),
                reason: "job map is not an object".to_string(),
            }
            .into());
        };

        let mut jobs = map
            .into_iter()
            .map(|(id, value)| decode(&format!("{JOBS_ROOT}/{id}"), value))
            .collect::<Result<Vec<_>>>()?;
        sort_chronologically(&mut jobs);
        Ok(jobs)
    }

    /// Zero-based page of records in creation order. `size` is clamped to
    /// `1..=MAX_PAGE_SIZE`.
    pub fn find_all_paginated(&self, page: usize, size: usize) -> Result<Page<JobRecord>> {
        let size = size.clamp(1, MAX_PAGE_SIZE);
        let jobs = self.find_all()?;
        let total_elements = jobs.len();

        let data = jobs
            .into_iter()
            .skip(page.saturating_mul(size))
            .take(size)
            .collect();

        Ok(Page {
            data,
            metadata: PageMetadata {
                total_elements,
                total_pages: total_elements.div_ceil(size),
                size,
                page,
            },
        })
    }

    /// Case-insensitive substring match on the title.
    pub fn find_by_title(&self, title: &str) -> Result<Vec<JobRecord>> {
        let needle = title.to_lowercase();
        let mut jobs = self.find_all()?;
        jobs.retain(|job| job.title.to_lowercase().contains(&needle));
        Ok(jobs)
    }

    /// Status filtering goes through the index; title filtering always scans.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<JobRecord>> {
        match (query.status, query.title_filter()) {
            (Some(status), None) => self.find_by_status(status),
            (Some(status), Some(needle)) => {
                let mut jobs = self.find_by_status(status)?;
                jobs.retain(|job| job.title.to_lowercase().contains(&needle));
                Ok(jobs)
            }
            (None, Some(needle)) => self.find_by_title(&needle),
            (None, None) => self.find_all(),
        }
    }

    pub fn find_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
        let ids = self.find_ids_by_status(status)?;
        let mut jobs = self.find_by_ids(&ids)?;
        sort_chronologically(&mut jobs);
        Ok(jobs)
    }

    pub fn find_ids_by_status(&self, status: JobStatus) -> Result<Vec<Uuid>> {
        let key = bucket_key(status);
        let Some(value) = self.backend.get(&key)? else {
            return Ok(Vec::new());
        };
        let Value::Object(bucket) = value else {
            return Err(StoreError::Corrupt {
                key,
                reason: "status bucket is not an object".to_string(),
            }
            .into());
        };

        bucket
            .keys()
            .map(|id| {
                Uuid::parse_str(id).map_err(|e| {
                    JobError::from(StoreError::Corrupt {
                        key: format!("{key}/{id}"),
                        reason: e.to_string(),
                    })
                })
            })
            .collect()
    }

    /// Records for `ids`, in input order. Unknown ids are skipped.
    pub fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<JobRecord>> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.find_by_id(id)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Insert or replace every record in one atomic commit, with the same
    /// bucket bookkeeping as `create` and `update`.
    pub fn save_all(&self, records: &[JobRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        // Status as of the ops queued so far, so repeated ids chain correctly.
        let mut current: HashMap<Uuid, Option<JobStatus>> = HashMap::new();
        let mut ops = Vec::with_capacity(records.len() * 3);

        for record in records {
            let previous = match current.get(&record.id) {
                Some(status) => *status,
                None => self.find_by_id(&record.id)?.map(|job| job.status),
            };
            if let Some(old) = previous.filter(|old| *old != record.status) {
                ops.push(WriteOp::delete(index_key(old, &record.id)));
            }
            ops.push(WriteOp::set(index_key(record.status, &record.id), Value::Bool(true)));
            ops.push(WriteOp::set(job_key(&record.id), encode(record)?));
            current.insert(record.id, Some(record.status));
        }

        self.backend.commit(ops)?;
        tracing::debug!(count = records.len(), "Saved job batch");
        Ok(())
    }

    /// Recompute the status index from the records, replacing whatever the
    /// buckets currently hold.
    pub fn rebuild_status_index(&self) -> Result<IndexRepair> {
        let jobs = self.find_all()?;

        let mut indexed: HashMap<String, BTreeSet<JobStatus>> = HashMap::new();
        for status in JobStatus::ALL {
            if let Some(Value::Object(bucket)) = self.backend.get(&bucket_key(status))? {
                for id in bucket.keys() {
                    indexed.entry(id.clone()).or_default().insert(status);
                }
            }
        }

        let mut repair = IndexRepair::default();
        let mut buckets: BTreeMap<JobStatus, Map<String, Value>> =
            JobStatus::ALL.iter().map(|s| (*s, Map::new())).collect();

        for job in &jobs {
            let id = job.id.to_string();
            match indexed.remove(&id) {
                None => repair.added += 1,
                Some(found) if found.len() == 1 && found.contains(&job.status) => {}
                Some(_) => repair.moved += 1,
            }
            if let Some(bucket) = buckets.get_mut(&job.status) {
                bucket.insert(id, Value::Bool(true));
            }
        }
        repair.dropped = indexed.len();

        let index: Map<String, Value> = buckets
            .into_iter()
            .map(|(status, bucket)| (status.to_string(), Value::Object(bucket)))
            .collect();
        self.backend.set(STATUS_ROOT, Value::Object(index))?;

        Ok(repair)
    }

    pub fn len(&self) -> Result<usize> {
        match self.backend.get(JOBS_ROOT)? {
            Some(Value::Object(map)) => Ok(map.len()),
            _ => Ok(0),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn encode(record: &JobRecord) -> Result<Value> {
    Ok(serde_json::to_value(record).map_err(StoreError::from)?)
}

fn decode(key: &str, value: Value) -> Result<JobRecord> {
    serde_json::from_value(value).map_err(|e| {
        JobError::from(StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    })
}

fn sort_chronologically(jobs: &mut [JobRecord]) {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
