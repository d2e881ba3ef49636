use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::job::record::JobStatus;
use crate::lock::LockManager;
use crate::store::RecordStore;

/// Jobs actually moved to completed by one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub count: usize,
    pub ids: Vec<Uuid>,
}

/// Completes every pending job in one locked pass.
///
/// 1. Snapshot the pending ids from the status index (may already be stale)
/// 2. Lock exactly those ids, all or nothing
/// 3. Re-read them and keep only the ones still pending
/// 4. Complete the survivors and save them as one batch
///
/// Jobs canceled or completed by someone else between steps 1 and 2 are
/// skipped, not reported as errors.
#[derive(Debug, Clone)]
pub struct BatchCompleter {
    store: Arc<RecordStore>,
    locks: Arc<LockManager>,
}

impl BatchCompleter {
    pub fn new(store: Arc<RecordStore>, locks: Arc<LockManager>) -> Self {
        Self { store, locks }
    }

    pub async fn run(&self) -> Result<BatchOutcome> {
        let snapshot = self.store.find_ids_by_status(JobStatus::Pending)?;
        if snapshot.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let resources: Vec<String> = snapshot.iter().map(Uuid::to_string).collect();
        self.locks
            .run_exclusive_multi(resources, || async {
                let mut jobs = self.store.find_by_ids(&snapshot)?;
                jobs.retain(|job| job.status == JobStatus::Pending);

                let skipped = snapshot.len() - jobs.len();
                if skipped > 0 {
                    tracing::debug!(skipped, "Jobs left pending state before the batch locked them");
                }
                if jobs.is_empty() {
                    return Ok(BatchOutcome::default());
                }

                for job in &mut jobs {
                    job.complete()?;
                }
                self.store.save_all(&jobs)?;

                let ids: Vec<Uuid> = jobs.iter().map(|job| job.id).collect();
                Ok::<_, JobError>(BatchOutcome {
                    count: ids.len(),
                    ids,
                })
            })
            .await
    }
}
