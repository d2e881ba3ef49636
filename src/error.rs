use thiserror::Error;

use crate::job::record::{Field, TransitionError};
use crate::store::backend::StoreError;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Resource {resource} is locked, please retry later")]
    LockTimeout { resource: String },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job already exists: {0}")]
    AlreadyExists(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Job {0} must not be empty")]
    EmptyField(Field),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl JobError {
    /// Stable machine-readable code reported to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::LockTimeout { .. } => "9399",
            JobError::NotFound(_) => "2001",
            JobError::AlreadyExists(_) => "2006",
            JobError::EmptyField(Field::Title) => "2007",
            JobError::EmptyField(Field::Description) => "2008",
            JobError::InvalidTransition(t) => t.code(),
            JobError::Store(_) => "9901",
        }
    }

    /// Only a lock timeout guarantees that nothing was mutated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::LockTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
