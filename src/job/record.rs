use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{JobError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[serde(alias = "PENDING")]
    Pending,
    #[serde(alias = "COMPLETED")]
    Completed,
    #[serde(alias = "CANCELED")]
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 3] = [JobStatus::Pending, JobStatus::Completed, JobStatus::Canceled];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Completed => "completed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "completed" => Ok(JobStatus::Completed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Rejected lifecycle transitions. Each variant is reported as its own kind.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Job is already completed")]
    AlreadyCompleted,

    #[error("Job is already canceled")]
    AlreadyCanceled,

    #[error("A canceled job cannot be completed")]
    CannotCompleteCanceled,

    #[error("A completed job cannot be canceled")]
    CannotCancelCompleted,

    #[error("A completed job cannot be reopened")]
    CannotReopenCompleted,

    #[error("A pending job cannot be reopened")]
    CannotReopenPending,
}

impl TransitionError {
    pub fn code(&self) -> &'static str {
        match self {
            TransitionError::CannotReopenCompleted => "2010",
            TransitionError::CannotCancelCompleted => "2011",
            TransitionError::CannotCompleteCanceled => "2012",
            TransitionError::CannotReopenPending => "2014",
            TransitionError::AlreadyCompleted => "2015",
            TransitionError::AlreadyCanceled => "2016",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Title,
    Description,
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Field::Title => write!(f, "title"),
            Field::Description => write!(f, "description"),
        }
    }
}

/// A unit of work tracked through the pending/completed/canceled lifecycle.
///
/// Records are plain values: the store hands out copies, and every mutation
/// goes back through [`RecordStore::update`](crate::store::RecordStore::update).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a new pending job with a fresh id.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Result<Self> {
        let title = non_blank(Field::Title, title.into())?;
        let description = non_blank(Field::Description, description.into())?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            title,
            description,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn complete(&mut self) -> Result<()> {
        match self.status {
            JobStatus::Pending => self.transition(JobStatus::Completed),
            JobStatus::Completed => Err(TransitionError::AlreadyCompleted.into()),
            JobStatus::Canceled => Err(TransitionError::CannotCompleteCanceled.into()),
        }
    }

    pub fn cancel(&mut self) -> Result<()> {
        match self.status {
            JobStatus::Pending => self.transition(JobStatus::Canceled),
            JobStatus::Completed => Err(TransitionError::CannotCancelCompleted.into()),
            JobStatus::Canceled => Err(TransitionError::AlreadyCanceled.into()),
        }
    }

    pub fn reopen(&mut self) -> Result<()> {
        match self.status {
            JobStatus::Canceled => self.transition(JobStatus::Pending),
            JobStatus::Pending => Err(TransitionError::CannotReopenPending.into()),
            JobStatus::Completed => Err(TransitionError::CannotReopenCompleted.into()),
        }
    }

    /// Allowed in every status.
    pub fn update_title(&mut self, title: impl Into<String>) -> Result<()> {
        self.title = non_blank(Field::Title, title.into())?;
        self.touch();
        Ok(())
    }

    /// Allowed in every status.
    pub fn update_description(&mut self, description: impl Into<String>) -> Result<()> {
        self.description = non_blank(Field::Description, description.into())?;
        self.touch();
        Ok(())
    }

    fn transition(&mut self, to: JobStatus) -> Result<()> {
        self.status = to;
        self.touch();
        Ok(())
    }

    // updated_at must strictly advance even if the clock has not ticked.
    fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::microseconds(1)
        };
    }
}

fn non_blank(field: Field, value: String) -> Result<String> {
    if value.trim().is_empty() {
        return Err(JobError::EmptyField(field));
    }
    Ok(value)
}
