//! Job lifecycle.
//!
//! - [`record`]: the [`JobRecord`] entity and its state machine
//!   (pending → completed, pending ⇄ canceled)
//! - [`service`]: lock-protected operations over the record store

pub mod record;
pub mod service;

pub use record::{Field, JobRecord, JobStatus, TransitionError};
pub use service::{JobService, JobUpdate, NewJob};
