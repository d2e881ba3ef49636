pub mod api;
pub mod config;
pub mod error;
pub mod job;
pub mod lock;
pub mod scheduler;
pub mod shutdown;
pub mod store;

pub use error::{JobError, Result};
