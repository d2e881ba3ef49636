//! Persistent job storage.
//!
//! - [`RecordStore`]: id → record map plus the status index partitioning it
//! - [`backend`]: the path-addressed JSON document it is persisted in
//!   ([`MemoryBackend`](backend::MemoryBackend) or
//!   [`JsonFileBackend`](backend::JsonFileBackend))
//! - [`DataFileLock`]: keeps a second process from writing the same data file

pub mod backend;
pub mod file_lock;
pub mod record_store;

pub use backend::{Backend, JsonFileBackend, MemoryBackend, StoreError, WriteOp};
pub use file_lock::{lock_path, DataFileLock};
pub use record_store::{IndexRepair, Page, PageMetadata, RecordStore, SearchQuery, MAX_PAGE_SIZE};
