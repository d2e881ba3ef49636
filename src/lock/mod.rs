//! Resource-scoped mutual exclusion.
//!
//! Every status mutation in the service runs inside a lock on the job id
//! it touches; batch operations take all of their ids at once:
//!
//! - [`LockManager::run_exclusive`]: one resource, scoped to a closure
//! - [`LockManager::run_exclusive_multi`]: all-or-nothing over a set of resources
//! - [`LockGuard`] / [`MultiLockGuard`]: RAII forms of the same
//!
//! Locks are polled, time out, and expire after a fixed window so a holder
//! that hung or crashed cannot block a resource forever.

pub mod manager;

pub use manager::{Lock, LockGuard, LockManager, MultiLockGuard};
