use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{JobError, Result};

/// A held lock on one resource.
#[derive(Debug, Clone)]
pub struct Lock {
    pub resource: String,
    pub owner: Uuid,
    pub acquired_at: Instant,
    /// `None` when the expiry window is too large to represent; such a lock
    /// never expires.
    pub expires_at: Option<Instant>,
}

impl Lock {
    fn new(resource: &str, owner: Uuid, expiry: Duration) -> Self {
        let acquired_at = Instant::now();
        Self {
            resource: resource.to_string(),
            owner,
            acquired_at,
            expires_at: acquired_at.checked_add(expiry),
        }
    }

    /// A lock older than the expiry window is treated as abandoned.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }
}

/// Process-local table of resource locks.
///
/// Callers wait by polling every `poll_interval` until the resource is free,
/// its holder's lock has expired, or their timeout runs out. There is no
/// fairness among waiters.
///
/// Locks are normally held through [`LockGuard`] / [`MultiLockGuard`], which
/// release on drop. That covers early returns, errors, panics and cancelled
/// futures alike.
#[derive(Debug, Default)]
pub struct LockManager {
    config: LockConfig,
    locks: Mutex<HashMap<String, Lock>>,
}

impl LockManager {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Lock>> {
        // Every critical section leaves the map consistent.
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_acquire(&self, resource: &str, owner: Uuid) -> bool {
        let now = Instant::now();
        let mut locks = self.table();

        if let Some(existing) = locks.get(resource) {
            if !existing.is_expired(now) {
                return false;
            }
            tracing::warn!(
                resource,
                stale_owner = %existing.owner,
                held_for_ms = now.duration_since(existing.acquired_at).as_millis() as u64,
                "Taking over expired lock"
            );
        }

        locks.insert(resource.to_string(), Lock::new(resource, owner, self.config.expiry));
        true
    }

    async fn acquire_as(&self, resource: &str, owner: Uuid, timeout: Duration) -> Result<()> {
        // A timeout past the clock's range waits with no deadline.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.try_acquire(resource, owner) {
                tracing::debug!(resource, owner = %owner, "Lock acquired");
                return Ok(());
            }

            let mut wait = self.config.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    tracing::warn!(
                        resource,
                        timeout_ms = timeout.as_millis() as u64,
                        "Lock acquisition timed out"
                    );
                    return Err(JobError::LockTimeout {
                        resource: resource.to_string(),
                    });
                }
                wait = wait.min(deadline - now);
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Wait up to `timeout` for `resource` and return the new owner token.
    ///
    /// The caller is responsible for calling [`release`](Self::release);
    /// prefer [`lock`](Self::lock) or [`run_exclusive`](Self::run_exclusive).
    pub async fn acquire(&self, resource: &str, timeout: Duration) -> Result<Uuid> {
        let owner = Uuid::new_v4();
        self.acquire_as(resource, owner, timeout).await?;
        Ok(owner)
    }

    /// Remove the lock on `resource` if `owner` still holds it.
    ///
    /// Returns false when the lock is gone or was taken over after expiring,
    /// so a late holder can never release someone else's lock.
    pub fn release(&self, resource: &str, owner: Uuid) -> bool {
        let mut locks = self.table();
        match locks.get(resource) {
            Some(lock) if lock.owner == owner => {
                locks.remove(resource);
                tracing::debug!(resource, owner = %owner, "Lock released");
                true
            }
            _ => false,
        }
    }

    /// Whether `resource` currently has a live (unexpired) lock.
    pub fn is_locked(&self, resource: &str) -> bool {
        let now = Instant::now();
        self.table()
            .get(resource)
            .is_some_and(|lock| !lock.is_expired(now))
    }

    /// Snapshot of the lock on `resource`, expired or not.
    pub fn holder(&self, resource: &str) -> Option<Lock> {
        self.table().get(resource).cloned()
    }

    /// Acquire `resource` and hold it until the guard is dropped.
    pub async fn lock(&self, resource: &str, timeout: Duration) -> Result<LockGuard<'_>> {
        let owner = self.acquire(resource, timeout).await?;
        Ok(LockGuard {
            manager: self,
            resource: resource.to_string(),
            owner,
        })
    }

    /// Acquire every resource or none of them.
    ///
    /// Resources are deduplicated and taken in sorted order, so two callers
    /// with overlapping sets cannot wait on each other in a cycle. `timeout`
    /// bounds the wait for each individual resource. If any acquisition
    /// fails, the ones already taken are released before returning.
    pub async fn lock_many<I, S>(&self, resources: I, timeout: Duration) -> Result<MultiLockGuard<'_>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered: Vec<String> = resources.into_iter().map(Into::into).collect();
        ordered.sort();
        ordered.dedup();

        let mut guard = MultiLockGuard {
            manager: self,
            owner: Uuid::new_v4(),
            resources: Vec::with_capacity(ordered.len()),
        };
        for resource in ordered {
            // On failure `guard` drops here and releases what it holds.
            self.acquire_as(&resource, guard.owner, timeout).await?;
            guard.resources.push(resource);
        }
        Ok(guard)
    }

    /// Run `operation` while holding `resource`, waiting at most the
    /// configured default timeout.
    pub async fn run_exclusive<T, E, F, Fut>(&self, resource: &str, operation: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<JobError>,
    {
        self.run_exclusive_with_timeout(resource, self.config.default_timeout, operation)
            .await
    }

    /// Run `operation` while holding `resource`. The lock is released however
    /// the operation ends; its error is returned unchanged.
    pub async fn run_exclusive_with_timeout<T, E, F, Fut>(
        &self,
        resource: &str,
        timeout: Duration,
        operation: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<JobError>,
    {
        let _guard = self.lock(resource, timeout).await?;
        operation().await
    }

    /// Run `operation` once while holding every resource in `resources`,
    /// waiting at most the configured default timeout per resource.
    pub async fn run_exclusive_multi<I, S, T, E, F, Fut>(
        &self,
        resources: I,
        operation: F,
    ) -> std::result::Result<T, E>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<JobError>,
    {
        self.run_exclusive_multi_with_timeout(resources, self.config.default_timeout, operation)
            .await
    }

    /// All-or-nothing variant of [`run_exclusive_with_timeout`](Self::run_exclusive_with_timeout).
    /// The operation never runs unless every lock was acquired.
    pub async fn run_exclusive_multi_with_timeout<I, S, T, E, F, Fut>(
        &self,
        resources: I,
        timeout: Duration,
        operation: F,
    ) -> std::result::Result<T, E>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<JobError>,
    {
        let _guard = self.lock_many(resources, timeout).await?;
        operation().await
    }
}

/// Holds one resource lock; releases it on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    resource: String,
    owner: Uuid,
}

impl LockGuard<'_> {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.manager.release(&self.resource, self.owner) {
            tracing::warn!(
                resource = %self.resource,
                owner = %self.owner,
                "Lock was no longer held at release, it expired and was taken over"
            );
        }
    }
}

/// Holds a set of resource locks under one owner token; releases all on drop.
#[derive(Debug)]
pub struct MultiLockGuard<'a> {
    manager: &'a LockManager,
    owner: Uuid,
    resources: Vec<String>,
}

impl MultiLockGuard<'_> {
    /// Held resources, in acquisition order.
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }
}

impl Drop for MultiLockGuard<'_> {
    fn drop(&mut self) {
        for resource in self.resources.iter().rev() {
            if !self.manager.release(resource, self.owner) {
                tracing::warn!(
                    resource = %resource,
                    owner = %self.owner,
                    "Lock was no longer held at release, it expired and was taken over"
                );
            }
        }
    }
}
