use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::store::backend::{Backend, JsonFileBackend, MemoryBackend, StoreError};
use crate::store::file_lock::DataFileLock;

/// Timing knobs for the resource lock table.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How often a waiting caller re-checks a held lock.
    pub poll_interval: Duration,
    /// Age after which a held lock is considered abandoned and may be taken over.
    pub expiry: Duration,
    /// Wait bound used by `run_exclusive` / `run_exclusive_multi`.
    pub default_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            expiry: Duration::from_secs(30),
            default_timeout: Duration::from_secs(10),
        }
    }
}

impl LockConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Periodic batch-completion settings.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    /// Each sweep result is appended here as a timestamped line, if set.
    pub log_path: Option<PathBuf>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            log_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    /// JSON data file. `None` keeps everything in memory.
    pub data_path: Option<PathBuf>,
    pub lock: LockConfig,
    pub sweep: SweepConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            data_path: None,
            lock: LockConfig::default(),
            sweep: SweepConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep.interval = interval;
        self
    }

    pub fn with_sweep_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.sweep.log_path = Some(path.into());
        self
    }

    /// Open the persistence backend selected by `data_path`.
    pub fn open_backend(&self) -> Result<Arc<dyn Backend>, StoreError> {
        match &self.data_path {
            Some(path) => Ok(Arc::new(JsonFileBackend::open(path)?)),
            None => Ok(Arc::new(MemoryBackend::new())),
        }
    }

    /// Take the single-writer lock on the data file, if there is one.
    /// Hold the returned guard for as long as the backend is in use.
    pub fn lock_data_file(&self) -> Result<Option<DataFileLock>, StoreError> {
        self.data_path
            .as_deref()
            .map(DataFileLock::acquire)
            .transpose()
    }
}
