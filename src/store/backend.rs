//! Path-addressed JSON document backends.
//!
//! Keys are slash-separated paths (`/jobs/<id>`) into a single nested JSON
//! document. Writes are grouped into a [`WriteOp`] batch and applied by
//! [`Backend::commit`], which is atomic with respect to every other backend
//! call: either the whole batch is visible (and, for the file backend,
//! persisted) or none of it is.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::runtime::RuntimeFlavor;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt entry at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error(
        "{} is in use by another jobwarden process{}; stop the server (or wait for the running command) and retry",
        path.display(),
        holder_suffix(*holder)
    )]
    Locked { path: PathBuf, holder: Option<u32> },
}

fn holder_suffix(holder: Option<u32>) -> String {
    holder.map(|pid| format!(" (pid {pid})")).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set { key: String, value: Value },
    Delete { key: String },
}

impl WriteOp {
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        WriteOp::Set {
            key: key.into(),
            value,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        WriteOp::Delete { key: key.into() }
    }
}

/// Durable key-value storage underneath the record store.
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Read the value at `key`, `None` if any path segment is missing.
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Apply every operation in order, atomically.
    fn commit(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.commit(vec![WriteOp::set(key, value)])
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.commit(vec![WriteOp::delete(key)])
    }
}

fn segments(key: &str) -> impl Iterator<Item = &str> {
    key.split('/').filter(|s| !s.is_empty())
}

/// The nested JSON tree both backends operate on.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    root: Value,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }
}

impl Document {
    pub fn from_value(root: Value) -> Result<Self, StoreError> {
        if !root.is_object() {
            return Err(StoreError::Corrupt {
                key: "/".to_string(),
                reason: "document root is not an object".to_string(),
            });
        }
        Ok(Self { root })
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        segments(key).try_fold(&self.root, |node, segment| node.get(segment))
    }

    pub fn apply(&mut self, op: WriteOp) -> Result<(), StoreError> {
        match op {
            WriteOp::Set { key, value } => self.set(&key, value),
            WriteOp::Delete { key } => {
                self.delete(&key);
                Ok(())
            }
        }
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        let parts: Vec<&str> = segments(key).collect();
        let Some((last, parents)) = parts.split_last() else {
            let replacement = Document::from_value(value)?;
            *self = replacement;
            return Ok(());
        };

        let mut node = &mut self.root;
        for segment in parents {
            let Value::Object(map) = node else {
                return Err(StoreError::Corrupt {
                    key: key.to_string(),
                    reason: format!("parent of '{segment}' is not an object"),
                });
            };
            node = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        match node {
            Value::Object(map) => {
                map.insert(last.to_string(), value);
                Ok(())
            }
            _ => Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: "parent is not an object".to_string(),
            }),
        }
    }

    // Deleting a missing path is a no-op.
    fn delete(&mut self, key: &str) {
        let parts: Vec<&str> = segments(key).collect();
        let Some((last, parents)) = parts.split_last() else {
            *self = Document::default();
            return;
        };

        let parent = parents
            .iter()
            .try_fold(&mut self.root, |node, segment| node.get_mut(*segment));
        if let Some(Value::Object(map)) = parent {
            map.remove(*last);
        }
    }
}

fn locked(doc: &Mutex<Document>) -> MutexGuard<'_, Document> {
    // Commits swap in a fully built document, so a poisoned lock still guards
    // a consistent tree.
    doc.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps the document in process memory only.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    doc: Mutex<Document>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(locked(&self.doc).get(key).cloned())
    }

    fn commit(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut doc = locked(&self.doc);
        let mut next = doc.clone();
        for op in ops {
            next.apply(op)?;
        }
        *doc = next;
        Ok(())
    }
}

/// Keeps the document in a JSON file, rewritten on every commit.
///
/// The file is replaced by writing a sibling temp file and renaming it over
/// the target, so a crash never leaves a half-written document behind.
///
/// Commits do synchronous file I/O while holding the document mutex. On a
/// multi-threaded tokio runtime the write runs under
/// [`tokio::task::block_in_place`], so other tasks move to another worker
/// instead of stalling behind the disk.
///
/// The backend assumes it is the file's only writer. Processes sharing a
/// data file must hold a [`DataFileLock`](super::DataFileLock) on it.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    doc: Mutex<Document>,
}

impl JsonFileBackend {
    /// Load `path`, starting from an empty document if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let doc = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Document::default(),
            Ok(bytes) => Document::from_value(serde_json::from_slice(&bytes)?)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Document::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), "Opened JSON data file");
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, doc: &Document) -> Result<(), StoreError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, serde_json::to_vec_pretty(doc.as_value())?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn run_blocking<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        // block_in_place panics on a current-thread runtime.
        _ => f(),
    }
}

impl Backend for JsonFileBackend {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(locked(&self.doc).get(key).cloned())
    }

    fn commit(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut doc = locked(&self.doc);
        let mut next = doc.clone();
        for op in ops {
            next.apply(op)?;
        }
        // Only publish what made it to disk.
        run_blocking(|| self.persist(&next))?;
        *doc = next;
        Ok(())
    }
}
