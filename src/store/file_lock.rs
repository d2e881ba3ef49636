//! Single-writer guard for a JSON data file.
//!
//! [`JsonFileBackend`](super::JsonFileBackend) keeps the whole document in
//! memory and rewrites the file on every commit, so two processes writing the
//! same file would silently discard each other's changes. Every process that
//! writes a data file takes an exclusive `flock` on a sibling `<file>.lock`
//! first. The kernel drops the lock when the holder exits, even on a crash,
//! so a leftover lock file never blocks a later run.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use super::backend::StoreError;

/// Exclusive hold on a data file. Released when dropped.
#[derive(Debug)]
pub struct DataFileLock {
    // Closing the file releases the flock.
    _file: File,
    path: PathBuf,
}

impl DataFileLock {
    /// Lock the data file at `data_path`, failing with [`StoreError::Locked`]
    /// if another process already holds it.
    pub fn acquire(data_path: &Path) -> Result<Self, StoreError> {
        let path = lock_path(data_path);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if !try_flock_exclusive(&file)? {
            let mut holder = String::new();
            // The pid is informational only.
            let _ = file.read_to_string(&mut holder);
            return Err(StoreError::Locked {
                path,
                holder: holder.trim().parse().ok(),
            });
        }

        file.set_len(0)?;
        file.rewind()?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        tracing::debug!(path = %path.display(), "Acquired data file lock");
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `<data_path>.lock`
pub fn lock_path(data_path: &Path) -> PathBuf {
    let mut path = data_path.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor comes from an open `File` that outlives this
    // call, and `LOCK_EX | LOCK_NB` never blocks.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

// No advisory locking elsewhere; a single writer is assumed.
#[cfg(not(unix))]
fn try_flock_exclusive(_file: &File) -> io::Result<bool> {
    Ok(true)
}
