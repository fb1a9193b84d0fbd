//! Process-shared reader/writer lock
//!
//! The lock is `flock(2)` on a small file next to the segment. The kernel
//! drops it when the holding process exits, so a writer that dies inside a
//! critical section never leaves the arena locked forever. `flock` state
//! belongs to the open file rather than the thread, so callers inside one
//! process are additionally serialised by a mutex.

use parking_lot::{Mutex, MutexGuard};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::fcntl::{flock, FlockArg};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use std::time::Instant;

/// Lock errors
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Timed out after {0:?} waiting for the segment lock")]
    Timeout(Duration),
    #[error("Lock system call failed: {0}")]
    Os(String),
    #[error("No process-shared lock is available on this platform")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Reader/writer lock shared by every process attached to a segment
pub struct SegmentLock {
    file: File,
    path: PathBuf,
    local: Mutex<()>,
    timeout: Duration,
}

impl SegmentLock {
    /// Lock file that belongs to the segment at `segment_path`
    pub fn lock_path(segment_path: &Path) -> PathBuf {
        let mut path = segment_path.as_os_str().to_owned();
        path.push(".lock");
        PathBuf::from(path)
    }

    /// Open (creating if needed) the lock file at `path`
    ///
    /// Fails with [`LockError::Unsupported`] where `flock(2)` does not exist.
    pub fn open(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        if !cfg!(unix) {
            return Err(LockError::Unsupported);
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            local: Mutex::new(()),
            timeout,
        })
    }

    /// Take the lock for reading; other readers may hold it at the same time
    pub fn read(&self) -> Result<LockGuard<'_>, LockError> {
        self.acquire(LockMode::Shared)
    }

    /// Take the lock exclusively
    pub fn write(&self) -> Result<LockGuard<'_>, LockError> {
        self.acquire(LockMode::Exclusive)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Remove the lock file; used when the owner tears the segment down
    pub fn remove_file(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn acquire(&self, mode: LockMode) -> Result<LockGuard<'_>, LockError> {
        let local = self
            .local
            .try_lock_for(self.timeout)
            .ok_or(LockError::Timeout(self.timeout))?;
        self.lock_file(mode)?;
        Ok(LockGuard {
            lock: self,
            mode,
            _local: local,
        })
    }

    #[cfg(unix)]
    fn lock_file(&self, mode: LockMode) -> Result<(), LockError> {
        let arg = match mode {
            LockMode::Shared => FlockArg::LockSharedNonblock,
            LockMode::Exclusive => FlockArg::LockExclusiveNonblock,
        };

        let started = Instant::now();
        let mut backoff = Duration::from_micros(50);
        loop {
            match flock(self.file.as_raw_fd(), arg) {
                Ok(()) => return Ok(()),
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                    if started.elapsed() >= self.timeout {
                        warn!(path = %self.path.display(), ?mode, "segment lock wait timed out");
                        return Err(LockError::Timeout(self.timeout));
                    }
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(5));
                }
                Err(e) => return Err(LockError::Os(e.to_string())),
            }
        }
    }

    #[cfg(not(unix))]
    fn lock_file(&self, _mode: LockMode) -> Result<(), LockError> {
        Err(LockError::Unsupported)
    }

    #[cfg(unix)]
    fn unlock_file(&self) {
        if let Err(e) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            warn!(path = %self.path.display(), error = %e, "failed to release segment lock");
        }
    }

    #[cfg(not(unix))]
    fn unlock_file(&self) {}
}

/// Held lock; released on drop
pub struct LockGuard<'a> {
    lock: &'a SegmentLock,
    mode: LockMode,
    _local: MutexGuard<'a, ()>,
}

impl LockGuard<'_> {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // Runs before `_local` is released
        self.lock.unlock_file();
    }
}


#[cfg(all(test, not(unix)))]
mod unsupported_tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_fails_without_flock() {
        let dir = TempDir::new().unwrap();
        let result = SegmentLock::open(&dir.path().join("segment.lock"), Duration::from_millis(50));
        assert!(matches!(result, Err(LockError::Unsupported)));
    }
}
