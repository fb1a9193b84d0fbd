//! Named shared memory segments
//!
//! A segment is a file in `/dev/shm` (Linux) or the temp directory, mapped
//! shared into every attached process. The file path is derived from the
//! cache name, so unrelated processes agree on the same segment without
//! talking to each other.

use crate::arena::Arena;
use anyhow::{bail, Context, Result};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::debug;

/// Shared memory segment that can be accessed by multiple processes
pub struct SharedMemory {
    mmap: MmapMut,
    base: NonNull<u8>,
    size: usize,
    path: PathBuf,
}

impl SharedMemory {
    /// Directory that holds segments when no override is configured
    pub fn default_dir() -> PathBuf {
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/dev/shm")
        }

        #[cfg(not(target_os = "linux"))]
        {
            std::env::temp_dir()
        }
    }

    /// Path of the segment backing `name`
    pub fn segment_path(name: &str, dir: Option<&Path>) -> PathBuf {
        let dir = dir.map(Path::to_path_buf).unwrap_or_else(Self::default_dir);
        dir.join(format!("shmcache_{}", name))
    }

    /// Create a fresh segment, replacing any existing one with the same name
    ///
    /// The old file is unlinked rather than truncated, so processes that still
    /// map the previous segment keep a consistent (if orphaned) view of it.
    pub fn create(name: &str, size: usize, dir: Option<&Path>) -> Result<Self> {
        if size == 0 {
            bail!("Shared memory size cannot be 0");
        }

        let path = Self::segment_path(name, dir);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed previous segment"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to remove stale segment {}", path.display())
                })
            }
        }

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to create shared memory {}", path.display()))?;

        file.set_len(size as u64)
            .context("Failed to set shared memory size")?;

        let mut mmap =
            unsafe { MmapMut::map_mut(&file) }.context("Failed to mmap shared memory")?;
        let base = NonNull::new(mmap.as_mut_ptr()).context("Shared memory mapped at null")?;

        Ok(Self {
            mmap,
            base,
            size,
            path,
        })
    }

    /// Open an existing shared memory segment
    pub fn open(name: &str, dir: Option<&Path>) -> Result<Self> {
        let path = Self::segment_path(name, dir);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open shared memory {}", path.display()))?;

        let mut mmap =
            unsafe { MmapMut::map_mut(&file) }.context("Failed to mmap shared memory")?;
        let size = mmap.len();
        if size == 0 {
            bail!("Shared memory {} is empty", path.display());
        }
        let base = NonNull::new(mmap.as_mut_ptr()).context("Shared memory mapped at null")?;

        Ok(Self {
            mmap,
            base,
            size,
            path,
        })
    }

    /// Process-local view of the whole mapping
    pub fn arena(&self) -> Arena {
        // The mapping is page aligned and lives as long as `self`
        unsafe { Arena::from_raw(self.base, self.size) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the backing file
    ///
    /// Existing mappings stay valid; the memory is released once the last
    /// process unmaps it.
    pub fn unlink(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to unlink shared memory {}", self.path.display())),
        }
    }

    /// Flush the mapping; only meaningful for file-backed directories
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush().context("Failed to flush shared memory")
    }
}

// The raw base pointer mirrors `mmap`, which is itself Send + Sync
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}
