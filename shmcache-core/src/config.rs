//! Cache configuration
//!
//! Only the owner's sizes shape the segment. Attachers read the layout from
//! the segment header and use the rest (name, directory, lock timeout,
//! reclaim batch) locally.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Pool capacity in bytes
pub const DEFAULT_POOL_SIZE: u64 = 1024 * 1024;
/// Hash index slots
pub const SHM_ITEMS: u64 = 1537;
/// Soft admission cap on live entries
pub const MAX_SHM_ITEMS: u64 = 1200;
/// Pending-free queue capacity
pub const MAX_SHM_FREE_ITEMS: u64 = 100;
/// Entries reclaimed per cleanup call
pub const RECLAIM_BATCH: usize = 3;

/// Shared memory cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Segment name; processes using the same name share the cache
    pub name: String,
    /// Directory holding the segment (defaults to /dev/shm on Linux)
    pub segment_dir: Option<PathBuf>,
    /// Pool capacity in bytes
    pub pool_size: u64,
    /// Hash index slots
    pub slots: u64,
    /// Maximum live entries
    pub max_items: u64,
    /// Pending-free queue capacity
    pub max_pending_free: u64,
    /// Entries reclaimed per cleanup call
    pub reclaim_batch: usize,
    /// Longest wait for the segment lock in milliseconds
    pub lock_timeout_ms: u64,
    /// Return pages of freed regions to the kernel
    pub release_pages: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "shmcache".to_string(),
            segment_dir: None,
            pool_size: DEFAULT_POOL_SIZE,
            slots: SHM_ITEMS,
            max_items: MAX_SHM_ITEMS,
            max_pending_free: MAX_SHM_FREE_ITEMS,
            reclaim_batch: RECLAIM_BATCH,
            lock_timeout_ms: 1000,
            release_pages: true,
        }
    }
}

impl CacheConfig {
    /// Default configuration for the segment called `name`
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(anyhow::anyhow!("Cache name cannot be empty"));
        }
        if self.name.contains(|c| c == '/' || c == '\0') {
            return Err(anyhow::anyhow!("Cache name cannot contain '/' or NUL"));
        }
        if self.pool_size == 0 {
            return Err(anyhow::anyhow!("Pool size cannot be 0"));
        }
        if self.slots < 2 {
            return Err(anyhow::anyhow!("Hash index needs at least 2 slots"));
        }
        if self.max_items == 0 {
            return Err(anyhow::anyhow!("Max items cannot be 0"));
        }
        if self.max_items >= self.slots {
            return Err(anyhow::anyhow!(
                "Max items ({}) must be below the slot count ({})",
                self.max_items,
                self.slots
            ));
        }
        if self.max_pending_free == 0 {
            return Err(anyhow::anyhow!("Pending-free queue capacity cannot be 0"));
        }
        if self.reclaim_batch == 0 {
            return Err(anyhow::anyhow!("Reclaim batch cannot be 0"));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CacheConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}
