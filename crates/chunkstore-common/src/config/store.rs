//! Store configuration structures.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_ARENA_SIZE, DEFAULT_LID_LEVELS, DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_MAX_BLOCK_SIZE,
    DEFAULT_RECYCLER_CAPACITY, MAX_ARENA_SIZE, MAX_BLOCK_SIZE_LIMIT, MIN_ARENA_SIZE,
    SUPPORTED_LID_LEVELS,
};
use crate::error::{StoreError, StoreResult};
use crate::sync::{Backoff, LockTimeout};
use crate::types::NodeId;

/// Configuration of a record store.
///
/// # Example
///
/// ```rust
/// use chunkstore_common::config::StoreConfig;
///
/// let config = StoreConfig::default().with_arena_size(8 * 1024 * 1024);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Node that owns locally created records.
    #[serde(default = "default_owner")]
    pub owner: NodeId,

    /// Size of the arena in bytes.
    #[serde(default = "default_arena_size")]
    pub arena_size: u64,

    /// Largest single allocation in bytes.
    #[serde(default = "default_max_block_size")]
    pub max_block_size: u64,

    /// Translation levels below the owner table.
    #[serde(default = "default_lid_levels")]
    pub lid_levels: u32,

    /// Capacity of the id recycler ring.
    #[serde(default = "default_recycler_capacity")]
    pub recycler_capacity: usize,

    /// Default lock timeout in milliseconds (0 = single attempt).
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Allow unlocked reads that trade atomicity for throughput.
    #[serde(default)]
    pub allow_weak_reads: bool,

    /// Cache leaf table addresses per thread.
    #[serde(default = "default_leaf_cache")]
    pub leaf_cache: bool,

    /// Directory for arena dumps written on fatal errors.
    #[serde(default)]
    pub dump_dir: Option<PathBuf>,

    /// Pause strategy for lock spin loops.
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_owner() -> NodeId {
    NodeId::new(1)
}

fn default_arena_size() -> u64 {
    DEFAULT_ARENA_SIZE
}

fn default_max_block_size() -> u64 {
    DEFAULT_MAX_BLOCK_SIZE
}

fn default_lid_levels() -> u32 {
    DEFAULT_LID_LEVELS
}

fn default_recycler_capacity() -> usize {
    DEFAULT_RECYCLER_CAPACITY
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

fn default_leaf_cache() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            arena_size: default_arena_size(),
            max_block_size: default_max_block_size(),
            lid_levels: default_lid_levels(),
            recycler_capacity: default_recycler_capacity(),
            lock_timeout_ms: default_lock_timeout_ms(),
            backoff: Backoff::default(),
            allow_weak_reads: false,
            leaf_cache: default_leaf_cache(),
            dump_dir: None,
        }
    }
}

impl StoreConfig {
    /// Creates a new default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a small configuration for testing (4 MB arena).
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            arena_size: 4 * 1024 * 1024,
            max_block_size: 256 * 1024,
            recycler_capacity: 1024,
            lock_timeout_ms: 200,
            ..Default::default()
        }
    }

    /// Sets the owner node.
    #[must_use]
    pub fn with_owner(mut self, owner: NodeId) -> Self {
        self.owner = owner;
        self
    }

    /// Sets the arena size.
    #[must_use]
    pub fn with_arena_size(mut self, arena_size: u64) -> Self {
        self.arena_size = arena_size;
        self
    }

    /// Sets the maximum block size.
    #[must_use]
    pub fn with_max_block_size(mut self, max_block_size: u64) -> Self {
        self.max_block_size = max_block_size;
        self
    }

    /// Sets the number of local-id levels.
    #[must_use]
    pub fn with_lid_levels(mut self, lid_levels: u32) -> Self {
        self.lid_levels = lid_levels;
        self
    }

    /// Sets the recycler capacity.
    #[must_use]
    pub fn with_recycler_capacity(mut self, capacity: usize) -> Self {
        self.recycler_capacity = capacity;
        self
    }

    /// Sets the default lock timeout.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enables or disables weak (unlocked) reads.
    #[must_use]
    pub fn with_weak_reads(mut self, enabled: bool) -> Self {
        self.allow_weak_reads = enabled;
        self
    }

    /// Enables or disables the per-thread leaf cache.
    #[must_use]
    pub fn with_leaf_cache(mut self, enabled: bool) -> Self {
        self.leaf_cache = enabled;
        self
    }

    /// Sets the directory for fatal-error dumps.
    #[must_use]
    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dir.into());
        self
    }

    /// Returns the default lock timeout.
    #[must_use]
    pub fn lock_timeout(&self) -> LockTimeout {
        if self.lock_timeout_ms == 0 {
            LockTimeout::TryOnce
        } else {
            LockTimeout::from_millis(self.lock_timeout_ms)
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> StoreResult<()> {
        if self.arena_size < MIN_ARENA_SIZE {
            return Err(StoreError::config(format!(
                "arena_size must be at least {MIN_ARENA_SIZE} bytes"
            )));
        }
        if self.arena_size >= MAX_ARENA_SIZE {
            return Err(StoreError::config(format!(
                "arena_size must be below {MAX_ARENA_SIZE} bytes"
            )));
        }
        if self.max_block_size == 0 || self.max_block_size > MAX_BLOCK_SIZE_LIMIT {
            return Err(StoreError::config(format!(
                "max_block_size must be in [1, {MAX_BLOCK_SIZE_LIMIT}]"
            )));
        }
        if self.max_block_size >= self.arena_size {
            return Err(StoreError::config(
                "max_block_size must be smaller than arena_size",
            ));
        }
        if !SUPPORTED_LID_LEVELS.contains(&self.lid_levels) {
            return Err(StoreError::config(format!(
                "lid_levels must be one of {SUPPORTED_LID_LEVELS:?}"
            )));
        }
        if self.recycler_capacity == 0 {
            return Err(StoreError::config("recycler_capacity must be > 0"));
        }
        Ok(())
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> StoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| StoreError::config(e.to_string()))
    }

    /// Saves configuration to a TOML file.
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let content = self.to_toml()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Converts configuration to a TOML string.
    pub fn to_toml(&self) -> StoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| StoreError::config(e.to_string()))
    }
}
