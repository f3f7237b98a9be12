//! Storage configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of storage shards.
pub const DEFAULT_SHARD_COUNT: usize = 3;

/// Default number of logical databases.
pub const DEFAULT_DATABASES: usize = 16;

/// Default timeout for a replicated commit.
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default upper bound on an encoded log entry (8 MB).
pub const DEFAULT_MAX_ENTRY_SIZE: usize = 8 * 1024 * 1024;

/// How a shard commits its write batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Commit straight into the local engine.
    Direct,
    /// Route every batch through the replicated log.
    Replicated,
}

/// Configuration for the sharded storage.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory; shard `n` lives under `<path>/<n>`.
    pub path: PathBuf,

    /// Number of storage shards.
    pub shard_count: usize,

    /// Number of logical databases exposed to clients.
    pub databases: usize,

    /// Page cache capacity in bytes, per shard.
    pub cache_capacity: u64,

    /// Enable zstd compression.
    pub compression: bool,

    /// Temporary database (deleted on drop).
    pub temporary: bool,

    /// Commit strategy chosen for every shard at open time.
    pub write_mode: WriteMode,

    /// How long a replicated commit waits before reporting an ambiguous outcome.
    pub apply_timeout: Duration,

    /// Largest encoded log entry accepted for submission.
    pub max_entry_size: usize,

    /// Record one applied-index sample every `log_index_step` commits.
    pub log_index_step: u64,

    /// Unflushed entries per shard that trigger an inline flush.
    pub memtable_entries_limit: usize,

    /// Interval of the background flusher. None disables it.
    pub flush_interval: Option<Duration>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./kiwidb_data/db"),
            shard_count: DEFAULT_SHARD_COUNT,
            databases: DEFAULT_DATABASES,
            cache_capacity: 256 * 1024 * 1024,
            compression: true,
            temporary: false,
            write_mode: WriteMode::Direct,
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            log_index_step: 1,
            memtable_entries_limit: 64 * 1024,
            flush_interval: Some(Duration::from_secs(1)),
        }
    }
}

impl StorageConfig {
    /// Create a new configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create a temporary configuration for testing.
    pub fn temporary() -> Self {
        Self {
            path: PathBuf::from(""),
            temporary: true,
            flush_interval: None,
            ..Default::default()
        }
    }

    /// Set the shard count.
    pub fn with_shard_count(mut self, count: usize) -> Self {
        self.shard_count = count.max(1);
        self
    }

    /// Set the number of logical databases.
    pub fn with_databases(mut self, databases: usize) -> Self {
        self.databases = databases.max(1);
        self
    }

    /// Set the write mode.
    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    /// Set the replicated commit timeout.
    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    /// Set the maximum encoded entry size.
    pub fn with_max_entry_size(mut self, size: usize) -> Self {
        self.max_entry_size = size;
        self
    }

    /// Set the applied-index sampling stride.
    pub fn with_log_index_step(mut self, step: u64) -> Self {
        self.log_index_step = step.max(1);
        self
    }

    /// Set the background flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    /// Disable background flushing.
    pub fn without_background_flush(mut self) -> Self {
        self.flush_interval = None;
        self
    }

    /// Directory of a single shard.
    pub fn shard_path(&self, shard: usize) -> PathBuf {
        self.path.join(shard.to_string())
    }

    /// Convert to sled configuration for one shard.
    pub(crate) fn to_sled_config(&self, shard_path: &Path) -> sled::Config {
        let config = sled::Config::new()
            .cache_capacity(self.cache_capacity)
            .use_compression(self.compression)
            // Durability points are explicit flushes so the applied-index
            // markers never run ahead of what is on disk.
            .flush_every_ms(None);

        if self.temporary {
            config.temporary(true)
        } else {
            config.path(shard_path)
        }
    }
}
