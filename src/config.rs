use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

const MIB: usize = 1 << 20;

/// Configuration for the in-memory write buffer.
#[derive(Debug, Clone)]
pub struct MemtableOptions {
    /// Maximum writes before the table locks. The table pre-allocates a
    /// record slot for each write, so a larger bound delays flushes and may
    /// hold onto more stale records. Must be below 2^31.
    pub writes_before_lock: usize,

    /// The table locks for insertion once it holds more than this much live
    /// data. Not a hard limit: concurrent in-progress writes may overflow it.
    pub data_limit: usize,

    /// The table locks for insertion once it holds more than this much data
    /// including stale records. Workloads that update values much more often
    /// than they insert new keys should keep this well above `data_limit`.
    pub total_data_limit: usize,
}

impl Default for MemtableOptions {
    fn default() -> Self {
        Self {
            writes_before_lock: 2000,
            data_limit: 16 * MIB,
            total_data_limit: 160 * MIB,
        }
    }
}

impl MemtableOptions {
    /// Set the write-count lock threshold.
    pub fn writes_before_lock(mut self, count: usize) -> Self {
        self.writes_before_lock = count;
        self
    }

    /// Set the live-data lock threshold.
    pub fn data_limit(mut self, bytes: usize) -> Self {
        self.data_limit = bytes;
        self
    }

    /// Set the total-data lock threshold (live plus stale records).
    pub fn total_data_limit(mut self, bytes: usize) -> Self {
        self.total_data_limit = bytes;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.writes_before_lock == 0 || self.writes_before_lock >= (1 << 31) {
            return errinput!(
                "writes_before_lock must be in 1..2^31, got {}",
                self.writes_before_lock
            );
        }
        Ok(())
    }
}

/// Configuration for sorted table files.
#[derive(Debug, Clone)]
pub struct SstOptions {
    /// Size in bytes of each data block within a table file.
    pub max_block_size: usize,

    /// Directory where `.kvsst` files are created.
    pub base_dir: PathBuf,
}

impl Default for SstOptions {
    fn default() -> Self {
        Self {
            max_block_size: 4 * MIB,
            base_dir: PathBuf::from("."),
        }
    }
}

impl SstOptions {
    /// Set the data block size.
    pub fn max_block_size(mut self, bytes: usize) -> Self {
        self.max_block_size = bytes;
        self
    }

    /// Set the table file directory.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        // Room for one minimal entry plus its index offset and the count word.
        if self.max_block_size < 64 {
            return errinput!("max_block_size must be at least 64, got {}", self.max_block_size);
        }
        Ok(())
    }
}

/// Configuration for the write-ahead log.
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Capacity of the pending-write ring. Bounds how many put operations
    /// can be logged concurrently before producers spin.
    pub concurrent_put_limit: usize,

    /// Directory where `.kvwal` files are created.
    pub base_dir: PathBuf,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            concurrent_put_limit: 256,
            base_dir: PathBuf::from("."),
        }
    }
}

impl WalOptions {
    /// Set the pending-write ring capacity.
    pub fn concurrent_put_limit(mut self, count: usize) -> Self {
        self.concurrent_put_limit = count;
        self
    }

    /// Set the log file directory.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        // One slot is always left empty to distinguish full from empty.
        if self.concurrent_put_limit < 2 {
            return errinput!(
                "concurrent_put_limit must be at least 2, got {}",
                self.concurrent_put_limit
            );
        }
        Ok(())
    }
}

/// Configuration for the store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub memtable: MemtableOptions,
    pub sst: SstOptions,
    pub wal: WalOptions,

    /// How often the background thread wakes to write memtable history to
    /// table files.
    pub background_activity_period: Duration,

    /// The number of frozen memtables held in memory before the background
    /// thread flushes them. Increasing this can improve throughput at the
    /// cost of memory footprint and WAL size. The actual history may exceed
    /// this value, as it is only drained every `background_activity_period`.
    pub memtable_history: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            memtable: MemtableOptions::default(),
            sst: SstOptions::default(),
            wal: WalOptions::default(),
            background_activity_period: Duration::from_millis(50),
            memtable_history: 2,
        }
    }
}

impl StoreOptions {
    /// Create options with both file directories set to `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self::default()
            .sst(SstOptions::default().base_dir(dir.clone()))
            .wal(WalOptions::default().base_dir(dir))
    }

    /// Configure the memtable.
    pub fn memtable(mut self, options: MemtableOptions) -> Self {
        self.memtable = options;
        self
    }

    /// Configure table files.
    pub fn sst(mut self, options: SstOptions) -> Self {
        self.sst = options;
        self
    }

    /// Configure the write-ahead log.
    pub fn wal(mut self, options: WalOptions) -> Self {
        self.wal = options;
        self
    }

    /// Set the background thread wake period.
    pub fn background_activity_period(mut self, period: Duration) -> Self {
        self.background_activity_period = period;
        self
    }

    /// Set the frozen memtable count that triggers a flush.
    pub fn memtable_history(mut self, count: usize) -> Self {
        self.memtable_history = count;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.memtable.validate()?;
        self.sst.validate()?;
        self.wal.validate()?;
        Ok(())
    }
}
