//! Configuration for StageKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, StageError};
use crate::protocol::{REPLY_HEADER_SIZE, REQUEST_HEADER_SIZE};

/// Main configuration for a StageKV instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── staging.log      (durability ring log)
    ///     └── store.dat        (log store data file, when used)
    pub data_dir: PathBuf,

    // -------------------------------------------------------------------------
    // Staging Region Configuration
    // -------------------------------------------------------------------------
    /// Size of one chunk; bounds a connection's batch before a forced flush
    pub chunk_size: usize,

    /// Number of chunk slots; bounds concurrently writing connections
    pub chunk_count: usize,

    /// Size of each per-connection request/reply buffer
    pub message_size: usize,

    // -------------------------------------------------------------------------
    // Flush Pipeline Configuration
    // -------------------------------------------------------------------------
    /// Max in-flight durable log writes
    pub io_queue_depth: usize,

    /// Pre-allocated ring log size in bytes
    pub log_capacity: u64,

    /// Force a data sync after every log write
    pub sync_on_write: bool,

    /// Emit an occupancy report every N flush completions (0 = never)
    pub usage_report_interval: u64,

    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// TCP listen address
    pub listen_addr: String,

    /// Max concurrent client connections
    pub max_connections: usize,

    /// How long a clerk waits for the next request (0 = forever)
    pub request_timeout_ms: u64,

    /// How long a client waits for a reply (0 = forever)
    pub reply_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./stagekv_data"),
            chunk_size: 32 * 1024,
            chunk_count: 256, // 8 MiB region
            message_size: 4096,
            io_queue_depth: 64,
            log_capacity: 4 * 1024 * 1024 * 1024, // 4 GiB, sparse
            sync_on_write: false,
            usage_report_interval: 1000,
            listen_addr: "127.0.0.1:9876".to_string(),
            max_connections: 1024,
            request_timeout_ms: 0,
            reply_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Total size of the staging region
    pub fn region_size(&self) -> usize {
        self.chunk_size * self.chunk_count
    }

    /// Clerk-side request wait bound
    pub fn request_timeout(&self) -> Option<Duration> {
        millis(self.request_timeout_ms)
    }

    /// Client-side reply wait bound
    pub fn reply_timeout(&self) -> Option<Duration> {
        millis(self.reply_timeout_ms)
    }

    /// Check that the settings are consistent with each other
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size <= REQUEST_HEADER_SIZE {
            return Err(StageError::Config(format!(
                "chunk_size {} must exceed the {} byte record header",
                self.chunk_size, REQUEST_HEADER_SIZE
            )));
        }
        if self.chunk_size > u32::MAX as usize {
            return Err(StageError::Config(format!(
                "chunk_size {} does not fit in 32 bits",
                self.chunk_size
            )));
        }
        if self.chunk_count == 0 {
            return Err(StageError::Config("chunk_count must be positive".to_string()));
        }
        if self.message_size < REQUEST_HEADER_SIZE.max(REPLY_HEADER_SIZE) + 8 {
            return Err(StageError::Config(format!(
                "message_size {} is too small",
                self.message_size
            )));
        }
        if self.io_queue_depth == 0 {
            return Err(StageError::Config("io_queue_depth must be positive".to_string()));
        }
        if self.log_capacity < self.chunk_size as u64 {
            return Err(StageError::Config(format!(
                "log_capacity {} is smaller than one chunk ({})",
                self.log_capacity, self.chunk_size
            )));
        }
        Ok(())
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the chunk size (in bytes)
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the number of chunk slots
    pub fn chunk_count(mut self, count: usize) -> Self {
        self.config.chunk_count = count;
        self
    }

    /// Set the per-connection message buffer size (in bytes)
    pub fn message_size(mut self, size: usize) -> Self {
        self.config.message_size = size;
        self
    }

    /// Set the max number of in-flight log writes
    pub fn io_queue_depth(mut self, depth: usize) -> Self {
        self.config.io_queue_depth = depth;
        self
    }

    /// Set the ring log capacity (in bytes)
    pub fn log_capacity(mut self, bytes: u64) -> Self {
        self.config.log_capacity = bytes;
        self
    }

    /// Sync the log after every write
    pub fn sync_on_write(mut self, sync: bool) -> Self {
        self.config.sync_on_write = sync;
        self
    }

    /// Set how many completions pass between usage reports
    pub fn usage_report_interval(mut self, every: u64) -> Self {
        self.config.usage_report_interval = every;
        self
    }

    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the clerk request wait bound (in milliseconds, 0 = forever)
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    /// Set the client reply wait bound (in milliseconds, 0 = forever)
    pub fn reply_timeout_ms(mut self, ms: u64) -> Self {
        self.config.reply_timeout_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
