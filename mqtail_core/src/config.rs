//! mqtail daemon configuration
//!
//! Typed configuration for `mqtail.yaml` files. Every key has a default,
//! so a missing or empty file yields a runnable (if small) configuration.
//!
//! # Example mqtail.yaml
//!
//! ```yaml
//! nworkers: 4
//! max_records: 8192
//! chunk_size: 256
//! max_reclen: 4096
//! qlen_goal: 1024
//! thread_restarts: 1
//! output_file: /var/log/mqtail/records.out
//! partitions: 8
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MqtailError, MqtailResult};
use crate::pool::PoolConfig;

/// mqtail configuration from mqtail.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Number of worker threads sending to the backend
    pub nworkers: usize,

    /// Number of pre-allocated record entries (open + queued, combined)
    pub max_records: usize,

    /// Size in bytes of one payload chunk
    pub chunk_size: usize,

    /// Maximum assembled record length in bytes
    pub max_reclen: usize,

    /// Maximum shard/routing key length in bytes
    pub max_keylen: usize,

    /// Target queue length per active worker, used by the wake heuristic
    pub qlen_goal: usize,

    /// How many times a single worker slot may be restarted before it
    /// is abandoned
    pub thread_restarts: u32,

    /// Pause before respawning an exited worker, in milliseconds
    pub restart_pause_ms: u64,

    /// Interval for the stats monitor thread, in milliseconds (0 disables)
    pub monitor_interval_ms: u64,

    /// How long the reader may wait for a free entry before dropping the
    /// record, in milliseconds (0 drops immediately)
    pub pool_wait_ms: u64,

    /// Output path for the file backend
    pub output_file: PathBuf,

    /// Partition count for keyed records (0 disables partitioning)
    pub partitions: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            nworkers: 1,
            max_records: 4096,
            chunk_size: 256,
            max_reclen: 4096,
            max_keylen: 128,
            qlen_goal: 1024,
            thread_restarts: 1,
            restart_pause_ms: 1000,
            monitor_interval_ms: 30_000,
            pool_wait_ms: 0,
            output_file: PathBuf::from("mqtail.out"),
            partitions: 0,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML string
    pub fn from_yaml(content: &str) -> MqtailResult<Self> {
        let config: RelayConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> MqtailResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Check that the configuration describes a runnable pipeline
    pub fn validate(&self) -> MqtailResult<()> {
        if self.nworkers == 0 {
            return Err(MqtailError::config("nworkers must be at least 1"));
        }
        if self.max_records == 0 {
            return Err(MqtailError::config("max_records must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(MqtailError::config("chunk_size must be at least 1"));
        }
        if self.max_reclen == 0 {
            return Err(MqtailError::config("max_reclen must be at least 1"));
        }
        if self.qlen_goal == 0 {
            return Err(MqtailError::config("qlen_goal must be at least 1"));
        }
        Ok(())
    }

    /// Log the effective configuration at startup
    pub fn dump(&self) {
        log::info!("config: nworkers = {}", self.nworkers);
        log::info!("config: max_records = {}", self.max_records);
        log::info!("config: chunk_size = {}", self.chunk_size);
        log::info!("config: max_reclen = {}", self.max_reclen);
        log::info!("config: max_keylen = {}", self.max_keylen);
        log::info!("config: qlen_goal = {}", self.qlen_goal);
        log::info!("config: thread_restarts = {}", self.thread_restarts);
        log::info!("config: restart_pause_ms = {}", self.restart_pause_ms);
        log::info!("config: monitor_interval_ms = {}", self.monitor_interval_ms);
        log::info!("config: pool_wait_ms = {}", self.pool_wait_ms);
        log::info!("config: output_file = {}", self.output_file.display());
        log::info!("config: partitions = {}", self.partitions);
    }

    /// Pool sizing derived from this configuration
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_records: self.max_records,
            chunk_size: self.chunk_size,
            max_reclen: self.max_reclen,
            max_keylen: self.max_keylen,
        }
    }

    /// Restart pause as a `Duration`
    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }

    /// Reader pool wait as a `Duration`
    pub fn pool_wait(&self) -> Duration {
        Duration::from_millis(self.pool_wait_ms)
    }

    /// Monitor interval as a `Duration`
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}
