use std::time::Duration;

use serde::Deserialize;

use crate::{envy_load, load_config};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StorageConfig {
    /// Directories the node stores partition files under, one per disk.
    #[serde(default = "StorageConfig::default_disk_roots")]
    pub disk_roots: Vec<String>,
    /// Delay before disk writer tasks start consuming their queues,
    /// leaving room for crash replay to finish first.
    #[serde(default = "StorageConfig::default_writer_task_start_delay_ms")]
    pub writer_task_start_delay_ms: u64,
    /// A partition growing past this many bytes is frozen and a new active
    /// partition is opened.
    #[serde(default = "StorageConfig::default_max_partition_size")]
    pub max_partition_size: u64,
    #[serde(default = "StorageConfig::default_writer_pool_size")]
    pub writer_pool_size: usize,
    /// Bound of each per-disk write queue; a full queue blocks the ingest
    /// side.
    #[serde(default = "StorageConfig::default_write_queue_capacity")]
    pub write_queue_capacity: usize,
    #[serde(default = "StorageConfig::default_fsync_on_append")]
    pub fsync_on_append: bool,
    /// How often a parked writer re-checks a non-writable disk.
    #[serde(default = "StorageConfig::default_disk_check_period_ms")]
    pub disk_check_period_ms: u64,
    /// How long shutdown waits for queues to drain before cancelling tasks.
    #[serde(default = "StorageConfig::default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            disk_roots: Self::default_disk_roots(),
            writer_task_start_delay_ms: Self::default_writer_task_start_delay_ms(),
            max_partition_size: Self::default_max_partition_size(),
            writer_pool_size: Self::default_writer_pool_size(),
            write_queue_capacity: Self::default_write_queue_capacity(),
            fsync_on_append: Self::default_fsync_on_append(),
            disk_check_period_ms: Self::default_disk_check_period_ms(),
            shutdown_grace_ms: Self::default_shutdown_grace_ms(),
        }
    }
}

impl StorageConfig {
    fn default_disk_roots() -> Vec<String> {
        vec!["./data/disk0".to_owned()]
    }

    const fn default_writer_task_start_delay_ms() -> u64 {
        1_000
    }

    const fn default_max_partition_size() -> u64 {
        256 * 1_024 * 1_024
    }

    const fn default_writer_pool_size() -> usize {
        16
    }

    const fn default_write_queue_capacity() -> usize {
        1_024
    }

    const fn default_fsync_on_append() -> bool {
        true
    }

    const fn default_disk_check_period_ms() -> u64 {
        5_000
    }

    const fn default_shutdown_grace_ms() -> u64 {
        5_000
    }

    pub fn from_env() -> Self {
        envy_load("blob_storage", "BLOBNEST_STORAGE_")
    }

    pub fn writer_task_start_delay(&self) -> Duration {
        Duration::from_millis(self.writer_task_start_delay_ms)
    }

    pub fn disk_check_period(&self) -> Duration {
        Duration::from_millis(self.disk_check_period_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

pub fn load_storage_config() -> Result<StorageConfig, config::ConfigError> {
    load_config("configuration/storage", "BLOBNEST_STORAGE")
}
