use std::time::Duration;

use serde::Deserialize;

use crate::{envy_load, load_config};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompactionConfig {
    /// A closed partition is rewritten once this fraction of its bytes
    /// belongs to deleted entries.
    #[serde(default = "CompactionConfig::default_deleted_ratio")]
    pub deleted_ratio: f64,
    /// Period between scans for compactable partitions.
    #[serde(default = "CompactionConfig::default_check_period_ms")]
    pub check_period_ms: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            deleted_ratio: Self::default_deleted_ratio(),
            check_period_ms: Self::default_check_period_ms(),
        }
    }
}

impl CompactionConfig {
    fn default_deleted_ratio() -> f64 {
        0.5
    }

    const fn default_check_period_ms() -> u64 {
        60_000
    }

    pub fn from_env() -> Self {
        envy_load("blob_compaction", "BLOBNEST_COMPACTION_")
    }

    pub fn check_period(&self) -> Duration {
        Duration::from_millis(self.check_period_ms)
    }
}

pub fn load_compaction_config() -> Result<CompactionConfig, config::ConfigError> {
    load_config("configuration/compaction", "BLOBNEST_COMPACTION")
}
