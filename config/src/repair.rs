use std::time::Duration;

use serde::Deserialize;

use crate::{envy_load, load_config};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RepairConfig {
    /// Period between anti-entropy cycles per disk.
    #[serde(default = "RepairConfig::default_repair_period_ms")]
    pub repair_period_ms: u64,
    /// Depth of partition Merkle trees; must match across the cluster.
    #[serde(default = "RepairConfig::default_merkle_max_level")]
    pub merkle_max_level: u32,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            repair_period_ms: Self::default_repair_period_ms(),
            merkle_max_level: Self::default_merkle_max_level(),
        }
    }
}

impl RepairConfig {
    const fn default_repair_period_ms() -> u64 {
        60_000
    }

    const fn default_merkle_max_level() -> u32 {
        15
    }

    pub fn from_env() -> Self {
        envy_load("blob_repair", "BLOBNEST_REPAIR_")
    }

    pub fn repair_period(&self) -> Duration {
        Duration::from_millis(self.repair_period_ms)
    }
}

pub fn load_repair_config() -> Result<RepairConfig, config::ConfigError> {
    load_config("configuration/repair", "BLOBNEST_REPAIR")
}
