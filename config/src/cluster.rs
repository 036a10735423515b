use std::time::Duration;

use serde::Deserialize;

use crate::{envy_load, load_config};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClusterConfig {
    /// Whether this node accepts client writes and fans them out.
    #[serde(default)]
    pub is_master: bool,
    /// Bound of the inbound replication queue.
    #[serde(default = "ClusterConfig::default_replication_queue_capacity")]
    pub replication_queue_capacity: usize,
    /// Deadline for synchronous peer RPCs; a timeout is treated as
    /// "peer unavailable".
    #[serde(default = "ClusterConfig::default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            is_master: false,
            replication_queue_capacity: Self::default_replication_queue_capacity(),
            rpc_timeout_ms: Self::default_rpc_timeout_ms(),
        }
    }
}

impl ClusterConfig {
    const fn default_replication_queue_capacity() -> usize {
        1_024
    }

    const fn default_rpc_timeout_ms() -> u64 {
        5_000
    }

    pub fn from_env() -> Self {
        envy_load("blob_cluster", "BLOBNEST_CLUSTER_")
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

pub fn load_cluster_config() -> Result<ClusterConfig, config::ConfigError> {
    load_config("configuration/cluster", "BLOBNEST_CLUSTER")
}
