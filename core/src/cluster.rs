//! Capabilities provided by the cluster membership collaborator.
//!
//! Membership, view change and the actual wire transport live outside this
//! crate; the engine consumes them through these traits and tests
//! substitute fakes honoring the same contracts.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use blob_types::{DifferenceInfo, DiskId, MerkleTreeInfo, NodeId, OffsetRange, PartitionId, ReplicationFile};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The peer did not answer within the transport deadline; the caller
    /// skips the peer for this cycle.
    #[error("peer {0} unavailable: {1}")]
    PeerUnavailable(NodeId, String),
    #[error("rpc to peer {0} timed out after {1:?}")]
    Timeout(NodeId, Duration),
    #[error("transport failure: {0}")]
    Transport(#[from] anyhow::Error),
}

/// Cluster view as the membership collaborator sees it right now.
pub trait ClusterMembership: fmt::Debug + Send + Sync {
    fn self_node(&self) -> NodeId;

    /// Current master, if the view has one.
    fn master(&self) -> Option<NodeId>;

    /// Every node of the current view, including `self` and the master.
    fn peers(&self) -> Vec<NodeId>;

    fn is_master(&self) -> bool {
        self.master() == Some(self.self_node())
    }
}

/// Point-to-point RPCs to one peer. Reliable per message, but message order
/// across calls is not preserved.
#[async_trait]
pub trait ClusterTransport: fmt::Debug + Send + Sync {
    /// One-way replication push.
    async fn send_replication(
        &self,
        peer: NodeId,
        file: ReplicationFile,
    ) -> Result<(), ClusterError>;

    async fn get_merkle_tree_info(
        &self,
        peer: NodeId,
        disk: DiskId,
        partition: PartitionId,
    ) -> Result<MerkleTreeInfo, ClusterError>;

    async fn get_difference(
        &self,
        peer: NodeId,
        disk: DiskId,
        partition: PartitionId,
    ) -> Result<DifferenceInfo, ClusterError>;

    /// Bulk payload pull used by repair.
    async fn fetch_range(
        &self,
        peer: NodeId,
        disk: DiskId,
        partition: PartitionId,
        ranges: &[OffsetRange],
    ) -> Result<Vec<ReplicationFile>, ClusterError>;
}
