use blob_basic_types::{DiskId, PartitionId};
use blobd_merkle_tree::{MerkleTree, OffsetRange};
use serde::{Deserialize, Serialize};

/// Wire answer to a tree request: which partition the tree describes plus
/// the serialized tree itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerkleTreeInfo {
    pub disk: DiskId,
    pub partition: PartitionId,
    pub tree: MerkleTree,
}

/// Divergent offset windows of one partition: half-open, sorted,
/// non-overlapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifferenceInfo {
    pub disk: DiskId,
    pub partition: PartitionId,
    pub ranges: Vec<OffsetRange>,
}

impl DifferenceInfo {
    pub fn empty(disk: DiskId, partition: PartitionId) -> Self {
        Self {
            disk,
            partition,
            ranges: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
