use blob_basic_types::{DiskId, PartitionId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionState {
    /// The one partition per disk currently accepting appends.
    Active,
    /// Rotated away from; append-frozen, eligible for repair and compaction.
    Closed,
    /// Being rewritten by the compaction service.
    Compacting,
    /// Superseded by a compacted copy; the file may already be gone.
    Deleted,
}

/// One append-only file on one disk.
///
/// `(disk, id)` is globally unique. `size` counts payload bytes appended so
/// far; `crc` is the running checksum over those bytes in append order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub disk: DiskId,
    pub id: PartitionId,
    pub state: PartitionState,
    pub crc: u64,
    pub size: u64,
}

impl Partition {
    pub fn new(disk: DiskId, id: PartitionId) -> Self {
        Self {
            disk,
            id,
            state: PartitionState::Active,
            crc: 0,
            size: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == PartitionState::Active
    }

    /// File name of the partition inside its disk root.
    pub fn file_name(&self) -> String {
        format!("{}.blob", self.id)
    }
}
