//! Domain types shared by every crate of the blob store: partitions, index
//! entries, queued writes, replication records and the repair wire shapes.

pub use blob_basic_types::{BlobId, BlobKind, DiskId, NodeId, PartitionId};
pub use blobd_merkle_tree::{Block, MerkleTree, OffsetRange};

pub use entry::{IndexEntry, Metadata, TempIndexRecord};
pub use file::{FileSource, ReplicationFile, StorageFile};
pub use partition::{Partition, PartitionState};
pub use repair::{DifferenceInfo, MerkleTreeInfo};

pub mod entry;
pub mod file;
pub mod partition;
pub mod repair;
