use std::collections::HashMap;
use std::path::PathBuf;

use blob_basic_types::{BlobId, BlobKind, DiskId, PartitionId};
use blobd_merkle_tree::Block;
use serde::{Deserialize, Serialize};

/// String multimap carried next to every blob (content type, original file
/// name, cache headers and the like).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(HashMap<String, Vec<String>>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    pub fn get(&self, key: &str) -> &[String] {
        self.0.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Durable record locating one blob variant inside a partition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: BlobId,
    pub kind: BlobKind,
    pub disk: DiskId,
    pub partition: PartitionId,
    pub offset: u64,
    pub length: u64,
    pub crc: u64,
    pub metadata: Metadata,
    pub deleted: bool,
    pub created_at: u64,
}

impl IndexEntry {
    /// Canonical 28-byte descriptor fed into Merkle leaf hashes.
    pub fn to_block(&self) -> Block {
        Block {
            id: self.id,
            kind: self.kind,
            crc: self.crc,
            length: self.length,
        }
    }

    /// End offset (exclusive) of the payload inside the partition file.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.length
    }
}

/// Row of the temp-index table recording an in-flight write, consulted on
/// restart to recover from a crash between index add and payload append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempIndexRecord {
    pub id: BlobId,
    pub kind: BlobKind,
    /// Spool file holding the payload, when the write came from disk.
    /// In-memory payloads cannot be replayed and are purged instead.
    pub file_path: Option<PathBuf>,
    pub metadata: Metadata,
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_keeps_every_value_per_key() {
        let mut metadata = Metadata::new();
        metadata.insert("content-type", "image/png");
        metadata.insert("content-type", "image/webp");
        assert_eq!(metadata.get("content-type").len(), 2);
        assert!(metadata.get("missing").is_empty());
    }

    #[test]
    fn entry_block_mirrors_identity_fields() {
        let entry = IndexEntry {
            id: BlobId(9),
            kind: BlobKind(1),
            disk: DiskId(0),
            partition: PartitionId(2),
            offset: 100,
            length: 50,
            crc: 77,
            metadata: Metadata::new(),
            deleted: false,
            created_at: 0,
        };
        let block = entry.to_block();
        assert_eq!(block.id, entry.id);
        assert_eq!(block.kind, entry.kind);
        assert_eq!(block.crc, entry.crc);
        assert_eq!(block.length, entry.length);
        assert_eq!(entry.end_offset(), 150);
    }
}
