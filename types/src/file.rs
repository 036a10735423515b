use std::path::PathBuf;

use blob_basic_types::{BlobId, BlobKind};
use serde::{Deserialize, Serialize};

use crate::entry::{IndexEntry, Metadata};

/// Where a queued write's payload lives. Exactly one representation exists
/// by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FileSource {
    /// Payload held in memory (small uploads, replication re-apply).
    Bytes(Vec<u8>),
    /// Payload spooled to a file by the ingest layer.
    Path(PathBuf),
}

/// One write queued for a disk's writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageFile {
    pub id: BlobId,
    pub kind: BlobKind,
    pub source: FileSource,
    pub length: u64,
    pub metadata: Metadata,
    pub auth_tokens: Vec<String>,
    /// Compaction rewrite traffic: appended without temp-index bookkeeping
    /// and never re-replicated.
    pub compaction: bool,
}

impl StorageFile {
    pub fn from_bytes(id: BlobId, kind: BlobKind, bytes: Vec<u8>) -> Self {
        let length = bytes.len() as u64;
        Self {
            id,
            kind,
            source: FileSource::Bytes(bytes),
            length,
            metadata: Metadata::new(),
            auth_tokens: Vec::new(),
            compaction: false,
        }
    }

    pub fn from_path(id: BlobId, kind: BlobKind, path: PathBuf, length: u64) -> Self {
        Self {
            id,
            kind,
            source: FileSource::Path(path),
            length,
            metadata: Metadata::new(),
            auth_tokens: Vec::new(),
            compaction: false,
        }
    }

    pub fn spool_path(&self) -> Option<&PathBuf> {
        match &self.source {
            FileSource::Path(path) => Some(path),
            FileSource::Bytes(_) => None,
        }
    }
}

/// Self-describing replication record: the index entry plus the payload
/// bytes, everything a slave needs to apply the write locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationFile {
    pub entry: IndexEntry,
    pub payload: Vec<u8>,
}

impl ReplicationFile {
    pub fn new(entry: IndexEntry, payload: Vec<u8>) -> Self {
        Self { entry, payload }
    }
}
