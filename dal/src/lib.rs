//! Durable stores backing the blob index, the partition table and the
//! temp-index table.
//!
//! The engine consumes the stores through the [`IndexStore`] and
//! [`PartitionStore`] capabilities; concrete backends are the Postgres
//! implementation used in production and an in-memory one honoring the
//! same contracts for tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use blob_config::database::DatabaseConfig;
use blob_types::{
    BlobId, BlobKind, DiskId, IndexEntry, MerkleTree, Partition, PartitionId, TempIndexRecord,
};

use crate::memory::{MemoryIndexStore, MemoryPartitionStore};
use crate::postgres::{PostgresIndexStore, PostgresPartitionStore};

pub mod memory;
pub mod postgres;

pub type DalResult<T> = Result<T, IndexError>;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// `(id, kind)` is already indexed. Fatal on the master write path,
    /// swallowed on replication re-apply.
    #[error("index entry for blob {id} kind {kind} already exists")]
    DuplicateEntry { id: BlobId, kind: BlobKind },
    /// The stored state violates an index invariant; fatal at startup.
    #[error("corrupt index: {0}")]
    Corrupt(String),
    #[error("index backend failure: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Durable map from `(id, kind)` to the location of the payload, plus the
/// temp-index table recording in-flight writes.
///
/// `add` must return only after the entry is stably recorded; a crash after
/// `add` but before the payload append is recovered through the temp index.
#[async_trait]
pub trait IndexStore: fmt::Debug + Send + Sync {
    async fn add(&self, entry: IndexEntry) -> DalResult<()>;

    async fn get_by_id(&self, id: BlobId, kind: BlobKind) -> DalResult<Option<IndexEntry>>;

    /// Every kind stored under one id, used for deletion cascades.
    async fn list_by_id(&self, id: BlobId) -> DalResult<Vec<IndexEntry>>;

    /// All entries of a partition ordered by `(id, kind)`.
    async fn list_by_partition(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> DalResult<Vec<IndexEntry>>;

    /// Same as [`Self::list_by_partition`] minus deleted entries.
    async fn live_list_by_partition(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> DalResult<Vec<IndexEntry>>;

    /// Smallest and greatest blob id inside a partition, used at reseal.
    async fn min_max_range(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> DalResult<Option<(BlobId, BlobId)>>;

    /// Bytes held by deleted entries of a partition; fuel for the
    /// compaction decision.
    async fn size_of_deleted(&self, disk: DiskId, partition: PartitionId) -> DalResult<u64>;

    /// Marks one variant deleted. Idempotent; payload bytes remain on disk
    /// until compaction.
    async fn delete(&self, id: BlobId, kind: BlobKind) -> DalResult<()>;

    /// Marks every variant of a blob deleted, returning how many rows
    /// changed.
    async fn delete_by_id(&self, id: BlobId) -> DalResult<u64>;

    /// Reinserts an entry, replacing any previous row for `(id, kind)`.
    /// This is the swap step of a compaction rewrite.
    async fn restore(&self, entry: IndexEntry) -> DalResult<()>;

    async fn add_temp_index(&self, record: TempIndexRecord) -> DalResult<()>;

    async fn delete_temp_index(&self, id: BlobId, kind: BlobKind) -> DalResult<()>;

    /// Oldest incomplete writes left behind by a crash, replayed on start.
    async fn get_temp_index_list(&self, limit: usize) -> DalResult<Vec<TempIndexRecord>>;

    /// Drops everything. Test-only by contract.
    async fn clear(&self) -> DalResult<()>;
}

/// The partition metadata table.
#[async_trait]
pub trait PartitionStore: fmt::Debug + Send + Sync {
    async fn add_partition(&self, partition: Partition) -> DalResult<()>;

    async fn get_partitions(&self, disk: DiskId) -> DalResult<Vec<Partition>>;

    async fn get_partition(&self, disk: DiskId, id: PartitionId) -> DalResult<Option<Partition>>;

    /// Persists mutable partition fields (size, crc, state).
    async fn update_partition(&self, partition: &Partition) -> DalResult<()>;

    /// Caches the partition's Merkle tree to short-circuit future repair
    /// comparisons.
    async fn update_tree(&self, disk: DiskId, id: PartitionId, tree: &MerkleTree) -> DalResult<()>;

    async fn get_tree(&self, disk: DiskId, id: PartitionId) -> DalResult<Option<MerkleTree>>;

    /// Removes the partition row once compaction has durably superseded it.
    async fn delete_partition(&self, disk: DiskId, id: PartitionId) -> DalResult<()>;
}

#[derive(Debug)]
enum StoreOrigin {
    Config(DatabaseConfig),
    Mock {
        index: Arc<MemoryIndexStore>,
        partitions: Arc<MemoryPartitionStore>,
    },
}

/// Factory of [`IndexStore`] / [`PartitionStore`] pairs.
///
/// The mock origin hands out the same shared stores on every call so test
/// code can assert through the capability traits.
#[derive(Debug)]
pub struct StoreFactory {
    origin: StoreOrigin,
}

impl StoreFactory {
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            origin: StoreOrigin::Config(config),
        }
    }

    pub fn mock() -> Self {
        Self {
            origin: StoreOrigin::Mock {
                index: Arc::new(MemoryIndexStore::new()),
                partitions: Arc::new(MemoryPartitionStore::new()),
            },
        }
    }

    pub async fn create_index_store(&self) -> anyhow::Result<Arc<dyn IndexStore>> {
        match &self.origin {
            StoreOrigin::Config(config) => {
                let store = PostgresIndexStore::connect(config).await?;
                Ok(Arc::new(store))
            }
            StoreOrigin::Mock { index, .. } => Ok(Arc::new(Arc::clone(index))),
        }
    }

    pub async fn create_partition_store(&self) -> anyhow::Result<Arc<dyn PartitionStore>> {
        match &self.origin {
            StoreOrigin::Config(config) => {
                let store = PostgresPartitionStore::connect(config).await?;
                Ok(Arc::new(store))
            }
            StoreOrigin::Mock { partitions, .. } => Ok(Arc::new(Arc::clone(partitions))),
        }
    }
}

#[async_trait]
impl<T: IndexStore + ?Sized> IndexStore for Arc<T> {
    async fn add(&self, entry: IndexEntry) -> DalResult<()> {
        (**self).add(entry).await
    }

    async fn get_by_id(&self, id: BlobId, kind: BlobKind) -> DalResult<Option<IndexEntry>> {
        (**self).get_by_id(id, kind).await
    }

    async fn list_by_id(&self, id: BlobId) -> DalResult<Vec<IndexEntry>> {
        (**self).list_by_id(id).await
    }

    async fn list_by_partition(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> DalResult<Vec<IndexEntry>> {
        (**self).list_by_partition(disk, partition).await
    }

    async fn live_list_by_partition(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> DalResult<Vec<IndexEntry>> {
        (**self).live_list_by_partition(disk, partition).await
    }

    async fn min_max_range(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> DalResult<Option<(BlobId, BlobId)>> {
        (**self).min_max_range(disk, partition).await
    }

    async fn size_of_deleted(&self, disk: DiskId, partition: PartitionId) -> DalResult<u64> {
        (**self).size_of_deleted(disk, partition).await
    }

    async fn delete(&self, id: BlobId, kind: BlobKind) -> DalResult<()> {
        (**self).delete(id, kind).await
    }

    async fn delete_by_id(&self, id: BlobId) -> DalResult<u64> {
        (**self).delete_by_id(id).await
    }

    async fn restore(&self, entry: IndexEntry) -> DalResult<()> {
        (**self).restore(entry).await
    }

    async fn add_temp_index(&self, record: TempIndexRecord) -> DalResult<()> {
        (**self).add_temp_index(record).await
    }

    async fn delete_temp_index(&self, id: BlobId, kind: BlobKind) -> DalResult<()> {
        (**self).delete_temp_index(id, kind).await
    }

    async fn get_temp_index_list(&self, limit: usize) -> DalResult<Vec<TempIndexRecord>> {
        (**self).get_temp_index_list(limit).await
    }

    async fn clear(&self) -> DalResult<()> {
        (**self).clear().await
    }
}

#[async_trait]
impl<T: PartitionStore + ?Sized> PartitionStore for Arc<T> {
    async fn add_partition(&self, partition: Partition) -> DalResult<()> {
        (**self).add_partition(partition).await
    }

    async fn get_partitions(&self, disk: DiskId) -> DalResult<Vec<Partition>> {
        (**self).get_partitions(disk).await
    }

    async fn get_partition(&self, disk: DiskId, id: PartitionId) -> DalResult<Option<Partition>> {
        (**self).get_partition(disk, id).await
    }

    async fn update_partition(&self, partition: &Partition) -> DalResult<()> {
        (**self).update_partition(partition).await
    }

    async fn update_tree(&self, disk: DiskId, id: PartitionId, tree: &MerkleTree) -> DalResult<()> {
        (**self).update_tree(disk, id, tree).await
    }

    async fn get_tree(&self, disk: DiskId, id: PartitionId) -> DalResult<Option<MerkleTree>> {
        (**self).get_tree(disk, id).await
    }

    async fn delete_partition(&self, disk: DiskId, id: PartitionId) -> DalResult<()> {
        (**self).delete_partition(disk, id).await
    }
}
