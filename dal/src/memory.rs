//! In-memory store backends honoring the same contracts as the Postgres
//! ones. Tests across the workspace run against these.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use blob_types::{
    BlobId, BlobKind, DiskId, IndexEntry, MerkleTree, Partition, PartitionId, TempIndexRecord,
};

use crate::{DalResult, IndexError, IndexStore, PartitionStore};

#[derive(Debug, Default)]
struct IndexInner {
    /// Keyed by `(id, kind)`; BTreeMap iteration order doubles as the
    /// `(id, kind)` listing order.
    entries: BTreeMap<(BlobId, BlobKind), IndexEntry>,
    temp: BTreeMap<(BlobId, BlobKind), TempIndexRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryIndexStore {
    inner: Mutex<IndexInner>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn add(&self, entry: IndexEntry) -> DalResult<()> {
        let mut inner = self.lock();
        let key = (entry.id, entry.kind);
        if inner.entries.contains_key(&key) {
            return Err(IndexError::DuplicateEntry {
                id: entry.id,
                kind: entry.kind,
            });
        }
        inner.entries.insert(key, entry);
        Ok(())
    }

    async fn get_by_id(&self, id: BlobId, kind: BlobKind) -> DalResult<Option<IndexEntry>> {
        Ok(self.lock().entries.get(&(id, kind)).cloned())
    }

    async fn list_by_id(&self, id: BlobId) -> DalResult<Vec<IndexEntry>> {
        let inner = self.lock();
        Ok(inner
            .entries
            .range((id, BlobKind(i32::MIN))..=(id, BlobKind(i32::MAX)))
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn list_by_partition(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> DalResult<Vec<IndexEntry>> {
        let inner = self.lock();
        Ok(inner
            .entries
            .values()
            .filter(|entry| entry.disk == disk && entry.partition == partition)
            .cloned()
            .collect())
    }

    async fn live_list_by_partition(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> DalResult<Vec<IndexEntry>> {
        let entries = self.list_by_partition(disk, partition).await?;
        Ok(entries.into_iter().filter(|entry| !entry.deleted).collect())
    }

    async fn min_max_range(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> DalResult<Option<(BlobId, BlobId)>> {
        let entries = self.list_by_partition(disk, partition).await?;
        let min = entries.iter().map(|entry| entry.id).min();
        let max = entries.iter().map(|entry| entry.id).max();
        Ok(min.zip(max))
    }

    async fn size_of_deleted(&self, disk: DiskId, partition: PartitionId) -> DalResult<u64> {
        let entries = self.list_by_partition(disk, partition).await?;
        Ok(entries
            .iter()
            .filter(|entry| entry.deleted)
            .map(|entry| entry.length)
            .sum())
    }

    async fn delete(&self, id: BlobId, kind: BlobKind) -> DalResult<()> {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(&(id, kind)) {
            entry.deleted = true;
        }
        Ok(())
    }

    async fn delete_by_id(&self, id: BlobId) -> DalResult<u64> {
        let mut inner = self.lock();
        let mut changed = 0;
        for (_, entry) in inner
            .entries
            .range_mut((id, BlobKind(i32::MIN))..=(id, BlobKind(i32::MAX)))
        {
            if !entry.deleted {
                entry.deleted = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn restore(&self, entry: IndexEntry) -> DalResult<()> {
        let mut inner = self.lock();
        inner.entries.insert((entry.id, entry.kind), entry);
        Ok(())
    }

    async fn add_temp_index(&self, record: TempIndexRecord) -> DalResult<()> {
        let mut inner = self.lock();
        inner.temp.insert((record.id, record.kind), record);
        Ok(())
    }

    async fn delete_temp_index(&self, id: BlobId, kind: BlobKind) -> DalResult<()> {
        self.lock().temp.remove(&(id, kind));
        Ok(())
    }

    async fn get_temp_index_list(&self, limit: usize) -> DalResult<Vec<TempIndexRecord>> {
        let inner = self.lock();
        Ok(inner.temp.values().take(limit).cloned().collect())
    }

    async fn clear(&self) -> DalResult<()> {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.temp.clear();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PartitionInner {
    partitions: BTreeMap<(DiskId, PartitionId), Partition>,
    trees: HashMap<(DiskId, PartitionId), MerkleTree>,
}

#[derive(Debug, Default)]
pub struct MemoryPartitionStore {
    inner: Mutex<PartitionInner>,
}

impl MemoryPartitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PartitionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PartitionStore for MemoryPartitionStore {
    async fn add_partition(&self, partition: Partition) -> DalResult<()> {
        let mut inner = self.lock();
        let key = (partition.disk, partition.id);
        if inner.partitions.contains_key(&key) {
            return Err(IndexError::Corrupt(format!(
                "partition {}/{} already registered",
                partition.disk, partition.id
            )));
        }
        inner.partitions.insert(key, partition);
        Ok(())
    }

    async fn get_partitions(&self, disk: DiskId) -> DalResult<Vec<Partition>> {
        let inner = self.lock();
        Ok(inner
            .partitions
            .range((disk, PartitionId(u32::MIN))..=(disk, PartitionId(u32::MAX)))
            .map(|(_, partition)| partition.clone())
            .collect())
    }

    async fn get_partition(&self, disk: DiskId, id: PartitionId) -> DalResult<Option<Partition>> {
        Ok(self.lock().partitions.get(&(disk, id)).cloned())
    }

    async fn update_partition(&self, partition: &Partition) -> DalResult<()> {
        let mut inner = self.lock();
        inner
            .partitions
            .insert((partition.disk, partition.id), partition.clone());
        Ok(())
    }

    async fn update_tree(&self, disk: DiskId, id: PartitionId, tree: &MerkleTree) -> DalResult<()> {
        self.lock().trees.insert((disk, id), tree.clone());
        Ok(())
    }

    async fn get_tree(&self, disk: DiskId, id: PartitionId) -> DalResult<Option<MerkleTree>> {
        Ok(self.lock().trees.get(&(disk, id)).cloned())
    }

    async fn delete_partition(&self, disk: DiskId, id: PartitionId) -> DalResult<()> {
        let mut inner = self.lock();
        inner.partitions.remove(&(disk, id));
        inner.trees.remove(&(disk, id));
        Ok(())
    }
}
