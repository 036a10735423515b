//! Per-disk partition bookkeeping: which partitions exist, which one is
//! active, their cached Merkle trees.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use anyhow::Context as _;
use blob_dal::{IndexStore, PartitionStore};
use blob_types::{DiskId, MerkleTree, OffsetRange, Partition, PartitionId, PartitionState};
use std::sync::Arc;

#[derive(Debug)]
pub struct PartitionRegistry {
    partitions: Arc<dyn PartitionStore>,
    index: Arc<dyn IndexStore>,
    max_partition_size: u64,
    merkle_max_level: u32,
    cache: Mutex<HashMap<DiskId, Vec<Partition>>>,
}

impl PartitionRegistry {
    pub fn new(
        partitions: Arc<dyn PartitionStore>,
        index: Arc<dyn IndexStore>,
        max_partition_size: u64,
        merkle_max_level: u32,
    ) -> Self {
        Self {
            partitions,
            index,
            max_partition_size,
            merkle_max_level,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_partition_size(&self) -> u64 {
        self.max_partition_size
    }

    pub fn merkle_max_level(&self) -> u32 {
        self.merkle_max_level
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DiskId, Vec<Partition>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads the disk's partition rows into the cache; called at startup
    /// and on `refresh` when a disk appears.
    pub async fn load_disk(&self, disk: DiskId) -> anyhow::Result<Vec<Partition>> {
        let partitions = self
            .partitions
            .get_partitions(disk)
            .await
            .with_context(|| format!("failed to load partitions of disk {disk}"))?;
        self.lock().insert(disk, partitions.clone());
        Ok(partitions)
    }

    pub fn cached_partitions(&self, disk: DiskId) -> Vec<Partition> {
        self.lock().get(&disk).cloned().unwrap_or_default()
    }

    pub fn cached_partition(&self, disk: DiskId, id: PartitionId) -> Option<Partition> {
        self.lock()
            .get(&disk)?
            .iter()
            .find(|partition| partition.id == id)
            .cloned()
    }

    /// The partition currently accepting appends on `disk`: the greatest id
    /// still below the size bound. Creates the first partition of a fresh
    /// disk on demand.
    pub async fn active_partition(&self, disk: DiskId) -> anyhow::Result<Partition> {
        if let Some(active) = self
            .lock()
            .get(&disk)
            .and_then(|partitions| partitions.iter().rev().find(|p| p.is_active()))
        {
            return Ok(active.clone());
        }
        let next_id = self
            .lock()
            .get(&disk)
            .and_then(|partitions| partitions.last())
            .map(|partition| partition.id.next())
            .unwrap_or_default();
        self.create_partition(disk, next_id, PartitionState::Active)
            .await
    }

    async fn create_partition(
        &self,
        disk: DiskId,
        id: PartitionId,
        state: PartitionState,
    ) -> anyhow::Result<Partition> {
        let mut partition = Partition::new(disk, id);
        partition.state = state;
        self.partitions
            .add_partition(partition.clone())
            .await
            .with_context(|| format!("failed to register partition {disk}/{id}"))?;
        blobd_logs::info!("Opened partition {}/{} ({:?})", disk, id, state);
        self.lock().entry(disk).or_default().push(partition.clone());
        Ok(partition)
    }

    /// Registers a partition reconstructed from a file found on disk with
    /// no matching row (e.g. after losing the partition table).
    pub async fn adopt_partition(&self, partition: Partition) -> anyhow::Result<()> {
        self.partitions
            .add_partition(partition.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to adopt partition {}/{}",
                    partition.disk, partition.id
                )
            })?;
        let mut guard = self.lock();
        let partitions = guard.entry(partition.disk).or_default();
        partitions.push(partition);
        partitions.sort_by_key(|partition| partition.id);
        Ok(())
    }

    /// Registers a partition observed on the replication path when the
    /// local node has no row for it yet.
    pub async fn ensure_partition(&self, disk: DiskId, id: PartitionId) -> anyhow::Result<Partition> {
        if let Some(partition) = self.cached_partition(disk, id) {
            return Ok(partition);
        }
        let has_greater = self
            .lock()
            .get(&disk)
            .map(|partitions| partitions.iter().any(|p| p.id > id))
            .unwrap_or(false);
        let state = if has_greater {
            PartitionState::Closed
        } else {
            PartitionState::Active
        };
        let created = self.create_partition(disk, id, state).await?;

        // A newer partition supersedes older active ones: the master has
        // rotated away from them, so this node freezes its copies too.
        let superseded: Vec<PartitionId> = self
            .lock()
            .get(&disk)
            .map(|partitions| {
                partitions
                    .iter()
                    .filter(|partition| partition.id < id && partition.is_active())
                    .map(|partition| partition.id)
                    .collect()
            })
            .unwrap_or_default();
        for old in superseded {
            self.set_state(disk, old, PartitionState::Closed).await?;
        }

        if let Some(partitions) = self.lock().get_mut(&disk) {
            partitions.sort_by_key(|partition| partition.id);
        }
        Ok(created)
    }

    /// Records an append: bumps size, replaces the running crc and persists
    /// the row. Returns the updated partition.
    pub async fn record_append(
        &self,
        disk: DiskId,
        id: PartitionId,
        appended: u64,
        crc: u64,
    ) -> anyhow::Result<Partition> {
        let updated = {
            let mut guard = self.lock();
            let partitions = guard
                .get_mut(&disk)
                .with_context(|| format!("append recorded for unknown disk {disk}"))?;
            let partition = partitions
                .iter_mut()
                .find(|partition| partition.id == id)
                .with_context(|| format!("append recorded for unknown partition {disk}/{id}"))?;
            partition.size += appended;
            partition.crc = crc;
            partition.clone()
        };
        self.partitions.update_partition(&updated).await?;
        Ok(updated)
    }

    /// Extends a partition after a positioned replication write. Size only
    /// grows; out-of-order deliveries never shrink it.
    pub async fn observe_remote_append(
        &self,
        disk: DiskId,
        id: PartitionId,
        end_offset: u64,
    ) -> anyhow::Result<Partition> {
        let updated = {
            let mut guard = self.lock();
            let partitions = guard
                .get_mut(&disk)
                .with_context(|| format!("replicated append for unknown disk {disk}"))?;
            let partition = partitions
                .iter_mut()
                .find(|partition| partition.id == id)
                .with_context(|| format!("replicated append for unknown partition {disk}/{id}"))?;
            partition.size = partition.size.max(end_offset);
            partition.clone()
        };
        self.partitions.update_partition(&updated).await?;
        Ok(updated)
    }

    pub async fn set_state(
        &self,
        disk: DiskId,
        id: PartitionId,
        state: PartitionState,
    ) -> anyhow::Result<Partition> {
        let updated = {
            let mut guard = self.lock();
            let partitions = guard
                .get_mut(&disk)
                .with_context(|| format!("state change for unknown disk {disk}"))?;
            let partition = partitions
                .iter_mut()
                .find(|partition| partition.id == id)
                .with_context(|| format!("state change for unknown partition {disk}/{id}"))?;
            partition.state = state;
            partition.clone()
        };
        self.partitions.update_partition(&updated).await?;
        Ok(updated)
    }

    /// Freezes the active partition and opens the next one. The frozen
    /// partition is resealed: its id range is checked and its Merkle tree
    /// is persisted so repair can short-circuit comparisons.
    pub async fn rotate(&self, disk: DiskId) -> anyhow::Result<(Partition, Partition)> {
        let active = self.active_partition(disk).await?;
        let closed = self
            .set_state(disk, active.id, PartitionState::Closed)
            .await?;

        let id_range = self.index.min_max_range(disk, closed.id).await?;
        blobd_logs::info!(
            "Sealed partition {}/{} at {} bytes, ids {:?}",
            disk,
            closed.id,
            closed.size,
            id_range
        );
        match self.rebuild_tree(disk, closed.id).await {
            Ok(tree) => self.persist_tree(disk, closed.id, &tree).await?,
            Err(err) => {
                blobd_logs::warn!(
                    "Could not seal tree of partition {}/{}: {err:?}",
                    disk,
                    closed.id
                );
            }
        }

        let fresh = self
            .create_partition(disk, closed.id.next(), PartitionState::Active)
            .await?;
        Ok((closed, fresh))
    }

    /// Builds the partition's tree over its live index entries, keyed by
    /// offset over `[0, size)`.
    pub async fn rebuild_tree(&self, disk: DiskId, id: PartitionId) -> anyhow::Result<MerkleTree> {
        let partition = self
            .cached_partition(disk, id)
            .with_context(|| format!("tree rebuild for unknown partition {disk}/{id}"))?;
        let range = OffsetRange::new(0, partition.size.max(1));
        self.rebuild_tree_with_shape(disk, id, range, self.merkle_max_level)
            .await
    }

    /// Same as [`Self::rebuild_tree`] with an explicit shape, used when
    /// diffing against a peer whose partition size differs. Entries outside
    /// the window are ignored; the diff surfaces them from the other side.
    pub async fn rebuild_tree_with_shape(
        &self,
        disk: DiskId,
        id: PartitionId,
        range: OffsetRange,
        max_level: u32,
    ) -> anyhow::Result<MerkleTree> {
        let live = self.index.live_list_by_partition(disk, id).await?;
        let blocks: BTreeMap<_, _> = live
            .iter()
            .filter(|entry| range.contains(entry.offset))
            .map(|entry| (entry.offset, entry.to_block()))
            .collect();
        Ok(MerkleTree::build(range, max_level, &blocks)?)
    }

    pub async fn persist_tree(
        &self,
        disk: DiskId,
        id: PartitionId,
        tree: &MerkleTree,
    ) -> anyhow::Result<()> {
        self.partitions.update_tree(disk, id, tree).await?;
        Ok(())
    }

    pub async fn stored_tree(&self, disk: DiskId, id: PartitionId) -> anyhow::Result<Option<MerkleTree>> {
        Ok(self.partitions.get_tree(disk, id).await?)
    }

    /// Drops a partition destroyed by compaction from the table and cache.
    pub async fn remove_partition(&self, disk: DiskId, id: PartitionId) -> anyhow::Result<()> {
        self.partitions.delete_partition(disk, id).await?;
        if let Some(partitions) = self.lock().get_mut(&disk) {
            partitions.retain(|partition| partition.id != id);
        }
        Ok(())
    }
}
