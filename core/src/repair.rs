//! Anti-entropy. Each node periodically compares its partitions against
//! the master's Merkle trees and pulls whatever ranges diverge.
//!
//! The same engine also serves the master side of the protocol: peers call
//! [`RepairEngine::merkle_tree_info`], [`RepairEngine::difference`] and
//! [`RepairEngine::fetch_range`] through the cluster transport.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context as _;
use blob_config::repair::RepairConfig;
use blob_dal::IndexStore;
use blob_types::{
    DifferenceInfo, DiskId, MerkleTreeInfo, NodeId, OffsetRange, Partition, PartitionId,
    PartitionState, ReplicationFile,
};
use tokio::sync::watch;

use crate::cluster::{ClusterError, ClusterMembership, ClusterTransport};
use crate::registry::PartitionRegistry;
use crate::replication::ReplicationApplier;
use crate::storage::FileStorage;

#[derive(Debug)]
pub struct RepairEngine {
    membership: Arc<dyn ClusterMembership>,
    transport: Arc<dyn ClusterTransport>,
    registry: Arc<PartitionRegistry>,
    index: Arc<dyn IndexStore>,
    storage: Arc<FileStorage>,
    applier: Arc<ReplicationApplier>,
    config: RepairConfig,
    /// Partitions whose active contents were seen diverging; their repair
    /// is deferred until rotation freezes them.
    diverging: Mutex<HashSet<(DiskId, PartitionId)>>,
}

impl RepairEngine {
    pub fn new(
        membership: Arc<dyn ClusterMembership>,
        transport: Arc<dyn ClusterTransport>,
        registry: Arc<PartitionRegistry>,
        index: Arc<dyn IndexStore>,
        storage: Arc<FileStorage>,
        applier: Arc<ReplicationApplier>,
        config: RepairConfig,
    ) -> Self {
        Self {
            membership,
            transport,
            registry,
            index,
            storage,
            applier,
            config,
            diverging: Mutex::new(HashSet::new()),
        }
    }

    /// Periodic per-disk repair tick.
    pub async fn run(
        self: Arc<Self>,
        disk: DiskId,
        mut stop_receiver: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        blobd_logs::info!("Repair task for disk {} started", disk);
        loop {
            if *stop_receiver.borrow() {
                break;
            }
            if let Err(err) = self.repair_disk(disk).await {
                blobd_logs::error!("Repair cycle for disk {} failed: {:?}", disk, err);
            }
            tokio::select! {
                _ = stop_receiver.changed() => {}
                _ = tokio::time::sleep(self.config.repair_period()) => {}
            }
        }
        blobd_logs::info!("Repair task for disk {} stopped", disk);
        Ok(())
    }

    pub fn diverging_partitions(&self) -> Vec<(DiskId, PartitionId)> {
        let mut list: Vec<_> = self
            .diverging
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        list.sort_unstable();
        list
    }

    fn mark_diverging(&self, disk: DiskId, partition: PartitionId, diverging: bool) {
        let mut set = self.diverging.lock().unwrap_or_else(PoisonError::into_inner);
        if diverging {
            set.insert((disk, partition));
        } else {
            set.remove(&(disk, partition));
        }
    }

    /// One repair cycle over every partition of `disk`. A failed partition
    /// never aborts the rest of the cycle.
    pub async fn repair_disk(&self, disk: DiskId) -> anyhow::Result<()> {
        let Some(master) = self.membership.master() else {
            blobd_logs::warn!("No master in the current view, skipping repair of disk {}", disk);
            return Ok(());
        };
        if master == self.membership.self_node() {
            return Ok(());
        }
        for partition in self.registry.cached_partitions(disk) {
            if matches!(
                partition.state,
                PartitionState::Compacting | PartitionState::Deleted
            ) {
                continue;
            }
            if let Err(err) = self.repair_partition(master, &partition).await {
                blobd_logs::error!(
                    "Repair of partition {}/{} failed: {:?}",
                    disk,
                    partition.id,
                    err
                );
            }
        }
        Ok(())
    }

    async fn repair_partition(&self, master: NodeId, partition: &Partition) -> anyhow::Result<()> {
        let (disk, id) = (partition.disk, partition.id);
        let info = match self.transport.get_merkle_tree_info(master, disk, id).await {
            Ok(info) => info,
            Err(ClusterError::PeerUnavailable(peer, reason)) => {
                blobd_logs::warn!(
                    "Master {} unavailable ({}), skipping partition {}/{} this cycle",
                    peer,
                    reason,
                    disk,
                    id
                );
                return Ok(());
            }
            Err(ClusterError::Timeout(peer, timeout)) => {
                blobd_logs::warn!(
                    "Tree request to {} timed out after {:?}, skipping partition {}/{}",
                    peer,
                    timeout,
                    disk,
                    id
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        // Build the local tree in the master's shape; local sizes may lag.
        let local = self
            .registry
            .rebuild_tree_with_shape(disk, id, info.tree.range(), info.tree.max_level())
            .await?;

        if partition.is_active() {
            // The active partition keeps taking writes; material repair is
            // deferred to the rotation that freezes it.
            if local.root_hash() != info.tree.root_hash() {
                self.mark_diverging(disk, id, true);
                match self.transport.get_difference(master, disk, id).await {
                    Ok(difference) => blobd_logs::info!(
                        "Active partition {}/{} diverges from master in {} ranges, repair deferred",
                        disk,
                        id,
                        difference.ranges.len()
                    ),
                    Err(err) => blobd_logs::warn!(
                        "Could not fetch divergence of active partition {}/{}: {:?}",
                        disk,
                        id,
                        err
                    ),
                }
            } else {
                self.mark_diverging(disk, id, false);
            }
            return Ok(());
        }

        let diff = local.difference(&info.tree)?;
        if diff.is_empty() {
            self.registry.persist_tree(disk, id, &local).await?;
            self.mark_diverging(disk, id, false);
            return Ok(());
        }

        blobd_logs::info!(
            "Partition {}/{} diverges from master in {} ranges, pulling payloads",
            disk,
            id,
            diff.len()
        );
        let files = match self.transport.fetch_range(master, disk, id, &diff).await {
            Ok(files) => files,
            Err(ClusterError::PeerUnavailable(..)) | Err(ClusterError::Timeout(..)) => {
                blobd_logs::warn!(
                    "Master became unavailable mid-repair, skipping partition {}/{}",
                    disk,
                    id
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        for file in files {
            let (id_, kind) = (file.entry.id, file.entry.kind);
            if let Err(err) = self.applier.apply(file).await {
                blobd_logs::error!(
                    "Failed to apply repaired blob {} kind {}: {:?}",
                    id_,
                    kind,
                    err
                );
            }
        }

        let refreshed = self
            .registry
            .rebuild_tree_with_shape(disk, id, info.tree.range(), info.tree.max_level())
            .await?;
        self.registry.persist_tree(disk, id, &refreshed).await?;
        self.mark_diverging(
            disk,
            id,
            refreshed.root_hash() != info.tree.root_hash(),
        );
        Ok(())
    }

    // ---- server half, reached by peers through the transport ----

    /// Tree of a local partition. Closed partitions answer from the sealed
    /// tree when one is stored; the active partition is hashed fresh.
    pub async fn merkle_tree_info(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> anyhow::Result<MerkleTreeInfo> {
        let local = self
            .registry
            .cached_partition(disk, partition)
            .with_context(|| format!("tree requested for unknown partition {disk}/{partition}"))?;
        if !local.is_active() {
            if let Some(tree) = self.registry.stored_tree(disk, partition).await? {
                return Ok(MerkleTreeInfo {
                    disk,
                    partition,
                    tree,
                });
            }
        }
        let tree = self.registry.rebuild_tree(disk, partition).await?;
        Ok(MerkleTreeInfo {
            disk,
            partition,
            tree,
        })
    }

    /// How far the partition's live contents have drifted from its sealed
    /// tree. Empty when no tree was sealed yet.
    pub async fn difference(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> anyhow::Result<DifferenceInfo> {
        let Some(sealed) = self.registry.stored_tree(disk, partition).await? else {
            return Ok(DifferenceInfo::empty(disk, partition));
        };
        let live = self
            .registry
            .rebuild_tree_with_shape(disk, partition, sealed.range(), sealed.max_level())
            .await?;
        Ok(DifferenceInfo {
            disk,
            partition,
            ranges: live.difference(&sealed)?,
        })
    }

    /// Live entries and payloads of the requested offset windows, for a
    /// peer repairing its copy.
    pub async fn fetch_range(
        &self,
        disk: DiskId,
        partition: PartitionId,
        ranges: &[OffsetRange],
    ) -> anyhow::Result<Vec<ReplicationFile>> {
        let live = self.index.live_list_by_partition(disk, partition).await?;
        let mut files = Vec::new();
        for entry in live {
            if !ranges.iter().any(|range| range.contains(entry.offset)) {
                continue;
            }
            let payload = self
                .storage
                .read_range(disk, partition, entry.offset, entry.length)
                .await
                .with_context(|| {
                    format!(
                        "failed to read blob {} kind {} from partition {}/{}",
                        entry.id, entry.kind, disk, partition
                    )
                })?;
            files.push(ReplicationFile::new(entry, payload));
        }
        Ok(files)
    }
}
