//! The storage engine: per-disk writers over append-only partition files,
//! replication fan-out, Merkle-tree repair and compaction, assembled from
//! the capability traits in [`cluster`] and the stores in `blob_dal`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use blob_config::{
    cluster::ClusterConfig, compaction::CompactionConfig, repair::RepairConfig,
    storage::StorageConfig,
};
use blob_dal::{IndexStore, PartitionStore};
use blob_types::{
    BlobId, BlobKind, DiskId, IndexEntry, Partition, PartitionState, StorageFile,
};
use blob_utils::id_generator::IdGenerator;
use blob_utils::panic_extractor::try_extract_panic_message;
use blobd_queued_job_processor::JobProcessor;
use futures::{future, Future};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cluster::{ClusterMembership, ClusterTransport};
use crate::compaction::CompactionService;
use crate::registry::PartitionRegistry;
use crate::repair::RepairEngine;
use crate::replication::{
    replication_queue, ReplicationApplier, ReplicationClient, ReplicationQueueHandle,
    ReplicationWriter,
};
use crate::storage::{DiskLayout, FileStorage};
use crate::writer::{write_queue, DiskWriter, DisksToWriters};

pub mod cluster;
pub mod compaction;
pub mod registry;
pub mod repair;
pub mod replication;
pub mod storage;
pub mod writer;

#[cfg(test)]
mod testonly;
#[cfg(test)]
mod tests;

/// How many interrupted writes one startup replay pass picks up.
const TEMP_INDEX_REPLAY_LIMIT: usize = 1_024;

const QUEUE_DRAIN_POLL: Duration = Duration::from_millis(500);

/// Ingest/serve facade handed to the HTTP layer: id allocation, writes
/// (blocking on queue backpressure), reads and deletion cascades.
#[derive(Debug)]
pub struct BlobStore {
    writers: DisksToWriters,
    index: Arc<dyn IndexStore>,
    storage: Arc<FileStorage>,
    id_generator: IdGenerator,
    next_disk: AtomicUsize,
}

impl BlobStore {
    pub fn allocate_id(&self) -> BlobId {
        self.id_generator.generate()
    }

    /// Queues a write on the next disk in round-robin order. Blocks while
    /// that disk's queue is full; this is the backpressure the caller sees.
    pub async fn put(&self, file: StorageFile) -> anyhow::Result<()> {
        let disks = self.writers.disks();
        anyhow::ensure!(!disks.is_empty(), "no writable disks registered");
        let disk = disks[self.next_disk.fetch_add(1, Ordering::Relaxed) % disks.len()];
        let queue = self
            .writers
            .get(disk)
            .with_context(|| format!("writer for disk {disk} disappeared"))?;
        queue.submit(file).await
    }

    pub async fn get(
        &self,
        id: BlobId,
        kind: BlobKind,
    ) -> anyhow::Result<Option<(IndexEntry, Vec<u8>)>> {
        let Some(entry) = self.index.get_by_id(id, kind).await? else {
            return Ok(None);
        };
        if entry.deleted {
            return Ok(None);
        }
        let payload = self
            .storage
            .read_range(entry.disk, entry.partition, entry.offset, entry.length)
            .await?;
        Ok(Some((entry, payload)))
    }

    /// Marks every variant of the blob deleted. Bytes are reclaimed later
    /// by compaction.
    pub async fn delete(&self, id: BlobId) -> anyhow::Result<u64> {
        Ok(self.index.delete_by_id(id).await?)
    }
}

/// A running storage node: the facade plus every background task and the
/// shared state needed to add disks at runtime.
#[derive(Debug)]
pub struct Node {
    pub store: Arc<BlobStore>,
    pub repair: Arc<RepairEngine>,
    pub replication_queue: ReplicationQueueHandle,
    storage_config: StorageConfig,
    registry: Arc<PartitionRegistry>,
    index: Arc<dyn IndexStore>,
    storage: Arc<FileStorage>,
    replication_client: Arc<ReplicationClient>,
    writers: DisksToWriters,
    tasks: Vec<JoinHandle<()>>,
    stop_sender: watch::Sender<bool>,
    stop_receiver: watch::Receiver<bool>,
}

#[allow(clippy::too_many_arguments)]
pub async fn initialize_components(
    storage_config: StorageConfig,
    cluster_config: ClusterConfig,
    repair_config: RepairConfig,
    compaction_config: CompactionConfig,
    index: Arc<dyn IndexStore>,
    partitions: Arc<dyn PartitionStore>,
    membership: Arc<dyn ClusterMembership>,
    transport: Arc<dyn ClusterTransport>,
) -> anyhow::Result<Node> {
    anyhow::ensure!(
        !storage_config.disk_roots.is_empty(),
        "cannot start a storage node without disks"
    );
    anyhow::ensure!(
        storage_config.disk_roots.len() <= storage_config.writer_pool_size,
        "{} disks configured but the writer pool only holds {}",
        storage_config.disk_roots.len(),
        storage_config.writer_pool_size
    );

    let layout = DiskLayout::from_roots(storage_config.disk_roots.clone());
    let storage = Arc::new(FileStorage::init(layout, storage_config.fsync_on_append).await?);
    let registry = Arc::new(PartitionRegistry::new(
        Arc::clone(&partitions),
        Arc::clone(&index),
        storage_config.max_partition_size,
        repair_config.merkle_max_level,
    ));

    for disk in storage.layout().disks() {
        reconcile_disk(disk, &storage, &registry).await?;
    }

    let replication_client = Arc::new(ReplicationClient::new(
        Arc::clone(&membership),
        Arc::clone(&transport),
    ));
    let applier = Arc::new(ReplicationApplier::new(
        Arc::clone(&registry),
        Arc::clone(&index),
        Arc::clone(&storage),
    ));
    let repair = Arc::new(RepairEngine::new(
        Arc::clone(&membership),
        Arc::clone(&transport),
        Arc::clone(&registry),
        Arc::clone(&index),
        Arc::clone(&storage),
        Arc::clone(&applier),
        repair_config,
    ));

    let (stop_sender, stop_receiver) = watch::channel(false);
    let writers = DisksToWriters::default();
    let store = Arc::new(BlobStore {
        writers: writers.clone(),
        index: Arc::clone(&index),
        storage: Arc::clone(&storage),
        id_generator: IdGenerator::new(),
        next_disk: AtomicUsize::new(0),
    });

    let (replication_handle, replication_receiver) =
        replication_queue(cluster_config.replication_queue_capacity);

    let mut node = Node {
        store,
        repair,
        replication_queue: replication_handle,
        storage_config,
        registry,
        index: Arc::clone(&index),
        storage,
        replication_client,
        writers,
        tasks: Vec::new(),
        stop_sender,
        stop_receiver,
    };

    for disk in node.storage.layout().disks() {
        node.spawn_disk_tasks(disk);
    }
    let replication_writer =
        ReplicationWriter::new(replication_receiver, Arc::clone(&applier));
    node.tasks.push(spawn_logged(
        "replication writer",
        replication_writer.run(node.stop_receiver.clone()),
    ));

    if membership.is_master() {
        replay_temp_index(&index, &node.store).await?;

        let compaction = CompactionService::new(
            Arc::clone(&membership),
            Arc::clone(&index),
            Arc::clone(&node.registry),
            Arc::clone(&node.storage),
            node.writers.clone(),
            compaction_config,
        );
        node.tasks.push(spawn_logged(
            "compaction",
            compaction.run(node.stop_receiver.clone(), None),
        ));
    }

    Ok(node)
}

impl Node {
    fn spawn_disk_tasks(&mut self, disk: DiskId) {
        let (handle, queue) = write_queue(self.storage_config.write_queue_capacity);
        self.writers.insert(disk, handle);

        let writer = DiskWriter::new(
            disk,
            queue,
            Arc::clone(&self.registry),
            Arc::clone(&self.index),
            Arc::clone(&self.storage),
            Arc::clone(&self.replication_client),
            self.storage_config.disk_check_period(),
        );
        self.tasks.push(spawn_logged(
            "disk writer",
            writer.run(
                self.stop_receiver.clone(),
                self.storage_config.writer_task_start_delay(),
            ),
        ));

        let repair = Arc::clone(&self.repair);
        self.tasks.push(spawn_logged(
            "repair",
            repair.run(disk, self.stop_receiver.clone()),
        ));
    }

    /// Picks up disks that appeared since startup, spawning their writer
    /// and repair tasks. Already-known disks are untouched.
    pub async fn refresh(&mut self) -> anyhow::Result<()> {
        for disk in self.storage.layout().disks() {
            if self.writers.contains(disk) {
                continue;
            }
            reconcile_disk(disk, &self.storage, &self.registry).await?;
            self.spawn_disk_tasks(disk);
            blobd_logs::info!("Disk {} joined the writer pool", disk);
        }
        Ok(())
    }

    /// Blocks until any node task exits. None of them is expected to while
    /// the node runs, so the daemon main loop sits here and tears the node
    /// down when this returns.
    pub async fn supervise(&mut self) {
        let tasks = std::mem::take(&mut self.tasks);
        if tasks.is_empty() {
            return;
        }
        let (finished, _, remaining) = future::select_all(tasks).await;
        match finished {
            Ok(()) => {
                blobd_logs::error!("A node task exited while the node was still running");
            }
            Err(error) => {
                let panic_message = try_extract_panic_message(error);
                blobd_logs::error!("A node task died: {panic_message}");
            }
        }
        // The survivors keep draining their queues until `stop`.
        self.tasks = remaining;
    }

    /// Graceful shutdown: drain the write queues, then the replication
    /// queue, wait out the grace period, then signal the tasks and join
    /// them without interrupting in-flight work.
    pub async fn stop(self) {
        blobd_logs::info!("Stopping storage node");
        while !self.writers.all_drained() {
            tokio::time::sleep(QUEUE_DRAIN_POLL).await;
        }
        while !self.replication_queue.is_drained() {
            tokio::time::sleep(QUEUE_DRAIN_POLL).await;
        }
        tokio::time::sleep(self.storage_config.shutdown_grace()).await;

        let _ = self.stop_sender.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                blobd_logs::warn!("Background task ended abnormally: {:?}", err);
            }
        }
        blobd_logs::info!("Storage node stopped");
    }
}

fn spawn_logged<F>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = future.await {
            blobd_logs::error!("The {name} task failed: {err:?}");
        }
    })
}

/// Brings the partition table and the files found on disk in line with
/// each other. Missing files for non-empty rows are fatal; orphan files
/// are adopted as closed partitions so repair can sort their contents out.
async fn reconcile_disk(
    disk: DiskId,
    storage: &FileStorage,
    registry: &PartitionRegistry,
) -> anyhow::Result<()> {
    let rows = registry.load_disk(disk).await?;
    let files = storage.list_partition_files(disk).await?;

    for row in &rows {
        if row.size == 0 || row.state == PartitionState::Deleted {
            continue;
        }
        if !files.contains(&row.id) {
            anyhow::bail!(
                "corrupt index: partition {}/{} records {} bytes but its file is missing",
                disk,
                row.id,
                row.size
            );
        }
        let actual = storage.partition_size(disk, row.id).await?;
        if actual < row.size {
            anyhow::bail!(
                "corrupt index: partition {}/{} records {} bytes but the file holds {}",
                disk,
                row.id,
                row.size,
                actual
            );
        }
    }

    for file_id in files {
        if rows.iter().any(|row| row.id == file_id) {
            continue;
        }
        let size = storage.partition_size(disk, file_id).await?;
        blobd_logs::warn!(
            "Adopting orphan partition file {}/{} ({} bytes)",
            disk,
            file_id,
            size
        );
        let mut partition = Partition::new(disk, file_id);
        partition.state = PartitionState::Closed;
        partition.size = size;
        registry.adopt_partition(partition).await?;
    }
    Ok(())
}

/// Replays the temp-index table after a crash: completed writes get their
/// leftover rows purged, recoverable ones are re-queued, unrecoverable
/// ones are dropped with a warning.
async fn replay_temp_index(
    index: &Arc<dyn IndexStore>,
    store: &Arc<BlobStore>,
) -> anyhow::Result<()> {
    let records = index.get_temp_index_list(TEMP_INDEX_REPLAY_LIMIT).await?;
    if records.is_empty() {
        return Ok(());
    }
    blobd_logs::info!("Replaying {} interrupted writes", records.len());
    for record in records {
        if index.get_by_id(record.id, record.kind).await?.is_some() {
            // The append and the index add both landed; only the temp-row
            // cleanup was lost in the crash.
            index.delete_temp_index(record.id, record.kind).await?;
            continue;
        }
        let Some(path) = record.file_path.clone() else {
            blobd_logs::warn!(
                "In-flight write of blob {} kind {} had no spool file, dropping it",
                record.id,
                record.kind
            );
            index.delete_temp_index(record.id, record.kind).await?;
            continue;
        };
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => {
                let mut file =
                    StorageFile::from_path(record.id, record.kind, path, metadata.len());
                file.metadata = record.metadata;
                store.put(file).await?;
            }
            Err(_) => {
                blobd_logs::warn!(
                    "Spool file {:?} of blob {} kind {} is gone, dropping the write",
                    path,
                    record.id,
                    record.kind
                );
                index.delete_temp_index(record.id, record.kind).await?;
            }
        }
    }
    Ok(())
}
