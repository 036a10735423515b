//! Per-disk write path. Every disk has exactly one writer task owning its
//! partition file handle; all appends to that disk flow through the
//! writer's bounded queue in submission order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use blob_dal::{IndexError, IndexStore};
use blob_types::{
    DiskId, FileSource, IndexEntry, PartitionId, ReplicationFile, StorageFile, TempIndexRecord,
};
use blob_utils::crc::{crc_of, CrcAccumulator};
use blob_utils::time::seconds_since_epoch;
use tokio::sync::{mpsc, watch};

use crate::registry::PartitionRegistry;
use crate::replication::ReplicationClient;
use crate::storage::{FileStorage, PartitionAppender};

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("disk {0} is not writable")]
    NoWritableDisk(DiskId),
    #[error("node is not the master; client writes are discarded")]
    NotMaster,
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("disk i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Producer side of one disk's bounded write queue. `submit` blocks once
/// the queue is full; that is the backpressure the ingest layer sees.
#[derive(Debug, Clone)]
pub struct WriteQueueHandle {
    tx: mpsc::Sender<StorageFile>,
}

impl WriteQueueHandle {
    pub async fn submit(&self, file: StorageFile) -> anyhow::Result<()> {
        self.tx
            .send(file)
            .await
            .map_err(|_| anyhow::anyhow!("write queue closed"))
    }

    pub fn is_drained(&self) -> bool {
        self.tx.capacity() == self.tx.max_capacity()
    }
}

pub fn write_queue(capacity: usize) -> (WriteQueueHandle, mpsc::Receiver<StorageFile>) {
    let (tx, rx) = mpsc::channel(capacity);
    (WriteQueueHandle { tx }, rx)
}

/// Concurrently refreshed mapping from disks to their write queues.
#[derive(Debug, Clone, Default)]
pub struct DisksToWriters {
    inner: Arc<Mutex<HashMap<DiskId, WriteQueueHandle>>>,
}

impl DisksToWriters {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DiskId, WriteQueueHandle>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, disk: DiskId, handle: WriteQueueHandle) {
        self.lock().insert(disk, handle);
    }

    pub fn get(&self, disk: DiskId) -> Option<WriteQueueHandle> {
        self.lock().get(&disk).cloned()
    }

    pub fn contains(&self, disk: DiskId) -> bool {
        self.lock().contains_key(&disk)
    }

    pub fn disks(&self) -> Vec<DiskId> {
        let mut disks: Vec<_> = self.lock().keys().copied().collect();
        disks.sort_unstable();
        disks
    }

    pub fn all_drained(&self) -> bool {
        self.lock().values().all(WriteQueueHandle::is_drained)
    }
}

/// The single writer of one disk.
#[derive(Debug)]
pub struct DiskWriter {
    disk: DiskId,
    queue: mpsc::Receiver<StorageFile>,
    registry: Arc<PartitionRegistry>,
    index: Arc<dyn IndexStore>,
    storage: Arc<FileStorage>,
    replication: Arc<ReplicationClient>,
    disk_check_period: Duration,
    appender: Option<(PartitionId, PartitionAppender)>,
    partition_crc: CrcAccumulator,
}

impl DiskWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        disk: DiskId,
        queue: mpsc::Receiver<StorageFile>,
        registry: Arc<PartitionRegistry>,
        index: Arc<dyn IndexStore>,
        storage: Arc<FileStorage>,
        replication: Arc<ReplicationClient>,
        disk_check_period: Duration,
    ) -> Self {
        Self {
            disk,
            queue,
            registry,
            index,
            storage,
            replication,
            disk_check_period,
            appender: None,
            partition_crc: CrcAccumulator::new(),
        }
    }

    /// Writer loop. Failures while storing one file are logged and the
    /// offending file is dropped; the loop itself never dies on them.
    pub async fn run(
        mut self,
        mut stop_receiver: watch::Receiver<bool>,
        start_delay: Duration,
    ) -> anyhow::Result<()> {
        tokio::time::sleep(start_delay).await;
        blobd_logs::info!("Writer for disk {} started", self.disk);
        loop {
            if *stop_receiver.borrow() {
                break;
            }
            tokio::select! {
                _ = stop_receiver.changed() => {}
                file = self.queue.recv() => {
                    let Some(file) = file else { break };
                    let (id, kind) = (file.id, file.kind);
                    if let Err(err) = self.process_file(file, &stop_receiver).await {
                        blobd_logs::error!(
                            "Failed to store blob {} kind {} on disk {}: {:?}",
                            id, kind, self.disk, err
                        );
                    }
                }
            }
        }
        blobd_logs::info!("Writer for disk {} stopped", self.disk);
        Ok(())
    }

    async fn process_file(
        &mut self,
        file: StorageFile,
        stop_receiver: &watch::Receiver<bool>,
    ) -> Result<(), WriterError> {
        // A temporarily non-writable disk parks the writer instead of
        // losing queued files.
        while !self.storage.is_writable(self.disk).await {
            if *stop_receiver.borrow() {
                return Err(WriterError::NoWritableDisk(self.disk));
            }
            blobd_logs::warn!(
                "Disk {} is not writable, writer parked for {:?}",
                self.disk,
                self.disk_check_period
            );
            tokio::time::sleep(self.disk_check_period).await;
        }

        // Slaves get their data through the replication path only.
        if !file.compaction && !self.replication.is_master() {
            return Err(WriterError::NotMaster);
        }

        let payload = self.load_payload(&file).await?;
        if payload.len() as u64 != file.length {
            blobd_logs::warn!(
                "Blob {} kind {} declared {} bytes but carries {}",
                file.id,
                file.kind,
                file.length,
                payload.len()
            );
        }

        if !file.compaction {
            self.index
                .add_temp_index(TempIndexRecord {
                    id: file.id,
                    kind: file.kind,
                    file_path: file.spool_path().cloned(),
                    metadata: file.metadata.clone(),
                    created_at: seconds_since_epoch(),
                })
                .await?;
        }

        let mut active = self.registry.active_partition(self.disk).await?;
        // A write that would cross the size bound goes to a fresh partition.
        if active.size > 0
            && active.size + payload.len() as u64 > self.registry.max_partition_size()
        {
            self.rotate().await?;
            active = self.registry.active_partition(self.disk).await?;
        }

        let appender = self.appender(active.id).await?;
        let offset = appender.append(&payload).await?;
        self.partition_crc.update(&payload);

        let entry = IndexEntry {
            id: file.id,
            kind: file.kind,
            disk: self.disk,
            partition: active.id,
            offset,
            length: payload.len() as u64,
            crc: crc_of(&payload),
            metadata: file.metadata.clone(),
            deleted: false,
            created_at: seconds_since_epoch(),
        };

        if file.compaction {
            // Compaction rewrites swap the existing mapping in place.
            self.index.restore(entry.clone()).await?;
        } else {
            self.index.add(entry.clone()).await?;
            self.index.delete_temp_index(file.id, file.kind).await?;
        }

        let updated = self
            .registry
            .record_append(self.disk, active.id, entry.length, self.partition_crc.value())
            .await?;

        if !file.compaction {
            self.replication
                .replicate(&ReplicationFile::new(entry, payload))
                .await;
        }

        if updated.size >= self.registry.max_partition_size() {
            self.rotate().await?;
        }
        Ok(())
    }

    async fn load_payload(&self, file: &StorageFile) -> Result<Vec<u8>, WriterError> {
        match &file.source {
            FileSource::Bytes(bytes) => Ok(bytes.clone()),
            FileSource::Path(path) => Ok(tokio::fs::read(path).await?),
        }
    }

    async fn rotate(&mut self) -> Result<(), WriterError> {
        self.appender = None;
        self.partition_crc = CrcAccumulator::new();
        self.registry.rotate(self.disk).await?;
        Ok(())
    }

    /// Returns the appender of the active partition, opening it (and
    /// re-seeding the running crc from existing bytes) when the writer
    /// switches partitions or just started.
    async fn appender(&mut self, id: PartitionId) -> Result<&mut PartitionAppender, WriterError> {
        let stale = !matches!(&self.appender, Some((current, _)) if *current == id);
        if stale {
            let appender = self.storage.open_appender(self.disk, id).await?;
            let mut crc = CrcAccumulator::new();
            if appender.end_offset() > 0 {
                let existing = self
                    .storage
                    .read_range(self.disk, id, 0, appender.end_offset())
                    .await?;
                crc.update(&existing);
            }
            self.partition_crc = crc;
            self.appender = Some((id, appender));
        }
        let (_, appender) = self
            .appender
            .as_mut()
            .expect("appender was just opened");
        Ok(appender)
    }
}
