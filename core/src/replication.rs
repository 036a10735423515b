//! Replication: master-side fan-out of fresh writes, and the slave-side
//! queue consumer applying them.

use std::sync::Arc;

use blob_dal::{IndexError, IndexStore};
use blob_types::ReplicationFile;
use tokio::sync::{mpsc, watch};

use crate::cluster::{ClusterMembership, ClusterTransport};
use crate::registry::PartitionRegistry;
use crate::storage::FileStorage;

/// Fans each replication file out to every peer except `self`. Delivery is
/// best-effort and unordered; repair reconciles whatever slips through.
#[derive(Debug)]
pub struct ReplicationClient {
    membership: Arc<dyn ClusterMembership>,
    transport: Arc<dyn ClusterTransport>,
}

impl ReplicationClient {
    pub fn new(
        membership: Arc<dyn ClusterMembership>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Self {
        Self {
            membership,
            transport,
        }
    }

    pub fn is_master(&self) -> bool {
        self.membership.is_master()
    }

    pub async fn replicate(&self, file: &ReplicationFile) {
        let self_node = self.membership.self_node();
        for peer in self.membership.peers() {
            if peer == self_node {
                continue;
            }
            if let Err(err) = self.transport.send_replication(peer, file.clone()).await {
                blobd_logs::warn!(
                    "Failed to replicate blob {} kind {} to peer {}: {:?}",
                    file.entry.id,
                    file.entry.kind,
                    peer,
                    err
                );
            }
        }
    }
}

/// Applies one replication file locally: payload at the master-assigned
/// offset, then the index entry. Re-applying the same file is a no-op.
#[derive(Debug)]
pub struct ReplicationApplier {
    registry: Arc<PartitionRegistry>,
    index: Arc<dyn IndexStore>,
    storage: Arc<FileStorage>,
}

impl ReplicationApplier {
    pub fn new(
        registry: Arc<PartitionRegistry>,
        index: Arc<dyn IndexStore>,
        storage: Arc<FileStorage>,
    ) -> Self {
        Self {
            registry,
            index,
            storage,
        }
    }

    pub async fn apply(&self, file: ReplicationFile) -> anyhow::Result<()> {
        let entry = file.entry;
        if self.index.get_by_id(entry.id, entry.kind).await?.is_some() {
            blobd_logs::debug!(
                "Blob {} kind {} already applied, skipping replication payload",
                entry.id,
                entry.kind
            );
            return Ok(());
        }

        self.registry
            .ensure_partition(entry.disk, entry.partition)
            .await?;
        self.storage
            .write_at(entry.disk, entry.partition, entry.offset, &file.payload)
            .await?;

        let (disk, partition, end_offset) = (entry.disk, entry.partition, entry.end_offset());
        match self.index.add(entry).await {
            Ok(()) => {}
            // Lost the race with a concurrent apply of the same file.
            Err(IndexError::DuplicateEntry { id, kind }) => {
                blobd_logs::debug!("Blob {} kind {} already indexed", id, kind);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        self.registry
            .observe_remote_append(disk, partition, end_offset)
            .await?;
        Ok(())
    }
}

/// Producer half of the node's inbound replication queue; the transport's
/// server side pushes received files here.
#[derive(Debug, Clone)]
pub struct ReplicationQueueHandle {
    tx: mpsc::Sender<ReplicationFile>,
}

impl ReplicationQueueHandle {
    pub async fn submit(&self, file: ReplicationFile) -> anyhow::Result<()> {
        self.tx
            .send(file)
            .await
            .map_err(|_| anyhow::anyhow!("replication queue closed"))
    }

    pub fn is_drained(&self) -> bool {
        self.tx.capacity() == self.tx.max_capacity()
    }
}

pub fn replication_queue(
    capacity: usize,
) -> (ReplicationQueueHandle, mpsc::Receiver<ReplicationFile>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ReplicationQueueHandle { tx }, rx)
}

/// Single consumer of the replication queue. Errors are absorbed per file.
#[derive(Debug)]
pub struct ReplicationWriter {
    queue: mpsc::Receiver<ReplicationFile>,
    applier: Arc<ReplicationApplier>,
}

impl ReplicationWriter {
    pub fn new(queue: mpsc::Receiver<ReplicationFile>, applier: Arc<ReplicationApplier>) -> Self {
        Self { queue, applier }
    }

    pub async fn run(mut self, mut stop_receiver: watch::Receiver<bool>) -> anyhow::Result<()> {
        blobd_logs::info!("Replication writer started");
        loop {
            if *stop_receiver.borrow() {
                break;
            }
            tokio::select! {
                _ = stop_receiver.changed() => {}
                file = self.queue.recv() => {
                    let Some(file) = file else { break };
                    let (id, kind) = (file.entry.id, file.entry.kind);
                    if let Err(err) = self.applier.apply(file).await {
                        blobd_logs::error!(
                            "Failed to apply replicated blob {} kind {}: {:?}",
                            id, kind, err
                        );
                    }
                }
            }
        }
        blobd_logs::info!("Replication writer stopped");
        Ok(())
    }
}
