//! Master-only compaction: rewrites closed partitions whose deleted
//! fraction crossed the configured threshold, reclaiming the dead bytes.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use blob_config::compaction::CompactionConfig;
use blob_dal::IndexStore;
use blob_types::{DiskId, FileSource, Partition, PartitionId, PartitionState, StorageFile};
use blobd_queued_job_processor::{async_trait, JobProcessor};

use crate::cluster::ClusterMembership;
use crate::registry::PartitionRegistry;
use crate::storage::FileStorage;
use crate::writer::DisksToWriters;

/// How long one rewrite may wait for the disk writer to drain the copied
/// entries before the job is declared failed.
const REWRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(600);
const REWRITE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct CompactionService {
    membership: Arc<dyn ClusterMembership>,
    index: Arc<dyn IndexStore>,
    registry: Arc<PartitionRegistry>,
    storage: Arc<FileStorage>,
    writers: DisksToWriters,
    config: CompactionConfig,
    last_scan: Mutex<Option<Instant>>,
}

impl CompactionService {
    pub fn new(
        membership: Arc<dyn ClusterMembership>,
        index: Arc<dyn IndexStore>,
        registry: Arc<PartitionRegistry>,
        storage: Arc<FileStorage>,
        writers: DisksToWriters,
        config: CompactionConfig,
    ) -> Self {
        Self {
            membership,
            index,
            registry,
            storage,
            writers,
            config,
            last_scan: Mutex::new(None),
        }
    }

    /// Whether the partition has accumulated enough dead bytes to be worth
    /// rewriting. Partitions stuck in `Compacting` after a crash qualify
    /// unconditionally so the interrupted rewrite resumes.
    async fn wants_compaction(&self, partition: &Partition) -> anyhow::Result<bool> {
        match partition.state {
            PartitionState::Compacting => return Ok(true),
            PartitionState::Closed => {}
            PartitionState::Active | PartitionState::Deleted => return Ok(false),
        }
        if partition.size == 0 {
            return Ok(false);
        }
        let deleted = self
            .index
            .size_of_deleted(partition.disk, partition.id)
            .await?;
        Ok(deleted as f64 / partition.size as f64 > self.config.deleted_ratio)
    }

    /// Copies the live entries into the disk's current active partition via
    /// the write queue, then destroys the rewritten partition. Interruption
    /// is safe: already-moved entries point at the new partition and the
    /// next run only copies the remainder.
    async fn compact(&self, partition: Partition) -> anyhow::Result<()> {
        let (disk, source) = (partition.disk, partition.id);
        self.registry
            .set_state(disk, source, PartitionState::Compacting)
            .await?;

        let live = self.index.live_list_by_partition(disk, source).await?;
        let queue = self
            .writers
            .get(disk)
            .with_context(|| format!("no writer registered for disk {disk}"))?;

        blobd_logs::info!(
            "Compacting partition {}/{}: rewriting {} live entries",
            disk,
            source,
            live.len()
        );
        for entry in &live {
            let payload = self
                .storage
                .read_range(disk, source, entry.offset, entry.length)
                .await?;
            let file = StorageFile {
                id: entry.id,
                kind: entry.kind,
                source: FileSource::Bytes(payload),
                length: entry.length,
                metadata: entry.metadata.clone(),
                auth_tokens: Vec::new(),
                compaction: true,
            };
            queue.submit(file).await?;
        }

        self.wait_for_rewrite(disk, source).await?;

        match self.storage.remove_partition(disk, source).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // A previous interrupted run already unlinked the file.
            }
            Err(err) => return Err(err.into()),
        }
        self.registry.remove_partition(disk, source).await?;
        blobd_logs::info!("Compacted partition {}/{} away", disk, source);
        Ok(())
    }

    async fn wait_for_rewrite(&self, disk: DiskId, source: PartitionId) -> anyhow::Result<()> {
        let deadline = Instant::now() + REWRITE_DRAIN_TIMEOUT;
        loop {
            let remaining = self.index.live_list_by_partition(disk, source).await?;
            if remaining.is_empty() {
                return Ok(());
            }
            if Instant::now() > deadline {
                anyhow::bail!(
                    "partition {disk}/{source} still holds {} live entries after {:?}",
                    remaining.len(),
                    REWRITE_DRAIN_TIMEOUT
                );
            }
            tokio::time::sleep(REWRITE_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl JobProcessor for CompactionService {
    type Job = Partition;
    type JobId = (DiskId, PartitionId);

    const POLLING_INTERVAL_MS: u64 = 1_000;
    const SERVICE_NAME: &'static str = "compaction";

    async fn get_next_job(&self) -> anyhow::Result<Option<(Self::JobId, Self::Job)>> {
        if !self.membership.is_master() {
            return Ok(None);
        }
        {
            let mut last_scan = self.last_scan.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(last) = *last_scan {
                if last.elapsed() < self.config.check_period() {
                    return Ok(None);
                }
            }
            *last_scan = Some(Instant::now());
        }
        for disk in self.writers.disks() {
            for partition in self.registry.cached_partitions(disk) {
                if self.wants_compaction(&partition).await? {
                    return Ok(Some(((disk, partition.id), partition)));
                }
            }
        }
        Ok(None)
    }

    async fn process_job(
        &self,
        _job_id: &Self::JobId,
        job: Self::Job,
        _started_at: Instant,
    ) -> anyhow::Result<()> {
        self.compact(job).await
    }

    async fn save_failure(&self, job_id: Self::JobId, _started_at: Instant, error: String) {
        let (disk, partition) = job_id;
        blobd_logs::warn!(
            "Compaction of partition {}/{} failed ({}), leaving it for the next scan",
            disk,
            partition,
            error
        );
        if let Err(err) = self
            .registry
            .set_state(disk, partition, PartitionState::Closed)
            .await
        {
            blobd_logs::error!(
                "Could not unwind compaction state of {}/{}: {:?}",
                disk,
                partition,
                err
            );
        }
    }
}
