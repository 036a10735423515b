//! Partition files on local disks: pure append logs of raw payload bytes.
//! Offsets and lengths live in the index, never in the file itself.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::PathBuf;

use blob_types::{DiskId, PartitionId};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const PARTITION_FILE_EXT: &str = "blob";

/// Maps disk ordinals to their root directories.
#[derive(Debug, Clone)]
pub struct DiskLayout {
    roots: HashMap<DiskId, PathBuf>,
}

impl DiskLayout {
    /// Disk ids are assigned by position in the configured root list.
    pub fn from_roots<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let roots = roots
            .into_iter()
            .enumerate()
            .map(|(ordinal, root)| (DiskId(ordinal as u32), root.into()))
            .collect();
        Self { roots }
    }

    pub fn disks(&self) -> Vec<DiskId> {
        let mut disks: Vec<_> = self.roots.keys().copied().collect();
        disks.sort_unstable();
        disks
    }

    pub fn root(&self, disk: DiskId) -> Option<&PathBuf> {
        self.roots.get(&disk)
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Appender owning the active partition's file handle. Exactly one exists
/// per disk at any time, inside that disk's writer.
#[derive(Debug)]
pub struct PartitionAppender {
    file: File,
    end_offset: u64,
    fsync_on_append: bool,
}

impl PartitionAppender {
    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    /// Appends `bytes` at the current end of the partition, returning the
    /// offset the payload starts at.
    pub async fn append(&mut self, bytes: &[u8]) -> io::Result<u64> {
        let offset = self.end_offset;
        self.file.write_all(bytes).await?;
        if self.fsync_on_append {
            self.file.sync_data().await?;
        }
        self.end_offset += bytes.len() as u64;
        Ok(offset)
    }
}

/// Disk-level file operations: appending through [`PartitionAppender`],
/// positioned writes for the replication path, reads for serving and
/// repair, and startup discovery of partition files.
#[derive(Debug)]
pub struct FileStorage {
    layout: DiskLayout,
    fsync_on_append: bool,
}

impl FileStorage {
    pub async fn init(layout: DiskLayout, fsync_on_append: bool) -> anyhow::Result<Self> {
        for disk in layout.disks() {
            let root = layout.root(disk).expect("disk listed but no root");
            fs::create_dir_all(root).await?;
        }
        Ok(Self {
            layout,
            fsync_on_append,
        })
    }

    pub fn layout(&self) -> &DiskLayout {
        &self.layout
    }

    fn partition_path(&self, disk: DiskId, partition: PartitionId) -> io::Result<PathBuf> {
        let root = self.layout.root(disk).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("unknown disk {disk}"))
        })?;
        Ok(root.join(format!("{partition}.{PARTITION_FILE_EXT}")))
    }

    pub async fn is_writable(&self, disk: DiskId) -> bool {
        let Some(root) = self.layout.root(disk) else {
            return false;
        };
        match fs::metadata(root).await {
            Ok(metadata) => metadata.is_dir() && !metadata.permissions().readonly(),
            Err(_) => false,
        }
    }

    pub async fn open_appender(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> io::Result<PartitionAppender> {
        let path = self.partition_path(disk, partition)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let end_offset = file.metadata().await?.len();
        Ok(PartitionAppender {
            file,
            end_offset,
            fsync_on_append: self.fsync_on_append,
        })
    }

    /// Writes `bytes` at an explicit offset. Replication applies payloads
    /// at the offsets the master assigned, so out-of-order delivery still
    /// converges to an identical file.
    pub async fn write_at(
        &self,
        disk: DiskId,
        partition: PartitionId,
        offset: u64,
        bytes: &[u8],
    ) -> io::Result<()> {
        let path = self.partition_path(disk, partition)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(bytes).await?;
        if self.fsync_on_append {
            file.sync_data().await?;
        }
        Ok(())
    }

    pub async fn read_range(
        &self,
        disk: DiskId,
        partition: PartitionId,
        offset: u64,
        length: u64,
    ) -> io::Result<Vec<u8>> {
        let path = self.partition_path(disk, partition)?;
        let mut file = File::open(&path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buffer = vec![0; length as usize];
        file.read_exact(&mut buffer).await?;
        Ok(buffer)
    }

    pub async fn partition_size(&self, disk: DiskId, partition: PartitionId) -> io::Result<u64> {
        let path = self.partition_path(disk, partition)?;
        Ok(fs::metadata(&path).await?.len())
    }

    pub async fn remove_partition(&self, disk: DiskId, partition: PartitionId) -> io::Result<()> {
        let path = self.partition_path(disk, partition)?;
        fs::remove_file(&path).await
    }

    /// Discovers partition files under a disk root, `<id>.blob` each.
    /// Files with unparseable names are skipped with a warning.
    pub async fn list_partition_files(&self, disk: DiskId) -> io::Result<Vec<PartitionId>> {
        let root = self.layout.root(disk).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("unknown disk {disk}"))
        })?;
        let mut entries = fs::read_dir(root).await?;
        let mut partitions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(PARTITION_FILE_EXT) {
                continue;
            }
            match path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u32>().ok())
            {
                Some(id) => partitions.push(PartitionId(id)),
                None => {
                    blobd_logs::warn!("Skipping unrecognized file {path:?} on disk {disk}");
                }
            }
        }
        partitions.sort_unstable();
        Ok(partitions)
    }
}
