//! Postgres backends. Queries use the runtime API so the crate builds
//! without a database connection.

use anyhow::Context as _;
use async_trait::async_trait;
use blob_config::database::DatabaseConfig;
use blob_types::{
    BlobId, BlobKind, DiskId, IndexEntry, MerkleTree, Metadata, Partition, PartitionId,
    PartitionState, TempIndexRecord,
};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};

use crate::{DalResult, IndexError, IndexStore, PartitionStore};

async fn connect_pool(config: &DatabaseConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .connect(&config.url)
        .await
        .context("failed to connect to the index database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run index migrations")?;
    Ok(pool)
}

fn storage_err(err: sqlx::Error) -> IndexError {
    IndexError::Storage(err.into())
}

fn entry_from_row(row: &PgRow) -> DalResult<IndexEntry> {
    let metadata: serde_json::Value = row.try_get("metadata").map_err(storage_err)?;
    let metadata: Metadata = serde_json::from_value(metadata)
        .map_err(|err| IndexError::Corrupt(format!("undecodable entry metadata: {err}")))?;
    Ok(IndexEntry {
        id: BlobId(row.try_get::<i64, _>("id").map_err(storage_err)? as u64),
        kind: BlobKind(row.try_get::<i32, _>("kind").map_err(storage_err)?),
        disk: DiskId(row.try_get::<i32, _>("disk").map_err(storage_err)? as u32),
        partition: PartitionId(row.try_get::<i32, _>("partition").map_err(storage_err)? as u32),
        offset: row.try_get::<i64, _>("byte_offset").map_err(storage_err)? as u64,
        length: row.try_get::<i64, _>("length").map_err(storage_err)? as u64,
        crc: row.try_get::<i64, _>("crc").map_err(storage_err)? as u64,
        metadata,
        deleted: row.try_get("deleted").map_err(storage_err)?,
        created_at: row.try_get::<i64, _>("created_at").map_err(storage_err)? as u64,
    })
}

fn metadata_json(metadata: &Metadata) -> DalResult<serde_json::Value> {
    serde_json::to_value(metadata)
        .map_err(|err| IndexError::Storage(anyhow::anyhow!("unencodable metadata: {err}")))
}

#[derive(Debug, Clone)]
pub struct PostgresIndexStore {
    pool: PgPool,
}

impl PostgresIndexStore {
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        Ok(Self {
            pool: connect_pool(config).await?,
        })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IndexStore for PostgresIndexStore {
    async fn add(&self, entry: IndexEntry) -> DalResult<()> {
        let result = sqlx::query(
            "INSERT INTO blob_index \
             (id, kind, disk, partition, byte_offset, length, crc, metadata, deleted, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (id, kind) DO NOTHING",
        )
        .bind(entry.id.0 as i64)
        .bind(entry.kind.0)
        .bind(entry.disk.0 as i32)
        .bind(entry.partition.0 as i32)
        .bind(entry.offset as i64)
        .bind(entry.length as i64)
        .bind(entry.crc as i64)
        .bind(metadata_json(&entry.metadata)?)
        .bind(entry.deleted)
        .bind(entry.created_at as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(IndexError::DuplicateEntry {
                id: entry.id,
                kind: entry.kind,
            });
        }
        Ok(())
    }

    async fn get_by_id(&self, id: BlobId, kind: BlobKind) -> DalResult<Option<IndexEntry>> {
        let row = sqlx::query("SELECT * FROM blob_index WHERE id = $1 AND kind = $2")
            .bind(id.0 as i64)
            .bind(kind.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn list_by_id(&self, id: BlobId) -> DalResult<Vec<IndexEntry>> {
        let rows = sqlx::query("SELECT * FROM blob_index WHERE id = $1 ORDER BY kind")
            .bind(id.0 as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn list_by_partition(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> DalResult<Vec<IndexEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM blob_index WHERE disk = $1 AND partition = $2 ORDER BY id, kind",
        )
        .bind(disk.0 as i32)
        .bind(partition.0 as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn live_list_by_partition(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> DalResult<Vec<IndexEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM blob_index \
             WHERE disk = $1 AND partition = $2 AND deleted = FALSE \
             ORDER BY id, kind",
        )
        .bind(disk.0 as i32)
        .bind(partition.0 as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn min_max_range(
        &self,
        disk: DiskId,
        partition: PartitionId,
    ) -> DalResult<Option<(BlobId, BlobId)>> {
        let row = sqlx::query(
            "SELECT MIN(id) AS min_id, MAX(id) AS max_id FROM blob_index \
             WHERE disk = $1 AND partition = $2",
        )
        .bind(disk.0 as i32)
        .bind(partition.0 as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        let min: Option<i64> = row.try_get("min_id").map_err(storage_err)?;
        let max: Option<i64> = row.try_get("max_id").map_err(storage_err)?;
        Ok(min.zip(max).map(|(min, max)| (BlobId(min as u64), BlobId(max as u64))))
    }

    async fn size_of_deleted(&self, disk: DiskId, partition: PartitionId) -> DalResult<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(length), 0) AS deleted_bytes FROM blob_index \
             WHERE disk = $1 AND partition = $2 AND deleted = TRUE",
        )
        .bind(disk.0 as i32)
        .bind(partition.0 as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        let bytes: i64 = row.try_get("deleted_bytes").map_err(storage_err)?;
        Ok(bytes as u64)
    }

    async fn delete(&self, id: BlobId, kind: BlobKind) -> DalResult<()> {
        sqlx::query("UPDATE blob_index SET deleted = TRUE WHERE id = $1 AND kind = $2")
            .bind(id.0 as i64)
            .bind(kind.0)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn delete_by_id(&self, id: BlobId) -> DalResult<u64> {
        let result =
            sqlx::query("UPDATE blob_index SET deleted = TRUE WHERE id = $1 AND deleted = FALSE")
                .bind(id.0 as i64)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn restore(&self, entry: IndexEntry) -> DalResult<()> {
        sqlx::query(
            "INSERT INTO blob_index \
             (id, kind, disk, partition, byte_offset, length, crc, metadata, deleted, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (id, kind) DO UPDATE SET \
             disk = excluded.disk, partition = excluded.partition, \
             byte_offset = excluded.byte_offset, length = excluded.length, \
             crc = excluded.crc, metadata = excluded.metadata, \
             deleted = excluded.deleted, created_at = excluded.created_at",
        )
        .bind(entry.id.0 as i64)
        .bind(entry.kind.0)
        .bind(entry.disk.0 as i32)
        .bind(entry.partition.0 as i32)
        .bind(entry.offset as i64)
        .bind(entry.length as i64)
        .bind(entry.crc as i64)
        .bind(metadata_json(&entry.metadata)?)
        .bind(entry.deleted)
        .bind(entry.created_at as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn add_temp_index(&self, record: TempIndexRecord) -> DalResult<()> {
        let file_path = record
            .file_path
            .as_ref()
            .map(|path| path.to_string_lossy().into_owned());
        sqlx::query(
            "INSERT INTO temp_index (id, kind, file_path, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id, kind) DO UPDATE SET \
             file_path = excluded.file_path, metadata = excluded.metadata, \
             created_at = excluded.created_at",
        )
        .bind(record.id.0 as i64)
        .bind(record.kind.0)
        .bind(file_path)
        .bind(metadata_json(&record.metadata)?)
        .bind(record.created_at as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn delete_temp_index(&self, id: BlobId, kind: BlobKind) -> DalResult<()> {
        sqlx::query("DELETE FROM temp_index WHERE id = $1 AND kind = $2")
            .bind(id.0 as i64)
            .bind(kind.0)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_temp_index_list(&self, limit: usize) -> DalResult<Vec<TempIndexRecord>> {
        let rows = sqlx::query("SELECT * FROM temp_index ORDER BY created_at LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter()
            .map(|row| {
                let metadata: serde_json::Value = row.try_get("metadata").map_err(storage_err)?;
                let metadata: Metadata = serde_json::from_value(metadata).map_err(|err| {
                    IndexError::Corrupt(format!("undecodable temp-index metadata: {err}"))
                })?;
                let file_path: Option<String> = row.try_get("file_path").map_err(storage_err)?;
                Ok(TempIndexRecord {
                    id: BlobId(row.try_get::<i64, _>("id").map_err(storage_err)? as u64),
                    kind: BlobKind(row.try_get::<i32, _>("kind").map_err(storage_err)?),
                    file_path: file_path.map(Into::into),
                    metadata,
                    created_at: row.try_get::<i64, _>("created_at").map_err(storage_err)? as u64,
                })
            })
            .collect()
    }

    async fn clear(&self) -> DalResult<()> {
        sqlx::query("TRUNCATE blob_index, temp_index")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

fn state_to_str(state: PartitionState) -> &'static str {
    match state {
        PartitionState::Active => "active",
        PartitionState::Closed => "closed",
        PartitionState::Compacting => "compacting",
        PartitionState::Deleted => "deleted",
    }
}

fn state_from_str(state: &str) -> DalResult<PartitionState> {
    match state {
        "active" => Ok(PartitionState::Active),
        "closed" => Ok(PartitionState::Closed),
        "compacting" => Ok(PartitionState::Compacting),
        "deleted" => Ok(PartitionState::Deleted),
        other => Err(IndexError::Corrupt(format!(
            "unknown partition state `{other}`"
        ))),
    }
}

fn partition_from_row(row: &PgRow) -> DalResult<Partition> {
    let state: String = row.try_get("state").map_err(storage_err)?;
    Ok(Partition {
        disk: DiskId(row.try_get::<i32, _>("disk").map_err(storage_err)? as u32),
        id: PartitionId(row.try_get::<i32, _>("id").map_err(storage_err)? as u32),
        state: state_from_str(&state)?,
        crc: row.try_get::<i64, _>("crc").map_err(storage_err)? as u64,
        size: row.try_get::<i64, _>("size").map_err(storage_err)? as u64,
    })
}

#[derive(Debug, Clone)]
pub struct PostgresPartitionStore {
    pool: PgPool,
}

impl PostgresPartitionStore {
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        Ok(Self {
            pool: connect_pool(config).await?,
        })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PartitionStore for PostgresPartitionStore {
    async fn add_partition(&self, partition: Partition) -> DalResult<()> {
        let result = sqlx::query(
            "INSERT INTO partitions (disk, id, state, crc, size) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (disk, id) DO NOTHING",
        )
        .bind(partition.disk.0 as i32)
        .bind(partition.id.0 as i32)
        .bind(state_to_str(partition.state))
        .bind(partition.crc as i64)
        .bind(partition.size as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(IndexError::Corrupt(format!(
                "partition {}/{} already registered",
                partition.disk, partition.id
            )));
        }
        Ok(())
    }

    async fn get_partitions(&self, disk: DiskId) -> DalResult<Vec<Partition>> {
        let rows = sqlx::query("SELECT * FROM partitions WHERE disk = $1 ORDER BY id")
            .bind(disk.0 as i32)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(partition_from_row).collect()
    }

    async fn get_partition(&self, disk: DiskId, id: PartitionId) -> DalResult<Option<Partition>> {
        let row = sqlx::query("SELECT * FROM partitions WHERE disk = $1 AND id = $2")
            .bind(disk.0 as i32)
            .bind(id.0 as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(partition_from_row).transpose()
    }

    async fn update_partition(&self, partition: &Partition) -> DalResult<()> {
        sqlx::query(
            "UPDATE partitions SET state = $3, crc = $4, size = $5 \
             WHERE disk = $1 AND id = $2",
        )
        .bind(partition.disk.0 as i32)
        .bind(partition.id.0 as i32)
        .bind(state_to_str(partition.state))
        .bind(partition.crc as i64)
        .bind(partition.size as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn update_tree(&self, disk: DiskId, id: PartitionId, tree: &MerkleTree) -> DalResult<()> {
        let bytes = bincode::serialize(tree)
            .map_err(|err| IndexError::Storage(anyhow::anyhow!("unencodable tree: {err}")))?;
        sqlx::query("UPDATE partitions SET tree = $3 WHERE disk = $1 AND id = $2")
            .bind(disk.0 as i32)
            .bind(id.0 as i32)
            .bind(bytes)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_tree(&self, disk: DiskId, id: PartitionId) -> DalResult<Option<MerkleTree>> {
        let row = sqlx::query("SELECT tree FROM partitions WHERE disk = $1 AND id = $2")
            .bind(disk.0 as i32)
            .bind(id.0 as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let bytes: Option<Vec<u8>> = row.try_get("tree").map_err(storage_err)?;
        bytes
            .map(|bytes| {
                bincode::deserialize(&bytes)
                    .map_err(|err| IndexError::Corrupt(format!("undecodable tree: {err}")))
            })
            .transpose()
    }

    async fn delete_partition(&self, disk: DiskId, id: PartitionId) -> DalResult<()> {
        sqlx::query("DELETE FROM partitions WHERE disk = $1 AND id = $2")
            .bind(disk.0 as i32)
            .bind(id.0 as i32)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}
