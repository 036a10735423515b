use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use blob_types::{
    BlobId, BlobKind, DiskId, IndexEntry, Metadata, PartitionId, PartitionState, ReplicationFile,
    StorageFile, TempIndexRecord,
};
use blobd_queued_job_processor::JobProcessor;
use tempfile::TempDir;
use tokio::sync::watch;

use crate::compaction::CompactionService;
use crate::testonly::{
    start_node, start_node_with, wait_until, FakeMembership, FakeTransport, TestNode,
};

const MASTER: blob_types::NodeId = blob_types::NodeId(1);
const SLAVE: blob_types::NodeId = blob_types::NodeId(2);
const DISK: DiskId = DiskId(0);

async fn master_only(transport: &Arc<FakeTransport>) -> TestNode {
    start_node(MASTER, MASTER, vec![MASTER], Arc::clone(transport), |_| {}).await
}

async fn put_and_wait(node: &TestNode, id: u64, payload: Vec<u8>) {
    let file = StorageFile::from_bytes(BlobId(id), BlobKind::ORIGINAL, payload);
    node.node.store.put(file).await.unwrap();
    wait_until("the blob is indexed", || async {
        node.index
            .get_by_id(BlobId(id), BlobKind::ORIGINAL)
            .await
            .unwrap()
            .is_some()
    })
    .await;
}

#[tokio::test]
async fn writes_are_appended_in_submission_order() {
    let transport = Arc::new(FakeTransport::default());
    let master = master_only(&transport).await;

    for id in 1..=5_u64 {
        let file = StorageFile::from_bytes(BlobId(id), BlobKind::ORIGINAL, vec![id as u8; 64]);
        master.node.store.put(file).await.unwrap();
    }
    wait_until("all five blobs are indexed", || async {
        master.index.get_by_id(BlobId(5), BlobKind::ORIGINAL).await.unwrap().is_some()
    })
    .await;

    let mut offsets = Vec::new();
    for id in 1..=5_u64 {
        let entry = master
            .index
            .get_by_id(BlobId(id), BlobKind::ORIGINAL)
            .await
            .unwrap()
            .unwrap();
        offsets.push(entry.offset);
    }
    let mut sorted = offsets.clone();
    sorted.sort_unstable();
    assert_eq!(offsets, sorted, "appends must land in submission order");
}

#[tokio::test]
async fn fresh_writes_replicate_to_the_slave() {
    let transport = Arc::new(FakeTransport::default());
    let master = start_node(MASTER, MASTER, vec![MASTER, SLAVE], Arc::clone(&transport), |_| {}).await;
    let slave = start_node(SLAVE, MASTER, vec![MASTER, SLAVE], Arc::clone(&transport), |_| {}).await;

    put_and_wait(&master, 7, b"payload".to_vec()).await;
    wait_until("the slave applied the write", || async {
        slave
            .index
            .get_by_id(BlobId(7), BlobKind::ORIGINAL)
            .await
            .unwrap()
            .is_some()
    })
    .await;

    let (entry, payload) = slave
        .node
        .store
        .get(BlobId(7), BlobKind::ORIGINAL)
        .await
        .unwrap()
        .expect("blob must be readable on the slave");
    assert_eq!(payload, b"payload");
    assert_eq!(entry.partition, PartitionId(0));
    assert_eq!(transport.replications(), 1, "only the slave gets a copy");
}

#[tokio::test]
async fn replication_is_idempotent() {
    let transport = Arc::new(FakeTransport::default());
    let slave = start_node(SLAVE, MASTER, vec![MASTER, SLAVE], Arc::clone(&transport), |_| {}).await;

    let payload = b"same bytes".to_vec();
    let entry = IndexEntry {
        id: BlobId(7),
        kind: BlobKind::ORIGINAL,
        disk: DISK,
        partition: PartitionId(0),
        offset: 0,
        length: payload.len() as u64,
        crc: blob_utils::crc::crc_of(&payload),
        metadata: Metadata::new(),
        deleted: false,
        created_at: 1,
    };
    let file = ReplicationFile::new(entry, payload.clone());

    slave.node.replication_queue.submit(file.clone()).await.unwrap();
    slave.node.replication_queue.submit(file).await.unwrap();

    wait_until("the first delivery is applied", || async {
        slave
            .index
            .get_by_id(BlobId(7), BlobKind::ORIGINAL)
            .await
            .unwrap()
            .is_some()
    })
    .await;
    wait_until("the queue is drained", || async {
        slave.node.replication_queue.is_drained()
    })
    .await;

    let listed = slave.index.list_by_id(BlobId(7)).await.unwrap();
    assert_eq!(listed.len(), 1, "duplicate delivery must be swallowed");
    let stored = slave
        .partitions
        .get_partition(DISK, PartitionId(0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        stored.size,
        payload.len() as u64,
        "payload must be appended exactly once"
    );
}

#[tokio::test]
async fn active_partition_repair_requests_one_tree_and_applies_nothing() {
    let transport = Arc::new(FakeTransport::default());
    let master = start_node(MASTER, MASTER, vec![MASTER, SLAVE], Arc::clone(&transport), |_| {}).await;
    let slave = start_node(SLAVE, MASTER, vec![MASTER, SLAVE], Arc::clone(&transport), |_| {}).await;

    put_and_wait(&master, 1, vec![9; 128]).await;
    wait_until("the slave caught up", || async {
        slave
            .index
            .get_by_id(BlobId(1), BlobKind::ORIGINAL)
            .await
            .unwrap()
            .is_some()
    })
    .await;

    transport.reset_counters();
    slave.node.repair.repair_disk(DISK).await.unwrap();

    assert_eq!(transport.tree_requests(), 1);
    assert_eq!(transport.difference_requests(), 0);
    assert!(transport.fetches().is_empty(), "active partitions are not materially repaired");
    assert!(slave.node.repair.diverging_partitions().is_empty());
}

#[tokio::test]
async fn diverging_active_partition_is_marked_and_deferred() {
    let transport = Arc::new(FakeTransport::default());
    let master = start_node(MASTER, MASTER, vec![MASTER, SLAVE], Arc::clone(&transport), |_| {}).await;
    let slave = start_node(SLAVE, MASTER, vec![MASTER, SLAVE], Arc::clone(&transport), |_| {}).await;

    // The slave misses this write entirely.
    transport.set_unavailable(SLAVE, true);
    put_and_wait(&master, 1, vec![1; 64]).await;
    transport.set_unavailable(SLAVE, false);
    // A later write makes the slave aware of partition 0 at all.
    put_and_wait(&master, 2, vec![2; 64]).await;
    wait_until("the slave holds the later write", || async {
        slave
            .index
            .get_by_id(BlobId(2), BlobKind::ORIGINAL)
            .await
            .unwrap()
            .is_some()
    })
    .await;

    transport.reset_counters();
    slave.node.repair.repair_disk(DISK).await.unwrap();

    assert!(transport.fetches().is_empty(), "repair of the active partition is deferred");
    assert_eq!(
        slave.node.repair.diverging_partitions(),
        vec![(DISK, PartitionId(0))]
    );
    // The missing write is still missing; rotation will flush it out.
    assert!(slave
        .index
        .get_by_id(BlobId(1), BlobKind::ORIGINAL)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn closed_partition_divergence_is_pulled_from_the_master() {
    let transport = Arc::new(FakeTransport::default());
    let configure = |config: &mut blob_config::storage::StorageConfig| {
        config.max_partition_size = 1024;
    };
    let master = start_node(MASTER, MASTER, vec![MASTER, SLAVE], Arc::clone(&transport), configure).await;
    let slave = start_node(SLAVE, MASTER, vec![MASTER, SLAVE], Arc::clone(&transport), configure).await;

    // Offsets in partition 0: blob 1 at [0, 42), blob 2 at [42, 46).
    put_and_wait(&master, 1, vec![1; 42]).await;
    transport.set_unavailable(SLAVE, true);
    put_and_wait(&master, 2, vec![2; 4]).await;
    transport.set_unavailable(SLAVE, false);
    // Crossing the size bound rotates partition 0 away; the slave freezes
    // its copy once it sees traffic for partition 1.
    put_and_wait(&master, 3, vec![3; 1000]).await;
    wait_until("the slave received the rotated write", || async {
        slave
            .index
            .get_by_id(BlobId(3), BlobKind::ORIGINAL)
            .await
            .unwrap()
            .is_some()
    })
    .await;

    assert_eq!(
        master
            .partitions
            .get_partition(DISK, PartitionId(0))
            .await
            .unwrap()
            .unwrap()
            .state,
        PartitionState::Closed
    );

    transport.reset_counters();
    slave.node.repair.repair_disk(DISK).await.unwrap();

    let fetches = transport.fetches();
    assert_eq!(fetches.len(), 1, "exactly one divergent partition gets pulled");
    let (disk, partition, ranges) = &fetches[0];
    assert_eq!((*disk, *partition), (DISK, PartitionId(0)));
    assert!(
        ranges.iter().any(|range| range.contains(42)),
        "requested ranges {ranges:?} must cover the missing offset"
    );

    let (_, payload) = slave
        .node
        .store
        .get(BlobId(2), BlobKind::ORIGINAL)
        .await
        .unwrap()
        .expect("repair must deliver the missing blob");
    assert_eq!(payload, vec![2; 4]);
    assert!(slave.node.repair.diverging_partitions().is_empty());
    assert!(
        slave
            .partitions
            .get_tree(DISK, PartitionId(0))
            .await
            .unwrap()
            .is_some(),
        "the refreshed tree must be persisted"
    );
}

#[tokio::test]
async fn rotation_caps_partition_size() {
    let transport = Arc::new(FakeTransport::default());
    let master = start_node(MASTER, MASTER, vec![MASTER], Arc::clone(&transport), |config| {
        config.max_partition_size = 1024;
    })
    .await;

    for id in 1..=10_u64 {
        put_and_wait(&master, id, vec![id as u8; 100]).await;
    }
    put_and_wait(&master, 11, vec![11; 30]).await;

    let partition_0 = master.index.list_by_partition(DISK, PartitionId(0)).await.unwrap();
    let partition_1 = master.index.list_by_partition(DISK, PartitionId(1)).await.unwrap();

    let bytes_in_0: u64 = partition_0.iter().map(|entry| entry.length).sum();
    assert!(bytes_in_0 <= 1024, "partition 0 holds {bytes_in_0} bytes");
    assert_eq!(partition_0.len(), 10);
    assert_eq!(partition_1.len(), 1);
    assert_eq!(partition_1[0].id, BlobId(11));

    let row = master
        .partitions
        .get_partition(DISK, PartitionId(0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.state, PartitionState::Closed);
    assert_eq!(row.size, 1000);
}

#[tokio::test]
async fn compaction_moves_live_entries_and_destroys_the_partition() {
    let transport = Arc::new(FakeTransport::default());
    let master = start_node(MASTER, MASTER, vec![MASTER], Arc::clone(&transport), |config| {
        // Exactly ten 100-byte blobs fill and close partition 0.
        config.max_partition_size = 1000;
    })
    .await;

    for id in 1..=10_u64 {
        put_and_wait(&master, id, vec![id as u8; 100]).await;
    }
    for id in 1..=6_u64 {
        master.node.store.delete(BlobId(id)).await.unwrap();
    }

    let membership = Arc::new(FakeMembership::new(MASTER, MASTER, vec![MASTER]));
    let compaction = CompactionService::new(
        membership,
        Arc::clone(&master.index),
        Arc::clone(&master.node.registry),
        Arc::clone(&master.node.storage),
        master.node.writers.clone(),
        blob_config::compaction::CompactionConfig {
            deleted_ratio: 0.5,
            check_period_ms: 0,
        },
    );
    let (_stop_sender, stop_receiver) = watch::channel(false);
    compaction.run(stop_receiver, Some(1)).await.unwrap();

    for id in 7..=10_u64 {
        let entry = master
            .index
            .get_by_id(BlobId(id), BlobKind::ORIGINAL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.partition, PartitionId(1), "blob {id} must move");
        let (_, payload) = master
            .node
            .store
            .get(BlobId(id), BlobKind::ORIGINAL)
            .await
            .unwrap()
            .expect("moved blob must stay readable");
        assert_eq!(payload, vec![id as u8; 100]);
    }
    assert!(
        master
            .partitions
            .get_partition(DISK, PartitionId(0))
            .await
            .unwrap()
            .is_none(),
        "the compacted partition row must be gone"
    );
    assert!(
        master
            .node
            .storage
            .partition_size(DISK, PartitionId(0))
            .await
            .is_err(),
        "the compacted partition file must be removed"
    );
}

#[tokio::test]
async fn interrupted_writes_are_replayed_from_the_temp_index() {
    let transport = Arc::new(FakeTransport::default());
    let dir = TempDir::new().unwrap();
    let factory = blob_dal::StoreFactory::mock();
    let index = factory.create_index_store().await.unwrap();
    let partitions = factory.create_partition_store().await.unwrap();

    let spool = dir.path().join("upload-17.spool");
    tokio::fs::write(&spool, b"recovered payload").await.unwrap();
    index
        .add_temp_index(TempIndexRecord {
            id: BlobId(17),
            kind: BlobKind::ORIGINAL,
            file_path: Some(spool),
            metadata: Metadata::new(),
            created_at: 1,
        })
        .await
        .unwrap();

    let master = start_node_with(
        MASTER,
        MASTER,
        vec![MASTER],
        Arc::clone(&transport),
        |_| {},
        dir,
        index,
        partitions,
    )
    .await;

    wait_until("the interrupted write is re-applied", || async {
        master
            .index
            .get_by_id(BlobId(17), BlobKind::ORIGINAL)
            .await
            .unwrap()
            .is_some()
    })
    .await;
    wait_until("its temp row is purged", || async {
        master.index.get_temp_index_list(10).await.unwrap().is_empty()
    })
    .await;

    let (_, payload) = master
        .node
        .store
        .get(BlobId(17), BlobKind::ORIGINAL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload, b"recovered payload");
}

#[tokio::test]
async fn completed_writes_only_lose_their_temp_rows_on_replay() {
    let transport = Arc::new(FakeTransport::default());
    let dir = TempDir::new().unwrap();
    let factory = blob_dal::StoreFactory::mock();
    let index = factory.create_index_store().await.unwrap();
    let partitions = factory.create_partition_store().await.unwrap();

    // The append and the index add survived the crash; only the temp-row
    // cleanup was lost.
    let entry = IndexEntry {
        id: BlobId(4),
        kind: BlobKind::ORIGINAL,
        disk: DISK,
        partition: PartitionId(0),
        offset: 0,
        length: 3,
        crc: 0,
        metadata: Metadata::new(),
        deleted: false,
        created_at: 1,
    };
    index.add(entry.clone()).await.unwrap();
    index
        .add_temp_index(TempIndexRecord {
            id: BlobId(4),
            kind: BlobKind::ORIGINAL,
            file_path: None,
            metadata: Metadata::new(),
            created_at: 1,
        })
        .await
        .unwrap();

    let master = start_node_with(
        MASTER,
        MASTER,
        vec![MASTER],
        Arc::clone(&transport),
        |_| {},
        dir,
        index,
        partitions,
    )
    .await;

    wait_until("the stale temp row disappears", || async {
        master.index.get_temp_index_list(10).await.unwrap().is_empty()
    })
    .await;
    let unchanged = master
        .index
        .get_by_id(BlobId(4), BlobKind::ORIGINAL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unchanged, entry, "no duplicate may be appended on replay");
}

#[tokio::test]
async fn slaves_discard_client_writes() {
    let transport = Arc::new(FakeTransport::default());
    let slave = start_node(SLAVE, MASTER, vec![MASTER, SLAVE], Arc::clone(&transport), |_| {}).await;

    let file = StorageFile::from_bytes(BlobId(1), BlobKind::ORIGINAL, vec![0; 16]);
    slave.node.store.put(file).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_matches!(
        slave.index.get_by_id(BlobId(1), BlobKind::ORIGINAL).await.unwrap(),
        None,
        "a slave must never index a client write"
    );
}

#[tokio::test]
async fn repair_skips_partitions_while_the_master_is_unreachable() {
    let transport = Arc::new(FakeTransport::default());
    let master = start_node(MASTER, MASTER, vec![MASTER, SLAVE], Arc::clone(&transport), |_| {}).await;
    let slave = start_node(SLAVE, MASTER, vec![MASTER, SLAVE], Arc::clone(&transport), |_| {}).await;

    put_and_wait(&master, 1, vec![5; 32]).await;
    wait_until("the slave caught up", || async {
        slave
            .index
            .get_by_id(BlobId(1), BlobKind::ORIGINAL)
            .await
            .unwrap()
            .is_some()
    })
    .await;

    transport.set_unavailable(MASTER, true);
    transport.reset_counters();
    slave.node.repair.repair_disk(DISK).await.unwrap();
    assert!(transport.fetches().is_empty());
}

#[tokio::test]
async fn stop_drains_queues_before_joining_tasks() {
    let transport = Arc::new(FakeTransport::default());
    let master = master_only(&transport).await;

    let file = StorageFile::from_bytes(BlobId(9), BlobKind::ORIGINAL, vec![1; 256]);
    master.node.store.put(file).await.unwrap();

    let index = Arc::clone(&master.index);
    master.node.stop().await;

    let entry = index
        .get_by_id(BlobId(9), BlobKind::ORIGINAL)
        .await
        .unwrap();
    assert!(entry.is_some(), "queued writes must land before shutdown");
}

#[tokio::test]
async fn registry_allocates_dense_partition_ids() {
    let factory = blob_dal::StoreFactory::mock();
    let index = factory.create_index_store().await.unwrap();
    let partitions = factory.create_partition_store().await.unwrap();
    let registry = crate::registry::PartitionRegistry::new(partitions, index, 1024, 4);

    registry.load_disk(DISK).await.unwrap();
    let first = registry.active_partition(DISK).await.unwrap();
    assert_eq!(first.id, PartitionId(0));

    let (closed, fresh) = registry.rotate(DISK).await.unwrap();
    assert_eq!(closed.id, PartitionId(0));
    assert_eq!(closed.state, PartitionState::Closed);
    assert_eq!(fresh.id, PartitionId(1));

    let active = registry.active_partition(DISK).await.unwrap();
    assert_eq!(active.id, PartitionId(1));
}
