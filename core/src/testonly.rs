//! Test doubles for the cluster collaborators plus node-assembly helpers
//! shared by the integration tests.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use blob_config::{
    cluster::ClusterConfig, compaction::CompactionConfig, repair::RepairConfig,
    storage::StorageConfig,
};
use blob_dal::{IndexStore, PartitionStore, StoreFactory};
use blob_types::{
    DifferenceInfo, DiskId, MerkleTreeInfo, NodeId, OffsetRange, PartitionId, ReplicationFile,
};
use tempfile::TempDir;

use crate::cluster::{ClusterError, ClusterMembership, ClusterTransport};
use crate::replication::ReplicationQueueHandle;
use crate::repair::RepairEngine;
use crate::{initialize_components, Node};

#[derive(Debug)]
pub(crate) struct FakeMembership {
    self_node: NodeId,
    master: NodeId,
    peers: Vec<NodeId>,
}

impl FakeMembership {
    pub fn new(self_node: NodeId, master: NodeId, peers: Vec<NodeId>) -> Self {
        Self {
            self_node,
            master,
            peers,
        }
    }
}

impl ClusterMembership for FakeMembership {
    fn self_node(&self) -> NodeId {
        self.self_node
    }

    fn master(&self) -> Option<NodeId> {
        Some(self.master)
    }

    fn peers(&self) -> Vec<NodeId> {
        self.peers.clone()
    }
}

/// Endpoint of one fake cluster node: its repair engine (serving the
/// request/response RPCs) and its inbound replication queue.
#[derive(Debug, Clone)]
pub(crate) struct FakeEndpoint {
    pub repair: Arc<RepairEngine>,
    pub replication: ReplicationQueueHandle,
}

/// In-process transport routing RPCs between registered endpoints, with
/// call counters for assertions and per-peer unavailability injection.
#[derive(Debug, Default)]
pub(crate) struct FakeTransport {
    endpoints: Mutex<HashMap<NodeId, FakeEndpoint>>,
    unavailable: Mutex<HashSet<NodeId>>,
    tree_requests: AtomicUsize,
    difference_requests: AtomicUsize,
    replications: AtomicUsize,
    fetches: Mutex<Vec<(DiskId, PartitionId, Vec<OffsetRange>)>>,
}

impl FakeTransport {
    pub fn register(&self, node: NodeId, endpoint: FakeEndpoint) {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node, endpoint);
    }

    pub fn set_unavailable(&self, node: NodeId, unavailable: bool) {
        let mut set = self
            .unavailable
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if unavailable {
            set.insert(node);
        } else {
            set.remove(&node);
        }
    }

    pub fn tree_requests(&self) -> usize {
        self.tree_requests.load(Ordering::SeqCst)
    }

    pub fn difference_requests(&self) -> usize {
        self.difference_requests.load(Ordering::SeqCst)
    }

    pub fn replications(&self) -> usize {
        self.replications.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> Vec<(DiskId, PartitionId, Vec<OffsetRange>)> {
        self.fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset_counters(&self) {
        self.tree_requests.store(0, Ordering::SeqCst);
        self.difference_requests.store(0, Ordering::SeqCst);
        self.replications.store(0, Ordering::SeqCst);
        self.fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn endpoint(&self, peer: NodeId) -> Result<FakeEndpoint, ClusterError> {
        if self
            .unavailable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&peer)
        {
            return Err(ClusterError::PeerUnavailable(
                peer,
                "injected outage".to_owned(),
            ));
        }
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer)
            .cloned()
            .ok_or_else(|| ClusterError::PeerUnavailable(peer, "not registered".to_owned()))
    }
}

#[async_trait]
impl ClusterTransport for FakeTransport {
    async fn send_replication(
        &self,
        peer: NodeId,
        file: ReplicationFile,
    ) -> Result<(), ClusterError> {
        let endpoint = self.endpoint(peer)?;
        self.replications.fetch_add(1, Ordering::SeqCst);
        endpoint
            .replication
            .submit(file)
            .await
            .map_err(ClusterError::Transport)
    }

    async fn get_merkle_tree_info(
        &self,
        peer: NodeId,
        disk: DiskId,
        partition: PartitionId,
    ) -> Result<MerkleTreeInfo, ClusterError> {
        let endpoint = self.endpoint(peer)?;
        self.tree_requests.fetch_add(1, Ordering::SeqCst);
        endpoint
            .repair
            .merkle_tree_info(disk, partition)
            .await
            .map_err(ClusterError::Transport)
    }

    async fn get_difference(
        &self,
        peer: NodeId,
        disk: DiskId,
        partition: PartitionId,
    ) -> Result<DifferenceInfo, ClusterError> {
        let endpoint = self.endpoint(peer)?;
        self.difference_requests.fetch_add(1, Ordering::SeqCst);
        endpoint
            .repair
            .difference(disk, partition)
            .await
            .map_err(ClusterError::Transport)
    }

    async fn fetch_range(
        &self,
        peer: NodeId,
        disk: DiskId,
        partition: PartitionId,
        ranges: &[OffsetRange],
    ) -> Result<Vec<ReplicationFile>, ClusterError> {
        let endpoint = self.endpoint(peer)?;
        self.fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((disk, partition, ranges.to_vec()));
        endpoint
            .repair
            .fetch_range(disk, partition, ranges)
            .await
            .map_err(ClusterError::Transport)
    }
}

/// One assembled node backed by in-memory stores and a temp directory.
#[derive(Debug)]
pub(crate) struct TestNode {
    pub node: Node,
    pub index: Arc<dyn IndexStore>,
    pub partitions: Arc<dyn PartitionStore>,
    _dir: TempDir,
}

pub(crate) fn test_storage_config(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        disk_roots: vec![dir.path().join("disk0").to_string_lossy().into_owned()],
        writer_task_start_delay_ms: 0,
        max_partition_size: 1 << 20,
        writer_pool_size: 2,
        write_queue_capacity: 64,
        fsync_on_append: false,
        disk_check_period_ms: 20,
        shutdown_grace_ms: 10,
    }
}

pub(crate) fn test_repair_config() -> RepairConfig {
    RepairConfig {
        // Long period: tests trigger repair cycles by hand.
        repair_period_ms: 3_600_000,
        merkle_max_level: 6,
    }
}

pub(crate) fn test_compaction_config() -> CompactionConfig {
    CompactionConfig {
        deleted_ratio: 0.5,
        // Long period: tests drive compaction by hand.
        check_period_ms: 3_600_000,
    }
}

pub(crate) async fn start_node(
    self_node: NodeId,
    master: NodeId,
    peers: Vec<NodeId>,
    transport: Arc<FakeTransport>,
    configure: impl FnOnce(&mut StorageConfig),
) -> TestNode {
    let dir = TempDir::new().expect("failed to create node directory");
    let factory = StoreFactory::mock();
    let index = factory.create_index_store().await.expect("mock index");
    let partitions = factory
        .create_partition_store()
        .await
        .expect("mock partitions");
    start_node_with(
        self_node, master, peers, transport, configure, dir, index, partitions,
    )
    .await
}

/// Assembles a node over pre-seeded stores and an existing directory, for
/// crash-recovery style tests.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn start_node_with(
    self_node: NodeId,
    master: NodeId,
    peers: Vec<NodeId>,
    transport: Arc<FakeTransport>,
    configure: impl FnOnce(&mut StorageConfig),
    dir: TempDir,
    index: Arc<dyn IndexStore>,
    partitions: Arc<dyn PartitionStore>,
) -> TestNode {
    let mut storage_config = test_storage_config(&dir);
    configure(&mut storage_config);

    let membership = Arc::new(FakeMembership::new(self_node, master, peers));

    let node = initialize_components(
        storage_config,
        ClusterConfig::default(),
        test_repair_config(),
        test_compaction_config(),
        Arc::clone(&index),
        Arc::clone(&partitions),
        membership,
        Arc::clone(&transport) as Arc<dyn ClusterTransport>,
    )
    .await
    .expect("node failed to start");

    transport.register(
        self_node,
        FakeEndpoint {
            repair: Arc::clone(&node.repair),
            replication: node.replication_queue.clone(),
        },
    );

    TestNode {
        node,
        index,
        partitions,
        _dir: dir,
    }
}

/// Polls an async condition until it holds or the test times out.
pub(crate) async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("gave up waiting until {what}");
}
