//! Shared test utilities for the coordinator tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use strand_hints::HintRepository;
use strand_meta::MetaStore;
use strand_net::{Bus, Message, NetError};
use strand_nodeset::{NodeTable, DEFAULT_HANDOFF_COUNT};
use strand_server::NodeServer;
use strand_store::MemoryStore;
use strand_types::{AvatarId, Checksum, NodeRef, Timestamp, VersionNumber};
use tokio::sync::{Mutex, Notify};

use crate::{ArchiveRequest, CoordinatorConfig};

pub const TEST_MAX_BYTES: u64 = 1_000_000_000;

/// Generate deterministic, non-repeating test data.
pub fn test_data(size: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = 0xDEAD_BEEF;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}

/// One in-process storage node: the server plus handles on its backing
/// state so tests can inspect stores and hint repositories directly.
pub struct TestNode {
    pub name: String,
    pub store: Arc<MemoryStore>,
    pub meta: Arc<MetaStore>,
    pub hints: Arc<HintRepository>,
    pub server: NodeServer,
}

/// In-process bus: requests dispatch straight into each node's server.
///
/// Nodes marked unreachable fail with a transport error, which is what a
/// dead QUIC peer looks like to the coordinators.
pub struct LoopbackBus {
    nodes: HashMap<String, Arc<TestNode>>,
    unreachable: Mutex<HashSet<String>>,
    held: Mutex<HashSet<String>>,
    held_entered: Notify,
    release: Notify,
}

impl LoopbackBus {
    pub fn new(nodes: &[Arc<TestNode>]) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|n| (n.name.clone(), n.clone()))
                .collect(),
            unreachable: Mutex::new(HashSet::new()),
            held: Mutex::new(HashSet::new()),
            held_entered: Notify::new(),
            release: Notify::new(),
        }
    }

    pub async fn set_unreachable(&self, exchange: &str) {
        self.unreachable.lock().await.insert(exchange.to_string());
    }

    pub async fn set_reachable(&self, exchange: &str) {
        self.unreachable.lock().await.remove(exchange);
    }

    /// Park the next request to `exchange` until [`release_held`] is
    /// called, so a test can observe an operation while it is in flight.
    ///
    /// [`release_held`]: LoopbackBus::release_held
    pub async fn hold(&self, exchange: &str) {
        self.held.lock().await.insert(exchange.to_string());
    }

    /// Wait until a held request has entered the bus.
    pub async fn wait_for_held(&self) {
        self.held_entered.notified().await;
    }

    /// Let the parked request continue.
    pub async fn release_held(&self, exchange: &str) {
        self.held.lock().await.remove(exchange);
        self.release.notify_one();
    }
}

#[async_trait]
impl Bus for LoopbackBus {
    async fn request(&self, dest: &NodeRef, msg: Message) -> Result<Message, NetError> {
        if self.held.lock().await.contains(&dest.exchange) {
            self.held_entered.notify_one();
            self.release.notified().await;
        }
        if self.unreachable.lock().await.contains(&dest.exchange) {
            return Err(NetError::Connect(format!("{} unreachable", dest.exchange)));
        }
        let node = self
            .nodes
            .get(&dest.exchange)
            .ok_or_else(|| NetError::UnknownExchange(dest.exchange.clone()))?;
        node.server.handle(msg).await.ok_or(NetError::NoReply)
    }

    async fn broadcast(&self, msg: Message) -> Result<(), NetError> {
        let down = self.unreachable.lock().await;
        for (name, node) in &self.nodes {
            if !down.contains(name) {
                node.server.handle(msg.clone()).await;
            }
        }
        Ok(())
    }
}

/// An in-process cluster wired up for coordinator tests.
pub struct TestCluster {
    pub nodes: Vec<Arc<TestNode>>,
    pub table: Arc<NodeTable>,
    pub bus: Arc<LoopbackBus>,
    pub config: CoordinatorConfig,
}

impl TestCluster {
    pub fn node(&self, exchange: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.name == exchange)
            .unwrap_or_else(|| panic!("no test node named {exchange}"))
    }
}

/// Build an `n`-node cluster with agreement level `k`, one shared node
/// table (every coordinator and server sees the same liveness view).
pub fn cluster(n: usize, k: usize) -> TestCluster {
    let destinations: Vec<NodeRef> = (1..=n)
        .map(|i| NodeRef::new(format!("storage-{i}")))
        .collect();
    let table = NodeTable::new(destinations.clone(), DEFAULT_HANDOFF_COUNT);
    let config = CoordinatorConfig::test_config(k);

    let nodes: Vec<Arc<TestNode>> = destinations
        .iter()
        .map(|dest| {
            let store = Arc::new(MemoryStore::new(TEST_MAX_BYTES));
            let meta = Arc::new(MetaStore::open_temporary().unwrap());
            let hints = Arc::new(HintRepository::open_temporary().unwrap());
            let server = NodeServer::new(
                dest.exchange.clone(),
                store.clone(),
                meta.clone(),
                hints.clone(),
                table.clone(),
                config.slice_size,
            );
            Arc::new(TestNode {
                name: dest.exchange.clone(),
                store,
                meta,
                hints,
                server,
            })
        })
        .collect();

    let bus = Arc::new(LoopbackBus::new(&nodes));
    TestCluster {
        nodes,
        table,
        bus,
        config,
    }
}

/// Build an archive request from per-segment payloads, deriving the
/// whole-object size and checksums the way a client would.
pub fn archive_request(
    avatar_id: AvatarId,
    key: &str,
    version_number: VersionNumber,
    timestamp: Timestamp,
    segments: Vec<Vec<u8>>,
) -> ArchiveRequest {
    let mut whole = Vec::new();
    for segment in &segments {
        whole.extend_from_slice(segment);
    }
    ArchiveRequest {
        avatar_id,
        key: key.to_string(),
        version_number,
        timestamp,
        total_size: whole.len() as u64,
        file_checksum: Checksum::of(&whole),
        segments: segments.into_iter().map(Bytes::from).collect(),
    }
}
