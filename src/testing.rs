//! Testing utilities for cluster integration tests
//!
//! Provides `TestCluster`: an in-process cluster over an [`InMemoryNetwork`],
//! with each node's durable state kept in a [`MemoryStorage`] that outlives
//! crashes, so nodes can be restarted over what they persisted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::core::config::RaftConfig;
use crate::core::error::RaftError;
use crate::core::log::{LogIndex, NodeId, ReplicatedLog};
use crate::core::raft_core::{NodeStatus, RaftCore};
use crate::core::raft_server::{RaftHandle, RaftServer};
use crate::core::role::RoleKind;
use crate::state_machine::{KeyValueStore, SharedKvStore};
use crate::storage::MemoryStorage;
use crate::transport::inmemory::InMemoryNetwork;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A single test node in the cluster
pub struct TestNode {
    pub id: NodeId,
    /// Durable state; survives `crash`
    pub storage: MemoryStorage,
    /// State machine of the current incarnation
    pub kv_store: SharedKvStore,
    handle: Option<RaftHandle>,
}

/// A test cluster of nodes running `KeyValueStore`
pub struct TestCluster {
    pub network: InMemoryNetwork,
    config: RaftConfig,
    nodes: BTreeMap<NodeId, TestNode>,
}

impl TestCluster {
    /// Timing used unless a test asks otherwise
    pub fn test_config() -> RaftConfig {
        RaftConfig::default()
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300))
            .with_rpc_timeout(Duration::from_millis(100))
    }

    /// Start a cluster of nodes `1..=count`. Must be called inside a Tokio runtime.
    pub fn new(count: usize) -> Self {
        Self::with_config(count, Self::test_config())
    }

    pub fn with_config(count: usize, config: RaftConfig) -> Self {
        let mut cluster = TestCluster {
            network: InMemoryNetwork::new(),
            config,
            nodes: BTreeMap::new(),
        };
        for id in 1..=count as NodeId {
            cluster.nodes.insert(
                id,
                TestNode {
                    id,
                    storage: MemoryStorage::new(),
                    kv_store: Arc::new(Mutex::new(KeyValueStore::new())),
                    handle: None,
                },
            );
        }
        for id in cluster.ids() {
            // Fresh storage always opens
            if let Err(e) = cluster.start_node(id) {
                panic!("node {} failed to start: {}", id, e);
            }
        }
        cluster
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    fn start_node(&mut self, id: NodeId) -> Result<(), RaftError> {
        let peers: Vec<NodeId> = self.ids().into_iter().filter(|&p| p != id).collect();
        let Some(node) = self.nodes.get_mut(&id) else {
            return Err(RaftError::Identity(format!("node {} is not part of the cluster", id)));
        };

        node.kv_store = Arc::new(Mutex::new(KeyValueStore::new()));
        let recovered = ReplicatedLog::open(Box::new(node.storage.clone()))?;
        let core = RaftCore::new(id, peers, recovered, Box::new(node.kv_store.clone()), self.config.clone())?;

        let server = RaftServer::new(core, self.network.transport_with_timeout(id, self.config.rpc_timeout));
        self.network.register(id, server.rpc_sender());
        node.handle = Some(server.start());
        Ok(())
    }

    /// Handle of a running node; `None` after `crash`
    pub fn handle(&self, id: NodeId) -> Option<&RaftHandle> {
        self.nodes.get(&id).and_then(|n| n.handle.as_ref())
    }

    pub fn status(&self, id: NodeId) -> Option<NodeStatus> {
        self.handle(id).map(|h| h.status())
    }

    pub fn kv_store(&self, id: NodeId) -> Option<SharedKvStore> {
        self.nodes.get(&id).map(|n| n.kv_store.clone())
    }

    /// The running leader with the highest term, if any
    pub fn leader(&self) -> Option<NodeId> {
        self.nodes
            .values()
            .filter_map(|n| n.handle.as_ref().map(|h| h.status()))
            .filter(|s| s.running && s.role == RoleKind::Leader)
            .max_by_key(|s| s.term)
            .map(|s| s.id)
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        self.wait_until(timeout, || self.leader()).await
    }

    /// Wait for a leader other than `old` in a term above `term`
    pub async fn wait_for_new_leader(&self, old: NodeId, term: u64, timeout: Duration) -> Option<NodeId> {
        self.wait_until(timeout, || {
            self.nodes
                .values()
                .filter(|n| n.id != old)
                .filter_map(|n| n.handle.as_ref().map(|h| h.status()))
                .find(|s| s.running && s.role == RoleKind::Leader && s.term > term)
                .map(|s| s.id)
        })
        .await
    }

    /// Wait until every listed running node has applied through `index`
    pub async fn wait_for_applied(&self, ids: &[NodeId], index: LogIndex, timeout: Duration) -> bool {
        self.wait_until(timeout, || {
            ids.iter()
                .all(|&id| self.status(id).is_some_and(|s| s.last_applied >= index))
                .then_some(())
        })
        .await
        .is_some()
    }

    async fn wait_until<T>(&self, timeout: Duration, mut check: impl FnMut() -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(found) = check() {
                return Some(found);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Submit through whichever node currently leads, retrying across
    /// leader changes until `timeout`. Returns the leader used and the
    /// state machine output.
    pub async fn propose(&self, command: &str, timeout: Duration) -> Result<(NodeId, Vec<u8>), RaftError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RaftError::QuorumUnreachable);
            }
            let Some(leader) = self.wait_for_leader(remaining).await else {
                return Err(RaftError::QuorumUnreachable);
            };
            let Some(handle) = self.handle(leader) else {
                continue;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            match handle.propose_and_wait(command.as_bytes().to_vec(), remaining).await {
                Ok(output) => return Ok((leader, output)),
                Err(RaftError::NotLeader { .. }) | Err(RaftError::LeadershipLost { .. }) => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Cut a node off from the rest of the cluster
    pub fn isolate(&self, id: NodeId) {
        self.network.isolate(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.network.heal(id);
    }

    pub fn partition(&self, a: &[NodeId], b: &[NodeId]) {
        self.network.partition(a, b);
    }

    pub fn heal_all(&self) {
        self.network.heal_all();
    }

    /// Stop a node abruptly; its storage is kept for `restart`
    pub async fn crash(&mut self, id: NodeId) {
        self.network.unregister(id);
        if let Some(handle) = self.nodes.get_mut(&id).and_then(|n| n.handle.take()) {
            handle.shutdown().await;
        }
    }

    /// Start a crashed node again over its retained storage
    pub fn restart(&mut self, id: NodeId) -> Result<(), RaftError> {
        self.start_node(id)
    }

    pub async fn shutdown(mut self) {
        for id in self.ids() {
            self.crash(id).await;
        }
    }
}
