//! In-memory transport implementation for testing
//!
//! All nodes of a cluster share one [`InMemoryNetwork`]. Each node gets an
//! [`InMemoryTransport`] bound to its id; the network can drop traffic to
//! isolated nodes or across a partition.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::core::dispatcher::RpcSender;
use crate::core::error::RaftError;
use crate::core::log::NodeId;
use crate::core::rpc::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult,
};
use crate::transport::{Transport, TransportError};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<NodeId, RpcSender>,
    isolated: HashSet<NodeId>,
    /// Directed links that drop traffic
    blocked: HashSet<(NodeId, NodeId)>,
}

impl NetworkState {
    fn connected(&self, from: NodeId, to: NodeId) -> bool {
        !self.isolated.contains(&from) && !self.isolated.contains(&to) && !self.blocked.contains(&(from, to))
    }
}

/// Shared switchboard for an in-process cluster
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route RPCs for `id` to `sender`, replacing any earlier registration
    pub fn register(&self, id: NodeId, sender: RpcSender) {
        self.state.write().nodes.insert(id, sender);
    }

    pub fn unregister(&self, id: NodeId) {
        self.state.write().nodes.remove(&id);
    }

    /// Transport for node `id` with the default RPC timeout
    pub fn transport(&self, id: NodeId) -> InMemoryTransport {
        self.transport_with_timeout(id, DEFAULT_TIMEOUT)
    }

    pub fn transport_with_timeout(&self, id: NodeId, timeout: Duration) -> InMemoryTransport {
        InMemoryTransport {
            from: id,
            network: self.clone(),
            timeout,
        }
    }

    /// Cut `id` off from every other node
    pub fn isolate(&self, id: NodeId) {
        self.state.write().isolated.insert(id);
    }

    /// Split the cluster: nodes in `a` cannot talk to nodes in `b`
    pub fn partition(&self, a: &[NodeId], b: &[NodeId]) {
        let mut state = self.state.write();
        for &x in a {
            for &y in b {
                state.blocked.insert((x, y));
                state.blocked.insert((y, x));
            }
        }
    }

    /// Reconnect `id` after `isolate`
    pub fn heal(&self, id: NodeId) {
        let mut state = self.state.write();
        state.isolated.remove(&id);
        state.blocked.retain(|&(x, y)| x != id && y != id);
    }

    /// Remove every isolation and partition
    pub fn heal_all(&self) {
        let mut state = self.state.write();
        state.isolated.clear();
        state.blocked.clear();
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<RpcSender, TransportError> {
        let state = self.state.read();
        if !state.connected(from, to) {
            return Err(TransportError::ConnectionFailed(to));
        }
        state.nodes.get(&to).cloned().ok_or(TransportError::NodeNotFound(to))
    }

    fn connected(&self, from: NodeId, to: NodeId) -> bool {
        self.state.read().connected(from, to)
    }
}

/// One node's view of the network
pub struct InMemoryTransport {
    from: NodeId,
    network: InMemoryNetwork,
    timeout: Duration,
}

impl InMemoryTransport {
    /// Deliver one RPC; a reply crossing a link that broke meanwhile is lost
    async fn call<T, F>(&self, target: NodeId, rpc: impl FnOnce(RpcSender) -> F) -> Result<T, TransportError>
    where
        T: Send,
        F: Future<Output = Result<T, RaftError>> + Send,
    {
        let sender = self.network.route(self.from, target)?;
        let result = tokio::time::timeout(self.timeout, rpc(sender))
            .await
            .map_err(|_| TransportError::Timeout(target))?;

        if !self.network.connected(target, self.from) {
            return Err(TransportError::ConnectionFailed(target));
        }
        result.map_err(|e| match e {
            RaftError::NodeStopped => TransportError::ConnectionFailed(target),
            other => TransportError::Remote {
                node: target,
                message: other.to_string(),
            },
        })
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.call(target, |sender| async move { sender.request_vote(args).await })
            .await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.call(target, |sender| async move { sender.append_entries(args).await })
            .await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError> {
        self.call(target, |sender| async move { sender.install_snapshot(args).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatcher::InboundRpc;
    use tokio::sync::mpsc;

    /// Registers `id` and answers every vote request with a grant
    fn spawn_voter(network: &InMemoryNetwork, id: NodeId) {
        let (tx, mut rx) = mpsc::channel(8);
        network.register(id, RpcSender::new(tx));
        tokio::spawn(async move {
            while let Some(rpc) = rx.recv().await {
                if let InboundRpc::RequestVote { args, reply } = rpc {
                    let _ = reply.send(Ok(RequestVoteResult { term: args.term, vote_granted: true }));
                }
            }
        });
    }

    fn vote_args() -> RequestVoteArgs {
        RequestVoteArgs { term: 1, candidate_id: 1, last_log_index: 0, last_log_term: 0 }
    }

    #[tokio::test]
    async fn test_delivers_between_registered_nodes() {
        let network = InMemoryNetwork::new();
        spawn_voter(&network, 2);

        let result = network.transport(1).request_vote(2, vote_args()).await.unwrap();
        assert!(result.vote_granted);
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let network = InMemoryNetwork::new();
        let result = network.transport(1).request_vote(7, vote_args()).await;
        assert_eq!(result, Err(TransportError::NodeNotFound(7)));
    }

    #[tokio::test]
    async fn test_isolate_and_heal() {
        let network = InMemoryNetwork::new();
        spawn_voter(&network, 2);
        let transport = network.transport(1);

        network.isolate(2);
        assert_eq!(
            transport.request_vote(2, vote_args()).await,
            Err(TransportError::ConnectionFailed(2))
        );

        network.heal(2);
        assert!(transport.request_vote(2, vote_args()).await.is_ok());
    }

    #[tokio::test]
    async fn test_partition_blocks_both_directions() {
        let network = InMemoryNetwork::new();
        spawn_voter(&network, 1);
        spawn_voter(&network, 2);
        spawn_voter(&network, 3);

        network.partition(&[1], &[2, 3]);
        assert!(network.transport(1).request_vote(2, vote_args()).await.is_err());
        assert!(network.transport(3).request_vote(1, vote_args()).await.is_err());
        assert!(network.transport(2).request_vote(3, vote_args()).await.is_ok());

        network.heal_all();
        assert!(network.transport(1).request_vote(3, vote_args()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_node_times_out() {
        let network = InMemoryNetwork::new();
        // Registered, but nobody reads the queue
        let (tx, _rx) = mpsc::channel(8);
        network.register(2, RpcSender::new(tx));

        let transport = network.transport_with_timeout(1, Duration::from_millis(50));
        assert_eq!(
            transport.request_vote(2, vote_args()).await,
            Err(TransportError::Timeout(2))
        );
    }
}
