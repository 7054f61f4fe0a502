//! Transport abstraction for RPC communication between nodes

use async_trait::async_trait;
use thiserror::Error;

use crate::core::log::NodeId;
use crate::core::rpc::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult,
};

/// Outbound side of the network: one call per RPC, awaiting the peer's reply
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError>;

    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError>;

    async fn install_snapshot(
        &self,
        target: NodeId,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection to node {0} failed")]
    ConnectionFailed(NodeId),
    #[error("request to node {0} timed out")]
    Timeout(NodeId),
    #[error("node {0} is not part of the cluster")]
    NodeNotFound(NodeId),
    /// The peer answered, but with an error (e.g. it has halted)
    #[error("node {node} failed the request: {message}")]
    Remote { node: NodeId, message: String },
}
