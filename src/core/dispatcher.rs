//! Plumbing between the processing loop and the network
//!
//! Inbound RPCs reach the loop as [`InboundRpc`] values through an
//! [`RpcSender`]; every inbound RPC carries a oneshot for its reply.
//! Outbound messages are handed to an [`RpcDispatcher`], which spawns one
//! task per message and posts the outcome back as a [`PeerEvent`].

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use super::error::RaftError;
use super::log::{LogIndex, NodeId, Term};
use super::rpc::{
    AppendEntriesArgs, AppendEntriesResult, AppendSent, InstallSnapshotArgs, InstallSnapshotResult,
    Outbound, RequestVoteArgs, RequestVoteResult,
};
use crate::transport::{Transport, TransportError};

pub type Reply<T> = oneshot::Sender<Result<T, RaftError>>;

/// An RPC received from a peer, waiting to be processed by the loop
pub enum InboundRpc {
    RequestVote {
        args: RequestVoteArgs,
        reply: Reply<RequestVoteResult>,
    },
    AppendEntries {
        args: AppendEntriesArgs,
        reply: Reply<AppendEntriesResult>,
    },
    InstallSnapshot {
        args: InstallSnapshotArgs,
        reply: Reply<InstallSnapshotResult>,
    },
}

/// Handle transports use to feed inbound RPCs into a node
#[derive(Clone)]
pub struct RpcSender {
    tx: mpsc::Sender<InboundRpc>,
}

impl RpcSender {
    pub fn new(tx: mpsc::Sender<InboundRpc>) -> Self {
        RpcSender { tx }
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> InboundRpc) -> Result<T, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| RaftError::NodeStopped)?;
        rx.await.map_err(|_| RaftError::NodeStopped)?
    }

    pub async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteResult, RaftError> {
        self.call(|reply| InboundRpc::RequestVote { args, reply }).await
    }

    pub async fn append_entries(&self, args: AppendEntriesArgs) -> Result<AppendEntriesResult, RaftError> {
        self.call(|reply| InboundRpc::AppendEntries { args, reply }).await
    }

    pub async fn install_snapshot(
        &self,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, RaftError> {
        self.call(|reply| InboundRpc::InstallSnapshot { args, reply }).await
    }
}

/// Outcome of an outbound RPC, posted back to the loop
#[derive(Debug)]
pub enum PeerEvent {
    VoteResponse {
        peer: NodeId,
        sent_term: Term,
        result: RequestVoteResult,
    },
    AppendResponse {
        peer: NodeId,
        sent: AppendSent,
        result: AppendEntriesResult,
    },
    SnapshotResponse {
        peer: NodeId,
        sent_term: Term,
        last_included_index: LogIndex,
        result: InstallSnapshotResult,
    },
    Unreachable {
        peer: NodeId,
        sent_term: Term,
        error: TransportError,
    },
}

pub struct RpcDispatcher<T: Transport> {
    transport: Arc<T>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl<T: Transport + 'static> RpcDispatcher<T> {
    pub fn new(transport: Arc<T>, events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        RpcDispatcher { transport, events }
    }

    /// Send every message concurrently; never blocks the caller
    pub fn dispatch(&self, messages: Vec<Outbound>) {
        for message in messages {
            let transport = Arc::clone(&self.transport);
            let events = self.events.clone();
            tokio::spawn(async move {
                let event = send(transport.as_ref(), message).await;
                // The loop may have shut down; nothing to report to
                let _ = events.send(event);
            });
        }
    }
}

async fn send<T: Transport>(transport: &T, message: Outbound) -> PeerEvent {
    match message {
        Outbound::RequestVote { to, args } => {
            let sent_term = args.term;
            match transport.request_vote(to, args).await {
                Ok(result) => PeerEvent::VoteResponse {
                    peer: to,
                    sent_term,
                    result,
                },
                Err(error) => unreachable_event(to, sent_term, error),
            }
        }
        Outbound::AppendEntries { to, args } => {
            let sent = AppendSent::for_args(&args);
            match transport.append_entries(to, args).await {
                Ok(result) => PeerEvent::AppendResponse {
                    peer: to,
                    sent,
                    result,
                },
                Err(error) => unreachable_event(to, sent.term, error),
            }
        }
        Outbound::InstallSnapshot { to, args } => {
            let sent_term = args.term;
            let last_included_index = args.last_included_index;
            match transport.install_snapshot(to, args).await {
                Ok(result) => PeerEvent::SnapshotResponse {
                    peer: to,
                    sent_term,
                    last_included_index,
                    result,
                },
                Err(error) => unreachable_event(to, sent_term, error),
            }
        }
    }
}

fn unreachable_event(peer: NodeId, sent_term: Term, error: TransportError) -> PeerEvent {
    trace!(peer, error = %error, "RPC failed");
    PeerEvent::Unreachable {
        peer,
        sent_term,
        error,
    }
}
