//! RaftServer - the per-node processing loop
//!
//! One task owns the [`RaftCore`] and handles every event against it in
//! turn: inbound RPCs, peer responses, client commands and both timers.
//! Network I/O happens in dispatcher tasks that only post events back here.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, sleep_until, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::dispatcher::{InboundRpc, PeerEvent, RpcDispatcher, RpcSender};
use super::error::RaftError;
use super::log::{LogIndex, Term};
use super::raft_core::{NodeStatus, RaftCore};
use super::snapshot::SnapshotMetadata;
use crate::transport::Transport;

const COMMAND_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 256;

/// Command sent to the RaftServer from clients
enum Command {
    Propose {
        command: Vec<u8>,
        reply: oneshot::Sender<Result<LogIndex, RaftError>>,
    },
    ProposeAndWait {
        command: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, RaftError>>,
    },
    TakeSnapshot {
        reply: oneshot::Sender<Result<Option<SnapshotMetadata>, RaftError>>,
    },
}

/// A proposal whose caller waits for it to be applied
struct Waiter {
    term: Term,
    reply: oneshot::Sender<Result<Vec<u8>, RaftError>>,
}

/// Handle for interacting with a running RaftServer
#[derive(Clone)]
pub struct RaftHandle {
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: mpsc::Sender<()>,
    status_rx: watch::Receiver<NodeStatus>,
}

impl RaftHandle {
    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, RaftError>>) -> Command,
    ) -> Result<oneshot::Receiver<Result<T, RaftError>>, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(make(reply))
            .await
            .map_err(|_| RaftError::NodeStopped)?;
        Ok(rx)
    }

    /// Append a command to the leader's log. Returns its index without
    /// waiting for it to commit.
    pub async fn propose(&self, command: Vec<u8>) -> Result<LogIndex, RaftError> {
        let rx = self.send(|reply| Command::Propose { command, reply }).await?;
        rx.await.map_err(|_| RaftError::NodeStopped)?
    }

    /// Propose a command and wait until it is applied, returning the state
    /// machine's output. Gives up with `QuorumUnreachable` after `timeout`.
    pub async fn propose_and_wait(&self, command: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, RaftError> {
        let rx = self
            .send(|reply| Command::ProposeAndWait { command, reply })
            .await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(result) => result.map_err(|_| RaftError::NodeStopped)?,
            Err(_) => Err(RaftError::QuorumUnreachable),
        }
    }

    pub async fn take_snapshot(&self) -> Result<Option<SnapshotMetadata>, RaftError> {
        let rx = self.send(|reply| Command::TakeSnapshot { reply }).await?;
        rx.await.map_err(|_| RaftError::NodeStopped)?
    }

    /// Latest published status
    pub fn status(&self) -> NodeStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status_rx.clone()
    }

    /// Wait until the published status satisfies `predicate`
    pub async fn wait_for_status(
        &self,
        predicate: impl FnMut(&NodeStatus) -> bool,
    ) -> Result<NodeStatus, RaftError> {
        let mut rx = self.status_rx.clone();
        let status = rx.wait_for(predicate).await.map_err(|_| RaftError::NodeStopped)?;
        Ok(status.clone())
    }

    /// Stop the loop and wait for it to finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
        let mut rx = self.status_rx.clone();
        let _ = rx.wait_for(|status| !status.running).await;
    }
}

pub struct RaftServer<T: Transport> {
    core: RaftCore,
    dispatcher: RpcDispatcher<T>,
    inbound_rx: mpsc::Receiver<InboundRpc>,
    inbound_tx: mpsc::Sender<InboundRpc>,
    events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    command_rx: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
    status_tx: watch::Sender<NodeStatus>,
    status_rx: watch::Receiver<NodeStatus>,
    waiters: BTreeMap<LogIndex, Waiter>,
}

impl<T: Transport + 'static> RaftServer<T> {
    pub fn new(core: RaftCore, transport: T) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(core.status());

        RaftServer {
            core,
            dispatcher: RpcDispatcher::new(Arc::new(transport), events_tx),
            inbound_rx,
            inbound_tx,
            events_rx,
            command_rx,
            command_tx,
            shutdown_rx,
            shutdown_tx,
            status_tx,
            status_rx,
            waiters: BTreeMap::new(),
        }
    }

    /// Where transports deliver this node's inbound RPCs. Available before
    /// `start` so the node can be registered with its network first.
    pub fn rpc_sender(&self) -> RpcSender {
        RpcSender::new(self.inbound_tx.clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status_rx.clone()
    }

    /// Start the server and return a handle for interaction
    pub fn start(self) -> RaftHandle {
        let handle = RaftHandle {
            command_tx: self.command_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            status_rx: self.status_rx.clone(),
        };

        tokio::spawn(self.run());

        handle
    }

    /// Main server loop
    async fn run(mut self) {
        let node = self.core.id();
        let mut heartbeat_interval = interval(self.core.config().heartbeat_interval);
        // Delay keeps a backlog of missed ticks from bursting out after a stall
        heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(node, term = self.core.current_term(), "Node started");

        let mut halted = None;
        loop {
            let is_leader = self.core.is_leader();
            let election_deadline = self.core.election_deadline();

            let outcome = tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                Some(rpc) = self.inbound_rx.recv() => self.handle_inbound(rpc),
                Some(event) = self.events_rx.recv() => self.handle_peer_event(event),
                Some(command) = self.command_rx.recv() => self.handle_command(command),
                _ = heartbeat_interval.tick(), if is_leader => self.on_heartbeat(),
                _ = sleep_until(election_deadline), if !is_leader => self.on_election_timeout(),
            };

            match outcome.and_then(|()| self.apply_committed()) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    error!(node, error = %e, "Fatal error; halting node");
                    halted = Some(e);
                    break;
                }
                Err(e) => warn!(node, error = %e, "Event failed"),
            }
            self.publish_status();
        }

        let reason = halted.clone().unwrap_or(RaftError::NodeStopped);
        for (_, waiter) in std::mem::take(&mut self.waiters) {
            let _ = waiter.reply.send(Err(reason.clone()));
        }

        let mut status = self.core.status();
        status.running = false;
        status.halted = halted.map(|e| e.to_string());
        self.status_tx.send_replace(status);
        info!(node, "Node stopped");
    }

    fn publish_status(&self) {
        let status = self.core.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn on_heartbeat(&mut self) -> Result<(), RaftError> {
        let messages = self.core.heartbeat()?;
        self.dispatcher.dispatch(messages);
        Ok(())
    }

    fn on_election_timeout(&mut self) -> Result<(), RaftError> {
        let messages = self.core.start_election()?;
        self.dispatcher.dispatch(messages);
        Ok(())
    }

    fn handle_inbound(&mut self, rpc: InboundRpc) -> Result<(), RaftError> {
        match rpc {
            InboundRpc::RequestVote { args, reply } => {
                let result = self.core.handle_request_vote(&args);
                respond(reply, result)
            }
            InboundRpc::AppendEntries { args, reply } => {
                let result = self.core.handle_append_entries(args);
                respond(reply, result)
            }
            InboundRpc::InstallSnapshot { args, reply } => {
                let result = self.core.handle_install_snapshot(args);
                respond(reply, result)
            }
        }
    }

    fn handle_peer_event(&mut self, event: PeerEvent) -> Result<(), RaftError> {
        let messages = match event {
            PeerEvent::VoteResponse {
                peer,
                sent_term,
                result,
            } => self.core.handle_request_vote_result(peer, sent_term, &result)?,
            PeerEvent::AppendResponse { peer, sent, result } => {
                self.core.handle_append_entries_result(peer, sent, &result)?
            }
            PeerEvent::SnapshotResponse {
                peer,
                sent_term,
                last_included_index,
                result,
            } => self
                .core
                .handle_install_snapshot_result(peer, sent_term, last_included_index, &result)?,
            PeerEvent::Unreachable {
                peer,
                sent_term,
                error,
            } => {
                debug!(node = self.core.id(), peer, error = %error, "Peer unreachable");
                self.core.handle_unreachable(peer, sent_term);
                Vec::new()
            }
        };
        self.dispatcher.dispatch(messages);
        Ok(())
    }

    fn handle_command(&mut self, command: Command) -> Result<(), RaftError> {
        match command {
            Command::Propose { command, reply } => {
                let result = self.propose(command);
                respond(reply, result)
            }
            Command::ProposeAndWait { command, reply } => match self.propose(command) {
                Ok(index) => {
                    let term = self.core.current_term();
                    self.waiters.insert(index, Waiter { term, reply });
                    Ok(())
                }
                Err(e) => {
                    let _ = reply.send(Err(e.clone()));
                    if e.is_fatal() {
                        return Err(e);
                    }
                    Ok(())
                }
            },
            Command::TakeSnapshot { reply } => {
                let result = self.core.take_snapshot();
                respond(reply, result)
            }
        }
    }

    /// Append locally and push the new entry to idle peers right away
    fn propose(&mut self, command: Vec<u8>) -> Result<LogIndex, RaftError> {
        let index = self.core.propose(command)?;
        let messages = self.core.replicate()?;
        self.dispatcher.dispatch(messages);
        Ok(index)
    }

    /// Apply newly committed entries and settle the proposals waiting on them
    fn apply_committed(&mut self) -> Result<(), RaftError> {
        for applied in self.core.apply_committed()? {
            let Some(waiter) = self.waiters.remove(&applied.index) else {
                continue;
            };
            let outcome = if waiter.term == applied.term {
                applied.result.map_err(RaftError::StateMachine)
            } else {
                Err(RaftError::LeadershipLost {
                    index: applied.index,
                })
            };
            let _ = waiter.reply.send(outcome);
        }

        if !self.core.is_leader() && !self.waiters.is_empty() {
            info!(
                node = self.core.id(),
                pending = self.waiters.len(),
                "Lost leadership; failing pending proposals"
            );
            for (index, waiter) in std::mem::take(&mut self.waiters) {
                let _ = waiter.reply.send(Err(RaftError::LeadershipLost { index }));
            }
        }
        Ok(())
    }
}

/// Reply to a caller; fatal errors are also returned so the loop halts
fn respond<T>(reply: oneshot::Sender<Result<T, RaftError>>, result: Result<T, RaftError>) -> Result<(), RaftError> {
    let fatal = match &result {
        Err(e) if e.is_fatal() => Some(e.clone()),
        _ => None,
    };
    let _ = reply.send(result);
    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
