//! RaftCore - the role state machine
//!
//! Synchronous and transport-agnostic. Every event (timer, inbound RPC,
//! peer response, proposal) is a method call; messages the node wants sent
//! are returned as [`Outbound`] values instead of being sent here. The
//! processing loop in `raft_server` is the only caller in production.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::RaftConfig;
use super::error::RaftError;
use super::log::{LogIndex, NodeId, Recovered, ReplicatedLog, Term};
use super::replication::{majority, ReplicationCoordinator};
use super::role::{Role, RoleKind};
use super::rpc::{
    AppendEntriesArgs, AppendEntriesResult, AppendSent, InstallSnapshotArgs, InstallSnapshotResult,
    Outbound, RequestVoteArgs, RequestVoteResult,
};
use super::snapshot::{Snapshot, SnapshotMetadata};
use crate::state_machine::{ApplyResult, Snapshotable};
use crate::storage::HardState;

/// A committed command that was handed to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub index: LogIndex,
    pub term: Term,
    pub result: ApplyResult,
}

/// Observable view of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: RoleKind,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub snapshot_index: LogIndex,
    pub running: bool,
    /// Set when a fatal error stopped the node
    pub halted: Option<String>,
}

pub struct RaftCore {
    id: NodeId,
    peers: Vec<NodeId>,
    config: RaftConfig,

    // Persistent state (written through `log` before anything depends on it)
    current_term: Term,
    voted_for: Option<NodeId>,
    log: ReplicatedLog,

    role: Role,
    state_machine: Box<dyn Snapshotable>,
    election_deadline: Instant,
    applied_since_snapshot: u64,
}

impl RaftCore {
    /// Build a node over a recovered log. The state machine is restored from
    /// the snapshot, if there is one; committed entries after it are applied
    /// again once the new leader advertises its commit index.
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        recovered: Recovered,
        mut state_machine: Box<dyn Snapshotable>,
        config: RaftConfig,
    ) -> Result<Self, RaftError> {
        let Recovered {
            log,
            hard_state,
            snapshot,
        } = recovered;

        if let Some(snapshot) = &snapshot {
            state_machine
                .restore(&snapshot.data)
                .map_err(RaftError::SnapshotCorruption)?;
            info!(
                node = id,
                index = snapshot.last_included_index(),
                "Restored state machine from snapshot"
            );
        }

        let peers: Vec<NodeId> = peers.into_iter().filter(|&p| p != id).collect();
        let election_deadline = Instant::now() + config.random_election_timeout();

        Ok(RaftCore {
            id,
            peers,
            config,
            current_term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            log,
            role: Role::Follower { leader: None },
            state_machine,
            election_deadline,
            applied_since_snapshot: 0,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn role(&self) -> RoleKind {
        self.role.kind()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    /// The leader of the current term, if known
    pub fn leader_id(&self) -> Option<NodeId> {
        match &self.role {
            Role::Leader { .. } => Some(self.id),
            Role::Follower { leader } => *leader,
            Role::Candidate { .. } => None,
        }
    }

    pub fn log(&self) -> &ReplicatedLog {
        &self.log
    }

    pub fn commit_index(&self) -> LogIndex {
        self.log.commit_index()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.log.last_applied()
    }

    pub fn election_deadline(&self) -> Instant {
        self.election_deadline
    }

    pub fn replication(&self) -> Option<&ReplicationCoordinator> {
        match &self.role {
            Role::Leader { replication } => Some(replication),
            _ => None,
        }
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            role: self.role(),
            term: self.current_term,
            voted_for: self.voted_for,
            leader: self.leader_id(),
            commit_index: self.log.commit_index(),
            last_applied: self.log.last_applied(),
            last_log_index: self.log.last_index(),
            snapshot_index: self.log.snapshot_index(),
            running: true,
            halted: None,
        }
    }

    fn persist_hard_state(&mut self) -> Result<(), RaftError> {
        self.log.save_hard_state(&HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        })
    }

    fn reset_election_deadline(&mut self) {
        self.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    fn set_role(&mut self, role: Role) {
        debug_assert!(
            self.role.kind().can_transition_to(role.kind()),
            "illegal role transition {} -> {}",
            self.role.kind(),
            role.kind()
        );
        self.role = role;
    }

    fn has_majority(&self, count: usize) -> bool {
        count >= majority(self.peers.len() + 1)
    }

    /// Revert to follower, adopting `term` if it is newer than ours
    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) -> Result<(), RaftError> {
        let previous = self.role.kind();
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.persist_hard_state()?;
        }
        self.set_role(Role::Follower { leader });
        self.reset_election_deadline();

        if previous != RoleKind::Follower {
            info!(node = self.id, term, from = %previous, "Stepped down to follower");
        }
        Ok(())
    }

    /// Election timeout elapsed: stand as candidate in a new term
    pub fn start_election(&mut self) -> Result<Vec<Outbound>, RaftError> {
        if self.is_leader() {
            return Ok(Vec::new());
        }

        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.persist_hard_state()?;

        let mut votes = HashSet::new();
        votes.insert(self.id);
        self.set_role(Role::Candidate { votes });
        self.reset_election_deadline();
        info!(node = self.id, term = self.current_term, "Became candidate");

        if self.has_majority(1) {
            return self.become_leader();
        }

        let args = RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        Ok(self
            .peers
            .iter()
            .map(|&to| Outbound::RequestVote {
                to,
                args: args.clone(),
            })
            .collect())
    }

    fn become_leader(&mut self) -> Result<Vec<Outbound>, RaftError> {
        let replication =
            ReplicationCoordinator::new(&self.peers, self.log.last_index(), Instant::now());
        self.set_role(Role::Leader { replication });
        info!(node = self.id, term = self.current_term, "Became leader");

        // Commits everything left over from earlier terms once it is replicated
        let index = self.log.append_as_leader(self.current_term, Vec::new())?;
        debug!(node = self.id, index, "Appended leader no-op");

        self.advance_commit_index();
        self.replicate()
    }

    pub fn handle_request_vote(&mut self, args: &RequestVoteArgs) -> Result<RequestVoteResult, RaftError> {
        if args.term < self.current_term {
            let err = RaftError::StaleTerm {
                received: args.term,
                current: self.current_term,
            };
            debug!(node = self.id, candidate = args.candidate_id, error = %err, "Rejecting vote request");
            return Ok(RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            });
        }

        if args.term > self.current_term {
            self.become_follower(args.term, None)?;
        }

        let can_vote = self.voted_for.is_none() || self.voted_for == Some(args.candidate_id);
        let up_to_date = self.log.is_up_to_date(args.last_log_term, args.last_log_index);
        let vote_granted = can_vote && up_to_date;

        if vote_granted {
            if self.voted_for != Some(args.candidate_id) {
                self.voted_for = Some(args.candidate_id);
                self.persist_hard_state()?;
            }
            self.reset_election_deadline();
            info!(node = self.id, term = self.current_term, candidate = args.candidate_id, "Granted vote");
        } else {
            debug!(
                node = self.id,
                term = self.current_term,
                candidate = args.candidate_id,
                voted_for = ?self.voted_for,
                up_to_date,
                "Denied vote"
            );
        }

        Ok(RequestVoteResult {
            term: self.current_term,
            vote_granted,
        })
    }

    pub fn handle_request_vote_result(
        &mut self,
        peer: NodeId,
        sent_term: Term,
        result: &RequestVoteResult,
    ) -> Result<Vec<Outbound>, RaftError> {
        if result.term > self.current_term {
            self.become_follower(result.term, None)?;
            return Ok(Vec::new());
        }
        if sent_term != self.current_term || !result.vote_granted {
            return Ok(Vec::new());
        }

        let needed = majority(self.peers.len() + 1);
        let won = match &mut self.role {
            Role::Candidate { votes } => {
                votes.insert(peer);
                votes.len() >= needed
            }
            _ => false,
        };

        if won {
            self.become_leader()
        } else {
            Ok(Vec::new())
        }
    }

    /// Accept `term`'s leader: step down if needed and restart the election timer
    fn follow(&mut self, term: Term, leader_id: NodeId) -> Result<(), RaftError> {
        if term > self.current_term || self.role.kind() != RoleKind::Follower {
            return self.become_follower(term, Some(leader_id));
        }
        if let Role::Follower { leader } = &mut self.role {
            *leader = Some(leader_id);
        }
        self.reset_election_deadline();
        Ok(())
    }

    pub fn handle_append_entries(&mut self, args: AppendEntriesArgs) -> Result<AppendEntriesResult, RaftError> {
        if args.term < self.current_term {
            debug!(
                node = self.id,
                leader = args.leader_id,
                error = %RaftError::StaleTerm { received: args.term, current: self.current_term },
                "Rejecting append"
            );
            return Ok(AppendEntriesResult {
                term: self.current_term,
                success: false,
                match_hint: None,
            });
        }

        self.follow(args.term, args.leader_id)?;

        match self.log.reconcile(
            args.prev_log_index,
            args.prev_log_term,
            args.entries,
            args.leader_commit,
        ) {
            Ok(_) => Ok(AppendEntriesResult {
                term: self.current_term,
                success: true,
                match_hint: None,
            }),
            Err(RaftError::LogConflict { index, match_hint }) => {
                debug!(node = self.id, index, match_hint, "Log mismatch; asking leader to back off");
                Ok(AppendEntriesResult {
                    term: self.current_term,
                    success: false,
                    match_hint: Some(match_hint),
                })
            }
            Err(e) => Err(e),
        }
    }

    pub fn handle_append_entries_result(
        &mut self,
        peer: NodeId,
        sent: AppendSent,
        result: &AppendEntriesResult,
    ) -> Result<Vec<Outbound>, RaftError> {
        if result.term > self.current_term {
            self.become_follower(result.term, None)?;
            return Ok(Vec::new());
        }
        if sent.term != self.current_term {
            return Ok(Vec::new());
        }

        let now = Instant::now();
        let Role::Leader { replication } = &mut self.role else {
            return Ok(Vec::new());
        };

        if !result.success {
            replication.on_append_reject(peer, sent, result.match_hint, now);
            debug!(node = self.id, peer, hint = ?result.match_hint, "Append rejected; retrying on next heartbeat");
            return Ok(Vec::new());
        }

        replication.on_append_success(peer, sent, now);
        let behind = replication
            .progress(peer)
            .is_some_and(|p| p.next_index <= self.log.last_index());

        self.advance_commit_index();
        if behind {
            return Ok(self.request_for(peer)?.into_iter().collect());
        }
        Ok(Vec::new())
    }

    pub fn handle_install_snapshot(
        &mut self,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, RaftError> {
        if args.term < self.current_term {
            return Ok(InstallSnapshotResult {
                term: self.current_term,
            });
        }

        self.follow(args.term, args.leader_id)?;

        let snapshot = Snapshot::new(args.last_included_index, args.last_included_term, args.data);
        if self.log.install_snapshot(&snapshot)? {
            self.state_machine
                .restore(&snapshot.data)
                .map_err(RaftError::SnapshotCorruption)?;
            self.applied_since_snapshot = 0;
        }

        Ok(InstallSnapshotResult {
            term: self.current_term,
        })
    }

    pub fn handle_install_snapshot_result(
        &mut self,
        peer: NodeId,
        sent_term: Term,
        last_included_index: LogIndex,
        result: &InstallSnapshotResult,
    ) -> Result<Vec<Outbound>, RaftError> {
        if result.term > self.current_term {
            self.become_follower(result.term, None)?;
            return Ok(Vec::new());
        }
        if sent_term != self.current_term {
            return Ok(Vec::new());
        }
        let Role::Leader { replication } = &mut self.role else {
            return Ok(Vec::new());
        };

        replication.on_snapshot_installed(peer, last_included_index, Instant::now());
        info!(node = self.id, peer, index = last_included_index, "Peer installed snapshot");
        self.advance_commit_index();
        Ok(self.request_for(peer)?.into_iter().collect())
    }

    /// The transport could not deliver a request; the next heartbeat retries
    pub fn handle_unreachable(&mut self, peer: NodeId, sent_term: Term) {
        if sent_term != self.current_term {
            return;
        }
        if let Role::Leader { replication } = &mut self.role {
            replication.on_unreachable(peer);
        }
    }

    /// Heartbeat tick (leader only)
    pub fn heartbeat(&mut self) -> Result<Vec<Outbound>, RaftError> {
        let window = self.config.election_timeout_max;
        let Role::Leader { replication } = &mut self.role else {
            return Ok(Vec::new());
        };

        let was_lost = replication.quorum_lost();
        if let Err(e) = replication.check_quorum(Instant::now(), window) {
            warn!(node = self.id, term = self.current_term, error = %e, "Commit index stalled");
        } else if was_lost && !replication.quorum_lost() {
            info!(node = self.id, term = self.current_term, "Quorum reachable again");
        }

        self.replicate()
    }

    /// One request for every peer that is not already waiting on a response
    pub fn replicate(&mut self) -> Result<Vec<Outbound>, RaftError> {
        let mut messages = Vec::new();
        for peer in self.peers.clone() {
            if let Some(message) = self.request_for(peer)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    fn request_for(&mut self, peer: NodeId) -> Result<Option<Outbound>, RaftError> {
        let Role::Leader { replication } = &mut self.role else {
            return Ok(None);
        };
        replication.next_request(
            peer,
            &self.log,
            self.current_term,
            self.id,
            self.config.max_entries_per_append,
            Instant::now(),
            self.config.election_timeout_max,
        )
    }

    /// Append a client command (leader only). Replication is asynchronous:
    /// the index is returned before the entry is committed.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<LogIndex, RaftError> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_id(),
            });
        }
        if command.is_empty() {
            return Err(RaftError::EmptyCommand);
        }
        self.state_machine
            .validate(&command)
            .map_err(RaftError::StateMachine)?;

        let index = self.log.append_as_leader(self.current_term, command)?;
        debug!(node = self.id, term = self.current_term, index, "Appended entry");
        self.advance_commit_index();
        Ok(index)
    }

    /// Commit the highest index stored on a majority, but only through an
    /// entry of the current term
    fn advance_commit_index(&mut self) {
        let Role::Leader { replication } = &self.role else {
            return;
        };
        let candidate = replication.majority_match(self.log.last_index());
        if candidate > self.log.commit_index() && self.log.term_at(candidate) == Some(self.current_term) {
            self.log.set_commit_index(candidate);
            debug!(node = self.id, index = candidate, "Advanced commit index");
        }
    }

    /// Apply every committed entry not yet applied, in index order
    pub fn apply_committed(&mut self) -> Result<Vec<Applied>, RaftError> {
        let mut applied = Vec::new();
        while let Some(entry) = self.log.next_committed() {
            self.applied_since_snapshot += 1;
            if entry.is_noop() {
                continue;
            }
            let result = self.state_machine.apply(entry.index, &entry.command);
            if let Err(e) = &result {
                debug!(node = self.id, index = entry.index, error = %e, "Command failed in state machine");
            }
            applied.push(Applied {
                index: entry.index,
                term: entry.term,
                result,
            });
        }

        let threshold = self.config.snapshot_threshold;
        if threshold > 0 && self.applied_since_snapshot >= threshold {
            info!(
                node = self.id,
                entries = self.applied_since_snapshot,
                "Automatic snapshot triggered"
            );
            self.take_snapshot()?;
        }
        Ok(applied)
    }

    /// Snapshot the state machine at `last_applied` and compact the log.
    /// Returns `None` when there is nothing new to compact.
    pub fn take_snapshot(&mut self) -> Result<Option<SnapshotMetadata>, RaftError> {
        let index = self.log.last_applied();
        if index <= self.log.snapshot_index() {
            return Ok(None);
        }
        let term = self
            .log
            .term_at(index)
            .ok_or_else(|| RaftError::DurabilityFailure(format!("applied entry {} missing from log", index)))?;
        let data = self.state_machine.snapshot().map_err(RaftError::StateMachine)?;

        let snapshot = Snapshot::new(index, term, data);
        self.log.compact(&snapshot)?;
        self.applied_since_snapshot = 0;
        info!(node = self.id, index, term, "Snapshot taken");
        Ok(Some(snapshot.metadata))
    }
}
