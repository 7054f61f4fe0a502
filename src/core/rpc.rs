//! Protocol messages exchanged between nodes
//!
//! These carry the fields each RPC needs; the wire encoding is whatever the
//! transport chooses (the HTTP transport uses JSON through serde).

use serde::{Deserialize, Serialize};

use super::log::{LogEntry, LogIndex, NodeId, Term};

/// RequestVote RPC arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// Candidate's term
    pub term: Term,
    /// Candidate requesting vote
    pub candidate_id: NodeId,
    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,
    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

/// RequestVote RPC results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResult {
    /// Current term, for candidate to update itself
    pub term: Term,
    /// True means candidate received vote
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// Leader's term
    pub term: Term,
    /// Leader's ID
    pub leader_id: NodeId,
    /// Index of log entry immediately preceding new ones
    pub prev_log_index: LogIndex,
    /// Term of prev_log_index entry
    pub prev_log_term: Term,
    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,
    /// Leader's commit_index
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    /// Current term, for leader to update itself
    pub term: Term,
    /// True if follower contained entry matching prev_log_index and prev_log_term
    pub success: bool,
    /// On rejection, the highest index the follower believes it shares with
    /// the leader; lets the leader skip a run of mismatched entries at once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_hint: Option<LogIndex>,
}

/// InstallSnapshot RPC arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    /// Leader's term
    pub term: Term,
    /// Leader's ID
    pub leader_id: NodeId,
    /// Last log index included in snapshot
    pub last_included_index: LogIndex,
    /// Term of last included entry
    pub last_included_term: Term,
    /// Snapshot data
    pub data: Vec<u8>,
}

/// InstallSnapshot RPC results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResult {
    /// Current term, for leader to update itself
    pub term: Term,
}

/// What a leader remembers about an AppendEntries it sent, so the response
/// can be matched back to the entries it acknowledges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendSent {
    pub term: Term,
    pub prev_log_index: LogIndex,
    pub entry_count: u64,
}

impl AppendSent {
    pub fn for_args(args: &AppendEntriesArgs) -> Self {
        AppendSent {
            term: args.term,
            prev_log_index: args.prev_log_index,
            entry_count: args.entries.len() as u64,
        }
    }

    /// Index of the last entry this request would replicate
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entry_count
    }
}

/// A message the core wants delivered to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    RequestVote { to: NodeId, args: RequestVoteArgs },
    AppendEntries { to: NodeId, args: AppendEntriesArgs },
    InstallSnapshot { to: NodeId, args: InstallSnapshotArgs },
}

impl Outbound {
    pub fn target(&self) -> NodeId {
        match self {
            Outbound::RequestVote { to, .. }
            | Outbound::AppendEntries { to, .. }
            | Outbound::InstallSnapshot { to, .. } => *to,
        }
    }
}
