//! Error taxonomy for the protocol engine

use thiserror::Error;

use super::log::{LogIndex, NodeId, Term};
use crate::storage::StorageError;

/// Errors raised by the protocol engine and the processing loop.
///
/// Some variants are ordinary protocol outcomes (a stale term, a log
/// mismatch) that are turned into RPC rejections. Others are fatal and stop
/// the node; see [`RaftError::is_fatal`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    /// A message carried a term lower than ours
    #[error("stale term {received} (current term is {current})")]
    StaleTerm { received: Term, current: Term },

    /// The entry at `prev_log_index` is absent or has a different term
    #[error("log conflict at index {index}; follower matches up to {match_hint}")]
    LogConflict { index: LogIndex, match_hint: LogIndex },

    /// Durable storage could not complete a write or read
    #[error("durability failure: {0}")]
    DurabilityFailure(String),

    /// The leader cannot reach a majority, so commits stall
    #[error("quorum unreachable")]
    QuorumUnreachable,

    /// A snapshot failed validation
    #[error("snapshot corruption: {0}")]
    SnapshotCorruption(String),

    /// A leader asked us to overwrite an entry we already consider committed
    #[error("refusing to truncate committed entry {index} (commit index {commit_index})")]
    CommittedEntryConflict { index: LogIndex, commit_index: LogIndex },

    /// This node is not the leader (includes leader hint if known)
    #[error("not the leader")]
    NotLeader { leader_hint: Option<NodeId> },

    /// Empty commands are reserved for the leader's election no-op
    #[error("empty command")]
    EmptyCommand,

    /// The node stepped down before the entry was applied; its fate is unknown
    #[error("leadership lost before entry {index} was applied")]
    LeadershipLost { index: LogIndex },

    /// State machine returned an error
    #[error("state machine error: {0}")]
    StateMachine(String),

    /// The data directory or configuration does not belong to this node
    #[error("identity error: {0}")]
    Identity(String),

    /// The processing loop is no longer running
    #[error("node stopped")]
    NodeStopped,
}

impl RaftError {
    /// Fatal errors halt the node instead of risking a false acknowledgement
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RaftError::DurabilityFailure(_)
                | RaftError::SnapshotCorruption(_)
                | RaftError::CommittedEntryConflict { .. }
                | RaftError::Identity(_)
        )
    }
}

impl From<StorageError> for RaftError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::SnapshotCorruption(msg) => RaftError::SnapshotCorruption(msg),
            other => RaftError::DurabilityFailure(other.to_string()),
        }
    }
}
