//! Storage abstraction for persistent node state
//!
//! The node must persist current_term, voted_for and log entries before it
//! answers any RPC that depends on them. The store knows nothing about
//! consensus; it only keeps what it is given, durably.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::log::{LogEntry, LogIndex, NodeId, Term};
use crate::core::snapshot::Snapshot;

/// Errors that can occur during storage operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// I/O error (e.g., disk full, permission denied)
    #[error("I/O error: {0}")]
    Io(String),
    /// Data corruption detected in the log or hard state
    #[error("data corruption: {0}")]
    Corruption(String),
    /// The snapshot record failed checksum or decoding
    #[error("snapshot corruption: {0}")]
    SnapshotCorruption(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// The single `{current_term, voted_for}` record, updated in place
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Everything a node needs to rebuild itself after a restart
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentState {
    pub hard_state: HardState,
    pub snapshot: Option<Snapshot>,
    /// Contiguous entries following the snapshot (or starting at index 1)
    pub entries: Vec<LogEntry>,
}

/// Durable log store
///
/// Every mutating call must be durable before it returns: the caller will
/// acknowledge replication or apply entries as soon as it gets `Ok`.
/// Mutations take `&mut self`, so a single owner serializes them.
/// The `Send` bound is required for use in async contexts.
pub trait LogStore: Send {
    /// Reconstruct the state as of the last durable write.
    /// Entries already covered by the snapshot are not returned.
    fn load_on_boot(&mut self) -> Result<PersistentState, StorageError>;

    /// Replace the `{current_term, voted_for}` record
    fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError>;

    /// Append entries after any existing entries
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Remove all entries with index >= from_index
    fn truncate_suffix(&mut self, from_index: LogIndex) -> Result<(), StorageError>;

    /// Persist the snapshot and drop every entry it covers, atomically with
    /// respect to `load_on_boot`
    fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Load the most recent snapshot, if any
    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError>;
}
