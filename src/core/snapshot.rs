//! Snapshot types for log compaction
//!
//! A snapshot captures the state machine at a specific log index so that
//! every entry up to and including that index can be discarded.

use serde::{Deserialize, Serialize};

use super::log::{LogIndex, Term};

/// Metadata about what's included in a snapshot
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    /// Last log index included in this snapshot
    pub last_included_index: LogIndex,
    /// Term of the last included log entry
    pub last_included_term: Term,
}

/// A snapshot of the state machine at a specific point in the log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    /// Serialized state machine data
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn new(last_included_index: LogIndex, last_included_term: Term, data: Vec<u8>) -> Self {
        Snapshot {
            metadata: SnapshotMetadata {
                last_included_index,
                last_included_term,
            },
            data,
        }
    }

    pub fn last_included_index(&self) -> LogIndex {
        self.metadata.last_included_index
    }

    pub fn last_included_term(&self) -> Term {
        self.metadata.last_included_term
    }
}
