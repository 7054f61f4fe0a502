//! In-memory storage implementation for testing
//!
//! No disk I/O. Clones share the same underlying state, so a test can drop
//! a node and boot a new one over the "durable" state the old one left.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{HardState, LogStore, PersistentState, StorageError};
use crate::core::log::{LogEntry, LogIndex};
use crate::core::snapshot::Snapshot;

#[derive(Debug, Default)]
struct Inner {
    hard_state: HardState,
    log: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
    fail_writes: bool,
}

/// In-memory storage implementation
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with an I/O error
    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    pub fn hard_state(&self) -> HardState {
        self.inner.lock().hard_state
    }

    /// Durable log entries (excluding those covered by the snapshot)
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.lock().log.clone()
    }

    fn check_writable(inner: &Inner) -> Result<(), StorageError> {
        if inner.fail_writes {
            return Err(StorageError::Io("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl LogStore for MemoryStorage {
    fn load_on_boot(&mut self) -> Result<PersistentState, StorageError> {
        let inner = self.inner.lock();
        Ok(PersistentState {
            hard_state: inner.hard_state,
            snapshot: inner.snapshot.clone(),
            entries: inner.log.clone(),
        })
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        Self::check_writable(&inner)?;
        inner.hard_state = *state;
        Ok(())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        Self::check_writable(&inner)?;
        inner.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_suffix(&mut self, from_index: LogIndex) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        Self::check_writable(&inner)?;
        inner.log.retain(|e| e.index < from_index);
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        Self::check_writable(&inner)?;
        let last = snapshot.last_included_index();
        inner.log.retain(|e| e.index > last);
        inner.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.inner.lock().snapshot.clone())
    }
}
