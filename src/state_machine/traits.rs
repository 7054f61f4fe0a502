//! State machine abstraction
//!
//! The state machine is the application logic the cluster coordinates.
//! When log entries are committed, they are applied to the state machine
//! in index order.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::log::LogIndex;

/// Result of applying a command to the state machine
/// Ok(output) for successful commands, Err(message) for errors
pub type ApplyResult = Result<Vec<u8>, String>;

/// State machine trait - the application logic the cluster coordinates
///
/// Implementations must be deterministic: applying the same commands
/// in the same order must produce the same state on all nodes. During
/// recovery an entry may be delivered again; applying `index` a second time
/// must not change the observable state.
pub trait StateMachine: Send {
    /// Check a command before it is proposed. Rejected commands never
    /// reach the log.
    fn validate(&self, _command: &[u8]) -> Result<(), String> {
        Ok(())
    }

    /// Apply the committed command at `index`
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> ApplyResult;
}

/// Snapshotable state machine - supports log compaction
///
/// Allows serializing state to bytes and restoring from bytes.
pub trait Snapshotable: StateMachine {
    /// Create a snapshot of the current state
    fn snapshot(&self) -> Result<Vec<u8>, String>;

    /// Replace current state with the deserialized snapshot data
    fn restore(&mut self, data: &[u8]) -> Result<(), String>;
}

/// Shared record of applied commands for testing
pub type AppliedCommands = Arc<Mutex<Vec<String>>>;

#[derive(Serialize, Deserialize)]
struct TestSnapshot {
    last_index: LogIndex,
    applied: Vec<String>,
}

/// Test state machine that records all applied commands to a shared vec
#[derive(Default)]
pub struct TestStateMachine {
    applied: AppliedCommands,
    last_index: LogIndex,
}

impl TestStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with a shared vec to inspect applied commands from outside
    pub fn new_shared(applied: AppliedCommands) -> Self {
        TestStateMachine {
            applied,
            last_index: 0,
        }
    }
}

impl StateMachine for TestStateMachine {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> ApplyResult {
        if index <= self.last_index {
            return Ok(Vec::new());
        }
        self.last_index = index;
        self.applied
            .lock()
            .push(String::from_utf8_lossy(command).into_owned());
        Ok(Vec::new())
    }
}

impl Snapshotable for TestStateMachine {
    fn snapshot(&self) -> Result<Vec<u8>, String> {
        let snapshot = TestSnapshot {
            last_index: self.last_index,
            applied: self.applied.lock().clone(),
        };
        serde_json::to_vec(&snapshot)
            .map_err(|e| format!("test state machine snapshot failed: {}", e))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        let snapshot: TestSnapshot = serde_json::from_slice(data)
            .map_err(|e| format!("test state machine restore failed: {}", e))?;
        self.last_index = snapshot.last_index;
        *self.applied.lock() = snapshot.applied;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_commands_once() {
        let applied = AppliedCommands::default();
        let mut sm = TestStateMachine::new_shared(applied.clone());

        sm.apply(1, b"a").unwrap();
        sm.apply(2, b"b").unwrap();
        sm.apply(2, b"b").unwrap();

        assert_eq!(*applied.lock(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_snapshot_restores_position() {
        let mut sm = TestStateMachine::new();
        sm.apply(1, b"a").unwrap();
        let snapshot = sm.snapshot().unwrap();

        let applied = AppliedCommands::default();
        let mut restored = TestStateMachine::new_shared(applied.clone());
        restored.restore(&snapshot).unwrap();
        restored.apply(1, b"a").unwrap();
        restored.apply(2, b"b").unwrap();

        assert_eq!(*applied.lock(), vec!["a".to_string(), "b".to_string()]);
    }
}
