//! Simple key-value store state machine
//!
//! Commands (UTF-8, state-changing operations that go through the log):
//! - `SET key value` - Set a key to a value
//! - `DELETE key` - Delete a key, fails with `NOT_FOUND` if absent
//!
//! For reads, use the `get()` method directly (bypasses the log).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{ApplyResult, Snapshotable, StateMachine};
use crate::core::log::LogIndex;

enum KvCommand<'a> {
    Set { key: &'a str, value: &'a str },
    Delete { key: &'a str },
}

fn parse(command: &[u8]) -> Result<KvCommand<'_>, String> {
    let text = std::str::from_utf8(command).map_err(|_| "command is not UTF-8".to_string())?;
    let parts: Vec<&str> = text.splitn(3, ' ').collect();

    match parts.as_slice() {
        ["SET", key, value] => Ok(KvCommand::Set { key: *key, value: *value }),
        ["DELETE", key] => Ok(KvCommand::Delete { key: *key }),
        _ => Err(format!("unknown command: {}", text)),
    }
}

/// Simple in-memory key-value store
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
    /// Highest log index applied; re-delivered entries at or below it are ignored
    last_applied_index: LogIndex,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value directly (for read-only queries, bypasses the log)
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    pub fn last_applied_index(&self) -> LogIndex {
        self.last_applied_index
    }
}

/// Shared key-value store that can be used for both the node and direct reads
pub type SharedKvStore = Arc<Mutex<KeyValueStore>>;

impl StateMachine for SharedKvStore {
    fn validate(&self, command: &[u8]) -> Result<(), String> {
        self.lock().validate(command)
    }

    fn apply(&mut self, index: LogIndex, command: &[u8]) -> ApplyResult {
        self.lock().apply(index, command)
    }
}

impl Snapshotable for SharedKvStore {
    fn snapshot(&self) -> Result<Vec<u8>, String> {
        self.lock().snapshot()
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        self.lock().restore(data)
    }
}

impl StateMachine for KeyValueStore {
    fn validate(&self, command: &[u8]) -> Result<(), String> {
        parse(command).map(|_| ())
    }

    fn apply(&mut self, index: LogIndex, command: &[u8]) -> ApplyResult {
        if index <= self.last_applied_index {
            return Ok(Vec::new());
        }
        self.last_applied_index = index;

        match parse(command)? {
            KvCommand::Set { key, value } => {
                self.data.insert(key.to_string(), value.to_string());
                Ok(Vec::new())
            }
            KvCommand::Delete { key } => {
                if self.data.remove(key).is_some() {
                    Ok(Vec::new())
                } else {
                    Err("NOT_FOUND".to_string())
                }
            }
        }
    }
}

impl Snapshotable for KeyValueStore {
    fn snapshot(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(self).map_err(|e| format!("snapshot serialization failed: {}", e))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        let restored: KeyValueStore = serde_json::from_slice(data)
            .map_err(|e| format!("snapshot deserialization failed: {}", e))?;
        *self = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut kv = KeyValueStore::new();

        let result = kv.apply(1, b"SET foo bar");
        assert!(result.is_ok());
        assert_eq!(kv.get("foo"), Some("bar".to_string()));
    }

    #[test]
    fn test_delete() {
        let mut kv = KeyValueStore::new();

        kv.apply(1, b"SET foo bar").unwrap();
        assert!(kv.apply(2, b"DELETE foo").is_ok());
        assert_eq!(kv.get("foo"), None);
    }

    #[test]
    fn test_delete_not_found() {
        let mut kv = KeyValueStore::new();

        let result = kv.apply(1, b"DELETE nonexistent");
        assert_eq!(result, Err("NOT_FOUND".to_string()));
    }

    #[test]
    fn test_value_with_spaces() {
        let mut kv = KeyValueStore::new();

        // splitn(3, ' ') lets the value contain spaces
        kv.apply(1, b"SET greeting hello world").unwrap();
        assert_eq!(kv.get("greeting"), Some("hello world".to_string()));
    }

    #[test]
    fn test_unknown_command() {
        let mut kv = KeyValueStore::new();

        let result = kv.apply(1, b"INVALID command");
        assert!(result.unwrap_err().contains("unknown command"));
        // A failed command still consumes its index
        assert_eq!(kv.last_applied_index(), 1);
    }

    #[test]
    fn test_replayed_index_is_ignored() {
        let mut kv = KeyValueStore::new();

        kv.apply(1, b"SET counter a").unwrap();
        kv.apply(2, b"DELETE counter").unwrap();
        // Recovery re-delivers index 1; it must not resurrect the key
        kv.apply(1, b"SET counter a").unwrap();

        assert_eq!(kv.get("counter"), None);
        assert_eq!(kv.last_applied_index(), 2);
    }

    #[test]
    fn test_snapshot_and_restore() {
        let mut kv1 = KeyValueStore::new();
        kv1.apply(1, b"SET key1 value1").unwrap();
        kv1.apply(2, b"SET key2 value2").unwrap();

        let snapshot = kv1.snapshot().unwrap();

        let mut kv2 = KeyValueStore::new();
        kv2.apply(1, b"SET existing something").unwrap();
        kv2.restore(&snapshot).unwrap();

        assert_eq!(kv2.get("key1"), Some("value1".to_string()));
        assert_eq!(kv2.get("key2"), Some("value2".to_string()));
        assert_eq!(kv2.get("existing"), None);
        assert_eq!(kv2.last_applied_index(), 2);
    }

    #[test]
    fn test_restore_invalid_data() {
        let mut kv = KeyValueStore::new();
        let result = kv.restore(b"invalid json data");
        assert!(result.unwrap_err().contains("deserialization failed"));
    }

    #[test]
    fn test_validate_commands() {
        let kv = KeyValueStore::new();
        assert!(kv.validate(b"SET foo bar").is_ok());
        assert!(kv.validate(b"DELETE foo").is_ok());
        assert!(kv.validate(b"SET foo").is_err());
        assert!(kv.validate(b"INVALID foo").is_err());
        assert!(kv.validate(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_shared_store_applies_through_lock() {
        let shared: SharedKvStore = Arc::new(Mutex::new(KeyValueStore::new()));
        let mut handle = shared.clone();

        handle.apply(1, b"SET a 1").unwrap();
        assert_eq!(shared.lock().get("a"), Some("1".to_string()));
    }
}
