//! File-based storage implementation for persistent node state
//!
//! Stores state in three files within a directory:
//! - `hard_state` - current term and vote (JSON with checksum)
//! - `log` - log entries (JSON lines format, each line has checksum)
//! - `snapshot` - most recent snapshot (JSON with checksum)
//!
//! Single-record files are replaced atomically (temp file, fsync, rename,
//! fsync directory). The log is appended and fsynced; a damaged final line
//! is a torn write from a crash and is dropped on load.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::{HardState, LogStore, PersistentState, StorageError};
use crate::core::log::{LogEntry, LogIndex};
use crate::core::snapshot::Snapshot;

/// Encode one record as `"{json} {crc32_hex}"` (no trailing newline)
pub(crate) fn encode_record<T: Serialize>(value: &T) -> Result<String, StorageError> {
    let json = serde_json::to_string(value)
        .map_err(|e| StorageError::Io(format!("serialization error: {}", e)))?;
    let checksum = crc32fast::hash(json.as_bytes());
    Ok(format!("{} {:08x}", json, checksum))
}

/// Verify and decode a record produced by [`encode_record`]
pub(crate) fn decode_record<T: DeserializeOwned>(line: &str) -> Result<T, String> {
    let (json, checksum_str) = line
        .rsplit_once(' ')
        .ok_or_else(|| "missing checksum".to_string())?;

    let stored = u32::from_str_radix(checksum_str, 16)
        .map_err(|_| "invalid checksum format".to_string())?;
    let computed = crc32fast::hash(json.as_bytes());
    if stored != computed {
        return Err(format!(
            "checksum mismatch: stored {:08x}, computed {:08x}",
            stored, computed
        ));
    }

    serde_json::from_str(json).map_err(|e| format!("invalid record: {}", e))
}

/// Atomically replace `path` with `data` (write temp, fsync, rename, fsync dir)
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;

    if let Some(dir) = path.parent() {
        sync_dir(dir)?;
    }
    Ok(())
}

/// Read a single-record file; `None` when it does not exist yet
pub(crate) fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let content = content.trim();
    if content.is_empty() {
        return Ok(None);
    }
    decode_record(content).map(Some)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StorageError> {
    Ok(())
}

/// File-based storage implementation
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Create a new FileStorage in the given directory
    /// Creates the directory if it doesn't exist
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(FileStorage { dir })
    }

    fn hard_state_path(&self) -> PathBuf {
        self.dir.join("hard_state")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot")
    }

    /// Read the log file, dropping (and trimming away) a torn final line
    fn read_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.split('\n').collect();
        // Everything after the last '\n' was never completed
        let (complete, unterminated) = lines.split_at(lines.len() - 1);
        let mut torn = !unterminated[0].is_empty();

        let mut entries = Vec::with_capacity(complete.len());
        for (line_num, line) in complete.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match decode_record::<LogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if line_num + 1 == complete.len() => {
                    warn!(line = line_num + 1, error = %e, "Dropping torn log tail");
                    torn = true;
                }
                Err(e) => {
                    return Err(StorageError::Corruption(format!(
                        "log line {}: {}",
                        line_num + 1,
                        e
                    )));
                }
            }
        }

        for pair in entries.windows(2) {
            if pair[1].index != pair[0].index + 1 {
                return Err(StorageError::Corruption(format!(
                    "log gap between index {} and {}",
                    pair[0].index, pair[1].index
                )));
            }
        }

        if torn {
            self.rewrite_log(&entries)?;
        }
        Ok(entries)
    }

    fn rewrite_log(&self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut content = String::new();
        for entry in entries {
            content.push_str(&encode_record(entry)?);
            content.push('\n');
        }
        atomic_write(&self.log_path(), content.as_bytes())
    }
}

impl LogStore for FileStorage {
    fn load_on_boot(&mut self) -> Result<PersistentState, StorageError> {
        let hard_state = read_record::<HardState>(&self.hard_state_path())
            .map_err(|e| StorageError::Corruption(format!("hard_state: {}", e)))?
            .unwrap_or_default();
        let snapshot = self.load_snapshot()?;
        let snapshot_index = snapshot.as_ref().map_or(0, |s| s.last_included_index());

        // Entries the snapshot covers may survive a crash mid-install
        let entries: Vec<LogEntry> = self
            .read_log()?
            .into_iter()
            .filter(|e| e.index > snapshot_index)
            .collect();

        if let Some(first) = entries.first() {
            if first.index != snapshot_index + 1 {
                return Err(StorageError::Corruption(format!(
                    "log starts at index {} but snapshot ends at {}",
                    first.index, snapshot_index
                )));
            }
        }

        debug!(
            dir = %self.dir.display(),
            term = hard_state.current_term,
            snapshot_index,
            entries = entries.len(),
            "Loaded persistent state"
        );
        Ok(PersistentState {
            hard_state,
            snapshot,
            entries,
        })
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError> {
        let mut record = encode_record(state)?;
        record.push('\n');
        atomic_write(&self.hard_state_path(), record.as_bytes())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut content = String::new();
        for entry in entries {
            content.push_str(&encode_record(entry)?);
            content.push('\n');
        }

        let path = self.log_path();
        let created = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        if created {
            // The new directory entry must be durable too
            sync_dir(&self.dir)?;
        }
        Ok(())
    }

    fn truncate_suffix(&mut self, from_index: LogIndex) -> Result<(), StorageError> {
        let keep: Vec<LogEntry> = self
            .read_log()?
            .into_iter()
            .filter(|e| e.index < from_index)
            .collect();
        self.rewrite_log(&keep)
    }

    fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut record = encode_record(snapshot)?;
        record.push('\n');
        atomic_write(&self.snapshot_path(), record.as_bytes())?;

        let last = snapshot.last_included_index();
        let keep: Vec<LogEntry> = self
            .read_log()?
            .into_iter()
            .filter(|e| e.index > last)
            .collect();
        self.rewrite_log(&keep)
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        read_record(&self.snapshot_path()).map_err(StorageError::SnapshotCorruption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_storage() -> (FileStorage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        (storage, dir)
    }

    fn entry(term: u64, index: u64, command: &str) -> LogEntry {
        LogEntry::new(index, term, command.as_bytes().to_vec())
    }

    #[test]
    fn test_file_storage_fresh_directory() {
        let (mut storage, _dir) = test_storage();

        let state = storage.load_on_boot().unwrap();
        assert_eq!(state, PersistentState::default());
    }

    #[test]
    fn test_file_storage_hard_state() {
        let (mut storage, _dir) = test_storage();

        storage
            .save_hard_state(&HardState { current_term: 5, voted_for: Some(3) })
            .unwrap();
        storage
            .save_hard_state(&HardState { current_term: 100, voted_for: None })
            .unwrap();

        let state = storage.load_on_boot().unwrap();
        assert_eq!(state.hard_state.current_term, 100);
        assert_eq!(state.hard_state.voted_for, None);
    }

    #[test]
    fn test_file_storage_log() {
        let (mut storage, _dir) = test_storage();

        storage
            .append_entries(&[entry(1, 1, "SET x 1"), entry(1, 2, "SET y 2")])
            .unwrap();

        let loaded = storage.load_on_boot().unwrap().entries;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].command, b"SET x 1");
        assert_eq!(loaded[1].command, b"SET y 2");
    }

    #[test]
    fn test_first_append_creates_log_in_directory() {
        let dir = TempDir::new().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        assert!(!dir.path().join("log").exists());

        storage.append_entries(&[entry(1, 1, "CMD 1")]).unwrap();
        assert!(dir.path().join("log").exists());
        storage.append_entries(&[entry(1, 2, "CMD 2")]).unwrap();

        let mut reopened = FileStorage::new(dir.path()).unwrap();
        let loaded = reopened.load_on_boot().unwrap().entries;
        assert_eq!(loaded.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_file_storage_truncate_suffix() {
        let (mut storage, _dir) = test_storage();

        storage
            .append_entries(&[entry(1, 1, "CMD 1"), entry(1, 2, "CMD 2"), entry(2, 3, "CMD 3")])
            .unwrap();
        storage.truncate_suffix(2).unwrap();
        storage.append_entries(&[entry(3, 2, "CMD 2b")]).unwrap();

        let loaded = storage.load_on_boot().unwrap().entries;
        assert_eq!(loaded, vec![entry(1, 1, "CMD 1"), entry(3, 2, "CMD 2b")]);
    }

    #[test]
    fn test_file_storage_persistence_across_instances() {
        let dir = TempDir::new().unwrap();

        // First instance - write data
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage
                .save_hard_state(&HardState { current_term: 42, voted_for: Some(7) })
                .unwrap();
            storage.append_entries(&[entry(42, 1, "HELLO")]).unwrap();
        }

        // Second instance - read data (simulates restart)
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            let state = storage.load_on_boot().unwrap();
            assert_eq!(state.hard_state.current_term, 42);
            assert_eq!(state.hard_state.voted_for, Some(7));
            assert_eq!(state.entries, vec![entry(42, 1, "HELLO")]);
        }
    }

    #[test]
    fn test_torn_final_line_is_dropped() {
        let (mut storage, dir) = test_storage();
        storage
            .append_entries(&[entry(1, 1, "CMD 1"), entry(1, 2, "CMD 2")])
            .unwrap();

        // Simulate a crash halfway through writing entry 3
        let log_path = dir.path().join("log");
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        write!(file, "{{\"index\":3,\"term\":1,\"comm").unwrap();
        drop(file);

        let loaded = storage.load_on_boot().unwrap().entries;
        assert_eq!(loaded.len(), 2);

        // The trimmed file accepts new appends cleanly
        storage.append_entries(&[entry(2, 3, "CMD 3")]).unwrap();
        let loaded = storage.load_on_boot().unwrap().entries;
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[2].term, 2);
    }

    #[test]
    fn test_detects_corrupted_log_entry_in_middle() {
        let (mut storage, dir) = test_storage();
        storage.append_entries(&[entry(1, 1, "CMD")]).unwrap();

        let log_path = dir.path().join("log");
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        writeln!(file, "{{\"index\":2,\"term\":1,\"command\":[66]}} deadbeef").unwrap();
        drop(file);
        storage.append_entries(&[entry(1, 3, "CMD 3")]).unwrap();

        let result = storage.load_on_boot();
        assert!(matches!(result, Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_detects_corrupted_hard_state() {
        let (mut storage, dir) = test_storage();
        storage
            .save_hard_state(&HardState { current_term: 42, voted_for: None })
            .unwrap();

        // Modify data but not checksum
        fs::write(dir.path().join("hard_state"), "{\"current_term\":99,\"voted_for\":null} 12345678\n")
            .unwrap();

        let result = storage.load_on_boot();
        assert!(matches!(result, Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_detects_corrupted_snapshot() {
        let (mut storage, dir) = test_storage();
        storage.install_snapshot(&Snapshot::new(10, 2, vec![1, 2, 3])).unwrap();

        fs::write(dir.path().join("snapshot"), "garbage 00000000\n").unwrap();

        let result = storage.load_on_boot();
        assert!(matches!(result, Err(StorageError::SnapshotCorruption(_))));
    }

    #[test]
    fn test_file_storage_snapshot_persistence() {
        let dir = TempDir::new().unwrap();

        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage
                .append_entries(&[entry(1, 1, "A"), entry(1, 2, "B"), entry(2, 3, "C")])
                .unwrap();
            storage.install_snapshot(&Snapshot::new(2, 1, vec![1, 2, 3, 4, 5])).unwrap();
        }

        let mut storage = FileStorage::new(dir.path()).unwrap();
        let state = storage.load_on_boot().unwrap();
        let snapshot = state.snapshot.unwrap();
        assert_eq!(snapshot.last_included_index(), 2);
        assert_eq!(snapshot.last_included_term(), 1);
        assert_eq!(snapshot.data, vec![1, 2, 3, 4, 5]);
        assert_eq!(state.entries, vec![entry(2, 3, "C")]);
    }

    #[test]
    fn test_stale_entries_below_snapshot_are_ignored() {
        let (mut storage, dir) = test_storage();
        storage
            .append_entries(&[entry(1, 1, "A"), entry(1, 2, "B"), entry(1, 3, "C")])
            .unwrap();

        // Crash after the snapshot was written but before the log was rewritten
        let record = encode_record(&Snapshot::new(2, 1, vec![])).unwrap();
        fs::write(dir.path().join("snapshot"), format!("{}\n", record)).unwrap();

        let state = storage.load_on_boot().unwrap();
        assert_eq!(state.entries, vec![entry(1, 3, "C")]);
    }

    #[test]
    fn test_crc32_basic() {
        // Test vector: "123456789" should have CRC32 = 0xCBF43926
        assert_eq!(crc32fast::hash(b"123456789"), 0xCBF43926);
    }
}
