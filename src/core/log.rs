//! Replicated log
//!
//! In-memory view of the log (committed prefix plus uncommitted tail) backed
//! by a durable [`LogStore`]. Every mutation reaches the store before the
//! in-memory view changes, so nothing is acknowledged or applied that a
//! crash could lose.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::RaftError;
use super::snapshot::Snapshot;
use crate::storage::{HardState, LogStore};

pub type NodeId = u64;
pub type Term = u64;
pub type LogIndex = u64;

/// A log entry containing a command and the term when it was received
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, command: Vec<u8>) -> Self {
        LogEntry {
            index,
            term,
            command,
        }
    }

    /// The leader's election no-op carries an empty command
    pub fn is_noop(&self) -> bool {
        self.command.is_empty()
    }
}

/// Result of opening a log over its durable store
pub struct Recovered {
    pub log: ReplicatedLog,
    pub hard_state: HardState,
    pub snapshot: Option<Snapshot>,
}

pub struct ReplicatedLog {
    store: Box<dyn LogStore>,
    /// Entries after the snapshot: `entries[i].index == snapshot_index + 1 + i`
    entries: Vec<LogEntry>,
    snapshot_index: LogIndex,
    snapshot_term: Term,
    commit_index: LogIndex,
    last_applied: LogIndex,
}

impl ReplicatedLog {
    /// Load persisted state and build the in-memory view.
    /// Commit and apply positions restart at the snapshot boundary.
    pub fn open(mut store: Box<dyn LogStore>) -> Result<Recovered, RaftError> {
        let mut persisted = store.load_on_boot()?;
        let (snapshot_index, snapshot_term) = persisted
            .snapshot
            .as_ref()
            .map_or((0, 0), |s| (s.last_included_index(), s.last_included_term()));

        // Terms never decrease along a log, so an entry older than the
        // snapshot's term is left over from an interrupted install
        if let Some(stale) = persisted.entries.iter().position(|e| e.term < snapshot_term) {
            let from = persisted.entries[stale].index;
            warn!(
                from,
                snapshot_index,
                snapshot_term,
                dropped = persisted.entries.len() - stale,
                "Dropping log entries older than the snapshot"
            );
            store.truncate_suffix(from)?;
            persisted.entries.truncate(stale);
        }

        let log = ReplicatedLog {
            store,
            entries: persisted.entries,
            snapshot_index,
            snapshot_term,
            commit_index: snapshot_index,
            last_applied: snapshot_index,
        };

        Ok(Recovered {
            log,
            hard_state: persisted.hard_state,
            snapshot: persisted.snapshot,
        })
    }

    pub fn save_hard_state(&mut self, state: &HardState) -> Result<(), RaftError> {
        self.store.save_hard_state(state)?;
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<Option<Snapshot>, RaftError> {
        Ok(self.store.load_snapshot()?)
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.last().map_or(self.snapshot_index, |e| e.index)
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(self.snapshot_term, |e| e.term)
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Term of the entry at `index`; `None` if absent or compacted away
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Up to `max` entries starting at `start` (which must be past the snapshot)
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry> {
        if start <= self.snapshot_index {
            return Vec::new();
        }
        let offset = (start - self.snapshot_index - 1) as usize;
        self.entries.iter().skip(offset).take(max).cloned().collect()
    }

    /// Vote rule: a candidate's log is acceptable if its last term is newer,
    /// or equal with an index at least as high as ours
    pub fn is_up_to_date(&self, last_log_term: Term, last_log_index: LogIndex) -> bool {
        last_log_term > self.last_term()
            || (last_log_term == self.last_term() && last_log_index >= self.last_index())
    }

    /// Append a new entry in `term` at the next index. Returns once durable.
    pub fn append_as_leader(&mut self, term: Term, command: Vec<u8>) -> Result<LogIndex, RaftError> {
        let entry = LogEntry::new(self.last_index() + 1, term, command);
        self.store.append_entries(std::slice::from_ref(&entry))?;
        let index = entry.index;
        self.entries.push(entry);
        Ok(index)
    }

    /// Follower side of AppendEntries.
    ///
    /// On success returns the index of the last entry covered by the request
    /// and raises the commit index to `min(leader_commit, that index)`.
    /// Fails with [`RaftError::LogConflict`] when `prev_log_index` is absent
    /// or has another term.
    pub fn reconcile(
        &mut self,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        mut entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> Result<LogIndex, RaftError> {
        let last_new = prev_log_index + entries.len() as u64;

        if prev_log_index < self.snapshot_index {
            // Snapshot content is committed, so only the part past it matters
            let covered = (self.snapshot_index - prev_log_index) as usize;
            entries.drain(..covered.min(entries.len()));
        } else {
            match self.term_at(prev_log_index) {
                Some(term) if term == prev_log_term => {}
                Some(term) => {
                    return Err(RaftError::LogConflict {
                        index: prev_log_index,
                        match_hint: self.first_index_of_term(prev_log_index, term).saturating_sub(1),
                    });
                }
                None => {
                    return Err(RaftError::LogConflict {
                        index: prev_log_index,
                        match_hint: self.last_index(),
                    });
                }
            }
        }

        // Skip entries we already hold; the first mismatch truncates the rest
        let mut first_new = entries.len();
        for (pos, entry) in entries.iter().enumerate() {
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index)?;
                    first_new = pos;
                    break;
                }
                None => {
                    first_new = pos;
                    break;
                }
            }
        }

        if first_new < entries.len() {
            let new_entries = entries.split_off(first_new);
            self.store.append_entries(&new_entries)?;
            debug!(
                first = new_entries[0].index,
                count = new_entries.len(),
                "Appended entries from leader"
            );
            self.entries.extend(new_entries);
        }

        let target = leader_commit.min(last_new);
        if target > self.commit_index {
            self.set_commit_index(target);
        }
        Ok(last_new)
    }

    /// First index (past the snapshot) of the run of `term` ending at `index`
    fn first_index_of_term(&self, index: LogIndex, term: Term) -> LogIndex {
        let mut first = index;
        while first > self.snapshot_index + 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), RaftError> {
        if index <= self.commit_index {
            return Err(RaftError::CommittedEntryConflict {
                index,
                commit_index: self.commit_index,
            });
        }
        self.store.truncate_suffix(index)?;
        let removed = self.last_index() - index + 1;
        self.entries.truncate((index - self.snapshot_index - 1) as usize);
        info!(from = index, removed, "Truncated conflicting log suffix");
        Ok(())
    }

    /// Raise the commit index (never lowers it, never past the last entry)
    pub fn set_commit_index(&mut self, index: LogIndex) {
        debug_assert!(index <= self.last_index());
        if index > self.commit_index {
            self.commit_index = index.min(self.last_index());
        }
    }

    /// Hand out the next committed-but-unapplied entry and mark it applied
    pub fn next_committed(&mut self) -> Option<LogEntry> {
        if self.last_applied >= self.commit_index {
            return None;
        }
        let entry = self.entry(self.last_applied + 1).cloned()?;
        self.last_applied = entry.index;
        Some(entry)
    }

    /// Install a snapshot received from the leader.
    ///
    /// Returns `false` (and changes nothing) when our applied state already
    /// covers it. Otherwise the local suffix survives only if it agrees with
    /// the snapshot's last entry, and the caller must restore the state
    /// machine from the snapshot data.
    pub fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<bool, RaftError> {
        let index = snapshot.last_included_index();
        let term = snapshot.last_included_term();
        if index <= self.last_applied {
            return Ok(false);
        }

        let keep_suffix = self.term_at(index) == Some(term);
        if keep_suffix {
            self.store.install_snapshot(snapshot)?;
            let covered = (index - self.snapshot_index) as usize;
            self.entries.drain(..covered);
        } else {
            // Drop the stale suffix first: a crash between the two writes
            // must never leave it sitting behind the snapshot
            self.store.truncate_suffix(index + 1)?;
            self.store.install_snapshot(snapshot)?;
            self.entries.clear();
        }

        self.snapshot_index = index;
        self.snapshot_term = term;
        self.commit_index = self.commit_index.max(index);
        self.last_applied = index;
        info!(index, term, kept = self.entries.len(), "Installed snapshot from leader");
        Ok(true)
    }

    /// Local compaction: persist `snapshot` and discard the entries it covers
    pub fn compact(&mut self, snapshot: &Snapshot) -> Result<(), RaftError> {
        let index = snapshot.last_included_index();
        debug_assert!(index <= self.last_applied);
        if index <= self.snapshot_index {
            return Ok(());
        }

        self.store.install_snapshot(snapshot)?;
        let covered = (index - self.snapshot_index) as usize;
        self.entries.drain(..covered);
        self.snapshot_index = index;
        self.snapshot_term = snapshot.last_included_term();
        info!(index, term = self.snapshot_term, "Compacted log");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, PersistentState, StorageError};

    fn open_log(storage: &MemoryStorage) -> ReplicatedLog {
        ReplicatedLog::open(Box::new(storage.clone())).unwrap().log
    }

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry::new(index, term, format!("CMD {}", index).into_bytes())
    }

    fn log_with_terms(terms: &[u64]) -> (ReplicatedLog, MemoryStorage) {
        let storage = MemoryStorage::new();
        let mut log = open_log(&storage);
        for term in terms {
            log.append_as_leader(*term, b"x".to_vec()).unwrap();
        }
        (log, storage)
    }

    #[test]
    fn test_append_as_leader_assigns_next_index() {
        let (mut log, storage) = log_with_terms(&[]);

        assert_eq!(log.append_as_leader(1, b"a".to_vec()).unwrap(), 1);
        assert_eq!(log.append_as_leader(1, b"b".to_vec()).unwrap(), 2);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);
        assert_eq!(storage.entries().len(), 2);
    }

    #[test]
    fn test_append_failure_leaves_log_unchanged() {
        let (mut log, storage) = log_with_terms(&[1]);
        storage.fail_writes(true);

        let result = log.append_as_leader(1, b"b".to_vec());
        assert!(matches!(result, Err(RaftError::DurabilityFailure(_))));
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn test_reconcile_appends_and_advances_commit() {
        let (mut log, _) = log_with_terms(&[]);

        let last = log.reconcile(0, 0, vec![entry(1, 1), entry(2, 1)], 1).unwrap();
        assert_eq!(last, 2);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.commit_index(), 1);
    }

    #[test]
    fn test_reconcile_heartbeat_advances_commit() {
        let (mut log, _) = log_with_terms(&[1, 1, 1]);

        log.reconcile(3, 1, vec![], 2).unwrap();
        assert_eq!(log.commit_index(), 2);
    }

    #[test]
    fn test_reconcile_commit_bounded_by_request() {
        // Entries past what the leader sent may be stale; never commit them
        let (mut log, _) = log_with_terms(&[1, 1, 1, 1]);

        log.reconcile(2, 1, vec![], 4).unwrap();
        assert_eq!(log.commit_index(), 2);
    }

    #[test]
    fn test_reconcile_rejects_missing_prev() {
        let (mut log, _) = log_with_terms(&[1, 1]);

        let result = log.reconcile(5, 1, vec![entry(6, 1)], 0);
        assert_eq!(result, Err(RaftError::LogConflict { index: 5, match_hint: 2 }));
    }

    #[test]
    fn test_reconcile_rejects_term_mismatch_with_hint() {
        let (mut log, _) = log_with_terms(&[1, 2, 2, 2]);

        let result = log.reconcile(4, 3, vec![], 0);
        // The whole run of term 2 is suspect; the hint points before it
        assert_eq!(result, Err(RaftError::LogConflict { index: 4, match_hint: 1 }));
    }

    #[test]
    fn test_reconcile_truncates_conflicting_suffix() {
        let (mut log, storage) = log_with_terms(&[1, 1, 2, 2]);

        log.reconcile(2, 1, vec![entry(3, 3)], 0).unwrap();

        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(3), Some(3));
        assert_eq!(storage.entries().len(), 3);
        assert_eq!(storage.entries()[2].term, 3);
    }

    #[test]
    fn test_reconcile_stale_request_does_not_truncate() {
        let (mut log, _) = log_with_terms(&[]);
        log.reconcile(0, 0, vec![entry(1, 1), entry(2, 1), entry(3, 1)], 0).unwrap();

        // A delayed copy of an earlier, shorter request
        log.reconcile(0, 0, vec![entry(1, 1)], 0).unwrap();
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn test_reconcile_refuses_to_truncate_committed() {
        let (mut log, _) = log_with_terms(&[1, 1]);
        log.set_commit_index(2);

        let result = log.reconcile(1, 1, vec![entry(2, 2)], 2);
        assert!(matches!(result, Err(RaftError::CommittedEntryConflict { index: 2, .. })));
        assert_eq!(log.term_at(2), Some(1));
    }

    #[test]
    fn test_up_to_date_comparison() {
        let (log, _) = log_with_terms(&[1, 2]);

        assert!(log.is_up_to_date(3, 1));
        assert!(log.is_up_to_date(2, 2));
        assert!(log.is_up_to_date(2, 5));
        assert!(!log.is_up_to_date(2, 1));
        assert!(!log.is_up_to_date(1, 10));
    }

    #[test]
    fn test_next_committed_walks_in_order() {
        let (mut log, _) = log_with_terms(&[1, 1, 1]);
        log.set_commit_index(2);

        assert_eq!(log.next_committed().map(|e| e.index), Some(1));
        assert_eq!(log.next_committed().map(|e| e.index), Some(2));
        assert_eq!(log.next_committed(), None);
        assert_eq!(log.last_applied(), 2);
    }

    #[test]
    fn test_compact_discards_prefix() {
        let (mut log, storage) = log_with_terms(&[1, 1, 2, 2]);
        log.set_commit_index(3);
        while log.next_committed().is_some() {}

        log.compact(&Snapshot::new(3, 2, vec![])).unwrap();

        assert_eq!(log.snapshot_index(), 3);
        assert_eq!(log.term_at(3), Some(2));
        assert_eq!(log.term_at(2), None);
        assert_eq!(log.entry(4).map(|e| e.index), Some(4));
        assert_eq!(log.entries_from(4, 10).len(), 1);
        assert_eq!(storage.entries().len(), 1);
    }

    #[test]
    fn test_install_snapshot_keeps_matching_suffix() {
        let (mut log, _) = log_with_terms(&[1, 1, 1, 1]);

        assert!(log.install_snapshot(&Snapshot::new(2, 1, vec![])).unwrap());
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.commit_index(), 2);
        assert_eq!(log.last_applied(), 2);
    }

    #[test]
    fn test_install_snapshot_discards_conflicting_log() {
        let (mut log, storage) = log_with_terms(&[1, 1, 1, 1]);

        assert!(log.install_snapshot(&Snapshot::new(3, 2, vec![])).unwrap());
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert!(storage.entries().is_empty());
    }

    /// Store that fails every write after the first `allowed` ones
    struct CrashingStore {
        inner: MemoryStorage,
        allowed: usize,
    }

    impl CrashingStore {
        fn write(&mut self) -> Result<(), StorageError> {
            if self.allowed == 0 {
                return Err(StorageError::Io("crash".to_string()));
            }
            self.allowed -= 1;
            Ok(())
        }
    }

    impl LogStore for CrashingStore {
        fn load_on_boot(&mut self) -> Result<PersistentState, StorageError> {
            self.inner.load_on_boot()
        }

        fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError> {
            self.write()?;
            self.inner.save_hard_state(state)
        }

        fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
            self.write()?;
            self.inner.append_entries(entries)
        }

        fn truncate_suffix(&mut self, from_index: LogIndex) -> Result<(), StorageError> {
            self.write()?;
            self.inner.truncate_suffix(from_index)
        }

        fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
            self.write()?;
            self.inner.install_snapshot(snapshot)
        }

        fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
            self.inner.load_snapshot()
        }
    }

    #[test]
    fn test_interrupted_snapshot_install_leaves_no_stale_suffix() {
        let storage = MemoryStorage::new();
        let mut log = open_log(&storage);
        log.reconcile(0, 0, vec![entry(1, 1), entry(2, 1), entry(3, 2), entry(4, 2)], 0)
            .unwrap();
        drop(log);

        // Only the first of the install's two writes lands
        let store = CrashingStore { inner: storage.clone(), allowed: 1 };
        let mut log = ReplicatedLog::open(Box::new(store)).unwrap().log;
        let result = log.install_snapshot(&Snapshot::new(3, 3, vec![]));
        assert!(matches!(result, Err(RaftError::DurabilityFailure(_))));

        let rebooted = open_log(&storage);
        assert_eq!(rebooted.snapshot_index(), 0);
        assert_eq!(rebooted.last_index(), 3);
        assert_eq!(rebooted.last_term(), 2);
        assert_eq!(storage.entries().last().map(|e| e.index), Some(3));
    }

    #[test]
    fn test_open_drops_entries_older_than_snapshot() {
        let mut storage = MemoryStorage::new();
        storage.install_snapshot(&Snapshot::new(3, 3, vec![])).unwrap();
        storage.append_entries(&[entry(4, 2), entry(5, 2)]).unwrap();

        let log = open_log(&storage);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 3);
        assert!(!log.is_up_to_date(2, 5));
        assert!(storage.entries().is_empty());
    }

    #[test]
    fn test_install_snapshot_ignores_already_applied() {
        let (mut log, _) = log_with_terms(&[1, 1]);
        log.set_commit_index(2);
        while log.next_committed().is_some() {}

        assert!(!log.install_snapshot(&Snapshot::new(1, 1, vec![])).unwrap());
        assert_eq!(log.snapshot_index(), 0);
    }

    #[test]
    fn test_reconcile_below_snapshot_boundary() {
        let (mut log, _) = log_with_terms(&[]);
        log.install_snapshot(&Snapshot::new(5, 2, vec![])).unwrap();

        let last = log
            .reconcile(3, 2, vec![entry(4, 2), entry(5, 2), entry(6, 3)], 6)
            .unwrap();
        assert_eq!(last, 6);
        assert_eq!(log.last_index(), 6);
        assert_eq!(log.commit_index(), 6);
    }

    #[test]
    fn test_reopen_restores_state() {
        let (mut log, storage) = log_with_terms(&[1, 1, 2]);
        log.save_hard_state(&HardState { current_term: 2, voted_for: Some(1) }).unwrap();
        drop(log);

        let recovered = ReplicatedLog::open(Box::new(storage.clone())).unwrap();
        assert_eq!(recovered.log.last_index(), 3);
        assert_eq!(recovered.log.last_term(), 2);
        assert_eq!(recovered.log.commit_index(), 0);
        assert_eq!(recovered.hard_state.voted_for, Some(1));
    }
}
