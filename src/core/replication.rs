//! Leader-side replication bookkeeping
//!
//! Tracks, per peer, what to send next and what is known to be stored there,
//! and derives the commit index from the majority's progress.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use super::error::RaftError;
use super::log::{LogIndex, NodeId, ReplicatedLog, Term};
use super::rpc::{AppendEntriesArgs, AppendSent, InstallSnapshotArgs, Outbound};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Next entry to send
    pub next_index: LogIndex,
    /// Highest entry known to be stored on the peer
    pub match_index: LogIndex,
    /// When the outstanding request (if any) was sent
    in_flight_since: Option<Instant>,
    /// Last time the peer answered us at all
    last_contact: Instant,
}

impl Progress {
    pub fn is_in_flight(&self) -> bool {
        self.in_flight_since.is_some()
    }
}

#[derive(Debug)]
pub struct ReplicationCoordinator {
    peers: BTreeMap<NodeId, Progress>,
    quorum_lost: bool,
}

impl ReplicationCoordinator {
    pub fn new(peers: &[NodeId], last_log_index: LogIndex, now: Instant) -> Self {
        let peers = peers
            .iter()
            .map(|&id| {
                let progress = Progress {
                    next_index: last_log_index + 1,
                    match_index: 0,
                    in_flight_since: None,
                    last_contact: now,
                };
                (id, progress)
            })
            .collect();
        ReplicationCoordinator {
            peers,
            quorum_lost: false,
        }
    }

    pub fn progress(&self, peer: NodeId) -> Option<&Progress> {
        self.peers.get(&peer)
    }

    /// Build the next request for `peer`, unless one is already outstanding.
    ///
    /// An outstanding request older than `lost_after` is presumed lost.
    /// Peers that need entries we have compacted get the snapshot instead.
    #[allow(clippy::too_many_arguments)]
    pub fn next_request(
        &mut self,
        peer: NodeId,
        log: &ReplicatedLog,
        term: Term,
        leader_id: NodeId,
        max_entries: usize,
        now: Instant,
        lost_after: Duration,
    ) -> Result<Option<Outbound>, RaftError> {
        let Some(progress) = self.peers.get_mut(&peer) else {
            return Ok(None);
        };
        if let Some(sent_at) = progress.in_flight_since {
            if now.duration_since(sent_at) < lost_after {
                return Ok(None);
            }
        }

        let message = if progress.next_index <= log.snapshot_index() {
            let Some(snapshot) = log.load_snapshot()? else {
                return Err(RaftError::SnapshotCorruption(format!(
                    "snapshot at index {} is missing from storage",
                    log.snapshot_index()
                )));
            };
            Outbound::InstallSnapshot {
                to: peer,
                args: InstallSnapshotArgs {
                    term,
                    leader_id,
                    last_included_index: snapshot.last_included_index(),
                    last_included_term: snapshot.last_included_term(),
                    data: snapshot.data,
                },
            }
        } else {
            let prev_log_index = progress.next_index - 1;
            let prev_log_term = log
                .term_at(prev_log_index)
                .ok_or_else(|| RaftError::DurabilityFailure(format!("no term for index {}", prev_log_index)))?;
            Outbound::AppendEntries {
                to: peer,
                args: AppendEntriesArgs {
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries: log.entries_from(progress.next_index, max_entries),
                    leader_commit: log.commit_index(),
                },
            }
        };

        progress.in_flight_since = Some(now);
        Ok(Some(message))
    }

    /// The peer stored everything up to `sent.last_index()`
    pub fn on_append_success(&mut self, peer: NodeId, sent: AppendSent, now: Instant) {
        if let Some(progress) = self.peers.get_mut(&peer) {
            progress.in_flight_since = None;
            progress.last_contact = now;
            progress.match_index = progress.match_index.max(sent.last_index());
            progress.next_index = progress.match_index + 1;
        }
    }

    /// The peer's log did not contain `sent.prev_log_index`; back off
    pub fn on_append_reject(
        &mut self,
        peer: NodeId,
        sent: AppendSent,
        match_hint: Option<LogIndex>,
        now: Instant,
    ) {
        if let Some(progress) = self.peers.get_mut(&peer) {
            progress.in_flight_since = None;
            progress.last_contact = now;
            let proposed = match match_hint {
                Some(hint) => hint + 1,
                None => sent.prev_log_index,
            };
            progress.next_index = proposed.max(progress.match_index + 1).max(1);
        }
    }

    pub fn on_snapshot_installed(&mut self, peer: NodeId, last_included_index: LogIndex, now: Instant) {
        if let Some(progress) = self.peers.get_mut(&peer) {
            progress.in_flight_since = None;
            progress.last_contact = now;
            progress.match_index = progress.match_index.max(last_included_index);
            progress.next_index = progress.match_index + 1;
        }
    }

    /// Transport failure: allow the next heartbeat to retry
    pub fn on_unreachable(&mut self, peer: NodeId) {
        if let Some(progress) = self.peers.get_mut(&peer) {
            progress.in_flight_since = None;
        }
    }

    /// Highest index stored on a majority of the cluster (leader included)
    pub fn majority_match(&self, leader_last_index: LogIndex) -> LogIndex {
        let mut matched: Vec<LogIndex> = self.peers.values().map(|p| p.match_index).collect();
        matched.push(leader_last_index);
        matched.sort_unstable_by(|a, b| b.cmp(a));
        matched[majority(matched.len()) - 1]
    }

    /// Whether a majority (leader included) has answered within `window`
    pub fn quorum_active(&self, now: Instant, window: Duration) -> bool {
        let recent = self
            .peers
            .values()
            .filter(|p| now.duration_since(p.last_contact) <= window)
            .count();
        recent + 1 >= majority(self.peers.len() + 1)
    }

    /// Fails with `QuorumUnreachable` only when the quorum is first lost;
    /// stays quiet afterwards until it recovers.
    pub fn check_quorum(&mut self, now: Instant, window: Duration) -> Result<(), RaftError> {
        let active = self.quorum_active(now, window);
        let newly_lost = !active && !self.quorum_lost;
        self.quorum_lost = !active;
        if newly_lost {
            return Err(RaftError::QuorumUnreachable);
        }
        Ok(())
    }

    pub fn quorum_lost(&self) -> bool {
        self.quorum_lost
    }
}

/// Strict majority of `cluster_size` members
pub fn majority(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn log_with(len: u64, term: Term) -> ReplicatedLog {
        let mut log = ReplicatedLog::open(Box::new(MemoryStorage::new())).unwrap().log;
        for _ in 0..len {
            log.append_as_leader(term, b"x".to_vec()).unwrap();
        }
        log
    }

    fn sent(prev_log_index: LogIndex, entry_count: u64) -> AppendSent {
        AppendSent {
            term: 1,
            prev_log_index,
            entry_count,
        }
    }

    const LOST_AFTER: Duration = Duration::from_millis(500);

    #[test]
    fn test_majority() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(5), 3);
    }

    #[test]
    fn test_next_request_starts_past_leader_log() {
        let log = log_with(3, 1);
        let now = Instant::now();
        let mut coordinator = ReplicationCoordinator::new(&[2, 3], 3, now);

        let request = coordinator.next_request(2, &log, 1, 1, 10, now, LOST_AFTER).unwrap();
        match request {
            Some(Outbound::AppendEntries { to, args }) => {
                assert_eq!(to, 2);
                assert_eq!(args.prev_log_index, 3);
                assert_eq!(args.prev_log_term, 1);
                assert!(args.entries.is_empty());
            }
            other => panic!("expected AppendEntries, got {:?}", other),
        }
    }

    #[test]
    fn test_one_request_in_flight_per_peer() {
        let log = log_with(1, 1);
        let now = Instant::now();
        let mut coordinator = ReplicationCoordinator::new(&[2], 1, now);

        assert!(coordinator.next_request(2, &log, 1, 1, 10, now, LOST_AFTER).unwrap().is_some());
        assert!(coordinator.next_request(2, &log, 1, 1, 10, now, LOST_AFTER).unwrap().is_none());

        // A request outstanding for too long is presumed lost
        let later = now + LOST_AFTER;
        assert!(coordinator.next_request(2, &log, 1, 1, 10, later, LOST_AFTER).unwrap().is_some());
    }

    #[test]
    fn test_batch_is_capped() {
        let log = log_with(10, 1);
        let now = Instant::now();
        let mut coordinator = ReplicationCoordinator::new(&[2], 0, now);

        let request = coordinator.next_request(2, &log, 1, 1, 4, now, LOST_AFTER).unwrap();
        let Some(Outbound::AppendEntries { args, .. }) = request else {
            panic!("expected AppendEntries");
        };
        assert_eq!(args.entries.len(), 4);
        assert_eq!(args.entries[0].index, 1);
    }

    #[test]
    fn test_success_advances_match_and_next() {
        let now = Instant::now();
        let mut coordinator = ReplicationCoordinator::new(&[2], 5, now);

        coordinator.on_append_success(2, sent(3, 2), now);
        let progress = coordinator.progress(2).unwrap();
        assert_eq!(progress.match_index, 5);
        assert_eq!(progress.next_index, 6);

        // A late, older acknowledgement never moves match_index backwards
        coordinator.on_append_success(2, sent(1, 1), now);
        assert_eq!(coordinator.progress(2).unwrap().match_index, 5);
    }

    #[test]
    fn test_reject_uses_hint() {
        let now = Instant::now();
        let mut coordinator = ReplicationCoordinator::new(&[2], 10, now);

        coordinator.on_append_reject(2, sent(10, 0), Some(3), now);
        assert_eq!(coordinator.progress(2).unwrap().next_index, 4);
    }

    #[test]
    fn test_reject_without_hint_steps_back() {
        let now = Instant::now();
        let mut coordinator = ReplicationCoordinator::new(&[2], 10, now);

        coordinator.on_append_reject(2, sent(10, 0), None, now);
        assert_eq!(coordinator.progress(2).unwrap().next_index, 10);
    }

    #[test]
    fn test_reject_never_drops_below_match() {
        let now = Instant::now();
        let mut coordinator = ReplicationCoordinator::new(&[2], 10, now);
        coordinator.on_append_success(2, sent(4, 2), now);

        coordinator.on_append_reject(2, sent(8, 0), Some(0), now);
        assert_eq!(coordinator.progress(2).unwrap().next_index, 7);
    }

    #[test]
    fn test_snapshot_sent_when_entries_compacted() {
        let mut log = log_with(4, 1);
        log.set_commit_index(4);
        while log.next_committed().is_some() {}
        log.compact(&crate::core::snapshot::Snapshot::new(3, 1, vec![7])).unwrap();

        let now = Instant::now();
        let mut coordinator = ReplicationCoordinator::new(&[2], 4, now);
        coordinator.on_append_reject(2, sent(4, 0), Some(0), now);

        let request = coordinator.next_request(2, &log, 1, 1, 10, now, LOST_AFTER).unwrap();
        let Some(Outbound::InstallSnapshot { args, .. }) = request else {
            panic!("expected InstallSnapshot");
        };
        assert_eq!(args.last_included_index, 3);
        assert_eq!(args.data, vec![7]);

        coordinator.on_snapshot_installed(2, 3, now);
        assert_eq!(coordinator.progress(2).unwrap().next_index, 4);
    }

    #[test]
    fn test_majority_match() {
        let now = Instant::now();
        let mut coordinator = ReplicationCoordinator::new(&[2, 3, 4, 5], 10, now);
        coordinator.on_append_success(2, sent(0, 8), now);
        coordinator.on_append_success(3, sent(0, 6), now);
        coordinator.on_append_success(4, sent(0, 2), now);

        // Sorted: 10, 8, 6, 2, 0 -> third highest is stored on a majority
        assert_eq!(coordinator.majority_match(10), 6);
    }

    #[test]
    fn test_quorum_loss_reported_once() {
        let start = Instant::now();
        let mut coordinator = ReplicationCoordinator::new(&[2, 3], 0, start);
        let window = Duration::from_millis(100);

        assert!(coordinator.check_quorum(start, window).is_ok());

        let later = start + Duration::from_millis(200);
        assert_eq!(coordinator.check_quorum(later, window), Err(RaftError::QuorumUnreachable));
        assert!(coordinator.check_quorum(later, window).is_ok());
        assert!(coordinator.quorum_lost());

        coordinator.on_append_success(2, sent(0, 0), later);
        assert!(coordinator.check_quorum(later, window).is_ok());
        assert!(!coordinator.quorum_lost());
    }
}
