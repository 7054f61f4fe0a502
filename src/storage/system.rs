//! Node identity and lifecycle record
//!
//! Kept in a `system` file next to the log. It pins the data directory to a
//! single node id and tells the next boot whether the previous run ended
//! cleanly.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::file::{atomic_write, encode_record, read_record};
use super::StorageError;
use crate::core::error::RaftError;
use crate::core::log::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRecord {
    pub node_id: NodeId,
    pub lifecycle: Lifecycle,
    pub boot_count: u64,
    pub last_started_at: DateTime<Utc>,
}

pub struct SystemStore {
    path: PathBuf,
    record: SystemRecord,
    /// True when the previous run never recorded a clean shutdown
    recovered_from_crash: bool,
}

impl SystemStore {
    /// Claim `dir` for `node_id` and record that the node is running.
    ///
    /// Fails with [`RaftError::Identity`] when the directory belongs to a
    /// different node.
    pub fn open<P: AsRef<Path>>(dir: P, node_id: NodeId) -> Result<Self, RaftError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(StorageError::from)?;
        let path = dir.join("system");

        let previous: Option<SystemRecord> = read_record(&path)
            .map_err(|e| RaftError::DurabilityFailure(format!("system record: {}", e)))?;

        let (boot_count, recovered_from_crash) = match &previous {
            None => {
                info!(node = node_id, dir = %dir.display(), "Initializing new data directory");
                (1, false)
            }
            Some(prev) if prev.node_id != node_id => {
                return Err(RaftError::Identity(format!(
                    "data directory {} belongs to node {}, not {}",
                    dir.display(),
                    prev.node_id,
                    node_id
                )));
            }
            Some(prev) => {
                let unclean = prev.lifecycle == Lifecycle::Running;
                if unclean {
                    warn!(
                        node = node_id,
                        last_started_at = %prev.last_started_at,
                        "Previous run did not shut down cleanly; recovering from durable log"
                    );
                }
                (prev.boot_count + 1, unclean)
            }
        };

        let mut store = SystemStore {
            path,
            record: SystemRecord {
                node_id,
                lifecycle: Lifecycle::Running,
                boot_count,
                last_started_at: Utc::now(),
            },
            recovered_from_crash,
        };
        store.persist()?;
        Ok(store)
    }

    pub fn record(&self) -> &SystemRecord {
        &self.record
    }

    pub fn recovered_from_crash(&self) -> bool {
        self.recovered_from_crash
    }

    /// Record a clean shutdown
    pub fn mark_stopped(&mut self) -> Result<(), RaftError> {
        self.record.lifecycle = Lifecycle::Stopped;
        self.persist()
    }

    fn persist(&mut self) -> Result<(), RaftError> {
        let mut line = encode_record(&self.record)?;
        line.push('\n');
        atomic_write(&self.path, line.as_bytes())?;
        Ok(())
    }
}
