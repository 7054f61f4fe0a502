//! Node roles and the legal transitions between them

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::log::NodeId;
use super::replication::ReplicationCoordinator;

/// Role-specific state. Exactly one is active at a time.
#[derive(Debug)]
pub enum Role {
    Follower {
        /// Leader of the current term, once heard from
        leader: Option<NodeId>,
    },
    Candidate {
        /// Nodes (including ourselves) that granted a vote this term
        votes: HashSet<NodeId>,
    },
    Leader {
        replication: ReplicationCoordinator,
    },
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Follower { .. } => RoleKind::Follower,
            Role::Candidate { .. } => RoleKind::Candidate,
            Role::Leader { .. } => RoleKind::Leader,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleKind {
    Follower,
    Candidate,
    Leader,
}

impl RoleKind {
    /// Transition table:
    ///
    /// | from      | to        | trigger                                   |
    /// |-----------|-----------|-------------------------------------------|
    /// | Follower  | Candidate | election timeout                          |
    /// | Candidate | Candidate | election timeout without a majority       |
    /// | Candidate | Leader    | majority of votes in the current term     |
    /// | any       | Follower  | higher term, or a current-term leader     |
    ///
    /// A follower never becomes leader without standing as candidate, and a
    /// leader only leaves office by stepping down to follower.
    pub fn can_transition_to(self, next: RoleKind) -> bool {
        use RoleKind::*;
        matches!(
            (self, next),
            (Follower, Candidate) | (Candidate, Candidate) | (Candidate, Leader) | (_, Follower)
        )
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoleKind::Follower => "follower",
            RoleKind::Candidate => "candidate",
            RoleKind::Leader => "leader",
        };
        f.write_str(name)
    }
}
