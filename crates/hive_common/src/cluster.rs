//! Cluster membership model
//!
//! A `ClusterView` is a point-in-time reading of the substrate's node list.
//! Quorum is always derived from it, never cached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Role a node is assigned at provisioning time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    PrimaryManager,
    SecondaryManager,
    Worker,
}

impl NodeRole {
    pub fn is_manager(self) -> bool {
        !matches!(self, NodeRole::Worker)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::PrimaryManager => write!(f, "primary-manager"),
            NodeRole::SecondaryManager => write!(f, "secondary-manager"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

/// Role as the substrate sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Manager,
    Worker,
}

/// Membership status reported by the substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    Ready,
    Down,
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Active,
    Pause,
    Drain,
}

/// One row of the substrate's node listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub hostname: String,
    pub role: MemberRole,
    pub status: MembershipStatus,
    pub availability: Availability,
    /// Only meaningful for managers
    pub manager_reachable: bool,
    pub is_leader: bool,
}

impl Member {
    /// Active member whose manager reachability follows its status
    pub fn new(hostname: &str, role: MemberRole, status: MembershipStatus) -> Self {
        Self {
            id: format!("id-{}", hostname),
            hostname: hostname.to_string(),
            role,
            status,
            availability: Availability::Active,
            manager_reachable: role == MemberRole::Manager && status == MembershipStatus::Ready,
            is_leader: false,
        }
    }

    /// Ready, schedulable and (for managers) reachable by its peers
    pub fn is_available(&self) -> bool {
        self.status == MembershipStatus::Ready
            && self.availability == Availability::Active
            && (self.role == MemberRole::Worker || self.manager_reachable)
    }
}

/// Minimum managers that must agree: floor(managers / 2) + 1
pub fn required_quorum(manager_count: usize) -> usize {
    manager_count / 2 + 1
}

/// Snapshot of cluster membership
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    pub members: Vec<Member>,
}

impl ClusterView {
    pub fn new(members: Vec<Member>) -> Self {
        Self { members }
    }

    pub fn node_count(&self) -> usize {
        self.members.len()
    }

    pub fn manager_count(&self) -> usize {
        self.managers().count()
    }

    pub fn ready_manager_count(&self) -> usize {
        self.managers().filter(|m| m.is_available()).count()
    }

    /// Nodes that can currently run workloads
    pub fn available_node_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_available()).count()
    }

    pub fn required_quorum(&self) -> usize {
        required_quorum(self.manager_count())
    }

    pub fn has_quorum(&self) -> bool {
        self.manager_count() >= 1 && self.ready_manager_count() >= self.required_quorum()
    }

    pub fn member(&self, hostname: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.hostname == hostname)
    }

    fn managers(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.role == MemberRole::Manager)
    }
}

/// One cluster formation epoch
///
/// Generation 1 is written by the primary at init. Forced recovery writes the
/// next generation and invalidates every join secret issued before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEpoch {
    pub id: Uuid,
    pub generation: u64,
    pub formed_by: String,
    pub formed_at: DateTime<Utc>,
    pub forced: bool,
}

impl ClusterEpoch {
    pub fn initial(formed_by: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            generation: 1,
            formed_by: formed_by.to_string(),
            formed_at: Utc::now(),
            forced: false,
        }
    }

    /// Epoch started by forced recovery on `formed_by`
    ///
    /// A forced epoch always follows at least the initial one, so an unknown
    /// predecessor counts as generation 1.
    pub fn successor(previous: Option<&ClusterEpoch>, formed_by: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            generation: previous.map_or(1, |e| e.generation) + 1,
            formed_by: formed_by.to_string(),
            formed_at: Utc::now(),
            forced: true,
        }
    }
}
