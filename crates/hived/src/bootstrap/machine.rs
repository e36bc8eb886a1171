//! Bootstrap state machine
//!
//! ```text
//! DETECT_ROLE → PROVISION_DEPENDENCIES → PRIMARY_INIT   → DEPLOY_WORKLOADS → READY
//!                                      ↘ SECONDARY_JOIN ↗ (managers)
//!                                                       → READY (workers)
//! any non-terminal state → FAILED
//! ```

use hive_common::cluster::NodeRole;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootstrapState {
    DetectRole,
    ProvisionDependencies,
    PrimaryInit,
    SecondaryJoin,
    DeployWorkloads,
    Ready,
    Failed,
}

impl BootstrapState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BootstrapState::Ready | BootstrapState::Failed)
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BootstrapState::DetectRole => "DETECT_ROLE",
            BootstrapState::ProvisionDependencies => "PROVISION_DEPENDENCIES",
            BootstrapState::PrimaryInit => "PRIMARY_INIT",
            BootstrapState::SecondaryJoin => "SECONDARY_JOIN",
            BootstrapState::DeployWorkloads => "DEPLOY_WORKLOADS",
            BootstrapState::Ready => "READY",
            BootstrapState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapEvent {
    RoleDetected(NodeRole),
    DependenciesReady(NodeRole),
    Initialized,
    Joined(NodeRole),
    Deployed,
    StepFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no bootstrap transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: BootstrapState,
    pub event: BootstrapEvent,
}

pub fn transition(
    from: BootstrapState,
    event: BootstrapEvent,
) -> Result<BootstrapState, InvalidTransition> {
    use BootstrapEvent as E;
    use BootstrapState as S;

    let next = match (from, event) {
        (S::DetectRole, E::RoleDetected(_)) => S::ProvisionDependencies,
        (S::ProvisionDependencies, E::DependenciesReady(NodeRole::PrimaryManager)) => {
            S::PrimaryInit
        }
        (S::ProvisionDependencies, E::DependenciesReady(_)) => S::SecondaryJoin,
        (S::PrimaryInit, E::Initialized) => S::DeployWorkloads,
        (S::SecondaryJoin, E::Joined(NodeRole::SecondaryManager)) => S::DeployWorkloads,
        (S::SecondaryJoin, E::Joined(NodeRole::Worker)) => S::Ready,
        (S::DeployWorkloads, E::Deployed) => S::Ready,
        (s, E::StepFailed) if !s.is_terminal() => S::Failed,
        _ => return Err(InvalidTransition { from, event }),
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_path() {
        let mut s = BootstrapState::DetectRole;
        for event in [
            BootstrapEvent::RoleDetected(NodeRole::PrimaryManager),
            BootstrapEvent::DependenciesReady(NodeRole::PrimaryManager),
            BootstrapEvent::Initialized,
            BootstrapEvent::Deployed,
        ] {
            s = transition(s, event).unwrap();
        }
        assert_eq!(s, BootstrapState::Ready);
    }

    #[test]
    fn test_worker_skips_deploy() {
        let s = transition(
            BootstrapState::SecondaryJoin,
            BootstrapEvent::Joined(NodeRole::Worker),
        )
        .unwrap();
        assert_eq!(s, BootstrapState::Ready);

        let s = transition(
            BootstrapState::SecondaryJoin,
            BootstrapEvent::Joined(NodeRole::SecondaryManager),
        )
        .unwrap();
        assert_eq!(s, BootstrapState::DeployWorkloads);
    }

    #[test]
    fn test_every_step_can_fail() {
        for s in [
            BootstrapState::DetectRole,
            BootstrapState::ProvisionDependencies,
            BootstrapState::PrimaryInit,
            BootstrapState::SecondaryJoin,
            BootstrapState::DeployWorkloads,
        ] {
            assert_eq!(
                transition(s, BootstrapEvent::StepFailed),
                Ok(BootstrapState::Failed)
            );
        }
    }

    #[test]
    fn test_undefined_transitions_rejected() {
        assert!(transition(BootstrapState::DetectRole, BootstrapEvent::Deployed).is_err());
        assert!(transition(BootstrapState::PrimaryInit, BootstrapEvent::Joined(NodeRole::Worker)).is_err());
        assert!(transition(BootstrapState::Ready, BootstrapEvent::StepFailed).is_err());
        assert!(transition(BootstrapState::Failed, BootstrapEvent::RoleDetected(NodeRole::Worker)).is_err());
        // a primary never joins
        assert!(transition(
            BootstrapState::SecondaryJoin,
            BootstrapEvent::Joined(NodeRole::PrimaryManager)
        )
        .is_err());
    }
}
