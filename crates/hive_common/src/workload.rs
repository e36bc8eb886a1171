//! Workload replica accounting

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadHealth {
    Healthy,
    Degraded,
    Failed,
}

/// A named, horizontally scaled service definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub name: String,
    pub desired_replicas: u32,
    pub observed_replicas: u32,
}

impl Workload {
    pub fn new(name: &str, desired_replicas: u32, observed_replicas: u32) -> Self {
        Self {
            name: name.to_string(),
            desired_replicas,
            observed_replicas,
        }
    }

    pub fn health(&self) -> WorkloadHealth {
        if self.observed_replicas == self.desired_replicas {
            WorkloadHealth::Healthy
        } else if self.observed_replicas == 0 {
            WorkloadHealth::Failed
        } else {
            WorkloadHealth::Degraded
        }
    }

    pub fn is_converged(&self) -> bool {
        self.observed_replicas == self.desired_replicas
    }

    /// Scheduling more than one replica implies spreading across nodes
    pub fn assumes_multi_node(&self) -> bool {
        self.desired_replicas > 1
    }

    /// Matches both the bare name and the `<stack>_<name>` form deployed
    /// by the stack
    pub fn matches(&self, stack: &str, short_name: &str) -> bool {
        self.name == short_name
            || self
                .name
                .strip_prefix(stack)
                .and_then(|rest| rest.strip_prefix('_'))
                == Some(short_name)
    }
}
