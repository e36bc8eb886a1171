//! Provisioning inventory
//!
//! The cloud provider's view of which instances are running. It is queried
//! independently of the substrate: when the two disagree, the inventory tells
//! us whether this node is really alone.

use crate::command::{CommandRunner, Invocation};
use crate::error::{HiveError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

#[async_trait]
pub trait ProvisioningInventory: Send + Sync {
    /// Names of running instances whose name matches `pattern`
    async fn running_instances(&self, pattern: &str) -> Result<Vec<String>>;
}

/// Google Compute Engine inventory via the gcloud CLI
pub struct GcloudInventory {
    runner: Arc<dyn CommandRunner>,
    project: Option<String>,
}

impl GcloudInventory {
    pub fn new(runner: Arc<dyn CommandRunner>, project: Option<String>) -> Self {
        Self { runner, project }
    }
}

#[derive(Debug, Deserialize)]
struct InstanceRow {
    name: String,
    status: String,
}

pub fn parse_instances(raw: &str) -> Result<Vec<String>> {
    let rows: Vec<InstanceRow> = serde_json::from_str(raw.trim())
        .map_err(|e| HiveError::invalid_response("gcloud instances list", e.to_string()))?;
    Ok(rows
        .into_iter()
        .filter(|r| r.status == "RUNNING")
        .map(|r| r.name)
        .collect())
}

#[async_trait]
impl ProvisioningInventory for GcloudInventory {
    async fn running_instances(&self, pattern: &str) -> Result<Vec<String>> {
        let mut args = vec![
            "compute".to_string(),
            "instances".to_string(),
            "list".to_string(),
            format!("--filter=name~'{}' AND status=RUNNING", pattern),
            "--format=json(name,status)".to_string(),
        ];
        if let Some(project) = &self.project {
            args.push(format!("--project={}", project));
        }
        let raw = self.runner.run(&Invocation::new("gcloud", args)).await?;
        parse_instances(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_running_instances_counted() {
        let raw = r#"[
            {"name": "prod-manager-1", "status": "RUNNING"},
            {"name": "prod-manager-2", "status": "TERMINATED"},
            {"name": "prod-manager-3", "status": "STOPPING"}
        ]"#;
        assert_eq!(parse_instances(raw).unwrap(), vec!["prod-manager-1"]);
    }

    #[test]
    fn test_empty_inventory() {
        assert!(parse_instances("[]").unwrap().is_empty());
    }

    #[test]
    fn test_garbage_is_invalid_response() {
        assert!(matches!(
            parse_instances("not json"),
            Err(HiveError::InvalidResponse { .. })
        ));
    }
}
