//! Node metadata attached at provisioning time
//!
//! Read-only from the controller's side. Keys: `role`, `is-primary`,
//! `deployment-name`, `node-count`, optional `primary-address`.

use crate::error::{HiveError, Result};
use async_trait::async_trait;
use std::time::Duration;

pub const KEY_ROLE: &str = "role";
pub const KEY_IS_PRIMARY: &str = "is-primary";
pub const KEY_DEPLOYMENT: &str = "deployment-name";
pub const KEY_NODE_COUNT: &str = "node-count";
pub const KEY_PRIMARY_ADDRESS: &str = "primary-address";

#[async_trait]
pub trait NodeMetadata: Send + Sync {
    /// Custom attribute, `None` when unset
    async fn attribute(&self, key: &str) -> Result<Option<String>>;

    /// Instance name as the inventory and substrate know it
    async fn hostname(&self) -> Result<String>;

    /// Internal address other nodes reach us on
    async fn internal_address(&self) -> Result<String>;
}

/// Provisioned role before single-node normalisation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignedRole {
    Manager,
    Worker,
}

/// Everything the bootstrapper needs from metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttributes {
    pub hostname: String,
    pub address: String,
    pub assigned_role: AssignedRole,
    pub is_primary: bool,
    pub deployment: String,
    pub node_count: usize,
    pub primary_address: Option<String>,
}

impl NodeAttributes {
    pub async fn read(metadata: &dyn NodeMetadata) -> Result<Self> {
        let required = |key: &'static str, value: Option<String>| {
            value.ok_or_else(|| HiveError::ConfigurationMissing(format!("metadata key {}", key)))
        };

        let role_raw = required(KEY_ROLE, metadata.attribute(KEY_ROLE).await?)?;
        let assigned_role = match role_raw.trim() {
            "manager" => AssignedRole::Manager,
            "worker" => AssignedRole::Worker,
            other => {
                return Err(HiveError::InvalidConfig(format!(
                    "metadata role {:?}, expected manager or worker",
                    other
                )))
            }
        };

        let is_primary = metadata
            .attribute(KEY_IS_PRIMARY)
            .await?
            .map(|v| matches!(v.trim(), "true" | "1" | "yes"))
            .unwrap_or(false);

        let deployment = required(KEY_DEPLOYMENT, metadata.attribute(KEY_DEPLOYMENT).await?)?;

        let count_raw = required(KEY_NODE_COUNT, metadata.attribute(KEY_NODE_COUNT).await?)?;
        let node_count = count_raw
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| HiveError::InvalidConfig(format!("metadata node-count {:?}", count_raw)))?;

        Ok(Self {
            hostname: metadata.hostname().await?,
            address: metadata.internal_address().await?,
            assigned_role,
            is_primary,
            deployment: deployment.trim().to_string(),
            node_count,
            primary_address: metadata
                .attribute(KEY_PRIMARY_ADDRESS)
                .await?
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        })
    }
}

const METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1/instance";

/// GCE-style metadata server
pub struct MetadataServer {
    client: reqwest::Client,
    base: String,
}

impl MetadataServer {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base(METADATA_BASE, timeout)
    }

    pub fn with_base(base: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HiveError::InvalidConfig(format!("metadata client: {}", e)))?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, path: &str) -> Result<Option<String>> {
        let url = format!("{}/{}", self.base, path);
        let response = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(HiveError::TransientUnavailable(format!(
                "metadata {} returned {}",
                path,
                response.status()
            )));
        }
        Ok(Some(response.text().await?))
    }
}

#[async_trait]
impl NodeMetadata for MetadataServer {
    async fn attribute(&self, key: &str) -> Result<Option<String>> {
        self.get(&format!("attributes/{}", key)).await
    }

    async fn hostname(&self) -> Result<String> {
        self.get("name")
            .await?
            .map(|v| v.trim().to_string())
            .ok_or_else(|| HiveError::ConfigurationMissing("instance name".to_string()))
    }

    async fn internal_address(&self) -> Result<String> {
        self.get("network-interfaces/0/ip")
            .await?
            .map(|v| v.trim().to_string())
            .ok_or_else(|| HiveError::ConfigurationMissing("instance address".to_string()))
    }
}
