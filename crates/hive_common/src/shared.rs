//! Shared handoff files
//!
//! A closed set of keys, each with an idempotence contract, instead of ad hoc
//! paths on a shared filesystem. Writes compare first and replace atomically,
//! so any number of nodes may race to publish the same value.

use crate::error::{HiveError, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SharedKey {
    /// Written by the primary at init, replaced after token rotation
    ManagerJoinToken,
    /// Same lifecycle as the manager token
    WorkerJoinToken,
    /// Written by whichever node formed the current epoch
    PrimaryAddress,
    /// Regenerable; any node may write the default
    LoadBalancerConfig,
    /// JSON `ClusterEpoch`; only init (if absent) and forced recovery write it
    ClusterEpoch,
    /// JSON `CapacityPlan` last deployed
    CapacityPlan,
}

impl SharedKey {
    pub const ALL: [SharedKey; 6] = [
        SharedKey::ManagerJoinToken,
        SharedKey::WorkerJoinToken,
        SharedKey::PrimaryAddress,
        SharedKey::LoadBalancerConfig,
        SharedKey::ClusterEpoch,
        SharedKey::CapacityPlan,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            SharedKey::ManagerJoinToken => "manager-join-token",
            SharedKey::WorkerJoinToken => "worker-join-token",
            SharedKey::PrimaryAddress => "primary-address",
            SharedKey::LoadBalancerConfig => "load-balancer-config",
            SharedKey::ClusterEpoch => "cluster-epoch",
            SharedKey::CapacityPlan => "capacity-plan",
        }
    }

    /// Name of the mirrored substrate config object
    pub fn config_object_name(self) -> String {
        format!("hive-{}", self.file_name())
    }
}

impl fmt::Display for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn read(&self, key: SharedKey) -> Result<Option<String>>;

    /// Repeating a write with the same value is a no-op
    async fn write(&self, key: SharedKey, value: &str) -> Result<()>;
}

/// Keys stored as files in one directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: SharedKey) -> PathBuf {
        self.root.join(key.file_name())
    }
}

#[async_trait]
impl SharedStore for FileStore {
    async fn read(&self, key: SharedKey) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HiveError::Io(format!("read {}: {}", key, e))),
        }
    }

    async fn write(&self, key: SharedKey, value: &str) -> Result<()> {
        if self.read(key).await?.as_deref() == Some(value) {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let target = self.path_for(key);
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", key.file_name(), std::process::id()));
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }
}
