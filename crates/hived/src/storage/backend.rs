//! Network share backend and peer source

use async_trait::async_trait;
use hive_common::command::{CommandRunner, Invocation};
use hive_common::error::{HiveError, Result};
use hive_common::shared::SharedKey;
use hive_common::substrate::ClusterSubstrate;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Make `export_path` available to the rest of the cluster
    async fn export(&self, export_path: &Path) -> Result<()>;

    /// Mount `authority:export_path` at `mount_point`; a no-op when already mounted
    async fn mount(&self, authority: &str, export_path: &Path, mount_point: &Path) -> Result<()>;
}

/// NFS via `exportfs` and `mount -t nfs`
pub struct NfsBackend {
    runner: Arc<dyn CommandRunner>,
}

impl NfsBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn is_mounted(&self, mount_point: &Path) -> bool {
        let check = Invocation::new("mountpoint", ["-q".to_string(), path_arg(mount_point)]);
        self.runner.run(&check).await.is_ok()
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

#[async_trait]
impl StorageBackend for NfsBackend {
    async fn export(&self, export_path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(export_path).await?;
        // Re-exporting an existing entry only refreshes its options
        self.runner
            .run(&Invocation::new(
                "exportfs",
                [
                    "-o".to_string(),
                    "rw,sync,no_subtree_check,no_root_squash".to_string(),
                    format!("*:{}", export_path.display()),
                ],
            ))
            .await?;
        Ok(())
    }

    async fn mount(&self, authority: &str, export_path: &Path, mount_point: &Path) -> Result<()> {
        if self.is_mounted(mount_point).await {
            debug!(mount_point = %mount_point.display(), "share already mounted");
            return Ok(());
        }
        tokio::fs::create_dir_all(mount_point).await?;
        self.runner
            .run(&Invocation::new(
                "mount",
                [
                    "-t".to_string(),
                    "nfs".to_string(),
                    "-o".to_string(),
                    "soft,timeo=100,retrans=3".to_string(),
                    format!("{}:{}", authority, export_path.display()),
                    path_arg(mount_point),
                ],
            ))
            .await?;
        Ok(())
    }
}

/// Copy of the handoff values held somewhere other than the share
#[async_trait]
pub trait PeerSource: Send + Sync {
    async fn fetch(&self, key: SharedKey) -> Result<Option<String>>;

    async fn mirror(&self, key: SharedKey, value: &str) -> Result<()>;
}

/// Substrate config objects, replicated by the managers' raft log
pub struct SwarmConfigPeer {
    substrate: Arc<dyn ClusterSubstrate>,
}

impl SwarmConfigPeer {
    pub fn new(substrate: Arc<dyn ClusterSubstrate>) -> Self {
        Self { substrate }
    }
}

#[async_trait]
impl PeerSource for SwarmConfigPeer {
    async fn fetch(&self, key: SharedKey) -> Result<Option<String>> {
        self.substrate
            .read_config_object(&key.config_object_name())
            .await
    }

    async fn mirror(&self, key: SharedKey, value: &str) -> Result<()> {
        if value.is_empty() {
            return Err(HiveError::InvalidConfig(format!("empty value for {}", key)));
        }
        self.substrate
            .write_config_object(&key.config_object_name(), value)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_common::fakes::{FakeSubstrate, ScriptedRunner};

    #[tokio::test]
    async fn test_mount_skipped_when_already_mounted() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let backend = NfsBackend::new(runner.clone());
        backend
            .mount("10.0.0.2", Path::new("/srv/hive-shared"), dir.path())
            .await
            .unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("mountpoint -q"));
    }

    #[tokio::test]
    async fn test_mount_runs_nfs_mount() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        runner.fail_on("mountpoint", "");
        let backend = NfsBackend::new(runner.clone());
        backend
            .mount("10.0.0.2", Path::new("/srv/hive-shared"), dir.path())
            .await
            .unwrap();
        let calls = runner.calls();
        assert!(calls[1].starts_with("mount -t nfs"));
        assert!(calls[1].contains("10.0.0.2:/srv/hive-shared"));
    }

    #[tokio::test]
    async fn test_peer_round_trips_through_config_objects() {
        let substrate = Arc::new(FakeSubstrate::new("mgr-1"));
        let peer = SwarmConfigPeer::new(substrate.clone());
        peer.mirror(SharedKey::PrimaryAddress, "10.0.0.2").await.unwrap();
        assert_eq!(
            peer.fetch(SharedKey::PrimaryAddress).await.unwrap().as_deref(),
            Some("10.0.0.2")
        );
        assert!(substrate
            .snapshot()
            .config_objects
            .contains_key("hive-primary-address"));
    }
}
