//! Shared storage coordinator
//!
//! Reads walk a fallback chain, first success wins:
//! share (after remount attempts) → peer → local cache → regenerated default.
//! The chain position that served the read decides the handle state.
//!
//! The coordinator serves the mounted share until it exports; from then on
//! it serves the exported directory, including after a forced recovery turns
//! a secondary into the authority.

use super::backend::{PeerSource, StorageBackend};
use crate::retry::{retry, RetryPolicy};
use async_trait::async_trait;
use hive_common::config::StorageConfig;
use hive_common::error::{HiveError, Result};
use hive_common::shared::{FileStore, SharedKey, SharedStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageState {
    Mounted,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedStorageHandle {
    pub mount_point: PathBuf,
    /// Address of the node exporting the share
    pub authority: Option<String>,
    pub state: StorageState,
}

/// Where a value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Share,
    Peer,
    Cache,
    Default,
}

pub fn default_load_balancer_config() -> String {
    "upstream frontend { server frontend:80; }\n\
     upstream backend { server backend:8080; }\n\
     server {\n\
     \x20   listen 80;\n\
     \x20   location /api/ { proxy_pass http://backend; }\n\
     \x20   location / { proxy_pass http://frontend; }\n\
     }\n"
        .to_string()
}

pub struct StorageCoordinator {
    backend: Arc<dyn StorageBackend>,
    share: Arc<dyn SharedStore>,
    /// Served instead of `share` once this node exports
    exported: Option<Arc<dyn SharedStore>>,
    exporting: AtomicBool,
    peer: Arc<dyn PeerSource>,
    cache: FileStore,
    config: StorageConfig,
    handle: Mutex<SharedStorageHandle>,
}

impl StorageCoordinator {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        share: Arc<dyn SharedStore>,
        peer: Arc<dyn PeerSource>,
        cache_dir: PathBuf,
        config: StorageConfig,
    ) -> Self {
        let handle = SharedStorageHandle {
            mount_point: config.mount_point.clone(),
            authority: None,
            state: StorageState::Unavailable,
        };
        Self {
            backend,
            share,
            exported: None,
            exporting: AtomicBool::new(false),
            peer,
            cache: FileStore::new(cache_dir),
            config,
            handle: Mutex::new(handle),
        }
    }

    /// Store behind the export directory, when it differs from the mount
    pub fn with_exported_share(mut self, exported: Arc<dyn SharedStore>) -> Self {
        self.exported = Some(exported);
        self
    }

    pub fn handle(&self) -> SharedStorageHandle {
        self.lock().clone()
    }

    fn share(&self) -> &Arc<dyn SharedStore> {
        match &self.exported {
            Some(exported) if self.exporting.load(Ordering::SeqCst) => exported,
            _ => &self.share,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SharedStorageHandle> {
        // A poisoned handle still holds a valid state value
        self.handle.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: StorageState) {
        let mut handle = self.lock();
        if handle.state != state {
            info!(from = ?handle.state, to = ?state, "shared storage state changed");
            handle.state = state;
        }
    }

    fn mount_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.mount_attempts,
            Duration::from_secs(self.config.mount_retry_secs),
        )
    }

    /// Primary side: export the share and serve it locally
    pub async fn export(&self, own_address: &str) -> Result<()> {
        self.backend.export(&self.config.export_path).await?;
        self.exporting.store(true, Ordering::SeqCst);
        {
            let mut handle = self.lock();
            handle.authority = Some(own_address.to_string());
            handle.mount_point = self.config.export_path.clone();
        }
        self.set_state(StorageState::Mounted);
        info!(path = %self.config.export_path.display(), "shared storage exported");
        Ok(())
    }

    /// Secondary side: mount the primary's export. Failure leaves the handle
    /// degraded; reads then fall back along the chain.
    pub async fn mount(&self, authority: &str) -> StorageState {
        self.exporting.store(false, Ordering::SeqCst);
        {
            let mut handle = self.lock();
            handle.authority = Some(authority.to_string());
            handle.mount_point = self.config.mount_point.clone();
        }
        match self.try_mount(authority).await {
            Ok(()) => {
                self.set_state(StorageState::Mounted);
                StorageState::Mounted
            }
            Err(e) => {
                warn!(authority, error = %e, "mount failed, falling back to peer and cache");
                self.set_state(StorageState::Degraded);
                StorageState::Degraded
            }
        }
    }

    async fn try_mount(&self, authority: &str) -> Result<()> {
        retry("shared storage mount", self.mount_policy(), |_| {
            self.backend
                .mount(authority, &self.config.export_path, &self.config.mount_point)
        })
        .await
    }

    /// Share, remounting first if the last attempt failed
    async fn read_share(&self, key: SharedKey) -> Option<String> {
        let handle = self.handle();
        if handle.state != StorageState::Mounted {
            let authority = handle.authority?;
            if self.try_mount(&authority).await.is_err() {
                return None;
            }
            self.set_state(StorageState::Mounted);
        }
        match self.share().read(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(%key, error = %e, "share read failed");
                self.set_state(StorageState::Degraded);
                None
            }
        }
    }

    async fn read_peer(&self, key: SharedKey) -> Option<String> {
        match self.peer.fetch(key).await {
            Ok(value) => value,
            Err(e) => {
                debug!(%key, error = %e, "peer fetch failed");
                None
            }
        }
    }

    async fn refresh_cache(&self, key: SharedKey, value: &str) {
        if let Err(e) = self.cache.write(key, value).await {
            warn!(%key, error = %e, "cache refresh failed");
        }
    }

    /// Walk the fallback chain for `key`
    pub async fn read_with_source(&self, key: SharedKey) -> Result<(String, ReadSource)> {
        if let Some(value) = self.read_share(key).await {
            self.refresh_cache(key, &value).await;
            return Ok((value, ReadSource::Share));
        }
        let share_ok = self.handle().state == StorageState::Mounted;

        if let Some(value) = self.read_peer(key).await {
            self.refresh_cache(key, &value).await;
            if !share_ok {
                self.set_state(StorageState::Degraded);
            }
            return Ok((value, ReadSource::Peer));
        }

        match self.cache.read(key).await {
            Ok(Some(value)) => {
                if !share_ok {
                    self.set_state(StorageState::Degraded);
                }
                warn!(%key, "serving cached copy");
                return Ok((value, ReadSource::Cache));
            }
            Ok(None) => {}
            Err(e) => debug!(%key, error = %e, "cache read failed"),
        }

        if key == SharedKey::LoadBalancerConfig {
            let value = default_load_balancer_config();
            self.refresh_cache(key, &value).await;
            if !share_ok {
                self.set_state(StorageState::Degraded);
            }
            warn!(%key, "regenerated default, running degraded");
            return Ok((value, ReadSource::Default));
        }

        if !share_ok {
            self.set_state(StorageState::Unavailable);
        }
        Err(HiveError::ConfigurationMissing(format!("shared key {}", key)))
    }

    /// Chain read where a missing key is `None`
    pub async fn read_optional(&self, key: SharedKey) -> Result<Option<String>> {
        match self.read_with_source(key).await {
            Ok((value, _)) => Ok(Some(value)),
            Err(HiveError::ConfigurationMissing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write to the share, the cache and the peer mirror
    pub async fn publish(&self, key: SharedKey, value: &str) -> Result<()> {
        self.share().write(key, value).await?;
        self.refresh_cache(key, value).await;
        if let Err(e) = self.peer.mirror(key, value).await {
            debug!(%key, error = %e, "peer mirror skipped");
        }
        debug!(%key, "published");
        Ok(())
    }
}

#[async_trait]
impl SharedStore for StorageCoordinator {
    async fn read(&self, key: SharedKey) -> Result<Option<String>> {
        self.read_optional(key).await
    }

    async fn write(&self, key: SharedKey, value: &str) -> Result<()> {
        self.publish(key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_common::fakes::MemoryStore;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyBackend {
        fail: bool,
        mounts: AtomicU32,
    }

    #[async_trait]
    impl StorageBackend for FlakyBackend {
        async fn export(&self, _export_path: &Path) -> Result<()> {
            Ok(())
        }

        async fn mount(&self, _a: &str, _e: &Path, _m: &Path) -> Result<()> {
            self.mounts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(HiveError::CommandFailed {
                    command: "mount".into(),
                    code: Some(32),
                    stderr: "connection timed out".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    struct DeadPeer;

    #[async_trait]
    impl PeerSource for DeadPeer {
        async fn fetch(&self, _key: SharedKey) -> Result<Option<String>> {
            Err(HiveError::QuorumLost("no leader".into()))
        }

        async fn mirror(&self, _key: SharedKey, _value: &str) -> Result<()> {
            Err(HiveError::QuorumLost("no leader".into()))
        }
    }

    fn coordinator(
        fail_mount: bool,
        share: Arc<MemoryStore>,
        cache_dir: &Path,
    ) -> (StorageCoordinator, Arc<FlakyBackend>) {
        let backend = Arc::new(FlakyBackend {
            fail: fail_mount,
            mounts: AtomicU32::new(0),
        });
        let config = StorageConfig {
            mount_attempts: 2,
            mount_retry_secs: 0,
            ..StorageConfig::default()
        };
        let coord = StorageCoordinator::new(
            backend.clone(),
            share,
            Arc::new(DeadPeer),
            cache_dir.to_path_buf(),
            config,
        );
        (coord, backend)
    }

    #[tokio::test]
    async fn test_mounted_read_refreshes_cache() {
        let dir = tempfile::tempdir().unwrap();
        let share = Arc::new(MemoryStore::default());
        share.write(SharedKey::WorkerJoinToken, "SWMTKN-w").await.unwrap();
        let (coord, _) = coordinator(false, share, dir.path());

        assert_eq!(coord.mount("10.0.0.2").await, StorageState::Mounted);
        let (value, source) = coord.read_with_source(SharedKey::WorkerJoinToken).await.unwrap();
        assert_eq!(value, "SWMTKN-w");
        assert_eq!(source, ReadSource::Share);
        assert!(dir.path().join("worker-join-token").exists());
    }

    #[tokio::test]
    async fn test_cache_used_when_mount_and_peer_fail() {
        let dir = tempfile::tempdir().unwrap();
        FileStore::new(dir.path())
            .write(SharedKey::PrimaryAddress, "10.0.0.2")
            .await
            .unwrap();
        let (coord, backend) = coordinator(true, Arc::new(MemoryStore::default()), dir.path());

        assert_eq!(coord.mount("10.0.0.2").await, StorageState::Degraded);
        let (value, source) = coord.read_with_source(SharedKey::PrimaryAddress).await.unwrap();

        assert_eq!(value, "10.0.0.2");
        assert_eq!(source, ReadSource::Cache);
        assert_eq!(coord.handle().state, StorageState::Degraded);
        // initial mount plus one remount round, both exhausted
        assert_eq!(backend.mounts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_load_balancer_default_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, _) = coordinator(true, Arc::new(MemoryStore::default()), dir.path());
        coord.mount("10.0.0.2").await;

        let (value, source) = coord
            .read_with_source(SharedKey::LoadBalancerConfig)
            .await
            .unwrap();
        assert_eq!(source, ReadSource::Default);
        assert!(value.contains("proxy_pass"));
        assert_eq!(coord.handle().state, StorageState::Degraded);
    }

    #[tokio::test]
    async fn test_nothing_left_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, _) = coordinator(true, Arc::new(MemoryStore::default()), dir.path());
        coord.mount("10.0.0.2").await;

        let err = coord
            .read_with_source(SharedKey::ManagerJoinToken)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::ConfigurationMissing(_)));
        assert_eq!(coord.handle().state, StorageState::Unavailable);
        assert_eq!(coord.read(SharedKey::ManagerJoinToken).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_key_on_healthy_share_stays_mounted() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, _) = coordinator(false, Arc::new(MemoryStore::default()), dir.path());
        coord.mount("10.0.0.2").await;

        assert!(coord.read(SharedKey::ManagerJoinToken).await.unwrap().is_none());
        assert_eq!(coord.handle().state, StorageState::Mounted);
    }

    #[tokio::test]
    async fn test_export_switches_to_exported_share() {
        let dir = tempfile::tempdir().unwrap();
        let mounted = Arc::new(MemoryStore::default());
        let exported = Arc::new(MemoryStore::default());
        let (coord, _) = coordinator(false, mounted.clone(), dir.path());
        let coord = coord.with_exported_share(exported.clone());

        assert_eq!(coord.mount("10.0.0.1").await, StorageState::Mounted);
        coord.publish(SharedKey::WorkerJoinToken, "SWMTKN-old").await.unwrap();
        assert_eq!(mounted.get(SharedKey::WorkerJoinToken).as_deref(), Some("SWMTKN-old"));

        // Old authority's mount is dead; this node exports from now on
        mounted.set_offline(true);
        coord.export("10.0.0.2").await.unwrap();
        coord.publish(SharedKey::WorkerJoinToken, "SWMTKN-new").await.unwrap();

        assert_eq!(exported.get(SharedKey::WorkerJoinToken).as_deref(), Some("SWMTKN-new"));
        let handle = coord.handle();
        assert_eq!(handle.authority.as_deref(), Some("10.0.0.2"));
        assert_eq!(handle.state, StorageState::Mounted);
        let (value, source) = coord.read_with_source(SharedKey::WorkerJoinToken).await.unwrap();
        assert_eq!((value.as_str(), source), ("SWMTKN-new", ReadSource::Share));
    }

    #[tokio::test]
    async fn test_publish_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let share = Arc::new(MemoryStore::default());
        let (coord, _) = coordinator(false, share.clone(), dir.path());
        coord.export("10.0.0.2").await.unwrap();

        coord.publish(SharedKey::PrimaryAddress, "10.0.0.2").await.unwrap();
        coord.publish(SharedKey::PrimaryAddress, "10.0.0.2").await.unwrap();
        assert_eq!(share.write_count(), 1);
        assert_eq!(coord.handle().authority.as_deref(), Some("10.0.0.2"));
    }
}
