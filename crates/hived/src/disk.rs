//! Disk pressure and retention purge for the search data path

use async_trait::async_trait;
use hive_common::error::{HiveError, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use sysinfo::Disks;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[async_trait]
pub trait DiskProbe: Send + Sync {
    /// Used percentage of the filesystem holding `path`
    async fn usage_percent(&self, path: &Path) -> Result<f64>;
}

#[async_trait]
pub trait DataPurger: Send + Sync {
    /// Delete data older than `retention`, returning the number of files removed
    async fn purge(&self, path: &Path, retention: Duration) -> Result<PurgeSummary>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub files: u64,
    pub bytes: u64,
}

/// Filesystem usage from sysinfo
#[derive(Default)]
pub struct SysinfoDisk;

/// Longest mount point that is a prefix of `path`
fn mount_usage(mounts: &[(PathBuf, u64, u64)], path: &Path) -> Option<f64> {
    mounts
        .iter()
        .filter(|(mount, _, _)| path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.as_os_str().len())
        .and_then(|(_, total, available)| {
            if *total == 0 {
                None
            } else {
                let used = total.saturating_sub(*available);
                Some(used as f64 * 100.0 / *total as f64)
            }
        })
}

#[async_trait]
impl DiskProbe for SysinfoDisk {
    async fn usage_percent(&self, path: &Path) -> Result<f64> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let disks = Disks::new_with_refreshed_list();
            let mounts: Vec<(PathBuf, u64, u64)> = disks
                .list()
                .iter()
                .map(|d| {
                    (
                        d.mount_point().to_path_buf(),
                        d.total_space(),
                        d.available_space(),
                    )
                })
                .collect();
            mount_usage(&mounts, &path).ok_or_else(|| {
                HiveError::Io(format!("no filesystem found for {}", path.display()))
            })
        })
        .await
        .map_err(|e| HiveError::Io(format!("disk probe task: {}", e)))?
    }
}

/// Deletes regular files by modification time
#[derive(Default)]
pub struct RetentionPurger;

fn purge_older_than(root: &Path, cutoff: SystemTime) -> PurgeSummary {
    let mut summary = PurgeSummary::default();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(modified) = meta.modified() else { continue };
        if modified >= cutoff {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                summary.files += 1;
                summary.bytes += meta.len();
            }
            Err(e) => warn!(path = %entry.path().display(), error = %e, "purge failed"),
        }
    }
    summary
}

#[async_trait]
impl DataPurger for RetentionPurger {
    async fn purge(&self, path: &Path, retention: Duration) -> Result<PurgeSummary> {
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let root = path.to_path_buf();
        let summary = tokio::task::spawn_blocking(move || purge_older_than(&root, cutoff))
            .await
            .map_err(|e| HiveError::Io(format!("purge task: {}", e)))?;
        debug!(path = %path.display(), files = summary.files, bytes = summary.bytes, "purge finished");
        Ok(summary)
    }
}
