//! Daemon wiring
//!
//! Builds the production collaborators from configuration, runs the
//! bootstrapper once, then drives the monitoring loops until shutdown.

use crate::bootstrap::{resolve_role, BootstrapJournal, BootstrapState, Bootstrapper};
use crate::disk::{DataPurger, DiskProbe, RetentionPurger, SysinfoDisk};
use crate::quorum::QuorumMonitor;
use crate::reconciler::ServiceReconciler;
use crate::scheduler::{shutdown_requested, LoopStats, PeriodicTask, Schedule};
use crate::search_monitor::SearchMonitor;
use crate::storage::{NfsBackend, StorageBackend, StorageCoordinator, SwarmConfigPeer};
use anyhow::{Context, Result};
use hive_common::cluster::NodeRole;
use hive_common::command::{CommandRunner, SystemRunner};
use hive_common::config::HiveConfig;
use hive_common::inventory::{GcloudInventory, ProvisioningInventory};
use hive_common::metadata::{MetadataServer, NodeAttributes, NodeMetadata};
use hive_common::search_client::{ElasticsearchClient, SearchEngine};
use hive_common::shared::{FileStore, SharedStore};
use hive_common::substrate::{ClusterSubstrate, DockerSwarm};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Every external system the daemon talks to
#[derive(Clone)]
pub struct Collaborators {
    pub metadata: Arc<dyn NodeMetadata>,
    pub substrate: Arc<dyn ClusterSubstrate>,
    pub inventory: Arc<dyn ProvisioningInventory>,
    pub search: Arc<dyn SearchEngine>,
    pub backend: Arc<dyn StorageBackend>,
    pub disk: Arc<dyn DiskProbe>,
    pub purger: Arc<dyn DataPurger>,
}

impl Collaborators {
    pub fn production(config: &HiveConfig) -> Result<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(config.command_timeout()));
        let http_timeout = Duration::from_secs(config.search.request_timeout_secs);
        Ok(Self {
            metadata: Arc::new(
                MetadataServer::new(http_timeout).context("Failed to build metadata client")?,
            ),
            substrate: Arc::new(DockerSwarm::new(runner.clone())),
            inventory: Arc::new(GcloudInventory::new(runner.clone(), None)),
            search: Arc::new(
                ElasticsearchClient::new(&config.search.endpoint, http_timeout)
                    .context("Failed to build search client")?,
            ),
            backend: Arc::new(NfsBackend::new(runner)),
            disk: Arc::new(SysinfoDisk),
            purger: Arc::new(RetentionPurger),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub rebootstrap: bool,
    pub skip_bootstrap: bool,
}

pub struct Daemon {
    config: HiveConfig,
    parts: Collaborators,
}

impl Daemon {
    pub fn new(config: HiveConfig, parts: Collaborators) -> Self {
        Self { config, parts }
    }

    fn schedule(&self, interval_secs: u64) -> Schedule {
        Schedule {
            interval: Duration::from_secs(interval_secs),
            deadline: self.config.cycle_deadline(),
            shutdown_grace: Duration::from_secs(self.config.daemon.shutdown_grace_secs),
        }
    }

    /// Mount served until this node exports, the export directory after
    fn storage(&self) -> Arc<StorageCoordinator> {
        let mounted: Arc<dyn SharedStore> =
            Arc::new(FileStore::new(self.config.storage.mount_point.clone()));
        let exported: Arc<dyn SharedStore> =
            Arc::new(FileStore::new(self.config.storage.export_path.clone()));
        let coordinator = StorageCoordinator::new(
            self.parts.backend.clone(),
            mounted,
            Arc::new(SwarmConfigPeer::new(self.parts.substrate.clone())),
            self.config.cache_dir(),
            self.config.storage.clone(),
        )
        .with_exported_share(exported);
        Arc::new(coordinator)
    }

    pub async fn run(self, options: RunOptions, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let attrs = NodeAttributes::read(self.parts.metadata.as_ref())
            .await
            .context("Failed to read node metadata")?;
        let role = resolve_role(&attrs);
        info!(hostname = %attrs.hostname, %role, deployment = %attrs.deployment, "node identity");

        let storage = self.storage();
        let journal_path = self.config.journal_path();

        if options.rebootstrap {
            BootstrapJournal::clear(&journal_path).await?;
        }

        let state = if options.skip_bootstrap {
            warn!("bootstrap skipped by request");
            None
        } else {
            let bootstrapper = Bootstrapper::new(
                self.parts.metadata.clone(),
                self.parts.substrate.clone(),
                storage.clone(),
                self.config.planner.clone(),
                self.config.bootstrap.clone(),
                journal_path,
            );
            let journal = bootstrapper.run().await?;
            Some(journal.current())
        };

        if *shutdown.borrow() {
            info!("shutdown requested during bootstrap");
            return Ok(());
        }

        if state == Some(BootstrapState::Failed) {
            error!("bootstrap FAILED; monitoring only the search engine until an operator intervenes");
        } else if storage.handle().authority.is_none() {
            // Journal said READY: attach the share again
            if role == NodeRole::PrimaryManager {
                if let Err(e) = storage.export(&attrs.address).await {
                    warn!(error = %e, "re-export failed, handoff values served from cache");
                }
            } else if let Some(primary) = &attrs.primary_address {
                storage.mount(primary).await;
            }
        }

        let mut loops: Vec<(&'static str, JoinHandle<LoopStats>)> = Vec::new();

        let search = SearchMonitor::new(
            self.parts.search.clone(),
            self.config.search.clone(),
            self.config.sample_log_path(),
        );
        loops.push((
            "search-health",
            PeriodicTask::new(Arc::new(search), self.schedule(self.config.search.interval_secs))
                .spawn(shutdown.clone()),
        ));

        if role.is_manager() && state != Some(BootstrapState::Failed) {
            let quorum = QuorumMonitor::new(
                self.parts.substrate.clone(),
                self.parts.inventory.clone(),
                storage.clone(),
                self.config.quorum.clone(),
                &attrs.deployment,
                &attrs.hostname,
                &attrs.address,
            )
            .with_stack(&self.config.bootstrap.stack_name)
            .with_storage_authority(storage.clone())
            .with_journal(self.config.journal_path());
            loops.push((
                "quorum",
                PeriodicTask::new(Arc::new(quorum), self.schedule(self.config.quorum.interval_secs))
                    .spawn(shutdown.clone()),
            ));

            let reconciler = ServiceReconciler::new(
                self.parts.substrate.clone(),
                self.parts.disk.clone(),
                self.parts.purger.clone(),
                self.config.planner.clone(),
                self.config.reconciler.clone(),
                &self.config.bootstrap.stack_name,
            );
            loops.push((
                "reconciler",
                PeriodicTask::new(
                    Arc::new(reconciler),
                    self.schedule(self.config.reconciler.interval_secs),
                )
                .spawn(shutdown.clone()),
            ));
        }

        info!(loops = loops.len(), "monitoring started");
        shutdown_requested(&mut shutdown).await;
        info!("shutting down monitoring loops");

        for (name, handle) in loops {
            match handle.await {
                Ok(stats) => info!(
                    task = name,
                    completed = stats.completed,
                    failed = stats.failed,
                    deadline_skips = stats.deadline_skips,
                    "loop finished"
                ),
                Err(e) => error!(task = name, error = %e, "loop task panicked"),
            }
        }
        Ok(())
    }
}
