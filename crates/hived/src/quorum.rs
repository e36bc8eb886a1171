//! Quorum and split-brain monitor
//!
//! Two independent sources decide whether this node is really alone: the
//! substrate's membership view and the provisioning inventory. Forced
//! recovery only happens when both agree that this node is the sole
//! surviving manager.
//!
//! Once the forced init has succeeded the new epoch exists, so everything
//! after it is best-effort: taking over the share, publishing secrets and
//! the epoch. The critical restarts stay pending until one cycle manages to
//! issue them.

use crate::bootstrap::BootstrapJournal;
use crate::scheduler::Cycle;
use crate::storage::StorageCoordinator;
use async_trait::async_trait;
use hive_common::cluster::{ClusterEpoch, ClusterView};
use hive_common::config::{BootstrapConfig, QuorumConfig};
use hive_common::error::{HiveError, Result};
use hive_common::inventory::ProvisioningInventory;
use hive_common::shared::{SharedKey, SharedStore};
use hive_common::substrate::ClusterSubstrate;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What the monitor would do about the current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Healthy,
    /// This node is the only running manager instance
    ForceRecover,
    /// A different instance is the sole survivor; it recovers, we wait
    SurvivorElsewhere(String),
    /// Inventory shows zero or several running managers
    OperatorAlert { running: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    /// `None` when the substrate refused to list members
    pub view: Option<ClusterView>,
    pub detail: String,
    pub decision: Decision,
}

impl Assessment {
    pub fn quorum_ok(&self) -> bool {
        self.decision == Decision::Healthy
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumOutcome {
    Healthy,
    Recovered {
        epoch: ClusterEpoch,
        restarted: Vec<String>,
    },
    Deferred(String),
    OperatorAlerted(usize),
}

pub struct QuorumMonitor {
    substrate: Arc<dyn ClusterSubstrate>,
    inventory: Arc<dyn ProvisioningInventory>,
    store: Arc<dyn SharedStore>,
    config: QuorumConfig,
    deployment: String,
    hostname: String,
    address: String,
    stack: String,
    /// Coordinator to take over as export authority after recovery
    authority: Option<Arc<StorageCoordinator>>,
    /// Bootstrap journal, for the epoch when the store has none
    journal_path: Option<PathBuf>,
    /// Epoch whose critical restarts have not been issued yet
    pending_restart: Mutex<Option<ClusterEpoch>>,
}

impl QuorumMonitor {
    pub fn new(
        substrate: Arc<dyn ClusterSubstrate>,
        inventory: Arc<dyn ProvisioningInventory>,
        store: Arc<dyn SharedStore>,
        config: QuorumConfig,
        deployment: &str,
        hostname: &str,
        address: &str,
    ) -> Self {
        Self {
            substrate,
            inventory,
            store,
            config,
            deployment: deployment.to_string(),
            hostname: hostname.to_string(),
            address: address.to_string(),
            stack: BootstrapConfig::default().stack_name,
            authority: None,
            journal_path: None,
            pending_restart: Mutex::new(None),
        }
    }

    /// Stack prefix of deployed workload names
    pub fn with_stack(mut self, stack: &str) -> Self {
        self.stack = stack.to_string();
        self
    }

    pub fn with_storage_authority(mut self, storage: Arc<StorageCoordinator>) -> Self {
        self.authority = Some(storage);
        self
    }

    pub fn with_journal(mut self, path: PathBuf) -> Self {
        self.journal_path = Some(path);
        self
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Option<ClusterEpoch>> {
        self.pending_restart.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Read-only evaluation
    pub async fn assess(&self) -> Result<Assessment> {
        let (view, detail) = match self.substrate.membership().await {
            Ok(view) if view.has_quorum() => {
                let detail = format!(
                    "{}/{} managers ready, quorum {}",
                    view.ready_manager_count(),
                    view.manager_count(),
                    view.required_quorum()
                );
                return Ok(Assessment {
                    view: Some(view),
                    detail,
                    decision: Decision::Healthy,
                });
            }
            Ok(view) => {
                let detail = format!(
                    "{}/{} managers ready, need {}",
                    view.ready_manager_count(),
                    view.manager_count(),
                    view.required_quorum()
                );
                (Some(view), detail)
            }
            Err(HiveError::QuorumLost(msg)) => (None, msg),
            Err(e) => return Err(e),
        };

        let pattern = self.config.manager_pattern_for(&self.deployment);
        let running = self.inventory.running_instances(&pattern).await?;
        let decision = match running.as_slice() {
            [only] if *only == self.hostname => Decision::ForceRecover,
            [only] => Decision::SurvivorElsewhere(only.clone()),
            _ => Decision::OperatorAlert { running },
        };

        Ok(Assessment {
            view,
            detail,
            decision,
        })
    }

    /// Assess, then act on the decision
    pub async fn cycle(&self) -> Result<QuorumOutcome> {
        let assessment = self.assess().await?;
        match assessment.decision {
            Decision::Healthy => {
                let pending = self.pending().clone();
                match pending {
                    Some(epoch) => {
                        info!(generation = epoch.generation, "finishing restarts of the recovered epoch");
                        self.finish_recovery(epoch).await
                    }
                    None => {
                        debug!(detail = %assessment.detail, "quorum holds");
                        Ok(QuorumOutcome::Healthy)
                    }
                }
            }
            Decision::ForceRecover => {
                warn!(detail = %assessment.detail, "quorum lost and this node is the sole surviving manager");
                self.recover().await
            }
            Decision::SurvivorElsewhere(survivor) => {
                warn!(
                    detail = %assessment.detail,
                    %survivor,
                    "quorum lost; sole surviving manager is another instance, not acting"
                );
                Ok(QuorumOutcome::Deferred(survivor))
            }
            Decision::OperatorAlert { running } => {
                error!(
                    detail = %assessment.detail,
                    running_managers = running.len(),
                    instances = ?running,
                    "quorum lost with an ambiguous manager count, operator action required"
                );
                Ok(QuorumOutcome::OperatorAlerted(running.len()))
            }
        }
    }

    async fn previous_epoch(&self) -> Option<ClusterEpoch> {
        match self.store.read(SharedKey::ClusterEpoch).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(epoch) => return Some(epoch),
                Err(e) => warn!(error = %e, "published epoch unreadable"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "could not read previous epoch"),
        }
        self.journal_epoch().await
    }

    async fn journal_epoch(&self) -> Option<ClusterEpoch> {
        let path = self.journal_path.as_ref()?;
        match BootstrapJournal::load(path).await {
            Ok(journal) => {
                let epoch = journal.and_then(|j| j.epoch);
                if let Some(epoch) = &epoch {
                    info!(generation = epoch.generation, "previous epoch taken from the bootstrap journal");
                }
                epoch
            }
            Err(e) => {
                warn!(error = %e, "bootstrap journal unreadable");
                None
            }
        }
    }

    /// Keep the local journal on the current epoch
    async fn record_epoch(&self, epoch: &ClusterEpoch) {
        let Some(path) = &self.journal_path else {
            return;
        };
        let result = match BootstrapJournal::load(path).await {
            Ok(Some(mut journal)) => {
                journal.epoch = Some(epoch.clone());
                journal.save(path).await
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(error = %e, "could not record the new epoch in the journal");
        }
    }

    async fn recover(&self) -> Result<QuorumOutcome> {
        let previous = self.previous_epoch().await;
        if let Some(prev) = &previous {
            if prev.formed_by != self.hostname {
                warn!(
                    original = %prev.formed_by,
                    "re-forming the cluster on a node that was not the epoch's primary"
                );
            }
        }

        self.substrate.init(&self.address, true).await?;
        info!(address = %self.address, "forced new single-manager cluster");
        let epoch = ClusterEpoch::successor(previous.as_ref(), &self.hostname);
        *self.pending() = Some(epoch.clone());

        // The old primary's export went with it
        if let Some(storage) = &self.authority {
            match storage.export(&self.address).await {
                Ok(()) => info!("took over as shared storage authority"),
                Err(e) => warn!(error = %e, "export failed, handoff values served from peer and cache"),
            }
        }
        self.publish_epoch(&epoch).await;
        self.record_epoch(&epoch).await;

        tokio::time::sleep(Duration::from_secs(self.config.stabilization_secs)).await;
        self.finish_recovery(epoch).await
    }

    /// Rotate the dead epoch's join secrets and publish the new one
    async fn publish_epoch(&self, epoch: &ClusterEpoch) {
        match self.substrate.rotate_join_tokens().await {
            Ok(tokens) => {
                self.publish(SharedKey::ManagerJoinToken, &tokens.manager).await;
                self.publish(SharedKey::WorkerJoinToken, &tokens.worker).await;
            }
            Err(e) => warn!(error = %e, "join token rotation failed, old secrets stay valid"),
        }
        self.publish(SharedKey::PrimaryAddress, &self.address).await;
        match serde_json::to_string(epoch) {
            Ok(raw) => self.publish(SharedKey::ClusterEpoch, &raw).await,
            Err(e) => warn!(error = %e, "epoch not serializable"),
        }
        info!(generation = epoch.generation, id = %epoch.id, forced = epoch.forced, "new cluster epoch");
    }

    async fn publish(&self, key: SharedKey, value: &str) {
        if let Err(e) = self.store.write(key, value).await {
            warn!(%key, error = %e, "publish failed after forced recovery");
        }
    }

    /// Restart every deployed critical workload, then clear the pending marker
    async fn finish_recovery(&self, epoch: ClusterEpoch) -> Result<QuorumOutcome> {
        let workloads = self.substrate.list_workloads().await?;
        let mut restarted = Vec::new();
        for name in &self.config.critical_workloads {
            let Some(workload) = workloads.iter().find(|w| w.matches(&self.stack, name)) else {
                debug!(workload = %name, "critical workload not deployed");
                continue;
            };
            match self.substrate.restart(&workload.name).await {
                Ok(()) => {
                    info!(workload = %workload.name, "force restarted");
                    restarted.push(workload.name.clone());
                }
                Err(e) => warn!(workload = %workload.name, error = %e, "restart failed"),
            }
        }
        *self.pending() = None;

        Ok(QuorumOutcome::Recovered { epoch, restarted })
    }
}

#[async_trait]
impl Cycle for QuorumMonitor {
    fn name(&self) -> &'static str {
        "quorum"
    }

    async fn run_cycle(&self) -> Result<()> {
        self.cycle().await.map(|_| ())
    }
}
