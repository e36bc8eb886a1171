//! Node bootstrapper
//!
//! Runs once at startup: detect role, wait for the container engine, then
//! either form the cluster (primary) or join it (everyone else), and finally
//! deploy the stack sized for the cluster. Every step is idempotent, so a
//! partial attempt is simply replayed from the top.

pub mod journal;
pub mod machine;

pub use journal::{BootstrapJournal, FailureRecord};
pub use machine::{transition, BootstrapEvent, BootstrapState, InvalidTransition};

use crate::retry::{poll, retry, RetryPolicy};
use crate::storage::StorageCoordinator;
use anyhow::Result;
use chrono::Utc;
use hive_common::capacity::PlannerTables;
use hive_common::cluster::{ClusterEpoch, MemberRole, NodeRole};
use hive_common::config::BootstrapConfig;
use hive_common::error::{HiveError, Result as HiveResult};
use hive_common::metadata::{AssignedRole, NodeAttributes, NodeMetadata};
use hive_common::shared::SharedKey;
use hive_common::substrate::ClusterSubstrate;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Role decision from provisioned attributes
pub fn resolve_role(attrs: &NodeAttributes) -> NodeRole {
    if attrs.node_count == 1 {
        return NodeRole::PrimaryManager;
    }
    match (attrs.assigned_role, attrs.is_primary) {
        (_, true) => NodeRole::PrimaryManager,
        (AssignedRole::Manager, false) => NodeRole::SecondaryManager,
        (AssignedRole::Worker, false) => NodeRole::Worker,
    }
}

/// Values discovered along the way
#[derive(Default)]
struct StepContext {
    attrs: Option<NodeAttributes>,
    role: Option<NodeRole>,
}

impl StepContext {
    fn attrs(&self) -> HiveResult<&NodeAttributes> {
        self.attrs
            .as_ref()
            .ok_or_else(|| HiveError::ConfigurationMissing("node attributes".to_string()))
    }

    fn role(&self) -> HiveResult<NodeRole> {
        self.role
            .ok_or_else(|| HiveError::ConfigurationMissing("node role".to_string()))
    }
}

pub struct Bootstrapper {
    metadata: Arc<dyn NodeMetadata>,
    substrate: Arc<dyn ClusterSubstrate>,
    storage: Arc<StorageCoordinator>,
    planner: PlannerTables,
    config: BootstrapConfig,
    journal_path: PathBuf,
}

impl Bootstrapper {
    pub fn new(
        metadata: Arc<dyn NodeMetadata>,
        substrate: Arc<dyn ClusterSubstrate>,
        storage: Arc<StorageCoordinator>,
        planner: PlannerTables,
        config: BootstrapConfig,
        journal_path: PathBuf,
    ) -> Self {
        Self {
            metadata,
            substrate,
            storage,
            planner,
            config,
            journal_path,
        }
    }

    fn join_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.join_wait_attempts,
            Duration::from_secs(self.config.join_wait_interval_secs),
        )
    }

    fn dependency_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.dependency_attempts,
            Duration::from_secs(self.config.join_wait_interval_secs),
        )
    }

    /// Drive the machine to READY or FAILED. A terminal journal from an
    /// earlier run is returned untouched.
    pub async fn run(&self) -> Result<BootstrapJournal> {
        if let Some(previous) = BootstrapJournal::load(&self.journal_path).await? {
            match previous.current() {
                BootstrapState::Ready => {
                    info!(role = ?previous.role, "already bootstrapped, skipping deploy");
                    return Ok(previous);
                }
                BootstrapState::Failed => {
                    error!(
                        failure = ?previous.failure,
                        "previous bootstrap failed; rerun with --rebootstrap after fixing the cause"
                    );
                    return Ok(previous);
                }
                state => info!(%state, "resuming interrupted bootstrap from the start"),
            }
        }

        let mut journal = BootstrapJournal::new();
        let mut ctx = StepContext::default();
        journal.save(&self.journal_path).await?;

        while !journal.current().is_terminal() {
            let state = journal.current();
            info!(%state, "bootstrap step");
            let event = match self.step(state, &mut ctx, &mut journal).await {
                Ok(event) => event,
                Err(e) => {
                    error!(%state, error = %e, kind = e.kind(), "bootstrap failed");
                    journal.record_failure(state, &e);
                    BootstrapEvent::StepFailed
                }
            };
            let next = transition(state, event)?;
            journal.record(next);
            journal.save(&self.journal_path).await?;
        }

        if journal.current() == BootstrapState::Ready {
            info!(role = ?journal.role, "node ready");
        }
        Ok(journal)
    }

    async fn step(
        &self,
        state: BootstrapState,
        ctx: &mut StepContext,
        journal: &mut BootstrapJournal,
    ) -> HiveResult<BootstrapEvent> {
        match state {
            BootstrapState::DetectRole => {
                let attrs = NodeAttributes::read(self.metadata.as_ref()).await?;
                let role = resolve_role(&attrs);
                if attrs.node_count == 1 && attrs.assigned_role == AssignedRole::Worker {
                    warn!("single-node cluster, promoting worker to primary manager");
                }
                info!(hostname = %attrs.hostname, %role, nodes = attrs.node_count, "role detected");
                journal.hostname = Some(attrs.hostname.clone());
                journal.role = Some(role);
                ctx.attrs = Some(attrs);
                ctx.role = Some(role);
                Ok(BootstrapEvent::RoleDetected(role))
            }
            BootstrapState::ProvisionDependencies => {
                retry("container engine", self.dependency_policy(), |_| {
                    self.substrate.engine_ready()
                })
                .await?;
                Ok(BootstrapEvent::DependenciesReady(ctx.role()?))
            }
            BootstrapState::PrimaryInit => {
                let epoch = self.primary_init(ctx.attrs()?).await?;
                journal.epoch = Some(epoch);
                Ok(BootstrapEvent::Initialized)
            }
            BootstrapState::SecondaryJoin => {
                let role = ctx.role()?;
                self.secondary_join(ctx.attrs()?, role).await?;
                Ok(BootstrapEvent::Joined(role))
            }
            BootstrapState::DeployWorkloads => {
                let attrs = ctx.attrs()?;
                let nodes = NonZeroUsize::new(attrs.node_count).ok_or_else(|| {
                    HiveError::InvalidConfig("node-count must be positive".to_string())
                })?;
                let plan = self.planner.plan(nodes);
                let env = plan.to_env();
                retry("stack deploy", self.dependency_policy(), |_| {
                    self.substrate
                        .deploy_stack(&self.config.stack_name, &self.config.compose_file, &env)
                })
                .await?;
                let plan_json = serde_json::to_string(&plan)?;
                self.storage.publish(SharedKey::CapacityPlan, &plan_json).await?;
                info!(
                    stack = %self.config.stack_name,
                    search_replicas = plan.search_replicas,
                    heap = %plan.heap_size,
                    "stack deployed"
                );
                journal.plan = Some(plan);
                journal.deployed_at = Some(Utc::now());
                Ok(BootstrapEvent::Deployed)
            }
            BootstrapState::Ready | BootstrapState::Failed => Err(HiveError::InvalidConfig(
                format!("bootstrap step requested in terminal state {}", state),
            )),
        }
    }

    async fn primary_init(&self, attrs: &NodeAttributes) -> HiveResult<ClusterEpoch> {
        self.storage.export(&attrs.address).await?;

        if self.substrate.local_state().await?.is_member() {
            info!("already a swarm member, skipping init");
        } else {
            self.substrate.init(&attrs.address, false).await?;
            info!(address = %attrs.address, "swarm initialised");
        }

        let manager_token = self.substrate.join_token(MemberRole::Manager).await?;
        let worker_token = self.substrate.join_token(MemberRole::Worker).await?;
        self.storage
            .publish(SharedKey::ManagerJoinToken, &manager_token)
            .await?;
        self.storage
            .publish(SharedKey::WorkerJoinToken, &worker_token)
            .await?;
        self.storage
            .publish(SharedKey::PrimaryAddress, &attrs.address)
            .await?;

        let existing = self
            .storage
            .read_with_source(SharedKey::ClusterEpoch)
            .await
            .ok()
            .and_then(|(raw, _)| serde_json::from_str::<ClusterEpoch>(&raw).ok());
        let epoch = match existing {
            Some(epoch) => epoch,
            None => {
                let epoch = ClusterEpoch::initial(&attrs.hostname);
                self.storage
                    .publish(SharedKey::ClusterEpoch, &serde_json::to_string(&epoch)?)
                    .await?;
                epoch
            }
        };
        info!(generation = epoch.generation, "join secrets published");
        Ok(epoch)
    }

    async fn secondary_join(&self, attrs: &NodeAttributes, role: NodeRole) -> HiveResult<()> {
        let authority = match &attrs.primary_address {
            Some(addr) => addr.clone(),
            None => {
                poll("primary address", self.join_policy(), || {
                    self.storage.read_optional(SharedKey::PrimaryAddress)
                })
                .await?
            }
        };
        let storage_state = self.storage.mount(&authority).await;
        info!(%authority, state = ?storage_state, "shared storage attached");

        if self.substrate.local_state().await?.is_member() {
            info!("already a swarm member, skipping join");
            return Ok(());
        }

        let token_key = if role.is_manager() {
            SharedKey::ManagerJoinToken
        } else {
            SharedKey::WorkerJoinToken
        };
        // Re-read the token each attempt; it changes after forced recovery
        retry("join credentials", self.join_policy(), |attempt| {
            let authority = authority.as_str();
            async move {
                let token = self
                    .storage
                    .read_optional(token_key)
                    .await?
                    .ok_or_else(|| HiveError::ConfigurationMissing(token_key.to_string()))?;
                self.substrate.join(authority, token.trim()).await?;
                info!(attempt, %role, "joined swarm");
                Ok(())
            }
        })
        .await
    }
}
