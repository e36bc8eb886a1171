//! In-memory collaborators for tests
//!
//! Each fake records the calls made against it so tests can assert on exact
//! side effects (how many restarts, which scale targets) without a swarm.

use crate::cluster::{ClusterView, Member, MemberRole, MembershipStatus};
use crate::command::{CommandRunner, Invocation};
use crate::error::{HiveError, Result};
use crate::inventory::ProvisioningInventory;
use crate::metadata::NodeMetadata;
use crate::search::{ClusterHealth, IndexSize, JvmStat, SearchStatus, ThreadPoolStat};
use crate::search_client::SearchEngine;
use crate::shared::{SharedKey, SharedStore};
use crate::substrate::{ClusterSubstrate, JoinTokens, LocalNodeState, LocalSwarmState};
use crate::workload::Workload;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

// ============================================================================
// Command runner
// ============================================================================

/// Records invocations; answers by command-line prefix, empty stdout otherwise
#[derive(Default)]
pub struct ScriptedRunner {
    invocations: Mutex<Vec<Invocation>>,
    responses: Mutex<Vec<(String, Result<String>)>>,
}

impl ScriptedRunner {
    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.responses
            .lock()
            .unwrap()
            .push((prefix.to_string(), Ok(stdout.to_string())));
    }

    pub fn fail_on(&self, prefix: &str, stderr: &str) {
        self.responses.lock().unwrap().push((
            prefix.to_string(),
            Err(HiveError::CommandFailed {
                command: prefix.to_string(),
                code: Some(1),
                stderr: stderr.to_string(),
            }),
        ));
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.invocations().iter().map(Invocation::display).collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> Result<String> {
        let line = invocation.display();
        self.invocations.lock().unwrap().push(invocation.clone());
        let responses = self.responses.lock().unwrap();
        responses
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| Ok(String::new()))
    }
}

// ============================================================================
// Metadata
// ============================================================================

pub struct FakeMetadata {
    hostname: String,
    address: String,
    attributes: BTreeMap<String, String>,
}

impl FakeMetadata {
    pub fn new(hostname: &str, address: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            address: address.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl NodeMetadata for FakeMetadata {
    async fn attribute(&self, key: &str) -> Result<Option<String>> {
        Ok(self.attributes.get(key).cloned())
    }

    async fn hostname(&self) -> Result<String> {
        Ok(self.hostname.clone())
    }

    async fn internal_address(&self) -> Result<String> {
        Ok(self.address.clone())
    }
}

// ============================================================================
// Substrate
// ============================================================================

/// Side effects issued against the substrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstrateCall {
    Init { addr: String, forced: bool },
    Join { addr: String, token: String },
    RotateTokens,
    Scale { workload: String, replicas: u32 },
    Restart(String),
    UpdateEnv(String),
    Deploy(String),
    WriteConfig(String),
}

#[derive(Debug, Clone)]
pub struct SubstrateState {
    pub hostname: String,
    pub engine_up: bool,
    pub local: LocalSwarmState,
    pub view: ClusterView,
    /// `membership()` reports a leaderless swarm
    pub leaderless: bool,
    pub workloads: Vec<Workload>,
    /// The next this many `list_workloads()` calls fail
    pub list_failures: u32,
    pub tokens: JoinTokens,
    /// `join()` rejects this token
    pub rejected_token: Option<String>,
    pub config_objects: BTreeMap<String, String>,
    pub last_deploy_env: BTreeMap<String, String>,
    pub calls: Vec<SubstrateCall>,
    rotations: u32,
}

/// Swarm simulation whose state converges immediately
pub struct FakeSubstrate {
    state: Mutex<SubstrateState>,
}

impl FakeSubstrate {
    /// Engine up, not yet part of any swarm
    pub fn new(hostname: &str) -> Self {
        Self {
            state: Mutex::new(SubstrateState {
                hostname: hostname.to_string(),
                engine_up: true,
                local: LocalSwarmState {
                    state: LocalNodeState::Inactive,
                    control_available: false,
                },
                view: ClusterView::default(),
                leaderless: false,
                workloads: Vec::new(),
                list_failures: 0,
                tokens: JoinTokens {
                    manager: "SWMTKN-manager-0".to_string(),
                    worker: "SWMTKN-worker-0".to_string(),
                },
                rejected_token: None,
                config_objects: BTreeMap::new(),
                last_deploy_env: BTreeMap::new(),
                calls: Vec::new(),
                rotations: 0,
            }),
        }
    }

    /// Already an active manager of `view`
    pub fn active_manager(hostname: &str, view: ClusterView) -> Self {
        let fake = Self::new(hostname);
        fake.update(|s| {
            s.local = LocalSwarmState {
                state: LocalNodeState::Active,
                control_available: true,
            };
            s.view = view;
        });
        fake
    }

    pub fn update<F: FnOnce(&mut SubstrateState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn snapshot(&self) -> SubstrateState {
        self.state.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<SubstrateCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn restarts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SubstrateCall::Restart(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn scales(&self) -> Vec<(String, u32)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SubstrateCall::Scale { workload, replicas } => Some((workload, replicas)),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn engine_check(state: &SubstrateState) -> Result<()> {
        if state.engine_up {
            Ok(())
        } else {
            Err(HiveError::TransientUnavailable("docker engine down".to_string()))
        }
    }

    fn workload_mut<'a>(state: &'a mut SubstrateState, name: &str) -> Result<&'a mut Workload> {
        state
            .workloads
            .iter_mut()
            .find(|w| w.name == name)
            .ok_or_else(|| HiveError::CommandFailed {
                command: format!("service {}", name),
                code: Some(1),
                stderr: format!("no such service: {}", name),
            })
    }
}

#[async_trait]
impl ClusterSubstrate for FakeSubstrate {
    async fn engine_ready(&self) -> Result<()> {
        Self::engine_check(&self.state.lock().unwrap())
    }

    async fn local_state(&self) -> Result<LocalSwarmState> {
        let state = self.state.lock().unwrap();
        Self::engine_check(&state)?;
        Ok(state.local)
    }

    async fn membership(&self) -> Result<ClusterView> {
        let state = self.state.lock().unwrap();
        Self::engine_check(&state)?;
        if state.leaderless {
            return Err(HiveError::QuorumLost("the swarm does not have a leader".to_string()));
        }
        Ok(state.view.clone())
    }

    async fn init(&self, advertise_addr: &str, force_new_cluster: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::engine_check(&state)?;
        state.calls.push(SubstrateCall::Init {
            addr: advertise_addr.to_string(),
            forced: force_new_cluster,
        });
        state.local = LocalSwarmState {
            state: LocalNodeState::Active,
            control_available: true,
        };
        let mut me = Member::new(&state.hostname, MemberRole::Manager, MembershipStatus::Ready);
        me.is_leader = true;
        if force_new_cluster {
            // Surviving manager keeps its workers, loses every other manager
            let workers: Vec<Member> = state
                .view
                .members
                .iter()
                .filter(|m| m.role == MemberRole::Worker)
                .cloned()
                .collect();
            let mut members = vec![me];
            members.extend(workers);
            state.view = ClusterView::new(members);
            state.leaderless = false;
        } else if state.view.members.is_empty() {
            state.view = ClusterView::new(vec![me]);
        }
        Ok(())
    }

    async fn join(&self, manager_addr: &str, token: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::engine_check(&state)?;
        state.calls.push(SubstrateCall::Join {
            addr: manager_addr.to_string(),
            token: token.to_string(),
        });
        if state.rejected_token.as_deref() == Some(token) {
            return Err(HiveError::CommandFailed {
                command: "docker swarm join".to_string(),
                code: Some(1),
                stderr: "invalid join token".to_string(),
            });
        }
        state.local = LocalSwarmState {
            state: LocalNodeState::Active,
            control_available: token == state.tokens.manager,
        };
        Ok(())
    }

    async fn join_token(&self, role: MemberRole) -> Result<String> {
        let state = self.state.lock().unwrap();
        Ok(match role {
            MemberRole::Manager => state.tokens.manager.clone(),
            MemberRole::Worker => state.tokens.worker.clone(),
        })
    }

    async fn rotate_join_tokens(&self) -> Result<JoinTokens> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(SubstrateCall::RotateTokens);
        state.rotations += 1;
        state.tokens = JoinTokens {
            manager: format!("SWMTKN-manager-{}", state.rotations),
            worker: format!("SWMTKN-worker-{}", state.rotations),
        };
        Ok(state.tokens.clone())
    }

    async fn list_workloads(&self) -> Result<Vec<Workload>> {
        let mut state = self.state.lock().unwrap();
        Self::engine_check(&state)?;
        if state.list_failures > 0 {
            state.list_failures -= 1;
            return Err(HiveError::TransientUnavailable("docker service ls timed out".to_string()));
        }
        Ok(state.workloads.clone())
    }

    async fn scale(&self, workload: &str, replicas: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(SubstrateCall::Scale {
            workload: workload.to_string(),
            replicas,
        });
        let w = Self::workload_mut(&mut state, workload)?;
        w.desired_replicas = replicas;
        w.observed_replicas = w.observed_replicas.min(replicas);
        Ok(())
    }

    async fn restart(&self, workload: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(SubstrateCall::Restart(workload.to_string()));
        let w = Self::workload_mut(&mut state, workload)?;
        w.observed_replicas = w.desired_replicas;
        Ok(())
    }

    async fn update_env(&self, workload: &str, _env: &BTreeMap<String, String>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(SubstrateCall::UpdateEnv(workload.to_string()));
        Self::workload_mut(&mut state, workload).map(|_| ())
    }

    async fn deploy_stack(
        &self,
        stack: &str,
        _compose_file: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::engine_check(&state)?;
        state.calls.push(SubstrateCall::Deploy(stack.to_string()));
        state.last_deploy_env = env.clone();
        Ok(())
    }

    async fn read_config_object(&self, name: &str) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        Self::engine_check(&state)?;
        Ok(state.config_objects.get(name).cloned())
    }

    async fn write_config_object(&self, name: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::engine_check(&state)?;
        if state.config_objects.get(name).map(String::as_str) == Some(value) {
            return Ok(());
        }
        state.calls.push(SubstrateCall::WriteConfig(name.to_string()));
        state
            .config_objects
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}

// ============================================================================
// Inventory
// ============================================================================

#[derive(Default)]
pub struct FakeInventory {
    running: Mutex<Vec<String>>,
    queries: Mutex<u32>,
}

impl FakeInventory {
    pub fn with_running(names: &[&str]) -> Self {
        let inventory = Self::default();
        inventory.set_running(names);
        inventory
    }

    pub fn set_running(&self, names: &[&str]) {
        *self.running.lock().unwrap() = names.iter().map(|n| n.to_string()).collect();
    }

    pub fn query_count(&self) -> u32 {
        *self.queries.lock().unwrap()
    }
}

#[async_trait]
impl ProvisioningInventory for FakeInventory {
    async fn running_instances(&self, pattern: &str) -> Result<Vec<String>> {
        *self.queries.lock().unwrap() += 1;
        Ok(self
            .running
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.contains(pattern))
            .cloned()
            .collect())
    }
}

// ============================================================================
// Shared store
// ============================================================================

/// Map-backed store that can be switched offline
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<SharedKey, String>>,
    offline: Mutex<bool>,
    writes: Mutex<u32>,
}

impl MemoryStore {
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock().unwrap() = offline;
    }

    pub fn get(&self, key: SharedKey) -> Option<String> {
        self.values.lock().unwrap().get(&key).cloned()
    }

    pub fn write_count(&self) -> u32 {
        *self.writes.lock().unwrap()
    }

    fn check(&self) -> Result<()> {
        if *self.offline.lock().unwrap() {
            Err(HiveError::TransientUnavailable("shared store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn read(&self, key: SharedKey) -> Result<Option<String>> {
        self.check()?;
        Ok(self.get(key))
    }

    async fn write(&self, key: SharedKey, value: &str) -> Result<()> {
        self.check()?;
        let mut values = self.values.lock().unwrap();
        if values.get(&key).map(String::as_str) != Some(value) {
            values.insert(key, value.to_string());
            *self.writes.lock().unwrap() += 1;
        }
        Ok(())
    }
}

// ============================================================================
// Search engine
// ============================================================================

#[derive(Debug, Clone)]
pub struct SearchState {
    pub reachable: bool,
    pub health: ClusterHealth,
    pub pools: Vec<ThreadPoolStat>,
    pub jvm: Vec<JvmStat>,
    pub indices: Vec<IndexSize>,
}

pub struct FakeSearchEngine {
    state: Mutex<SearchState>,
}

impl FakeSearchEngine {
    /// Green three-node cluster at the given heap usage
    pub fn green(heap_used_percent: f64) -> Self {
        let nodes = ["search-1", "search-2", "search-3"];
        Self {
            state: Mutex::new(SearchState {
                reachable: true,
                health: ClusterHealth {
                    status: SearchStatus::Green,
                    number_of_nodes: 3,
                    unassigned_shards: 0,
                },
                pools: nodes
                    .iter()
                    .map(|n| ThreadPoolStat {
                        node: n.to_string(),
                        pool: "search".to_string(),
                        active: 0,
                        queue: 0,
                        rejected: 0,
                    })
                    .collect(),
                jvm: nodes
                    .iter()
                    .map(|n| JvmStat {
                        node: n.to_string(),
                        heap_used_percent: 30.0,
                    })
                    .chain(std::iter::once(JvmStat {
                        node: "search-hot".to_string(),
                        heap_used_percent,
                    }))
                    .collect(),
                indices: vec![IndexSize {
                    name: "documents".to_string(),
                    store_bytes: 1 << 30,
                }],
            }),
        }
    }

    pub fn update<F: FnOnce(&mut SearchState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap());
    }

    fn reachable(&self) -> Result<SearchState> {
        let state = self.state.lock().unwrap().clone();
        if state.reachable {
            Ok(state)
        } else {
            Err(HiveError::TransientUnavailable("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl SearchEngine for FakeSearchEngine {
    async fn cluster_health(&self) -> Result<ClusterHealth> {
        Ok(self.reachable()?.health)
    }

    async fn thread_pools(&self) -> Result<Vec<ThreadPoolStat>> {
        Ok(self.reachable()?.pools)
    }

    async fn jvm(&self) -> Result<Vec<JvmStat>> {
        Ok(self.reachable()?.jvm)
    }

    async fn largest_indices(&self, limit: usize) -> Result<Vec<IndexSize>> {
        let mut indices = self.reachable()?.indices;
        indices.truncate(limit);
        Ok(indices)
    }
}
