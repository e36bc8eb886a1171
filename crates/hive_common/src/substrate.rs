//! Cluster substrate control
//!
//! The substrate is the swarm-mode orchestrator: membership, join secrets and
//! replicated workloads. `DockerSwarm` drives it through the docker CLI.

use crate::cluster::{Availability, ClusterView, Member, MemberRole, MembershipStatus};
use crate::command::{CommandRunner, Invocation};
use crate::error::{HiveError, Result};
use crate::workload::Workload;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// This engine's own swarm participation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalNodeState {
    Inactive,
    Pending,
    Active,
    Error,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSwarmState {
    pub state: LocalNodeState,
    /// True when this engine is a manager
    pub control_available: bool,
}

impl LocalSwarmState {
    pub fn is_member(&self) -> bool {
        matches!(self.state, LocalNodeState::Active | LocalNodeState::Locked)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTokens {
    pub manager: String,
    pub worker: String,
}

#[async_trait]
pub trait ClusterSubstrate: Send + Sync {
    /// Engine answers at all
    async fn engine_ready(&self) -> Result<()>;

    async fn local_state(&self) -> Result<LocalSwarmState>;

    /// Full node listing; `QuorumLost` when the managers cannot elect a leader
    async fn membership(&self) -> Result<ClusterView>;

    /// Form a new cluster. `force_new_cluster` discards prior membership.
    async fn init(&self, advertise_addr: &str, force_new_cluster: bool) -> Result<()>;

    async fn join(&self, manager_addr: &str, token: &str) -> Result<()>;

    async fn join_token(&self, role: MemberRole) -> Result<String>;

    /// Invalidate both join secrets and return the replacements
    async fn rotate_join_tokens(&self) -> Result<JoinTokens>;

    async fn list_workloads(&self) -> Result<Vec<Workload>>;

    async fn scale(&self, workload: &str, replicas: u32) -> Result<()>;

    /// Reschedule every task of the workload
    async fn restart(&self, workload: &str) -> Result<()>;

    async fn update_env(&self, workload: &str, env: &BTreeMap<String, String>) -> Result<()>;

    /// Create or update every workload of a stack in place
    async fn deploy_stack(
        &self,
        stack: &str,
        compose_file: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Cluster-wide config object, readable from any manager
    async fn read_config_object(&self, name: &str) -> Result<Option<String>>;

    async fn write_config_object(&self, name: &str, value: &str) -> Result<()>;
}

/// Docker swarm-mode substrate
pub struct DockerSwarm {
    runner: Arc<dyn CommandRunner>,
}

impl DockerSwarm {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn docker<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S> + Send,
        S: Into<String>,
    {
        self.runner.run(&Invocation::new("docker", args)).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmInfo {
    local_node_state: String,
    #[serde(default)]
    control_available: bool,
}

#[derive(Debug, Deserialize)]
struct NodeRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Hostname")]
    hostname: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Availability")]
    availability: String,
    #[serde(rename = "ManagerStatus", default)]
    manager_status: String,
}

#[derive(Debug, Deserialize)]
struct ServiceRow {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Replicas")]
    replicas: String,
}

/// Parse `docker info --format '{{json .Swarm}}'`
pub fn parse_swarm_info(raw: &str) -> Result<LocalSwarmState> {
    let info: SwarmInfo = serde_json::from_str(raw.trim())
        .map_err(|e| HiveError::invalid_response("docker info", e.to_string()))?;
    let state = match info.local_node_state.as_str() {
        "inactive" => LocalNodeState::Inactive,
        "pending" => LocalNodeState::Pending,
        "active" => LocalNodeState::Active,
        "locked" => LocalNodeState::Locked,
        _ => LocalNodeState::Error,
    };
    Ok(LocalSwarmState {
        state,
        control_available: info.control_available,
    })
}

/// Parse `docker node ls --format '{{json .}}'`, one object per line
pub fn parse_node_list(raw: &str) -> Result<ClusterView> {
    let mut members = Vec::new();
    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let row: NodeRow = serde_json::from_str(line)
            .map_err(|e| HiveError::invalid_response("docker node ls", e.to_string()))?;

        let role = if row.manager_status.is_empty() {
            MemberRole::Worker
        } else {
            MemberRole::Manager
        };
        let status = match row.status.as_str() {
            "Ready" => MembershipStatus::Ready,
            "Down" => MembershipStatus::Down,
            _ => MembershipStatus::Unreachable,
        };
        let availability = match row.availability.as_str() {
            "Pause" => Availability::Pause,
            "Drain" => Availability::Drain,
            _ => Availability::Active,
        };

        members.push(Member {
            id: row.id,
            hostname: row.hostname,
            role,
            status,
            availability,
            manager_reachable: matches!(row.manager_status.as_str(), "Leader" | "Reachable"),
            is_leader: row.manager_status == "Leader",
        });
    }
    Ok(ClusterView::new(members))
}

/// Parse `docker service ls --format '{{json .}}'`
///
/// Replicas read like `2/3` or `1/1 (max 1 per node)`.
pub fn parse_service_list(raw: &str) -> Result<Vec<Workload>> {
    let mut workloads = Vec::new();
    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let row: ServiceRow = serde_json::from_str(line)
            .map_err(|e| HiveError::invalid_response("docker service ls", e.to_string()))?;

        let counts = row.replicas.split_whitespace().next().unwrap_or_default();
        let (observed, desired) = counts.split_once('/').ok_or_else(|| {
            HiveError::invalid_response("docker service ls", format!("replicas {:?}", row.replicas))
        })?;
        let parse = |v: &str| {
            v.parse::<u32>().map_err(|_| {
                HiveError::invalid_response("docker service ls", format!("replicas {:?}", row.replicas))
            })
        };

        workloads.push(Workload::new(&row.name, parse(desired)?, parse(observed)?));
    }
    Ok(workloads)
}

/// Extract the payload from `docker config inspect --pretty`
pub fn parse_config_pretty(raw: &str) -> Option<String> {
    let mut lines = raw.lines();
    lines.by_ref().find(|l| l.trim() == "Data:")?;
    let body: Vec<&str> = lines.collect();
    Some(body.join("\n").trim_end_matches('\n').to_string())
}

fn is_leaderless(err: &HiveError) -> bool {
    match err {
        HiveError::CommandFailed { stderr, .. } => {
            stderr.contains("does not have a leader") || stderr.contains("quorum")
        }
        _ => false,
    }
}

#[async_trait]
impl ClusterSubstrate for DockerSwarm {
    async fn engine_ready(&self) -> Result<()> {
        self.docker(["version", "--format", "{{.Server.Version}}"])
            .await
            .map(|_| ())
            .map_err(|e| HiveError::TransientUnavailable(format!("docker engine: {}", e)))
    }

    async fn local_state(&self) -> Result<LocalSwarmState> {
        let raw = self.docker(["info", "--format", "{{json .Swarm}}"]).await?;
        parse_swarm_info(&raw)
    }

    async fn membership(&self) -> Result<ClusterView> {
        match self.docker(["node", "ls", "--format", "{{json .}}"]).await {
            Ok(raw) => parse_node_list(&raw),
            Err(e) if is_leaderless(&e) => Err(HiveError::QuorumLost(format!(
                "substrate has no leader: {}",
                e
            ))),
            Err(e) => Err(e),
        }
    }

    async fn init(&self, advertise_addr: &str, force_new_cluster: bool) -> Result<()> {
        let mut args = vec![
            "swarm".to_string(),
            "init".to_string(),
            "--advertise-addr".to_string(),
            advertise_addr.to_string(),
        ];
        if force_new_cluster {
            args.push("--force-new-cluster".to_string());
        }
        self.docker(args).await.map(|_| ())
    }

    async fn join(&self, manager_addr: &str, token: &str) -> Result<()> {
        let remote = format!("{}:2377", manager_addr);
        self.docker(["swarm", "join", "--token", token, remote.as_str()])
            .await
            .map(|_| ())
    }

    async fn join_token(&self, role: MemberRole) -> Result<String> {
        let role = match role {
            MemberRole::Manager => "manager",
            MemberRole::Worker => "worker",
        };
        let raw = self.docker(["swarm", "join-token", "-q", role]).await?;
        Ok(raw.trim().to_string())
    }

    async fn rotate_join_tokens(&self) -> Result<JoinTokens> {
        let manager = self
            .docker(["swarm", "join-token", "-q", "--rotate", "manager"])
            .await?;
        let worker = self
            .docker(["swarm", "join-token", "-q", "--rotate", "worker"])
            .await?;
        Ok(JoinTokens {
            manager: manager.trim().to_string(),
            worker: worker.trim().to_string(),
        })
    }

    async fn list_workloads(&self) -> Result<Vec<Workload>> {
        let raw = self.docker(["service", "ls", "--format", "{{json .}}"]).await?;
        parse_service_list(&raw)
    }

    async fn scale(&self, workload: &str, replicas: u32) -> Result<()> {
        let target = format!("{}={}", workload, replicas);
        self.docker(["service", "scale", "--detach", target.as_str()])
            .await
            .map(|_| ())
    }

    async fn restart(&self, workload: &str) -> Result<()> {
        self.docker(["service", "update", "--force", "--detach", workload])
            .await
            .map(|_| ())
    }

    async fn update_env(&self, workload: &str, env: &BTreeMap<String, String>) -> Result<()> {
        let mut args = vec!["service".to_string(), "update".to_string(), "--detach".to_string()];
        for (key, value) in env {
            args.push("--env-add".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(workload.to_string());
        self.docker(args).await.map(|_| ())
    }

    async fn deploy_stack(
        &self,
        stack: &str,
        compose_file: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        let compose = compose_file.display().to_string();
        let invocation = Invocation::new(
            "docker",
            ["stack", "deploy", "--with-registry-auth", "-c", compose.as_str(), stack],
        )
        .with_env(env.clone());
        self.runner.run(&invocation).await.map(|_| ())
    }

    async fn read_config_object(&self, name: &str) -> Result<Option<String>> {
        match self.docker(["config", "inspect", "--pretty", name]).await {
            Ok(raw) => Ok(parse_config_pretty(&raw)),
            Err(HiveError::CommandFailed { stderr, .. }) if stderr.contains("No such config") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn write_config_object(&self, name: &str, value: &str) -> Result<()> {
        if self.read_config_object(name).await?.as_deref() == Some(value) {
            return Ok(());
        }
        // Config objects are immutable; replace
        let _ = self.docker(["config", "rm", name]).await;
        let invocation = Invocation::new("docker", ["config", "create", name, "-"]).with_stdin(value);
        self.runner.run(&invocation).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedRunner;

    #[test]
    fn test_parse_node_list() {
        let raw = r#"{"Availability":"Active","Hostname":"mgr-1","ID":"a1","ManagerStatus":"Leader","Self":true,"Status":"Ready"}
{"Availability":"Active","Hostname":"mgr-2","ID":"a2","ManagerStatus":"Unreachable","Self":false,"Status":"Down"}
{"Availability":"Drain","Hostname":"wrk-1","ID":"a3","ManagerStatus":"","Self":false,"Status":"Ready"}
"#;
        let view = parse_node_list(raw).unwrap();
        assert_eq!(view.node_count(), 3);
        assert_eq!(view.manager_count(), 2);
        assert_eq!(view.ready_manager_count(), 1);
        assert!(view.members[0].is_leader);
        assert_eq!(view.members[2].availability, Availability::Drain);
        assert_eq!(view.members[2].role, MemberRole::Worker);
    }

    #[test]
    fn test_parse_service_list() {
        let raw = r#"{"ID":"s1","Mode":"replicated","Name":"app_search","Replicas":"2/3"}
{"ID":"s2","Mode":"replicated","Name":"app_lb","Replicas":"1/1 (max 1 per node)"}
"#;
        let workloads = parse_service_list(raw).unwrap();
        assert_eq!(workloads[0], Workload::new("app_search", 3, 2));
        assert_eq!(workloads[1], Workload::new("app_lb", 1, 1));
    }

    #[test]
    fn test_parse_service_list_rejects_garbage() {
        let raw = r#"{"ID":"s1","Name":"x","Replicas":"n/a"}"#;
        assert!(parse_service_list(raw).is_err());
    }

    #[test]
    fn test_parse_swarm_info() {
        let state =
            parse_swarm_info(r#"{"LocalNodeState":"active","ControlAvailable":true}"#).unwrap();
        assert!(state.is_member());
        assert!(state.control_available);

        let state = parse_swarm_info(r#"{"LocalNodeState":"inactive"}"#).unwrap();
        assert!(!state.is_member());
    }

    #[test]
    fn test_parse_config_pretty() {
        let raw = "ID:\tabc\nName:\thive-primary-address\nData:\n10.0.0.4\n";
        assert_eq!(parse_config_pretty(raw).as_deref(), Some("10.0.0.4"));
        assert_eq!(parse_config_pretty("ID: abc\n"), None);
    }

    #[tokio::test]
    async fn test_leaderless_membership_maps_to_quorum_lost() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.fail_on(
            "docker node ls",
            "Error response from daemon: rpc error: code = Unknown desc = The swarm does not have a leader.",
        );
        let swarm = DockerSwarm::new(runner);
        let err = swarm.membership().await.unwrap_err();
        assert!(matches!(err, HiveError::QuorumLost(_)));
    }

    #[tokio::test]
    async fn test_forced_init_flag() {
        let runner = Arc::new(ScriptedRunner::default());
        let swarm = DockerSwarm::new(runner.clone());
        swarm.init("10.0.0.4", true).await.unwrap();
        assert_eq!(
            runner.calls(),
            vec!["docker swarm init --advertise-addr 10.0.0.4 --force-new-cluster"]
        );
    }

    #[tokio::test]
    async fn test_deploy_passes_plan_env() {
        let runner = Arc::new(ScriptedRunner::default());
        let swarm = DockerSwarm::new(runner.clone());
        let mut env = BTreeMap::new();
        env.insert("SEARCH_REPLICAS".to_string(), "3".to_string());
        swarm
            .deploy_stack("app", Path::new("/opt/hive/stack.yml"), &env)
            .await
            .unwrap();
        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].env["SEARCH_REPLICAS"], "3");
    }
}
