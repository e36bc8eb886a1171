//! Command handlers for hivectl.

use anyhow::{Context, Result};
use hive_common::cluster::{ClusterView, MembershipStatus};
use hive_common::config::HiveConfig;
use hive_common::metadata::NodeAttributes;
use hive_common::search::{classify, overall_severity, HealthSample, Severity};
use hive_common::shared::{FileStore, SharedStore};
use hive_common::workload::WorkloadHealth;
use hived::bootstrap::{BootstrapJournal, BootstrapState};
use hived::daemon::Collaborators;
use hived::quorum::{Decision, QuorumMonitor};
use hived::search_monitor::{recent_samples, SearchMonitor};
use owo_colors::OwoColorize;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

const KW: usize = 18;

fn load_config(path: Option<&Path>) -> Result<HiveConfig> {
    HiveConfig::load(path).context("Failed to load configuration")
}

fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(60).dimmed());
}

fn print_kv(key: &str, value: impl std::fmt::Display) {
    println!("{:width$} {}", key, value, width = KW);
}

fn severity_label(severity: Severity) -> String {
    match severity {
        Severity::Healthy => "healthy".green().to_string(),
        Severity::Warning => "warning".yellow().to_string(),
        Severity::Critical => "critical".red().bold().to_string(),
    }
}

/// Handle plan command
pub fn plan(config: Option<&Path>, nodes: usize, json: bool) -> Result<()> {
    let config = load_config(config)?;
    let count = NonZeroUsize::new(nodes).context("--nodes must be at least 1")?;
    let plan = config.planner.plan(count);

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    header(&format!("capacity plan for {} node(s)", nodes));
    print_kv("search replicas", plan.search_replicas);
    print_kv("index replicas", plan.search_index_replicas);
    print_kv("heap", &plan.heap_size);
    print_kv("initial masters", plan.initial_master_list.join(", "));
    print_kv(
        "pool sizes",
        format!(
            "search {}  write {}  get {}",
            plan.thread_pool_sizes.search, plan.thread_pool_sizes.write, plan.thread_pool_sizes.get
        ),
    );
    print_kv(
        "pool queues",
        format!(
            "search {}  write {}  get {}",
            plan.thread_pool_queues.search,
            plan.thread_pool_queues.write,
            plan.thread_pool_queues.get
        ),
    );
    let b = plan.circuit_breaker_limits;
    print_kv(
        "breakers",
        format!(
            "total {}%  request {}%  fielddata {}%  network {}%",
            b.total, b.request, b.field_data, b.network
        ),
    );
    println!();
    Ok(())
}

fn print_members(view: &ClusterView) {
    for m in &view.members {
        let status = match m.status {
            MembershipStatus::Ready if m.is_available() => "ready".green().to_string(),
            MembershipStatus::Ready => format!("{:?}", m.availability).to_lowercase().yellow().to_string(),
            MembershipStatus::Down => "down".red().to_string(),
            MembershipStatus::Unreachable => "unreachable".red().to_string(),
        };
        let leader = if m.is_leader { " (leader)" } else { "" };
        println!(
            "  {:28} {:8} {}{}",
            m.hostname,
            format!("{:?}", m.role).to_lowercase(),
            status,
            leader.cyan()
        );
    }
}

/// Handle status command
pub async fn status(config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let parts = Collaborators::production(&config)?;

    let view = parts
        .substrate
        .membership()
        .await
        .context("Failed to read cluster membership")?;

    header("cluster");
    print_kv("nodes", view.node_count());
    print_kv("available", view.available_node_count());
    print_kv(
        "managers",
        format!(
            "{} ready of {} (quorum {})",
            view.ready_manager_count(),
            view.manager_count(),
            view.required_quorum()
        ),
    );
    println!();
    print_members(&view);

    let workloads = parts
        .substrate
        .list_workloads()
        .await
        .context("Failed to list workloads")?;
    header("workloads");
    for w in &workloads {
        let health = match w.health() {
            WorkloadHealth::Healthy => "healthy".green().to_string(),
            WorkloadHealth::Degraded => "degraded".yellow().to_string(),
            WorkloadHealth::Failed => "failed".red().to_string(),
        };
        println!(
            "  {:28} {}/{}  {}",
            w.name, w.observed_replicas, w.desired_replicas, health
        );
    }
    println!();
    Ok(())
}

/// Handle quorum command
pub async fn quorum(config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let parts = Collaborators::production(&config)?;
    let attrs = NodeAttributes::read(parts.metadata.as_ref())
        .await
        .context("Failed to read node metadata")?;

    let store: Arc<dyn SharedStore> = Arc::new(FileStore::new(config.storage.mount_point.clone()));
    let monitor = QuorumMonitor::new(
        parts.substrate.clone(),
        parts.inventory.clone(),
        store,
        config.quorum.clone(),
        &attrs.deployment,
        &attrs.hostname,
        &attrs.address,
    )
    .with_stack(&config.bootstrap.stack_name);
    let assessment = monitor.assess().await.context("Quorum assessment failed")?;

    header("quorum");
    print_kv("detail", &assessment.detail);
    let decision = match &assessment.decision {
        Decision::Healthy => "quorum holds".green().to_string(),
        Decision::ForceRecover => "lost; this node would force a new cluster".red().bold().to_string(),
        Decision::SurvivorElsewhere(host) => {
            format!("lost; {} is the sole survivor", host).yellow().to_string()
        }
        Decision::OperatorAlert { running } => format!(
            "lost; {} managers running, operator action required",
            running.len()
        )
        .red()
        .bold()
        .to_string(),
    };
    print_kv("decision", decision);
    if let Some(view) = &assessment.view {
        println!();
        print_members(view);
    }
    println!();
    Ok(())
}

fn print_sample(sample: &HealthSample, config: &HiveConfig) {
    let findings = classify(sample, &config.search.thresholds());
    print_kv("taken", sample.taken_at.format("%Y-%m-%d %H:%M:%S UTC"));
    print_kv("status", format!("{:?}", sample.status).to_lowercase());
    print_kv("latency", format!("{}ms", sample.latency_ms));
    if let Some(heap) = sample.heap_used_percent {
        print_kv("heap", format!("{:.1}%", heap));
    }
    print_kv("severity", severity_label(overall_severity(&findings)));
    for f in &findings {
        println!("  {} {}: {}", severity_label(f.severity), f.check, f.message);
    }
}

/// Handle probe command
pub async fn probe(config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let parts = Collaborators::production(&config)?;
    let monitor = SearchMonitor::new(
        parts.search.clone(),
        config.search.clone(),
        config.sample_log_path(),
    );

    let sample = monitor.probe().await;
    header(&format!("search engine {}", config.search.endpoint));
    print_sample(&sample, &config);
    if !sample.largest_indices.is_empty() {
        println!();
        for idx in &sample.largest_indices {
            println!(
                "  {:32} {:>10.1} MiB",
                idx.name,
                idx.store_bytes as f64 / (1024.0 * 1024.0)
            );
        }
    }
    println!();
    Ok(())
}

/// Handle history command
pub async fn history(config: Option<&Path>, limit: usize) -> Result<()> {
    let config = load_config(config)?;
    let path = config.sample_log_path();
    let samples = recent_samples(&path, limit)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    header("search health history");
    if samples.is_empty() {
        println!("  {}", "no samples recorded".dimmed());
    }
    for sample in &samples {
        let findings = classify(sample, &config.search.thresholds());
        println!(
            "  {}  {:11} {:>6}ms  {}",
            sample.taken_at.format("%m-%d %H:%M:%S"),
            format!("{:?}", sample.status).to_lowercase(),
            sample.latency_ms,
            severity_label(overall_severity(&findings))
        );
    }
    println!();
    Ok(())
}

/// Handle bootstrap-status command
pub async fn bootstrap_status(config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let path = config.journal_path();
    let Some(journal) = BootstrapJournal::load(&path).await? else {
        header("bootstrap");
        println!("  {}", format!("no journal at {}", path.display()).dimmed());
        println!();
        return Ok(());
    };

    header("bootstrap");
    let state = journal.current();
    let label = match state {
        BootstrapState::Ready => state.to_string().green().to_string(),
        BootstrapState::Failed => state.to_string().red().bold().to_string(),
        _ => state.to_string().yellow().to_string(),
    };
    print_kv("state", label);
    print_kv("attempt", journal.attempt_id);
    if let Some(host) = &journal.hostname {
        print_kv("hostname", host);
    }
    if let Some(role) = journal.role {
        print_kv("role", role);
    }
    if let Some(epoch) = &journal.epoch {
        print_kv(
            "epoch",
            format!("generation {} formed by {}", epoch.generation, epoch.formed_by),
        );
    }
    if let Some(at) = journal.deployed_at {
        print_kv("deployed", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(failure) = &journal.failure {
        print_kv(
            "failed in",
            format!("{} ({})", failure.state, failure.kind).red(),
        );
        print_kv("error", &failure.message);
    }

    println!();
    for entry in &journal.history {
        println!(
            "  {}  {}",
            entry.at.format("%H:%M:%S").dimmed(),
            entry.state
        );
    }
    println!();
    Ok(())
}
