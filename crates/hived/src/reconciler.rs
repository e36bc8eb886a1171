//! Service health reconciler
//!
//! Per cycle: track the node count (re-applying the capacity plan when it
//! moves), scale multi-node workloads down to one replica when only one node
//! is left, then remediate every workload that has not converged.
//!
//! A workload this loop scaled or restarted gets `settle_cycles` cycles to
//! converge before it is remediated again.

use crate::disk::{DataPurger, DiskProbe, PurgeSummary};
use crate::scheduler::Cycle;
use async_trait::async_trait;
use hive_common::capacity::PlannerTables;
use hive_common::config::ReconcilerConfig;
use hive_common::error::{HiveError, Result};
use hive_common::substrate::ClusterSubstrate;
use hive_common::workload::Workload;
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Actions taken in one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub node_count: usize,
    pub scaled: Vec<(String, u32)>,
    pub restarted: Vec<String>,
    pub purged: Option<PurgeSummary>,
    /// Node count the capacity plan was re-applied for
    pub plan_applied: Option<usize>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.scaled.is_empty()
            && self.restarted.is_empty()
            && self.purged.is_none()
            && self.plan_applied.is_none()
    }
}

pub struct ServiceReconciler {
    substrate: Arc<dyn ClusterSubstrate>,
    disk: Arc<dyn DiskProbe>,
    purger: Arc<dyn DataPurger>,
    planner: PlannerTables,
    config: ReconcilerConfig,
    stack: String,
    last_node_count: Mutex<Option<usize>>,
    /// Workload name → cycles left before it may be remediated
    settling: Mutex<BTreeMap<String, u32>>,
}

impl ServiceReconciler {
    pub fn new(
        substrate: Arc<dyn ClusterSubstrate>,
        disk: Arc<dyn DiskProbe>,
        purger: Arc<dyn DataPurger>,
        planner: PlannerTables,
        config: ReconcilerConfig,
        stack: &str,
    ) -> Self {
        Self {
            substrate,
            disk,
            purger,
            planner,
            config,
            stack: stack.to_string(),
            last_node_count: Mutex::new(None),
            settling: Mutex::new(BTreeMap::new()),
        }
    }

    fn is_search(&self, w: &Workload) -> bool {
        w.matches(&self.stack, &self.config.search_workload)
    }

    /// Converged or removed workloads leave the settle window
    fn prune_settled(&self, workloads: &[Workload]) {
        let mut settling = self.settling.lock().unwrap_or_else(|p| p.into_inner());
        settling.retain(|name, _| {
            workloads
                .iter()
                .any(|w| w.name == *name && !w.is_converged())
        });
    }

    /// True while `w` is inside its settle window; consumes one cycle of it
    fn still_settling(&self, w: &Workload) -> bool {
        let mut settling = self.settling.lock().unwrap_or_else(|p| p.into_inner());
        match settling.get_mut(&w.name) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            Some(_) => {
                settling.remove(&w.name);
                false
            }
            None => false,
        }
    }

    fn start_settling<'a>(&self, names: impl IntoIterator<Item = &'a String>) {
        if self.config.settle_cycles == 0 {
            return;
        }
        let mut settling = self.settling.lock().unwrap_or_else(|p| p.into_inner());
        for name in names {
            settling.insert(name.clone(), self.config.settle_cycles);
        }
    }

    fn swap_node_count(&self, nodes: usize) -> Option<usize> {
        let mut last = self
            .last_node_count
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        last.replace(nodes)
    }

    pub async fn cycle(&self) -> Result<ReconcileReport> {
        let view = self.substrate.membership().await?;
        let workloads = self.substrate.list_workloads().await?;
        let nodes = view.available_node_count();
        let mut report = ReconcileReport {
            node_count: nodes,
            ..ReconcileReport::default()
        };
        let mut touched: BTreeSet<String> = BTreeSet::new();
        self.prune_settled(&workloads);

        let previous = self.swap_node_count(nodes);
        if let (Some(prev), Some(count)) = (previous, NonZeroUsize::new(nodes)) {
            if prev != nodes {
                info!(from = prev, to = nodes, "node count changed, re-applying capacity plan");
                self.apply_plan(count, &workloads, &mut report, &mut touched)
                    .await;
            }
        }

        if nodes == 1 {
            for w in workloads.iter().filter(|w| w.assumes_multi_node()) {
                if touched.contains(&w.name) {
                    continue;
                }
                match self.substrate.scale(&w.name, 1).await {
                    Ok(()) => {
                        warn!(workload = %w.name, from = w.desired_replicas, "single node left, scaled to 1");
                        report.scaled.push((w.name.clone(), 1));
                        touched.insert(w.name.clone());
                    }
                    Err(e) => warn!(workload = %w.name, error = %e, "scale down failed"),
                }
            }
        }

        for w in &workloads {
            if w.is_converged() || touched.contains(&w.name) {
                continue;
            }
            if self.still_settling(w) {
                debug!(
                    workload = %w.name,
                    observed = w.observed_replicas,
                    desired = w.desired_replicas,
                    "still converging after a recent change"
                );
                continue;
            }
            let mismatch = HiveError::CapacityMismatch {
                workload: w.name.clone(),
                desired: w.desired_replicas,
                observed: w.observed_replicas,
            };
            warn!(health = ?w.health(), "{}", mismatch);
            self.remediate(w, &mut report).await;
        }

        self.start_settling(touched.iter().chain(report.restarted.iter()));

        if report.is_noop() {
            debug!(nodes, workloads = workloads.len(), "no action needed");
        }
        Ok(report)
    }

    async fn apply_plan(
        &self,
        nodes: NonZeroUsize,
        workloads: &[Workload],
        report: &mut ReconcileReport,
        touched: &mut BTreeSet<String>,
    ) {
        let Some(search) = workloads.iter().find(|w| self.is_search(w)) else {
            debug!("search workload not deployed, plan not applied");
            return;
        };
        let plan = self.planner.plan(nodes);

        if let Err(e) = self.substrate.update_env(&search.name, &plan.to_env()).await {
            warn!(workload = %search.name, error = %e, "plan env update failed");
            return;
        }
        touched.insert(search.name.clone());
        report.plan_applied = Some(nodes.get());

        let replicas = plan.search_replicas as u32;
        if search.desired_replicas != replicas {
            match self.substrate.scale(&search.name, replicas).await {
                Ok(()) => report.scaled.push((search.name.clone(), replicas)),
                Err(e) => warn!(workload = %search.name, error = %e, "plan scale failed"),
            }
        }
        info!(
            workload = %search.name,
            replicas,
            heap = %plan.heap_size,
            "capacity plan applied"
        );
    }

    async fn remediate(&self, w: &Workload, report: &mut ReconcileReport) {
        if self.is_search(w) {
            self.relieve_disk_pressure(report).await;
        }
        match self.substrate.restart(&w.name).await {
            Ok(()) => {
                info!(workload = %w.name, "force restarted");
                report.restarted.push(w.name.clone());
            }
            Err(e) => warn!(workload = %w.name, error = %e, "restart failed"),
        }
    }

    async fn relieve_disk_pressure(&self, report: &mut ReconcileReport) {
        let path = &self.config.data_path;
        let usage = match self.disk.usage_percent(path).await {
            Ok(u) => u,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "disk usage unknown, skipping purge");
                return;
            }
        };
        if usage < self.config.disk_cleanup_threshold_percent {
            debug!(usage, "disk pressure below threshold");
            return;
        }
        warn!(
            usage,
            threshold = self.config.disk_cleanup_threshold_percent,
            "search data disk under pressure, purging"
        );
        match self.purger.purge(path, self.config.retention()).await {
            Ok(summary) => {
                info!(files = summary.files, bytes = summary.bytes, "purged old search data");
                report.purged = Some(summary);
            }
            Err(e) => warn!(error = %e, "purge failed"),
        }
    }
}

#[async_trait]
impl Cycle for ServiceReconciler {
    fn name(&self) -> &'static str {
        "reconciler"
    }

    async fn run_cycle(&self) -> Result<()> {
        self.cycle().await.map(|_| ())
    }
}
