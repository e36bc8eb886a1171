//! Cluster loses two of three managers; the survivor heals it

use hive_common::capacity::PlannerTables;
use hive_common::cluster::{ClusterEpoch, ClusterView, Member, MemberRole, MembershipStatus};
use hive_common::config::{QuorumConfig, ReconcilerConfig, SearchConfig, StorageConfig};
use hive_common::error::Result;
use hive_common::fakes::{
    FakeInventory, FakeSearchEngine, FakeSubstrate, MemoryStore, ScriptedRunner, SubstrateCall,
};
use hive_common::search::Severity;
use hive_common::shared::{SharedKey, SharedStore};
use hive_common::substrate::ClusterSubstrate;
use hive_common::workload::Workload;
use hived::disk::{DataPurger, DiskProbe, PurgeSummary};
use hived::quorum::{QuorumMonitor, QuorumOutcome};
use hived::reconciler::ServiceReconciler;
use hived::search_monitor::SearchMonitor;
use hived::storage::{NfsBackend, StorageCoordinator, StorageState, SwarmConfigPeer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

struct QuietDisk;

#[async_trait::async_trait]
impl DiskProbe for QuietDisk {
    async fn usage_percent(&self, _path: &Path) -> Result<f64> {
        Ok(20.0)
    }
}

#[async_trait::async_trait]
impl DataPurger for QuietDisk {
    async fn purge(&self, _path: &Path, _retention: Duration) -> Result<PurgeSummary> {
        Ok(PurgeSummary::default())
    }
}

fn survivor_view() -> ClusterView {
    let mut down_2 = Member::new("prod-manager-2", MemberRole::Manager, MembershipStatus::Down);
    down_2.manager_reachable = false;
    let mut down_3 = Member::new("prod-manager-3", MemberRole::Manager, MembershipStatus::Unreachable);
    down_3.manager_reachable = false;
    ClusterView::new(vec![
        Member::new("prod-manager-1", MemberRole::Manager, MembershipStatus::Ready),
        down_2,
        down_3,
    ])
}

fn stack() -> Vec<Workload> {
    vec![
        Workload::new("app_search", 3, 1),
        Workload::new("app_backend", 2, 1),
        Workload::new("app_frontend", 2, 1),
        Workload::new("app_lb", 1, 1),
    ]
}

#[tokio::test]
async fn three_to_one_scales_down_and_recovers_once() {
    let substrate = Arc::new(FakeSubstrate::active_manager("prod-manager-1", survivor_view()));
    substrate.update(|s| s.workloads = stack());
    let stale = substrate.snapshot().tokens;

    let store = Arc::new(MemoryStore::default());
    store.write(SharedKey::ManagerJoinToken, &stale.manager).await.unwrap();
    store.write(SharedKey::WorkerJoinToken, &stale.worker).await.unwrap();
    store
        .write(
            SharedKey::ClusterEpoch,
            &serde_json::to_string(&ClusterEpoch::initial("prod-manager-1")).unwrap(),
        )
        .await
        .unwrap();

    let inventory = Arc::new(FakeInventory::with_running(&["prod-manager-1"]));
    let quorum = QuorumMonitor::new(
        substrate.clone(),
        inventory,
        store.clone(),
        QuorumConfig {
            stabilization_secs: 0,
            ..QuorumConfig::default()
        },
        "prod",
        "prod-manager-1",
        "10.0.0.2",
    );
    let reconciler = ServiceReconciler::new(
        substrate.clone(),
        Arc::new(QuietDisk),
        Arc::new(QuietDisk),
        PlannerTables::default(),
        ReconcilerConfig::default(),
        "app",
    );

    // Reconciler sees one available node and shrinks multi-node workloads
    let report = reconciler.cycle().await.unwrap();
    assert_eq!(report.node_count, 1);
    let mut scaled: Vec<_> = report.scaled.iter().map(|(n, r)| (n.as_str(), *r)).collect();
    scaled.sort();
    assert_eq!(
        scaled,
        vec![("app_backend", 1), ("app_frontend", 1), ("app_search", 1)]
    );
    assert!(report.restarted.is_empty());

    // Quorum: 1 of 3 managers ready, inventory agrees this node is alone
    let outcome = quorum.cycle().await.unwrap();
    let epoch = match outcome {
        QuorumOutcome::Recovered { epoch, restarted } => {
            assert_eq!(restarted, vec!["app_search", "app_backend", "app_frontend", "app_lb"]);
            epoch
        }
        other => panic!("expected forced recovery, got {:?}", other),
    };
    assert_eq!(epoch.generation, 2);
    assert_eq!(epoch.formed_by, "prod-manager-1");

    let forced_inits = substrate
        .calls()
        .iter()
        .filter(|c| matches!(c, SubstrateCall::Init { forced: true, .. }))
        .count();
    assert_eq!(forced_inits, 1);

    // Later cycles of both loops are quiet
    for _ in 0..3 {
        assert_eq!(quorum.cycle().await.unwrap(), QuorumOutcome::Healthy);
        assert!(reconciler.cycle().await.unwrap().is_noop());
    }
    assert_eq!(substrate.restarts().len(), 4);

    // Stale secrets were replaced
    assert_ne!(store.get(SharedKey::ManagerJoinToken).unwrap(), stale.manager);
    assert_ne!(store.get(SharedKey::WorkerJoinToken).unwrap(), stale.worker);
    let published: ClusterEpoch =
        serde_json::from_str(&store.get(SharedKey::ClusterEpoch).unwrap()).unwrap();
    assert!(published.forced);
}

#[tokio::test]
async fn secondary_survivor_takes_over_shared_storage() {
    let dir = tempfile::tempdir().unwrap();
    let substrate = Arc::new(FakeSubstrate::active_manager("prod-manager-1", survivor_view()));
    let dead_epoch = ClusterEpoch::initial("prod-manager-3");
    substrate.update(|s| {
        s.workloads = stack();
        s.config_objects.insert(
            SharedKey::ClusterEpoch.config_object_name(),
            serde_json::to_string(&dead_epoch).unwrap(),
        );
    });

    // Mounted from the old primary, which is gone with its export
    let dead_mount = Arc::new(MemoryStore::default());
    let exported = Arc::new(MemoryStore::default());
    let storage_config = StorageConfig {
        export_path: dir.path().join("export"),
        mount_point: dir.path().join("mnt"),
        mount_attempts: 1,
        mount_retry_secs: 0,
    };
    let storage = Arc::new(
        StorageCoordinator::new(
            Arc::new(NfsBackend::new(Arc::new(ScriptedRunner::default()))),
            dead_mount.clone(),
            Arc::new(SwarmConfigPeer::new(substrate.clone())),
            dir.path().join("cache"),
            storage_config.clone(),
        )
        .with_exported_share(exported.clone()),
    );
    assert_eq!(storage.mount("10.0.0.1").await, StorageState::Mounted);
    dead_mount.set_offline(true);

    let quorum = QuorumMonitor::new(
        substrate.clone(),
        Arc::new(FakeInventory::with_running(&["prod-manager-1"])),
        storage.clone(),
        QuorumConfig {
            stabilization_secs: 0,
            ..QuorumConfig::default()
        },
        "prod",
        "prod-manager-1",
        "10.0.0.2",
    )
    .with_storage_authority(storage.clone());

    let (epoch, restarted) = match quorum.cycle().await.unwrap() {
        QuorumOutcome::Recovered { epoch, restarted } => (epoch, restarted),
        other => panic!("expected forced recovery, got {:?}", other),
    };
    assert_eq!(epoch.generation, 2);
    assert_eq!(restarted.len(), 4);

    let handle = storage.handle();
    assert_eq!(handle.authority.as_deref(), Some("10.0.0.2"));
    assert_eq!(handle.mount_point, storage_config.export_path);
    assert_eq!(handle.state, StorageState::Mounted);

    // Rejoining nodes find the new secrets on this node's export
    let tokens = substrate.snapshot().tokens;
    assert_eq!(exported.get(SharedKey::WorkerJoinToken), Some(tokens.worker));
    assert_eq!(exported.get(SharedKey::ManagerJoinToken), Some(tokens.manager));
    assert_eq!(exported.get(SharedKey::PrimaryAddress).as_deref(), Some("10.0.0.2"));
    assert_eq!(dead_mount.write_count(), 0);

    assert_eq!(quorum.cycle().await.unwrap(), QuorumOutcome::Healthy);
    assert_eq!(substrate.restarts().len(), 4);
}

#[tokio::test]
async fn survivor_on_dead_share_still_restarts_critical_workloads() {
    let substrate = Arc::new(FakeSubstrate::active_manager("prod-manager-1", survivor_view()));
    substrate.update(|s| s.workloads = stack());
    let store = Arc::new(MemoryStore::default());
    store.set_offline(true);

    let quorum = QuorumMonitor::new(
        substrate.clone(),
        Arc::new(FakeInventory::with_running(&["prod-manager-1"])),
        store,
        QuorumConfig {
            stabilization_secs: 0,
            ..QuorumConfig::default()
        },
        "prod",
        "prod-manager-1",
        "10.0.0.2",
    );

    match quorum.cycle().await.unwrap() {
        QuorumOutcome::Recovered { restarted, .. } => assert_eq!(
            restarted,
            vec!["app_search", "app_backend", "app_frontend", "app_lb"]
        ),
        other => panic!("expected forced recovery, got {:?}", other),
    }
    assert_eq!(quorum.cycle().await.unwrap(), QuorumOutcome::Healthy);
    assert_eq!(substrate.restarts().len(), 4);
}

#[tokio::test]
async fn stale_secret_rejected_fresh_secret_accepted() {
    let survivor = Arc::new(FakeSubstrate::active_manager("prod-manager-1", survivor_view()));
    survivor.update(|s| s.leaderless = true);
    let stale = survivor.snapshot().tokens;
    let store = Arc::new(MemoryStore::default());
    store.write(SharedKey::WorkerJoinToken, &stale.worker).await.unwrap();

    let quorum = QuorumMonitor::new(
        survivor.clone(),
        Arc::new(FakeInventory::with_running(&["prod-manager-1"])),
        store.clone(),
        QuorumConfig {
            stabilization_secs: 0,
            ..QuorumConfig::default()
        },
        "prod",
        "prod-manager-1",
        "10.0.0.2",
    );
    assert!(matches!(
        quorum.cycle().await.unwrap(),
        QuorumOutcome::Recovered { .. }
    ));

    // A replacement worker joining the new epoch
    let newcomer = FakeSubstrate::new("prod-worker-9");
    newcomer.update(|s| s.rejected_token = Some(stale.worker.clone()));
    assert!(newcomer.join("10.0.0.2", &stale.worker).await.is_err());
    let fresh = store.get(SharedKey::WorkerJoinToken).unwrap();
    newcomer.join("10.0.0.2", &fresh).await.unwrap();
}

#[tokio::test]
async fn heap_pressure_yields_one_critical_per_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeSearchEngine::green(92.0));
    let monitor = SearchMonitor::new(
        engine.clone(),
        SearchConfig::default(),
        dir.path().join("search-health.jsonl"),
    );

    for _ in 0..3 {
        let (_, findings) = monitor.cycle().await;
        let critical = findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .count();
        assert_eq!(critical, 1);
    }

    engine.update(|s| {
        for j in &mut s.jvm {
            j.heap_used_percent = 80.0;
        }
    });
    let (_, findings) = monitor.cycle().await;
    assert!(findings.is_empty());
}
