use anyhow::Result;

use lodestone_core::crd::NodeRole;

use super::backend::{WorkloadKey, WorkloadKind};
use super::ClusterReconciler;
use crate::fixtures::{bundle, node_set, test_cluster, TestHarness};

fn key(kind: WorkloadKind, name: &str) -> WorkloadKey {
    WorkloadKey {
        kind,
        name: name.into(),
        namespace: "default".into(),
    }
}

#[tokio::test]
async fn first_pass_creates_all_groups_paused() -> Result<()> {
    let cluster = test_cluster(
        "search",
        "default",
        vec![
            node_set(vec![NodeRole::Master], 3),
            node_set(vec![NodeRole::Data], 2),
            node_set(vec![NodeRole::Client], 1),
        ],
    );
    let harness = TestHarness::new("search");
    harness.membership.set_in_cluster("search-m-1", true);
    let reconciler = ClusterReconciler::new(cluster, harness.collaborators());

    let outcome = reconciler.reconcile().await;

    assert!(outcome.is_settled(), "expected a clean first pass, got failures {:?}", outcome.failures);
    assert_eq!(outcome.statuses.len(), 3, "expected one status per group, got {}", outcome.statuses.len());
    for (kind, name) in [
        (WorkloadKind::StatefulSet, "search-m-1"),
        (WorkloadKind::Deployment, "search-d-2"),
        (WorkloadKind::StatefulSet, "search-c-3"),
    ] {
        let stored = harness
            .backend
            .stored(&key(kind, name))
            .unwrap_or_else(|| panic!("workload {} missing after first pass", name));
        assert!(stored.paused(), "expected workload {} to be paused after first pass", name);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn blocked_master_chain_halts_without_blocking_independent_groups() -> Result<()> {
    let cluster = test_cluster(
        "search",
        "default",
        vec![
            node_set(vec![NodeRole::Master], 3),
            node_set(vec![NodeRole::Master], 3),
            node_set(vec![NodeRole::Client], 1),
        ],
    );
    let harness = TestHarness::new("search");
    // No membership entries: the first master group's rejoin wait times out.
    let reconciler = ClusterReconciler::new(cluster, harness.collaborators());

    let outcome = reconciler.reconcile().await;

    assert!(!outcome.is_settled(), "expected the pass to record the rejoin failure");
    assert!(
        outcome.failures.iter().any(|failure| failure.group == "search-m-1"),
        "expected the first master group to be the recorded failure, got {:?}",
        outcome.failures
    );
    assert!(
        harness.backend.stored(&key(WorkloadKind::StatefulSet, "search-m-1")).is_some(),
        "expected the first master group to have been created"
    );
    assert!(
        harness.backend.stored(&key(WorkloadKind::StatefulSet, "search-m-2")).is_none(),
        "expected the second master group to be held back while the chain is blocked"
    );
    assert!(
        harness.backend.stored(&key(WorkloadKind::StatefulSet, "search-c-3")).is_some(),
        "expected the independent client group to be visited despite the blocked chain"
    );
    assert_eq!(outcome.statuses.len(), 3, "expected skipped groups to still surface a status, got {}", outcome.statuses.len());
    Ok(())
}

#[tokio::test]
async fn second_pass_performs_no_additional_updates() -> Result<()> {
    let cluster = test_cluster("search", "default", vec![node_set(vec![NodeRole::Master], 3), node_set(vec![NodeRole::Data], 2)]);
    let harness = TestHarness::new("search");
    harness.membership.set_in_cluster("search-m-1", true);
    let reconciler = ClusterReconciler::new(cluster, harness.collaborators());

    let first = reconciler.reconcile().await;
    assert!(first.is_settled(), "expected a clean first pass, got failures {:?}", first.failures);
    let writes_after_first = harness.backend.writes();

    let second = reconciler.reconcile().await;

    assert!(second.is_settled(), "expected a clean second pass, got failures {:?}", second.failures);
    assert_eq!(
        harness.backend.writes(),
        writes_after_first,
        "expected an unchanged topology to produce zero additional updates, got {} additional",
        harness.backend.writes() - writes_after_first
    );
    Ok(())
}

#[tokio::test]
async fn undeclared_groups_are_scaled_down_and_deleted() -> Result<()> {
    let declared = test_cluster("search", "default", vec![node_set(vec![NodeRole::Master], 3), node_set(vec![NodeRole::Data], 2)]);
    let harness = TestHarness::new("search");
    harness.membership.set_in_cluster("search-m-1", true);

    let first = ClusterReconciler::new(declared.clone(), harness.collaborators()).reconcile().await;
    assert!(first.is_settled(), "expected a clean seeding pass, got failures {:?}", first.failures);

    // The data set is dropped from the declared topology; its nodes are
    // already absent from the live cluster.
    let shrunk = test_cluster("search", "default", vec![node_set(vec![NodeRole::Master], 3)]);
    let outcome = ClusterReconciler::new(shrunk, harness.collaborators()).reconcile().await;

    assert!(outcome.is_settled(), "expected a clean removal pass, got failures {:?}", outcome.failures);
    assert!(
        harness.backend.stored(&key(WorkloadKind::Deployment, "search-d-2")).is_none(),
        "expected the undeclared data group to be deleted"
    );
    assert!(harness.backend.deletes() >= 1, "expected at least one delete, got {}", harness.backend.deletes());
    assert!(
        harness.backend.stored(&key(WorkloadKind::StatefulSet, "search-m-1")).is_some(),
        "expected the declared master group to survive"
    );
    Ok(())
}

#[tokio::test]
async fn declared_replica_changes_propagate() -> Result<()> {
    let cluster = test_cluster("search", "default", vec![node_set(vec![NodeRole::Master], 3)]);
    let harness = TestHarness::new("search");
    harness.membership.set_in_cluster("search-m-1", true);

    let first = ClusterReconciler::new(cluster, harness.collaborators()).reconcile().await;
    assert!(first.is_settled(), "expected a clean seeding pass, got failures {:?}", first.failures);

    let grown = test_cluster("search", "default", vec![node_set(vec![NodeRole::Master], 5)]);
    let outcome = ClusterReconciler::new(grown, harness.collaborators()).reconcile().await;

    assert!(outcome.is_settled(), "expected a clean scaling pass, got failures {:?}", outcome.failures);
    let stored = harness
        .backend
        .stored(&key(WorkloadKind::StatefulSet, "search-m-1"))
        .expect("workload missing after scaling pass");
    assert_eq!(stored.replicas(), 5, "expected the declared replica change to propagate, got {}", stored.replicas());
    Ok(())
}

#[tokio::test]
async fn credential_drift_is_surfaced_per_group() -> Result<()> {
    let cluster = test_cluster("search", "default", vec![node_set(vec![NodeRole::Master], 3), node_set(vec![NodeRole::Client], 1)]);
    let harness = TestHarness::new("search");
    harness.membership.set_in_cluster("search-m-1", true);
    let reconciler = ClusterReconciler::new(cluster, harness.collaborators());

    let first = reconciler.reconcile().await;
    assert!(first.is_settled(), "expected a clean first pass, got failures {:?}", first.failures);

    harness
        .credential_bundles
        .set("search", bundle(&[("tls.crt", "cert-v2"), ("tls.key", "key-v2")]));
    let outcome = reconciler.reconcile().await;

    assert!(outcome.is_settled(), "expected a clean pass, got failures {:?}", outcome.failures);
    assert_eq!(outcome.statuses.len(), 2, "expected one status per group, got {}", outcome.statuses.len());
    for status in &outcome.statuses {
        assert!(
            status.upgrade_status.scheduled_for_cert_redeploy,
            "expected group {} to be scheduled for credential redeploy",
            status.workload_name
        );
        assert!(
            !status.upgrade_status.scheduled_for_upgrade,
            "expected no template upgrade flag for group {}",
            status.workload_name
        );
    }
    Ok(())
}
