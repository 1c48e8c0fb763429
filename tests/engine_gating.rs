//! Mode, gate, and lock invariants across the execution path
//!
//! These are the guarantees spelled out for every controller: no mutation
//! outside active mode, fail-closed behavior when a required gate is
//! missing, and node-lock exclusion for node-scoped work.

mod common;

use common::{active_config, harness, harness_with_gate, monitor_config};
use koptimizer::cloud::CloudFixture;
use koptimizer::controllers::Evictor;
use koptimizer::engine::{run_cycle, Clearance};
use koptimizer::model::{
    EstimatedImpact, Priority, Recommendation, RecommendationKind, RiskLevel, Target,
};
use koptimizer::orchestrator::{ClusterFixture, Orchestrator};
use koptimizer::testutil::{ready_node, running_pod};
use std::sync::Arc;

/// Three nodes; one nearly empty, one with room, one packed enough that the
/// empty node's pods fit on the roomy one.
fn consolidatable_cluster() -> ClusterFixture {
    ClusterFixture {
        nodes: vec![
            ready_node("roomy", 8000, 32 << 30),
            ready_node("fragmented", 4000, 16 << 30),
        ],
        pods: vec![
            // roomy sits below the fragmentation threshold but keeps 2000m free
            running_pod("default", "busy-1", "roomy", 6000, 16 << 30),
            running_pod("default", "strag-1", "fragmented", 200, 1 << 30),
        ],
        ..Default::default()
    }
}

#[tokio::test]
async fn monitor_mode_surfaces_but_never_mutates() {
    let h = harness(monitor_config(), consolidatable_cluster(), CloudFixture::default());
    h.ctx.state.refresh().await.unwrap();

    let evictor = Evictor::new(Arc::clone(&h.ctx));
    let executed = run_cycle(&h.ctx, &evictor).await.unwrap();
    assert_eq!(executed, 0, "nothing may execute in monitor mode");

    // the recommendation is surfaced
    assert!(!h.ctx.registry.is_empty());
    // and the cluster is untouched
    let state = h.orchestrator.fixture();
    assert_eq!(state.pods.len(), 2);
    assert!(state.nodes.iter().all(|n| !n.unschedulable));
    // the audit trail shows the dry-run decision
    let tail = h.ctx.state.audit().tail(10);
    assert!(tail.iter().any(|e| e.action.starts_with("dry-run-")));
    h.shutdown.cancel();
}

#[tokio::test]
async fn active_mode_consolidation_drains_the_node() {
    let h = harness(active_config(), consolidatable_cluster(), CloudFixture::default());
    h.ctx.state.refresh().await.unwrap();

    let evictor = Evictor::new(Arc::clone(&h.ctx));
    let executed = run_cycle(&h.ctx, &evictor).await.unwrap();
    assert_eq!(executed, 1);

    let state = h.orchestrator.fixture();
    assert!(
        !state.pods.iter().any(|p| p.meta.name == "strag-1"),
        "the straggler was evicted"
    );
    h.shutdown.cancel();
}

#[tokio::test]
async fn required_gate_missing_fails_closed() {
    // configuration says the gate is enabled, but none is wired in
    let h = harness_with_gate(
        active_config(),
        consolidatable_cluster(),
        CloudFixture::default(),
        false,
    );
    h.ctx.state.refresh().await.unwrap();

    let rec = Recommendation::new(
        RecommendationKind::Eviction,
        Priority::Medium,
        Target::cluster("Node", "fragmented"),
    )
    .auto_executable(true)
    .with_ai_gate(true);
    match h.ctx.clearance("evictor", &rec).await {
        Clearance::Skip(reason) => assert!(reason.contains("not configured")),
        Clearance::Proceed { .. } => panic!("must fail closed without a gate"),
    }
    // no mutation happened
    assert_eq!(h.orchestrator.fixture().pods.len(), 2);
    h.shutdown.cancel();
}

#[tokio::test]
async fn non_auto_executable_recs_are_left_pending() {
    let h = harness(active_config(), consolidatable_cluster(), CloudFixture::default());
    let rec = Recommendation::new(
        RecommendationKind::Storage,
        Priority::Medium,
        Target::cluster("PersistentVolume", "orphan"),
    );
    match h.ctx.clearance("storage-policy", &rec).await {
        Clearance::Skip(reason) => assert!(reason.contains("auto-executable")),
        Clearance::Proceed { .. } => panic!("non-auto rec must not clear"),
    }
    h.shutdown.cancel();
}

#[tokio::test]
async fn node_lock_contention_skips_execution() {
    let h = harness(active_config(), consolidatable_cluster(), CloudFixture::default());
    h.ctx.state.refresh().await.unwrap();
    assert!(h.ctx.state.locks().try_lock("fragmented", "rebalancer"));

    let rec = Recommendation::new(
        RecommendationKind::Eviction,
        Priority::Medium,
        Target::cluster("Node", "fragmented"),
    )
    .auto_executable(true);
    match h.ctx.clearance("evictor", &rec).await {
        Clearance::Skip(reason) => assert!(reason.contains("locked")),
        Clearance::Proceed { .. } => panic!("lock must exclude a second holder"),
    }
    // the original holder still owns the lock
    assert_eq!(
        h.ctx.state.locks().holder_of("fragmented").as_deref(),
        Some("rebalancer")
    );
    h.shutdown.cancel();
}

#[tokio::test]
async fn clearance_releases_the_lock_on_drop() {
    let h = harness(active_config(), consolidatable_cluster(), CloudFixture::default());
    h.ctx.state.refresh().await.unwrap();
    let rec = Recommendation::new(
        RecommendationKind::Eviction,
        Priority::Medium,
        Target::cluster("Node", "fragmented"),
    )
    .auto_executable(true)
    .with_impact(EstimatedImpact {
        nodes_affected: 1,
        pods_affected: 1,
        monthly_cost_change_usd: -10.0,
        risk: RiskLevel::Medium,
    });
    {
        let clearance = h.ctx.clearance("evictor", &rec).await;
        match clearance {
            Clearance::Proceed { lock } => {
                assert!(lock.is_some());
                assert_eq!(
                    h.ctx.state.locks().holder_of("fragmented").as_deref(),
                    Some("evictor")
                );
            }
            Clearance::Skip(reason) => panic!("expected clearance, got skip: {reason}"),
        }
    }
    assert_eq!(h.ctx.state.locks().holder_of("fragmented"), None);
    h.shutdown.cancel();
}

#[tokio::test]
async fn snapshot_is_stable_across_a_cycle() {
    let h = harness(monitor_config(), consolidatable_cluster(), CloudFixture::default());
    h.ctx.state.refresh().await.unwrap();
    let snapshot = h.ctx.state.snapshot();
    let nodes_before = snapshot.nodes.len();
    let pods_before = snapshot.pods.len();

    // mutate the underlying cluster and refresh: the held snapshot must
    // still read as it did at capture time
    h.orchestrator
        .evict_pod("default", "strag-1", 0)
        .await
        .unwrap();
    h.ctx.state.refresh().await.unwrap();

    assert_eq!(snapshot.nodes.len(), nodes_before);
    assert_eq!(snapshot.pods.len(), pods_before);
    // while the freshly published snapshot observes the change
    assert_eq!(h.ctx.state.snapshot().pods.len(), pods_before - 1);
    h.shutdown.cancel();
}
