//! End-to-end execution paths against the in-memory cluster
//!
//! Active-mode cycles for the node autoscaler, the rebalancer, and the
//! spot interruption handler, exercising drain-before-scale-down, the
//! all-evictions-failed abort, and emergency evacuation.

mod common;

use common::{active_config, harness};
use koptimizer::cloud::CloudFixture;
use koptimizer::controllers::{NodeAutoscaler, Rebalancer, SpotOptimizer};
use koptimizer::engine::run_cycle;
use koptimizer::model::{Lifecycle, NodeGroup, ANNOTATION_SPOT_INTERRUPTION, LABEL_NODE_GROUP};
use koptimizer::orchestrator::{ClusterFixture, NodeUsage};
use koptimizer::testutil::{ready_node, running_pod};
use std::sync::Arc;

fn group(id: &str, min: i32, desired: i32, max: i32) -> NodeGroup {
    NodeGroup {
        id: id.into(),
        name: id.into(),
        instance_type: "m5.xlarge".into(),
        instance_family: "m5".into(),
        architecture: "amd64".into(),
        min_count: min,
        desired_count: desired,
        max_count: max,
        lifecycle: Lifecycle::OnDemand,
        instance_types: vec!["m5.xlarge".into()],
    }
}

fn grouped_node(name: &str, group: &str) -> koptimizer::model::Node {
    let mut node = ready_node(name, 4000, 16 << 30);
    node.meta
        .labels
        .insert(LABEL_NODE_GROUP.to_string(), group.to_string());
    node
}

fn scale_down_fixture() -> (ClusterFixture, CloudFixture) {
    let fixture = ClusterFixture {
        nodes: vec![grouped_node("idle", "ng-1"), grouped_node("busy", "ng-1")],
        pods: vec![
            running_pod("default", "sleepy", "idle", 100, 1 << 30),
            running_pod("default", "worker", "busy", 3000, 12 << 30),
        ],
        node_usage: vec![
            NodeUsage {
                node: "idle".into(),
                cpu_milli: 150.0,
                memory_bytes: (1_i64 << 30) as f64,
            },
            NodeUsage {
                node: "busy".into(),
                cpu_milli: 3500.0,
                memory_bytes: (13_i64 << 30) as f64,
            },
        ],
        ..Default::default()
    };
    let cloud = CloudFixture {
        node_groups: vec![group("ng-1", 1, 2, 10)],
        catalog: Vec::new(),
    };
    (fixture, cloud)
}

#[tokio::test]
async fn scale_down_drains_then_shrinks_the_group() {
    let (fixture, cloud) = scale_down_fixture();
    let h = harness(active_config(), fixture, cloud);
    h.ctx.state.refresh().await.unwrap();

    let scaler = NodeAutoscaler::new(Arc::clone(&h.ctx));
    let executed = run_cycle(&h.ctx, &scaler).await.unwrap();
    assert_eq!(executed, 1);

    // the idle node's pod was evicted before the group shrank
    let state = h.orchestrator.fixture();
    assert!(!state.pods.iter().any(|p| p.meta.name == "sleepy"));
    assert_eq!(h.cloud.scaling_calls(), vec![("ng-1".to_string(), 1)]);
}

#[tokio::test]
async fn scale_down_aborts_when_nothing_drains() {
    let (fixture, cloud) = scale_down_fixture();
    let h = harness(active_config(), fixture, cloud);
    h.orchestrator.fail_evictions_of("default", "sleepy");
    h.ctx.state.refresh().await.unwrap();

    let scaler = NodeAutoscaler::new(Arc::clone(&h.ctx));
    let result = run_cycle(&h.ctx, &scaler).await;
    assert!(result.is_err(), "zero successful drains must abort");
    // desired count was never touched
    assert!(h.cloud.scaling_calls().is_empty());
    let groups = h.cloud.fixture().node_groups;
    assert_eq!(groups[0].desired_count, 2);
    // audit records the abort
    let tail = h.ctx.state.audit().tail(20);
    assert!(tail.iter().any(|e| e.action == "scale-down-aborted"));
}

#[tokio::test]
async fn rebalancer_moves_pods_and_uncordons() {
    let mut hot_usage_fixture = ClusterFixture {
        nodes: vec![
            ready_node("hot", 4000, 16 << 30),
            ready_node("cool", 4000, 16 << 30),
        ],
        pods: vec![
            running_pod("default", "p1", "hot", 300, 1 << 30),
            running_pod("default", "p2", "hot", 300, 1 << 30),
        ],
        node_usage: vec![
            NodeUsage {
                node: "hot".into(),
                cpu_milli: 3600.0,
                memory_bytes: (8_i64 << 30) as f64,
            },
            NodeUsage {
                node: "cool".into(),
                cpu_milli: 400.0,
                memory_bytes: (2_i64 << 30) as f64,
            },
        ],
        ..Default::default()
    };
    // owners so the readiness wait has something to poll
    for pod in &mut hot_usage_fixture.pods {
        pod.meta.owner_references = vec![koptimizer::model::OwnerReference {
            kind: "ReplicaSet".into(),
            name: "web-6d4cf56db6".into(),
            controller: true,
        }];
    }
    let h = harness(active_config(), hot_usage_fixture, CloudFixture::default());
    h.ctx.state.refresh().await.unwrap();

    let rebalancer = Rebalancer::new(Arc::clone(&h.ctx));
    let executed = run_cycle(&h.ctx, &rebalancer).await.unwrap();
    assert_eq!(executed, 1);

    let state = h.orchestrator.fixture();
    // the planned pods were evicted and the node is schedulable again
    assert!(state.pods.is_empty());
    let hot = state.nodes.iter().find(|n| n.meta.name == "hot").unwrap();
    assert!(!hot.unschedulable);
}

#[tokio::test]
async fn interruption_annotation_triggers_emergency_drain() {
    let mut doomed = ready_node("doomed", 4000, 16 << 30);
    doomed
        .meta
        .annotations
        .insert(ANNOTATION_SPOT_INTERRUPTION.to_string(), "true".to_string());
    let fixture = ClusterFixture {
        nodes: vec![doomed, ready_node("other", 4000, 16 << 30)],
        pods: vec![running_pod("default", "victim", "doomed", 100, 1 << 30)],
        ..Default::default()
    };
    let h = harness(active_config(), fixture, CloudFixture::default());
    h.ctx.state.refresh().await.unwrap();

    let optimizer = SpotOptimizer::new(Arc::clone(&h.ctx));
    let executed = run_cycle(&h.ctx, &optimizer).await.unwrap();
    assert!(executed >= 1);

    let state = h.orchestrator.fixture();
    assert!(state.pods.is_empty(), "the doomed node was evacuated");
    let tail = h.ctx.state.audit().tail(20);
    assert!(tail.iter().any(|e| e.action == "emergency-drain"));
}
