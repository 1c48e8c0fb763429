//! Fixture builders shared by unit and integration tests
//!
//! Deliberately small: a ready node, a running pod with one container, and a
//! snapshot assembled from both with the derived fields recomputed the same
//! way the refresh loop computes them.

use crate::model::{
    Container, Lifecycle, Node, NodeCapacity, NodeCondition, NodeGroup, ObjectMeta, OwnerReference,
    Pod, PodSpec, PodStatus, ResourceRequests,
};
use crate::state::{ClusterSnapshot, NodeInfo, PodInfo};
use chrono::Utc;
use std::collections::HashMap;

/// A ready, schedulable node wrapped in a [`NodeInfo`] with zeroed usage.
pub fn node_info(name: &str, cpu_milli: i64, memory_bytes: i64) -> NodeInfo {
    NodeInfo {
        node: ready_node(name, cpu_milli, memory_bytes),
        cpu_capacity_milli: cpu_milli,
        memory_capacity_bytes: memory_bytes,
        cpu_requested_milli: 0,
        memory_requested_bytes: 0,
        cpu_usage_milli: 0.0,
        memory_usage_bytes: 0.0,
        hourly_cost_usd: 0.10,
        on_demand_hourly_usd: 0.10,
        is_spot: false,
        gpus: 0,
        gpus_used: 0,
        pod_count: 0,
    }
}

/// A ready, schedulable raw node.
pub fn ready_node(name: &str, cpu_milli: i64, memory_bytes: i64) -> Node {
    Node {
        meta: ObjectMeta::named(name),
        capacity: NodeCapacity {
            cpu_milli,
            memory_bytes,
            gpus: 0,
        },
        unschedulable: false,
        conditions: vec![NodeCondition {
            condition_type: "Ready".into(),
            status: "True".into(),
        }],
        taints: Vec::new(),
    }
}

/// A running single-container pod bound to `node`.
pub fn running_pod(
    namespace: &str,
    name: &str,
    node: &str,
    cpu_milli: i64,
    memory_bytes: i64,
) -> Pod {
    Pod {
        meta: ObjectMeta {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        },
        spec: PodSpec {
            node_name: Some(node.to_string()),
            containers: vec![Container {
                name: "app".into(),
                requests: ResourceRequests {
                    cpu_milli,
                    memory_bytes,
                    gpu: None,
                },
                resize_policy: None,
            }],
            ..Default::default()
        },
        status: PodStatus::default(),
    }
}

/// A [`PodInfo`] over [`running_pod`] with the request fields derived.
pub fn pod_info(
    namespace: &str,
    name: &str,
    node: &str,
    cpu_milli: i64,
    memory_bytes: i64,
) -> PodInfo {
    PodInfo {
        pod: running_pod(namespace, name, node, cpu_milli, memory_bytes),
        owner_kind: None,
        owner_name: None,
        replicas: 1,
        cpu_request_milli: cpu_milli,
        memory_request_bytes: memory_bytes,
        cpu_usage_milli: 0.0,
        memory_usage_bytes: 0.0,
    }
}

/// Attach a Deployment-style owner (through a ReplicaSet name) to a pod info.
pub fn owned_by(mut info: PodInfo, kind: &str, name: &str) -> PodInfo {
    info.pod.meta.owner_references = vec![OwnerReference {
        kind: kind.into(),
        name: name.into(),
        controller: true,
    }];
    info.owner_kind = Some(kind.into());
    info.owner_name = Some(name.into());
    info
}

/// A node group fixture.
pub fn node_group(id: &str, instance_type: &str, min: i32, desired: i32, max: i32) -> NodeGroup {
    let family = instance_type
        .split(['.', '-'])
        .next()
        .unwrap_or(instance_type)
        .to_string();
    NodeGroup {
        id: id.into(),
        name: id.into(),
        instance_type: instance_type.into(),
        instance_family: family,
        architecture: "amd64".into(),
        min_count: min,
        desired_count: desired,
        max_count: max,
        lifecycle: Lifecycle::OnDemand,
        instance_types: vec![instance_type.into()],
    }
}

/// Assemble a snapshot from node and pod infos.
///
/// Pod requests are added onto each node's requested totals and the
/// `pods_by_node` index is rebuilt, mirroring the refresh loop.
pub fn snapshot_of(mut nodes: Vec<NodeInfo>, pods: Vec<PodInfo>) -> ClusterSnapshot {
    let mut pods_by_node: HashMap<String, Vec<Pod>> = HashMap::new();
    for info in &pods {
        if let Some(node) = &info.pod.spec.node_name {
            pods_by_node
                .entry(node.clone())
                .or_default()
                .push(info.pod.clone());
        }
    }
    for node in &mut nodes {
        if let Some(bound) = pods_by_node.get(node.name()) {
            for pod in bound {
                let requests = pod.effective_requests();
                node.cpu_requested_milli += requests.cpu_milli;
                node.memory_requested_bytes += requests.memory_bytes;
                node.gpus_used += requests.gpu.unwrap_or(0);
                if !pod.is_daemonset() {
                    node.pod_count += 1;
                }
            }
        }
    }
    let total_hourly = nodes.iter().map(|n| n.hourly_cost_usd).sum();
    ClusterSnapshot {
        taken_at: Utc::now(),
        nodes,
        node_groups: Vec::new(),
        pods,
        hpas: Vec::new(),
        volumes: Vec::new(),
        services: Vec::new(),
        pods_by_node,
        total_hourly_cost_usd: total_hourly,
    }
}
