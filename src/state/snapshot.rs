//! Cluster snapshot
//!
//! The immutable, point-in-time view every controller reads for the
//! duration of one analyze pass. Published once by the refresh loop and
//! never mutated afterwards.

use crate::model::{
    HorizontalPodAutoscaler, Node, NodeGroup, PersistentVolume, Pod, Service,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Per-node derived view
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// The node object
    pub node: Node,
    /// Allocatable CPU in millicores
    pub cpu_capacity_milli: i64,
    /// Allocatable memory in bytes
    pub memory_capacity_bytes: i64,
    /// Sum of effective pod CPU requests bound here
    pub cpu_requested_milli: i64,
    /// Sum of effective pod memory requests bound here
    pub memory_requested_bytes: i64,
    /// Point-in-time CPU usage in millicores
    pub cpu_usage_milli: f64,
    /// Point-in-time memory usage in bytes
    pub memory_usage_bytes: f64,
    /// Hourly price of this node (spot price when the node is spot)
    pub hourly_cost_usd: f64,
    /// On-demand hourly price regardless of lifecycle
    pub on_demand_hourly_usd: f64,
    /// Whether the node runs on interruptible capacity
    pub is_spot: bool,
    /// GPUs on the node
    pub gpus: i64,
    /// GPUs requested by pods bound here
    pub gpus_used: i64,
    /// Pods bound here, excluding DaemonSet-owned pods
    pub pod_count: usize,
}

impl NodeInfo {
    /// Node name.
    pub fn name(&self) -> &str {
        &self.node.meta.name
    }

    /// Requested CPU as a fraction of capacity.
    pub fn cpu_requested_fraction(&self) -> f64 {
        if self.cpu_capacity_milli == 0 {
            return 0.0;
        }
        self.cpu_requested_milli as f64 / self.cpu_capacity_milli as f64
    }

    /// Requested memory as a fraction of capacity.
    pub fn memory_requested_fraction(&self) -> f64 {
        if self.memory_capacity_bytes == 0 {
            return 0.0;
        }
        self.memory_requested_bytes as f64 / self.memory_capacity_bytes as f64
    }

    /// CPU usage percent of capacity.
    pub fn cpu_usage_pct(&self) -> f64 {
        if self.cpu_capacity_milli == 0 {
            return 0.0;
        }
        self.cpu_usage_milli / self.cpu_capacity_milli as f64 * 100.0
    }

    /// Memory usage percent of capacity.
    pub fn memory_usage_pct(&self) -> f64 {
        if self.memory_capacity_bytes == 0 {
            return 0.0;
        }
        self.memory_usage_bytes / self.memory_capacity_bytes as f64 * 100.0
    }
}

/// Per-pod derived view
#[derive(Debug, Clone)]
pub struct PodInfo {
    /// The pod object
    pub pod: Pod,
    /// Owner kind, resolved through the controller reference
    pub owner_kind: Option<String>,
    /// Owner name
    pub owner_name: Option<String>,
    /// Sibling replica count under the same owner
    pub replicas: i32,
    /// Effective CPU request in millicores
    pub cpu_request_milli: i64,
    /// Effective memory request in bytes
    pub memory_request_bytes: i64,
    /// Point-in-time CPU usage in millicores
    pub cpu_usage_milli: f64,
    /// Point-in-time memory usage in bytes
    pub memory_usage_bytes: f64,
}

impl PodInfo {
    /// Namespace of the pod.
    pub fn namespace(&self) -> &str {
        &self.pod.meta.namespace
    }

    /// `namespace/name` key.
    pub fn key(&self) -> String {
        self.pod.key()
    }
}

/// Immutable point-in-time cluster view
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
    /// Nodes, in listing order
    pub nodes: Vec<NodeInfo>,
    /// Node groups, in listing order
    pub node_groups: Vec<NodeGroup>,
    /// Pods, in listing order
    pub pods: Vec<PodInfo>,
    /// Horizontal pod autoscalers
    pub hpas: Vec<HorizontalPodAutoscaler>,
    /// Persistent volumes
    pub volumes: Vec<PersistentVolume>,
    /// Services
    pub services: Vec<Service>,
    /// Pods grouped by node name
    pub pods_by_node: HashMap<String, Vec<Pod>>,
    /// Sum of per-node hourly prices
    pub total_hourly_cost_usd: f64,
}

impl Default for NodeInfo {
    fn default() -> Self {
        Self {
            node: Node {
                meta: crate::model::ObjectMeta::default(),
                capacity: crate::model::NodeCapacity::default(),
                unschedulable: false,
                conditions: Vec::new(),
                taints: Vec::new(),
            },
            cpu_capacity_milli: 0,
            memory_capacity_bytes: 0,
            cpu_requested_milli: 0,
            memory_requested_bytes: 0,
            cpu_usage_milli: 0.0,
            memory_usage_bytes: 0.0,
            hourly_cost_usd: 0.0,
            on_demand_hourly_usd: 0.0,
            is_spot: false,
            gpus: 0,
            gpus_used: 0,
            pod_count: 0,
        }
    }
}

impl ClusterSnapshot {
    /// Node info by name.
    pub fn node(&self, name: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Pods bound to a node.
    pub fn pods_on(&self, node: &str) -> &[Pod] {
        self.pods_by_node
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Raw node objects, for simulator calls.
    pub fn raw_nodes(&self) -> Vec<Node> {
        self.nodes.iter().map(|n| n.node.clone()).collect()
    }

    /// Extrapolated daily cost of the fleet.
    pub fn daily_cost_usd(&self) -> f64 {
        self.total_hourly_cost_usd * 24.0
    }
}
