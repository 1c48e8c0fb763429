//! Bin-packer and fragmentation scorer
//!
//! The scorer ranks nodes by how empty they are on the request axes; the
//! first-fit-decreasing packer estimates the minimum node count the current
//! workload needs. Both are coarse planners: the exact movable-set decision
//! always goes through the scheduling simulator.

use crate::state::{ClusterSnapshot, NodeInfo};
use std::collections::HashMap;

/// Fraction of node capacity kept back for the system reserve.
pub const SYSTEM_RESERVE_FRACTION: f64 = 0.10;

/// Fragmentation score of a node: the average idle fraction of CPU and
/// memory requests. 1.0 is an empty node, 0.0 a fully requested one.
pub fn fragmentation_score(node: &NodeInfo) -> f64 {
    let cpu_idle = 1.0 - node.cpu_requested_fraction();
    let mem_idle = 1.0 - node.memory_requested_fraction();
    (cpu_idle + mem_idle) / 2.0
}

/// Nodes whose fragmentation score exceeds `threshold`, most fragmented
/// first. DaemonSet pods are already excluded from `pod_count`.
pub fn consolidation_candidates(
    snapshot: &ClusterSnapshot,
    threshold: f64,
) -> Vec<(NodeInfo, f64)> {
    let mut candidates: Vec<(NodeInfo, f64)> = snapshot
        .nodes
        .iter()
        .map(|n| (n.clone(), fragmentation_score(n)))
        .filter(|(_, score)| *score > threshold)
        .collect();
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    candidates
}

/// Result of a bin-packing pass
#[derive(Debug, Clone)]
pub struct BinPackResult {
    /// Estimated minimum nodes the workload needs
    pub min_nodes_needed: usize,
    /// Nodes currently in the cluster
    pub current_nodes: usize,
    /// Whether the estimate is below the current count
    pub can_consolidate: bool,
    /// Nodes the estimate would free
    pub nodes_saved: usize,
    /// Pod key to bin index
    pub assignments: HashMap<String, usize>,
}

#[derive(Debug)]
struct Bin {
    cpu_free: i64,
    mem_free: i64,
}

/// First-fit-decreasing pack of all non-DaemonSet pods into bins sized at
/// `1 - SYSTEM_RESERVE_FRACTION` of each node's capacity.
pub fn pack(snapshot: &ClusterSnapshot) -> BinPackResult {
    let mut bins: Vec<Bin> = snapshot
        .nodes
        .iter()
        .map(|n| Bin {
            cpu_free: (n.cpu_capacity_milli as f64 * (1.0 - SYSTEM_RESERVE_FRACTION)) as i64,
            mem_free: (n.memory_capacity_bytes as f64 * (1.0 - SYSTEM_RESERVE_FRACTION)) as i64,
        })
        .collect();

    let mut pods: Vec<(String, i64, i64)> = snapshot
        .pods
        .iter()
        .filter(|p| !p.pod.is_daemonset() && !p.pod.is_completed())
        .map(|p| (p.key(), p.cpu_request_milli, p.memory_request_bytes))
        .collect();
    pods.sort_by(|a, b| b.1.cmp(&a.1));

    let mut assignments = HashMap::new();
    let mut used = vec![false; bins.len()];
    for (key, cpu, mem) in pods {
        let slot = bins
            .iter()
            .position(|bin| bin.cpu_free >= cpu && bin.mem_free >= mem);
        if let Some(idx) = slot {
            bins[idx].cpu_free -= cpu;
            bins[idx].mem_free -= mem;
            used[idx] = true;
            assignments.insert(key, idx);
        } else {
            // Unpackable pod: it keeps its own node in any plan.
            let idx = bins.len();
            bins.push(Bin {
                cpu_free: 0,
                mem_free: 0,
            });
            used.push(true);
            assignments.insert(key, idx);
        }
    }

    let min_nodes_needed = used.iter().filter(|u| **u).count();
    let current_nodes = snapshot.nodes.len();
    let nodes_saved = current_nodes.saturating_sub(min_nodes_needed);
    BinPackResult {
        min_nodes_needed,
        current_nodes,
        can_consolidate: nodes_saved > 0,
        nodes_saved,
        assignments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{node_info, pod_info, snapshot_of};

    #[test]
    fn three_small_pods_fit_one_node() {
        let snapshot = snapshot_of(
            vec![
                node_info("n1", 4000, 16 << 30),
                node_info("n2", 4000, 16 << 30),
                node_info("n3", 4000, 16 << 30),
            ],
            vec![
                pod_info("default", "a", "n1", 500, 1 << 30),
                pod_info("default", "b", "n2", 500, 1 << 30),
                pod_info("default", "c", "n3", 500, 1 << 30),
            ],
        );
        let result = pack(&snapshot);
        assert_eq!(result.min_nodes_needed, 1);
        assert!(result.can_consolidate);
        assert_eq!(result.nodes_saved, 2);
    }

    #[test]
    fn memory_bound_pack_needs_more_bins() {
        let snapshot = snapshot_of(
            vec![
                node_info("n1", 8000, 8 << 30),
                node_info("n2", 8000, 8 << 30),
                node_info("n3", 8000, 8 << 30),
            ],
            vec![
                pod_info("default", "a", "n1", 500, 4 << 30),
                pod_info("default", "b", "n2", 500, 4 << 30),
                pod_info("default", "c", "n3", 500, 4 << 30),
            ],
        );
        // 10% reserve leaves 7.2 GiB per bin: one 4 GiB pod each
        let result = pack(&snapshot);
        assert!(result.min_nodes_needed >= 2);
    }

    #[test]
    fn daemonset_pods_do_not_pack() {
        let mut snapshot = snapshot_of(
            vec![node_info("n1", 4000, 16 << 30)],
            vec![pod_info("default", "a", "n1", 500, 1 << 30)],
        );
        snapshot.pods[0].pod.meta.owner_references = vec![crate::model::OwnerReference {
            kind: "DaemonSet".into(),
            name: "logging".into(),
            controller: true,
        }];
        let result = pack(&snapshot);
        assert!(result.assignments.is_empty());
    }

    #[test]
    fn fragmentation_ranks_empty_nodes_first() {
        let mut busy = node_info("busy", 4000, 16 << 30);
        busy.cpu_requested_milli = 3600;
        busy.memory_requested_bytes = 14 << 30;
        let mut idle = node_info("idle", 4000, 16 << 30);
        idle.cpu_requested_milli = 200;
        idle.memory_requested_bytes = 1 << 30;

        assert!(fragmentation_score(&idle) > 0.6);
        assert!(fragmentation_score(&busy) < 0.2);

        let snapshot = snapshot_of(vec![busy, idle], vec![]);
        let candidates = consolidation_candidates(&snapshot, 0.6);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0.name(), "idle");
    }
}
