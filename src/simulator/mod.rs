//! Scheduling simulator
//!
//! Answers one question: can this pod land on that node? The checks run in
//! the same order the real scheduler applies them (readiness, cordon,
//! taints, resources, node selector, node affinity, pod affinity and
//! anti-affinity, topology spread) and the first failure wins, so callers
//! get a stable reason string.
//!
//! Callers doing speculative placement (consolidator, rebalancer) must add
//! each placed pod to `pods_by_node[target]` before checking the next pod,
//! so cumulative capacity is respected.

use crate::model::{
    Node, NodeSelectorOperator, Pod, PodAffinityTerm, TopologySpreadConstraint,
    UnsatisfiableAction,
};
use std::collections::HashMap;

/// Shared view for affinity and topology checks
pub struct SimulationContext<'a> {
    /// All nodes in the cluster
    pub all_nodes: &'a [Node],
    /// Pods grouped by node name
    pub pods_by_node: &'a HashMap<String, Vec<Pod>>,
}

/// Outcome of a placement check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementVerdict {
    /// The pod fits
    Feasible,
    /// The pod does not fit, with the first failing check
    Infeasible(String),
}

impl PlacementVerdict {
    /// Whether the pod fits.
    pub fn is_feasible(&self) -> bool {
        matches!(self, PlacementVerdict::Feasible)
    }

    /// Rejection reason, when infeasible.
    pub fn reason(&self) -> Option<&str> {
        match self {
            PlacementVerdict::Feasible => None,
            PlacementVerdict::Infeasible(reason) => Some(reason),
        }
    }
}

/// Check whether `pod` can be placed on `node` given the pods already there.
///
/// `ctx` widens affinity and topology checks to the whole cluster; without
/// it they consider only the candidate node.
pub fn can_schedule(
    pod: &Pod,
    node: &Node,
    pods_on_node: &[Pod],
    ctx: Option<&SimulationContext<'_>>,
) -> PlacementVerdict {
    if !node.is_ready() {
        return PlacementVerdict::Infeasible(format!("node {} not ready", node.meta.name));
    }
    if node.unschedulable {
        return PlacementVerdict::Infeasible(format!("node {} is cordoned", node.meta.name));
    }
    if !pod.tolerates_taints(&node.taints) {
        return PlacementVerdict::Infeasible(format!(
            "node {} has untolerated taints",
            node.meta.name
        ));
    }
    if let Some(reason) = check_resources(pod, node, pods_on_node) {
        return PlacementVerdict::Infeasible(reason);
    }
    for (key, value) in &pod.spec.node_selector {
        if node.meta.labels.get(key) != Some(value) {
            return PlacementVerdict::Infeasible(format!("node selector {key}={value} unmatched"));
        }
    }
    if let Some(affinity) = &pod.spec.affinity {
        if let Some(node_affinity) = &affinity.node_affinity {
            if !node_affinity.required_terms.is_empty()
                && !node_affinity
                    .required_terms
                    .iter()
                    .any(|term| node_selector_term_matches(term, node))
            {
                return PlacementVerdict::Infeasible("required node affinity unmatched".into());
            }
        }
        if let Some(pod_affinity) = &affinity.pod_affinity {
            for term in &pod_affinity.required_terms {
                if !affinity_term_satisfied(pod, node, pods_on_node, ctx, term) {
                    return PlacementVerdict::Infeasible(format!(
                        "pod affinity on {} unmatched",
                        term.topology_key
                    ));
                }
            }
        }
        if let Some(anti) = &affinity.pod_anti_affinity {
            for term in &anti.required_terms {
                if affinity_term_satisfied(pod, node, pods_on_node, ctx, term) {
                    return PlacementVerdict::Infeasible(format!(
                        "pod anti-affinity on {} violated",
                        term.topology_key
                    ));
                }
            }
        }
    }
    for constraint in &pod.spec.topology_spread_constraints {
        if constraint.when_unsatisfiable != UnsatisfiableAction::DoNotSchedule {
            continue;
        }
        if let Some(reason) = check_topology_spread(pod, node, pods_on_node, ctx, constraint) {
            return PlacementVerdict::Infeasible(reason);
        }
    }
    PlacementVerdict::Feasible
}

/// Candidate nodes on which the pod fits, in input order.
pub fn find_fitting_nodes<'a, I>(
    pod: &Pod,
    candidates: I,
    ctx: &SimulationContext<'_>,
) -> Vec<String>
where
    I: IntoIterator<Item = &'a Node>,
{
    candidates
        .into_iter()
        .filter(|node| {
            let existing = ctx
                .pods_by_node
                .get(&node.meta.name)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            can_schedule(pod, node, existing, Some(ctx)).is_feasible()
        })
        .map(|node| node.meta.name.clone())
        .collect()
}

fn check_resources(pod: &Pod, node: &Node, pods_on_node: &[Pod]) -> Option<String> {
    let need = pod.effective_requests();
    let mut used_cpu = 0i64;
    let mut used_mem = 0i64;
    let mut used_gpu = 0i64;
    for existing in pods_on_node {
        let requests = existing.effective_requests();
        used_cpu += requests.cpu_milli;
        used_mem += requests.memory_bytes;
        used_gpu += requests.gpu.unwrap_or(0);
    }
    if used_cpu + need.cpu_milli > node.capacity.cpu_milli {
        return Some(format!(
            "insufficient cpu on {} ({}m free, {}m needed)",
            node.meta.name,
            node.capacity.cpu_milli - used_cpu,
            need.cpu_milli
        ));
    }
    if used_mem + need.memory_bytes > node.capacity.memory_bytes {
        return Some(format!("insufficient memory on {}", node.meta.name));
    }
    let need_gpu = need.gpu.unwrap_or(0);
    if need_gpu > 0 && used_gpu + need_gpu > node.capacity.gpus {
        return Some(format!("insufficient gpu on {}", node.meta.name));
    }
    None
}

fn node_selector_term_matches(term: &crate::model::NodeSelectorTerm, node: &Node) -> bool {
    term.match_expressions.iter().all(|expr| {
        let value = node.meta.labels.get(&expr.key);
        match expr.operator {
            NodeSelectorOperator::In => value.map(|v| expr.values.contains(v)).unwrap_or(false),
            NodeSelectorOperator::NotIn => value.map(|v| !expr.values.contains(v)).unwrap_or(true),
            NodeSelectorOperator::Exists => value.is_some(),
            NodeSelectorOperator::DoesNotExist => value.is_none(),
            NodeSelectorOperator::Gt | NodeSelectorOperator::Lt => {
                let label: Option<i64> = value.and_then(|v| v.parse().ok());
                let operand: Option<i64> = expr.values.first().and_then(|v| v.parse().ok());
                match (label, operand) {
                    (Some(l), Some(o)) => {
                        if expr.operator == NodeSelectorOperator::Gt {
                            l > o
                        } else {
                            l < o
                        }
                    }
                    _ => false,
                }
            }
        }
    })
}

/// Nodes in the same topology domain as `node` for `key`.
///
/// A node without the key is its own domain.
fn domain_nodes<'a>(
    node: &'a Node,
    ctx: Option<&'a SimulationContext<'_>>,
    key: &str,
) -> Vec<&'a Node> {
    let Some(value) = node.topology_value(key) else {
        return vec![node];
    };
    match ctx {
        Some(ctx) => ctx
            .all_nodes
            .iter()
            .filter(|n| n.topology_value(key) == Some(value))
            .collect(),
        None => vec![node],
    }
}

fn term_matches_pod(term: &PodAffinityTerm, subject_ns: &str, candidate: &Pod) -> bool {
    let ns_ok = if let Some(selector) = &term.namespace_selector {
        // An empty namespace selector means all namespaces. A non-empty one
        // needs namespace labels this model does not carry; treat as no match.
        selector.is_empty()
    } else if term.namespaces.is_empty() {
        candidate.meta.namespace == subject_ns
    } else {
        term.namespaces.contains(&candidate.meta.namespace)
    };
    if !ns_ok {
        return false;
    }
    term.selector
        .as_ref()
        .map(|s| s.matches(&candidate.meta.labels))
        .unwrap_or(false)
}

/// Whether at least one pod in the node's topology domain matches the term.
fn affinity_term_satisfied(
    pod: &Pod,
    node: &Node,
    pods_on_node: &[Pod],
    ctx: Option<&SimulationContext<'_>>,
    term: &PodAffinityTerm,
) -> bool {
    let domain = domain_nodes(node, ctx, &term.topology_key);
    for domain_node in domain {
        let pods: &[Pod] = if domain_node.meta.name == node.meta.name {
            pods_on_node
        } else if let Some(ctx) = ctx {
            ctx.pods_by_node
                .get(&domain_node.meta.name)
                .map(Vec::as_slice)
                .unwrap_or(&[])
        } else {
            &[]
        };
        if pods
            .iter()
            .any(|candidate| term_matches_pod(term, &pod.meta.namespace, candidate))
        {
            return true;
        }
    }
    false
}

fn check_topology_spread(
    pod: &Pod,
    node: &Node,
    pods_on_node: &[Pod],
    ctx: Option<&SimulationContext<'_>>,
    constraint: &TopologySpreadConstraint,
) -> Option<String> {
    let key = &constraint.topology_key;
    let Some(candidate_domain) = node.topology_value(key) else {
        return Some(format!("node {} missing topology key {key}", node.meta.name));
    };
    let matches = |candidate: &Pod| {
        candidate.meta.namespace == pod.meta.namespace
            && constraint
                .selector
                .as_ref()
                .map(|s| s.matches(&candidate.meta.labels))
                .unwrap_or(false)
    };

    // Count matching pods per domain, simulating the placement.
    let mut counts: HashMap<&str, i64> = HashMap::new();
    match ctx {
        Some(ctx) => {
            for other in ctx.all_nodes {
                let Some(domain) = other.topology_value(key) else {
                    continue;
                };
                let pods: &[Pod] = if other.meta.name == node.meta.name {
                    pods_on_node
                } else {
                    ctx.pods_by_node
                        .get(&other.meta.name)
                        .map(Vec::as_slice)
                        .unwrap_or(&[])
                };
                let count = pods.iter().filter(|p| matches(p)).count() as i64;
                *counts.entry(domain).or_insert(0) += count;
            }
        }
        None => {
            let count = pods_on_node.iter().filter(|p| matches(p)).count() as i64;
            counts.insert(candidate_domain, count);
        }
    }
    *counts.entry(candidate_domain).or_insert(0) += 1;

    let populated: Vec<i64> = counts.values().copied().filter(|&c| c > 0).collect();
    let max = populated.iter().copied().max().unwrap_or(0);
    let min = populated.iter().copied().min().unwrap_or(0);
    if max - min > constraint.max_skew {
        return Some(format!(
            "topology spread on {key} violated (skew {} > {})",
            max - min,
            constraint.max_skew
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Affinity, Container, LabelSelector, NodeAffinity, NodeCapacity, NodeCondition,
        NodeSelectorRequirement, NodeSelectorTerm, ObjectMeta, PodAffinity, PodSpec, PodStatus,
        ResourceRequests, Taint, TaintEffect, Toleration, TolerationOperator,
    };
    use std::collections::BTreeMap;

    fn ready_node(name: &str, cpu: i64, mem: i64) -> Node {
        Node {
            meta: ObjectMeta::named(name),
            capacity: NodeCapacity {
                cpu_milli: cpu,
                memory_bytes: mem,
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

    fn simple_pod(name: &str, cpu: i64, mem: i64) -> Pod {
        Pod {
            meta: ObjectMeta {
                name: name.into(),
                namespace: "default".into(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![Container {
                    name: "app".into(),
                    requests: ResourceRequests {
                        cpu_milli: cpu,
                        memory_bytes: mem,
                        gpu: None,
                    },
                    resize_policy: None,
                }],
                ..Default::default()
            },
            status: PodStatus::default(),
        }
    }

    #[test]
    fn rejects_cordoned_and_not_ready() {
        let pod = simple_pod("p", 100, 1 << 20);
        let mut node = ready_node("n1", 4000, 16 << 30);
        node.unschedulable = true;
        assert!(!can_schedule(&pod, &node, &[], None).is_feasible());

        let mut node = ready_node("n2", 4000, 16 << 30);
        node.conditions.clear();
        let verdict = can_schedule(&pod, &node, &[], None);
        assert_eq!(verdict.reason(), Some("node n2 not ready"));
    }

    #[test]
    fn respects_cumulative_capacity() {
        let node = ready_node("n1", 1000, 4 << 30);
        let existing = vec![simple_pod("a", 700, 1 << 30)];
        let pod = simple_pod("b", 400, 1 << 30);
        assert!(!can_schedule(&pod, &node, &existing, None).is_feasible());
        let smaller = simple_pod("c", 300, 1 << 30);
        assert!(can_schedule(&smaller, &node, &existing, None).is_feasible());
    }

    #[test]
    fn taints_require_toleration() {
        let mut node = ready_node("n1", 4000, 16 << 30);
        node.taints.push(Taint {
            key: "dedicated".into(),
            value: "batch".into(),
            effect: TaintEffect::NoSchedule,
        });
        let pod = simple_pod("p", 100, 1 << 20);
        assert!(!can_schedule(&pod, &node, &[], None).is_feasible());

        let mut tolerant = pod.clone();
        tolerant.spec.tolerations.push(Toleration {
            key: "dedicated".into(),
            operator: TolerationOperator::Equal,
            value: "batch".into(),
            effect: Some(TaintEffect::NoSchedule),
        });
        assert!(can_schedule(&tolerant, &node, &[], None).is_feasible());
    }

    #[test]
    fn node_affinity_gt_parses_integers() {
        let mut node = ready_node("n1", 4000, 16 << 30);
        node.meta.labels.insert("cpu-generation".into(), "7".into());
        let mut pod = simple_pod("p", 100, 1 << 20);
        pod.spec.affinity = Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required_terms: vec![NodeSelectorTerm {
                    match_expressions: vec![NodeSelectorRequirement {
                        key: "cpu-generation".into(),
                        operator: NodeSelectorOperator::Gt,
                        values: vec!["5".into()],
                    }],
                }],
            }),
            ..Default::default()
        });
        assert!(can_schedule(&pod, &node, &[], None).is_feasible());

        node.meta.labels.insert("cpu-generation".into(), "4".into());
        assert!(!can_schedule(&pod, &node, &[], None).is_feasible());
    }

    #[test]
    fn anti_affinity_blocks_same_domain() {
        let mut node_a = ready_node("a", 4000, 16 << 30);
        node_a.meta.labels.insert("zone".into(), "z1".into());
        let mut node_b = ready_node("b", 4000, 16 << 30);
        node_b.meta.labels.insert("zone".into(), "z1".into());

        let mut existing = simple_pod("web-1", 100, 1 << 20);
        existing
            .meta
            .labels
            .insert("app".to_string(), "web".to_string());

        let mut pods_by_node = HashMap::new();
        pods_by_node.insert("a".to_string(), vec![existing]);
        let nodes = vec![node_a, node_b.clone()];
        let ctx = SimulationContext {
            all_nodes: &nodes,
            pods_by_node: &pods_by_node,
        };

        let mut pod = simple_pod("web-2", 100, 1 << 20);
        pod.meta.labels.insert("app".to_string(), "web".to_string());
        let mut selector = LabelSelector::default();
        selector
            .match_labels
            .insert("app".to_string(), "web".to_string());
        pod.spec.affinity = Some(Affinity {
            pod_anti_affinity: Some(PodAffinity {
                required_terms: vec![crate::model::PodAffinityTerm {
                    selector: Some(selector),
                    namespaces: vec![],
                    namespace_selector: None,
                    topology_key: "zone".into(),
                }],
            }),
            ..Default::default()
        });

        // node b shares zone z1 with the existing web pod on node a
        let verdict = can_schedule(&pod, &node_b, &[], Some(&ctx));
        assert!(!verdict.is_feasible());
    }

    #[test]
    fn topology_spread_enforces_max_skew() {
        let mut nodes = Vec::new();
        let mut pods_by_node: HashMap<String, Vec<Pod>> = HashMap::new();
        for (name, zone, count) in [("a", "z1", 2), ("b", "z2", 0)] {
            let mut node = ready_node(name, 8000, 32 << 30);
            node.meta.labels.insert("zone".into(), zone.into());
            nodes.push(node);
            let mut pods = Vec::new();
            for i in 0..count {
                let mut p = simple_pod(&format!("web-{name}-{i}"), 100, 1 << 20);
                p.meta.labels.insert("app".to_string(), "web".to_string());
                pods.push(p);
            }
            pods_by_node.insert(name.to_string(), pods);
        }
        let ctx = SimulationContext {
            all_nodes: &nodes,
            pods_by_node: &pods_by_node,
        };

        let mut selector = LabelSelector::default();
        selector
            .match_labels
            .insert("app".to_string(), "web".to_string());
        let mut pod = simple_pod("web-new", 100, 1 << 20);
        pod.meta.labels.insert("app".to_string(), "web".to_string());
        pod.spec.topology_spread_constraints = vec![TopologySpreadConstraint {
            max_skew: 1,
            topology_key: "zone".into(),
            when_unsatisfiable: UnsatisfiableAction::DoNotSchedule,
            selector: Some(selector),
        }];

        // placing on z1 makes counts {z1: 3} against an empty-but-ignored z2;
        // domains without matching pods are not part of the skew window
        let existing_a = pods_by_node.get("a").unwrap().clone();
        assert!(can_schedule(&pod, &nodes[0], &existing_a, Some(&ctx)).is_feasible());

        // seed one matching pod in z2, then z1 placement gives skew 3-1=2
        pods_by_node.get_mut("b").unwrap().push({
            let mut p = simple_pod("web-b-0", 100, 1 << 20);
            p.meta.labels.insert("app".to_string(), "web".to_string());
            p
        });
        let ctx = SimulationContext {
            all_nodes: &nodes,
            pods_by_node: &pods_by_node,
        };
        assert!(!can_schedule(&pod, &nodes[0], &existing_a, Some(&ctx)).is_feasible());
        // z2 placement balances instead
        let existing_b = pods_by_node.get("b").unwrap().clone();
        assert!(can_schedule(&pod, &nodes[1], &existing_b, Some(&ctx)).is_feasible());
    }

    #[test]
    fn find_fitting_nodes_filters() {
        let nodes = vec![
            ready_node("small", 200, 1 << 30),
            ready_node("large", 4000, 16 << 30),
        ];
        let pods_by_node = HashMap::new();
        let ctx = SimulationContext {
            all_nodes: &nodes,
            pods_by_node: &pods_by_node,
        };
        let pod = simple_pod("p", 500, 1 << 30);
        let fitting = find_fitting_nodes(&pod, nodes.iter(), &ctx);
        assert_eq!(fitting, vec!["large".to_string()]);
    }
}
