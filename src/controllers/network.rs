//! Network policy
//!
//! Two cost checks: cloud load balancers with no ready endpoints (each one
//! bills a fixed monthly amount whether or not it serves traffic), and
//! workloads whose replicas spread across more zones than the configured
//! ceiling, since every replica pair split across zones pays inter-zone
//! transfer on its east-west traffic. Advisory only.

use crate::engine::{Clearance, Controller, EngineContext};
use crate::error::Result;
use crate::model::{
    deployment_for_replicaset, Priority, Recommendation, RecommendationKind, Target,
    LABEL_TOPOLOGY_ZONE,
};
use crate::state::ClusterSnapshot;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Idle load-balancer and cross-zone-spread detector
pub struct NetworkPolicy {
    ctx: Arc<EngineContext>,
}

impl NetworkPolicy {
    /// Build the controller.
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    fn plan_idle_load_balancers(&self, snapshot: &ClusterSnapshot) -> Vec<Recommendation> {
        let monthly = self.ctx.config.network.load_balancer_month_usd;
        snapshot
            .services
            .iter()
            .filter(|s| s.is_load_balancer && s.endpoint_count == 0)
            .map(|s| {
                Recommendation::new(
                    RecommendationKind::Network,
                    Priority::Medium,
                    Target::namespaced("Service", s.meta.namespace.clone(), s.meta.name.clone()),
                )
                .with_summary(format!(
                    "Load balancer {}/{} has no ready endpoints",
                    s.meta.namespace, s.meta.name
                ))
                .with_step("Delete the service or fix its selector".to_string())
                .auto_executable(false)
                .with_monthly_saving(monthly)
            })
            .collect()
    }

    /// Workloads whose replicas occupy more zones than the ceiling.
    fn plan_cross_zone(&self, snapshot: &ClusterSnapshot) -> Vec<Recommendation> {
        let ceiling = self.ctx.config.network.max_workload_zones;
        if ceiling == 0 {
            return Vec::new();
        }
        let zone_of: BTreeMap<&str, &str> = snapshot
            .nodes
            .iter()
            .filter_map(|n| {
                n.node
                    .topology_value(LABEL_TOPOLOGY_ZONE)
                    .map(|zone| (n.name(), zone))
            })
            .collect();

        // zones per workload owner, with the ReplicaSet hop resolved
        let mut zones_by_owner: BTreeMap<(String, String, String), BTreeSet<String>> =
            BTreeMap::new();
        for info in &snapshot.pods {
            if info.pod.is_daemonset() || info.pod.is_completed() {
                continue;
            }
            let (Some(kind), Some(name)) = (info.owner_kind.as_deref(), info.owner_name.as_deref())
            else {
                continue;
            };
            let (kind, name) = match kind {
                "ReplicaSet" => match deployment_for_replicaset(name) {
                    Some(deploy) => ("Deployment", deploy),
                    None => (kind, name),
                },
                _ => (kind, name),
            };
            let Some(node) = info.pod.spec.node_name.as_deref() else {
                continue;
            };
            let Some(zone) = zone_of.get(node) else {
                continue;
            };
            zones_by_owner
                .entry((
                    info.pod.meta.namespace.clone(),
                    kind.to_string(),
                    name.to_string(),
                ))
                .or_default()
                .insert((*zone).to_string());
        }

        zones_by_owner
            .into_iter()
            .filter(|(_, zones)| zones.len() > ceiling)
            .map(|((namespace, kind, name), zones)| {
                let spread: Vec<&str> = zones.iter().map(String::as_str).collect();
                Recommendation::new(
                    RecommendationKind::Network,
                    Priority::Low,
                    Target::namespaced(kind, namespace.clone(), name.clone()),
                )
                .with_summary(format!(
                    "{namespace}/{name} spans {} zones ({}); ceiling is {ceiling}",
                    zones.len(),
                    spread.join(", ")
                ))
                .with_step(
                    "Add a zone topology spread constraint or node affinity to narrow the spread"
                        .to_string(),
                )
                .auto_executable(false)
                .with_detail("zones", spread.join(","))
                .with_detail("zone_count", zones.len().to_string())
            })
            .collect()
    }
}

#[async_trait]
impl Controller for NetworkPolicy {
    fn name(&self) -> &'static str {
        "network-policy"
    }

    async fn analyze(&self, snapshot: &ClusterSnapshot) -> Result<Vec<Recommendation>> {
        let mut recommendations = self.plan_idle_load_balancers(snapshot);
        recommendations.extend(self.plan_cross_zone(snapshot));
        Ok(recommendations)
    }

    async fn execute(&self, rec: &Recommendation) -> Result<bool> {
        if let Clearance::Proceed { .. } = self.ctx.clearance(self.name(), rec).await {
            unreachable!("network recommendations are not auto-executable");
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enginetest::context_with_defaults;
    use crate::model::{ObjectMeta, Service};
    use crate::state::NodeInfo;
    use crate::testutil::{node_info, owned_by, pod_info, snapshot_of};

    fn service(name: &str, lb: bool, endpoints: u32) -> Service {
        Service {
            meta: ObjectMeta {
                name: name.into(),
                namespace: "default".into(),
                ..Default::default()
            },
            is_load_balancer: lb,
            endpoint_count: endpoints,
        }
    }

    fn zoned_node(name: &str, zone: &str) -> NodeInfo {
        let mut node = node_info(name, 4000, 16 << 30);
        node.node
            .meta
            .labels
            .insert(LABEL_TOPOLOGY_ZONE.into(), zone.into());
        node
    }

    fn replica(name: &str, node: &str) -> crate::state::PodInfo {
        owned_by(
            pod_info("default", name, node, 200, 1 << 30),
            "ReplicaSet",
            "web-6d4cf56db6",
        )
    }

    #[tokio::test]
    async fn only_endpointless_load_balancers_are_flagged() {
        let ctx = Arc::new(context_with_defaults());
        let policy = NetworkPolicy::new(ctx);
        let mut snapshot = snapshot_of(vec![], vec![]);
        snapshot.services = vec![
            service("idle-lb", true, 0),
            service("busy-lb", true, 3),
            service("cluster-ip", false, 0),
        ];
        let recs = policy.analyze(&snapshot).await.unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].target.name, "idle-lb");
        assert!(!recs[0].auto_executable);
    }

    #[tokio::test]
    async fn wide_zone_spread_is_flagged() {
        let ctx = Arc::new(context_with_defaults());
        let policy = NetworkPolicy::new(ctx);
        let snapshot = snapshot_of(
            vec![
                zoned_node("a", "z1"),
                zoned_node("b", "z2"),
                zoned_node("c", "z3"),
            ],
            vec![
                replica("web-6d4cf56db6-1", "a"),
                replica("web-6d4cf56db6-2", "b"),
                replica("web-6d4cf56db6-3", "c"),
            ],
        );
        // three zones against the default ceiling of two
        let recs = policy.plan_cross_zone(&snapshot);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].target.name, "web");
        assert_eq!(recs[0].target.kind, "Deployment");
        assert_eq!(recs[0].details.get("zone_count").unwrap(), "3");
        assert!(!recs[0].auto_executable);
    }

    #[tokio::test]
    async fn spread_within_the_ceiling_is_fine() {
        let ctx = Arc::new(context_with_defaults());
        let policy = NetworkPolicy::new(ctx);
        let snapshot = snapshot_of(
            vec![zoned_node("a", "z1"), zoned_node("b", "z2")],
            vec![
                replica("web-6d4cf56db6-1", "a"),
                replica("web-6d4cf56db6-2", "b"),
            ],
        );
        assert!(policy.plan_cross_zone(&snapshot).is_empty());
    }

    #[tokio::test]
    async fn daemonsets_and_zoneless_nodes_are_ignored() {
        let ctx = Arc::new(context_with_defaults());
        let policy = NetworkPolicy::new(ctx);
        let daemon = owned_by(
            pod_info("default", "agent-1", "a", 100, 1 << 30),
            "DaemonSet",
            "agent",
        );
        let snapshot = snapshot_of(
            vec![
                zoned_node("a", "z1"),
                zoned_node("b", "z2"),
                zoned_node("c", "z3"),
                // no zone label: replicas here cannot be attributed
                node_info("d", 4000, 16 << 30),
            ],
            vec![
                daemon,
                replica("web-6d4cf56db6-1", "a"),
                replica("web-6d4cf56db6-2", "d"),
            ],
        );
        assert!(policy.plan_cross_zone(&snapshot).is_empty());
    }
}
