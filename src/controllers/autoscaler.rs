//! Node autoscaler
//!
//! Three policies over node groups: scale up on pending pods, scale down on
//! dual-axis underutilization, and a (never auto-executed) instance-size
//! advisor. Scale-down drains the underutilized nodes before touching the
//! desired count; a scale-down where no node drains successfully is aborted.

use crate::engine::{Clearance, Controller, EngineContext};
use crate::error::{OptimizerError, Result};
use crate::model::{
    EstimatedImpact, NodeGroup, PodPhase, Priority, Recommendation, RecommendationKind, RiskLevel,
    Target, LABEL_NODE_GROUP,
};
use crate::state::{ClusterSnapshot, NodeInfo};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Node group up/down scaler and size advisor
pub struct NodeAutoscaler {
    ctx: Arc<EngineContext>,
}

impl NodeAutoscaler {
    /// Build the controller.
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    fn nodes_of_group<'a>(
        snapshot: &'a ClusterSnapshot,
        group: &NodeGroup,
    ) -> Vec<&'a NodeInfo> {
        snapshot
            .nodes
            .iter()
            .filter(|n| {
                n.node
                    .meta
                    .labels
                    .get(LABEL_NODE_GROUP)
                    .map(|g| g == &group.name || g == &group.id)
                    .unwrap_or_else(|| n.node.instance_type() == Some(group.instance_type.as_str()))
            })
            .collect()
    }

    fn plan_scale_up(&self, snapshot: &ClusterSnapshot) -> Vec<Recommendation> {
        let pending = snapshot
            .pods
            .iter()
            .filter(|p| {
                p.pod.status.phase == PodPhase::Pending && p.pod.spec.node_name.is_none()
            })
            .count() as i32;
        if pending == 0 {
            return Vec::new();
        }
        let config = &self.ctx.config.autoscaler;
        let mut recommendations = Vec::new();
        for group in &snapshot.node_groups {
            if group.desired_count >= group.max_count {
                continue;
            }
            let proposed =
                (group.desired_count + pending.min(config.max_scale_up_nodes)).min(group.max_count);
            let added = proposed - group.desired_count;
            if added <= 0 {
                continue;
            }
            let scale_up_pct = if group.desired_count == 0 {
                100.0
            } else {
                f64::from(added) / f64::from(group.desired_count) * 100.0
            };
            let rec = Recommendation::new(
                RecommendationKind::NodeScale,
                Priority::High,
                Target::cluster("NodeGroup", group.name.clone()),
            )
            .with_summary(format!(
                "Scale up {} from {} to {} for {} pending pods",
                group.name, group.desired_count, proposed, pending
            ))
            .with_step(format!("Set desired count of {} to {proposed}", group.id))
            .auto_executable(true)
            .with_ai_gate(scale_up_pct > self.ctx.config.ai_gate.scale_threshold_pct)
            .with_impact(EstimatedImpact {
                nodes_affected: added as u32,
                pods_affected: pending as u32,
                monthly_cost_change_usd: 0.0,
                risk: RiskLevel::Low,
            })
            .with_detail("node_group_id", group.id.clone())
            .with_detail("direction", "up")
            .with_detail("desired", proposed.to_string());
            recommendations.push(rec);
        }
        recommendations
    }

    fn plan_scale_down(&self, snapshot: &ClusterSnapshot) -> Vec<Recommendation> {
        let config = &self.ctx.config.autoscaler;
        let mut recommendations = Vec::new();
        for group in &snapshot.node_groups {
            if group.desired_count <= group.min_count {
                continue;
            }
            let underutilized: Vec<&NodeInfo> = Self::nodes_of_group(snapshot, group)
                .into_iter()
                .filter(|n| {
                    !n.node.unschedulable
                        && n.cpu_usage_pct() < config.scale_down_threshold
                        && n.memory_usage_pct() < config.scale_down_threshold
                })
                .collect();
            if underutilized.is_empty() {
                continue;
            }
            let removable = (underutilized.len() as i32)
                .min(config.max_scale_down_nodes)
                .min(group.desired_count - group.min_count);
            if removable <= 0 {
                continue;
            }
            let proposed = group.desired_count - removable;
            let victims: Vec<String> = underutilized
                .iter()
                .take(removable as usize)
                .map(|n| n.name().to_string())
                .collect();
            let monthly_saving: f64 = underutilized
                .iter()
                .take(removable as usize)
                .map(|n| n.hourly_cost_usd * 730.0)
                .sum();
            let rec = Recommendation::new(
                RecommendationKind::NodeScale,
                Priority::Medium,
                Target::cluster("NodeGroup", group.name.clone()),
            )
            .with_summary(format!(
                "Scale down {} from {} to {} ({} underutilized nodes)",
                group.name,
                group.desired_count,
                proposed,
                underutilized.len()
            ))
            .with_step(format!("Drain nodes {}", victims.join(", ")))
            .with_step(format!("Set desired count of {} to {proposed}", group.id))
            .auto_executable(true)
            .with_monthly_saving(monthly_saving)
            .with_impact(EstimatedImpact {
                nodes_affected: removable as u32,
                pods_affected: victims
                    .iter()
                    .map(|v| snapshot.node(v).map(|n| n.pod_count).unwrap_or(0) as u32)
                    .sum(),
                monthly_cost_change_usd: -monthly_saving,
                risk: RiskLevel::Medium,
            })
            .with_detail("node_group_id", group.id.clone())
            .with_detail("direction", "down")
            .with_detail("desired", proposed.to_string())
            .with_detail("nodes", victims.join(","));
            recommendations.push(rec);
        }
        recommendations
    }

    fn plan_size_advice(&self, snapshot: &ClusterSnapshot) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();
        for group in &snapshot.node_groups {
            let members = Self::nodes_of_group(snapshot, group);
            if members.is_empty() {
                continue;
            }
            let count = members.len() as f64;
            let avg_cpu = members.iter().map(|n| n.cpu_usage_pct()).sum::<f64>() / count;
            let avg_mem = members.iter().map(|n| n.memory_usage_pct()).sum::<f64>() / count;

            let suggestion = if avg_cpu > 85.0 || avg_mem > 85.0 {
                self.ctx
                    .family_guard
                    .next_size_up(&group.instance_type)
                    .map(|t| (t, "larger"))
            } else if avg_cpu < 30.0 && avg_mem < 30.0 {
                self.ctx
                    .family_guard
                    .next_size_down(&group.instance_type)
                    .map(|t| (t, "smaller"))
            } else {
                None
            };
            let Some((instance_type, direction)) = suggestion else {
                continue;
            };
            let rec = Recommendation::new(
                RecommendationKind::NodeGroupAdjust,
                Priority::Low,
                Target::cluster("NodeGroup", group.name.clone()),
            )
            .with_summary(format!(
                "Move {} to the {direction} {} (avg cpu {:.0}%, mem {:.0}%)",
                group.name, instance_type.name, avg_cpu, avg_mem
            ))
            .with_step(format!(
                "Create a {} node group and migrate workloads",
                instance_type.name
            ))
            .auto_executable(false)
            .with_impact(EstimatedImpact {
                nodes_affected: members.len() as u32,
                pods_affected: 0,
                monthly_cost_change_usd: 0.0,
                risk: RiskLevel::High,
            })
            .with_detail("node_group_id", group.id.clone())
            .with_detail("suggested_instance_type", instance_type.name.clone());
            recommendations.push(rec);
        }
        recommendations
    }

    async fn execute_scale_down(&self, rec: &Recommendation, group_id: &str) -> Result<()> {
        let victims: Vec<&str> = rec
            .details
            .get("nodes")
            .map(|s| s.split(',').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        let mut drained = 0i32;
        for node in &victims {
            let Some(_guard) = self.ctx.state.locks().guard(node, self.name()) else {
                warn!(node, "scale-down victim is locked; skipping");
                continue;
            };
            match self.ctx.drainer.drain_node(node, self.name()).await {
                Ok(report) if !report.partial => {
                    drained += 1;
                    self.ctx.state.audit().record(
                        "scale-down-drain",
                        (*node).to_string(),
                        self.name(),
                        format!("evicted={}", report.evicted),
                    );
                }
                Ok(_) => {
                    warn!(node, "partial drain during scale-down; node excluded");
                }
                Err(e) => {
                    warn!(node, error = %e, "scale-down drain failed");
                }
            }
        }
        if drained == 0 {
            // hard-terminating undrained nodes would drop workloads
            self.ctx.state.audit().record(
                "scale-down-aborted",
                rec.target.name.clone(),
                self.name(),
                "no node drained successfully".to_string(),
            );
            return Err(OptimizerError::DrainFailed {
                node: rec.target.name.clone(),
                reason: "scale-down aborted: zero successful drains".to_string(),
            });
        }
        let snapshot = self.ctx.state.snapshot();
        let group = snapshot
            .node_groups
            .iter()
            .find(|g| g.id == group_id)
            .ok_or_else(|| OptimizerError::CloudProvider(format!("group {group_id} vanished")))?;
        let desired = (group.desired_count - drained).max(group.min_count);
        self.ctx
            .state
            .cloud()
            .set_desired_count(group_id, desired)
            .await?;
        self.ctx.state.audit().record(
            "scale-down",
            rec.target.name.clone(),
            self.name(),
            format!("desired={desired} drained={drained}"),
        );
        info!(group = group_id, desired, drained, "scale-down applied");
        Ok(())
    }
}

#[async_trait]
impl Controller for NodeAutoscaler {
    fn name(&self) -> &'static str {
        "node-autoscaler"
    }

    async fn analyze(&self, snapshot: &ClusterSnapshot) -> Result<Vec<Recommendation>> {
        let mut recommendations = self.plan_scale_up(snapshot);
        recommendations.extend(self.plan_scale_down(snapshot));
        recommendations.extend(self.plan_size_advice(snapshot));
        Ok(recommendations)
    }

    async fn execute(&self, rec: &Recommendation) -> Result<bool> {
        let clearance = self.ctx.clearance(self.name(), rec).await;
        let _lock = match clearance {
            Clearance::Skip(_) => return Ok(false),
            Clearance::Proceed { lock } => lock,
        };
        let group_id = rec
            .details
            .get("node_group_id")
            .cloned()
            .ok_or_else(|| OptimizerError::CloudProvider("missing node_group_id".into()))?;
        match rec.details.get("direction").map(String::as_str) {
            Some("up") => {
                let desired: i32 = rec
                    .details
                    .get("desired")
                    .and_then(|d| d.parse().ok())
                    .ok_or_else(|| OptimizerError::CloudProvider("missing desired".into()))?;
                self.ctx
                    .state
                    .cloud()
                    .set_desired_count(&group_id, desired)
                    .await?;
                self.ctx.state.audit().record(
                    "scale-up",
                    rec.target.name.clone(),
                    self.name(),
                    format!("desired={desired}"),
                );
                info!(group = %group_id, desired, "scale-up applied");
                Ok(true)
            }
            Some("down") => {
                self.execute_scale_down(rec, &group_id).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enginetest::context_with_defaults;
    use crate::testutil::{node_group, node_info, pod_info, snapshot_of};

    fn pending_pod(name: &str) -> crate::state::PodInfo {
        let mut info = pod_info("default", name, "unbound", 500, 1 << 30);
        info.pod.spec.node_name = None;
        info.pod.status.phase = PodPhase::Pending;
        info
    }

    #[tokio::test]
    async fn pending_pods_drive_scale_up() {
        let ctx = Arc::new(context_with_defaults());
        let scaler = NodeAutoscaler::new(ctx);
        let mut snapshot = snapshot_of(
            vec![node_info("n1", 4000, 16 << 30)],
            vec![pending_pod("waiting-1"), pending_pod("waiting-2")],
        );
        snapshot.node_groups = vec![node_group("ng-1", "m5.xlarge", 1, 2, 10)];
        let recs = scaler.plan_scale_up(&snapshot);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].details.get("desired").unwrap(), "4");
        // +2 on desired=2 is a 100% jump: above the default 50% gate bar
        assert!(recs[0].requires_ai_gate);
    }

    #[tokio::test]
    async fn scale_up_from_zero_counts_as_full_jump() {
        let ctx = Arc::new(context_with_defaults());
        let scaler = NodeAutoscaler::new(ctx);
        let mut snapshot = snapshot_of(vec![], vec![pending_pod("waiting")]);
        snapshot.node_groups = vec![node_group("ng-1", "m5.xlarge", 0, 0, 4)];
        let recs = scaler.plan_scale_up(&snapshot);
        assert_eq!(recs.len(), 1);
        assert!(recs[0].requires_ai_gate);
    }

    #[tokio::test]
    async fn dual_axis_underutilization_drives_scale_down() {
        let ctx = Arc::new(context_with_defaults());
        let scaler = NodeAutoscaler::new(ctx);
        let mut idle = node_info("idle", 4000, 16 << 30);
        idle.cpu_usage_milli = 200.0; // 5%
        idle.memory_usage_bytes = (1_i64 << 30) as f64; // ~6%
        idle.node
            .meta
            .labels
            .insert(LABEL_NODE_GROUP.into(), "ng-1".into());
        let mut hot = node_info("hot", 4000, 16 << 30);
        hot.cpu_usage_milli = 3800.0;
        hot.memory_usage_bytes = (15_i64 << 30) as f64;
        hot.node
            .meta
            .labels
            .insert(LABEL_NODE_GROUP.into(), "ng-1".into());
        let mut snapshot = snapshot_of(vec![idle, hot], vec![]);
        snapshot.node_groups = vec![node_group("ng-1", "m5.xlarge", 1, 2, 10)];
        let recs = scaler.plan_scale_down(&snapshot);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].details.get("desired").unwrap(), "1");
        assert_eq!(recs[0].details.get("nodes").unwrap(), "idle");
    }

    #[tokio::test]
    async fn cpu_only_idle_node_is_not_scaled_down() {
        let ctx = Arc::new(context_with_defaults());
        let scaler = NodeAutoscaler::new(ctx);
        let mut half_idle = node_info("half", 4000, 16 << 30);
        half_idle.cpu_usage_milli = 100.0;
        half_idle.memory_usage_bytes = (12_i64 << 30) as f64; // 75% memory
        half_idle
            .node
            .meta
            .labels
            .insert(LABEL_NODE_GROUP.into(), "ng-1".into());
        let mut snapshot = snapshot_of(vec![half_idle], vec![]);
        snapshot.node_groups = vec![node_group("ng-1", "m5.xlarge", 0, 1, 10)];
        assert!(scaler.plan_scale_down(&snapshot).is_empty());
    }
}
