//! Spot optimizer
//!
//! Three layers: the mixer nudges the fleet toward the configured spot
//! share, the diversity manager flags spot groups with too few instance
//! types to survive a capacity crunch, and the interruption handler turns
//! vendor termination signals into emergency drains.

use crate::cloud::{estimated_spot_discount, HOURS_PER_MONTH};
use crate::engine::{Clearance, Controller, EngineContext};
use crate::error::Result;
use crate::model::{
    EstimatedImpact, Lifecycle, Priority, Recommendation, RecommendationKind, RiskLevel, Target,
    ANNOTATION_AZURE_SCHEDULED_EVENT, ANNOTATION_SPOT_INTERRUPTION,
};
use crate::state::{ClusterSnapshot, NodeInfo};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Node conditions that announce an interruption, per vendor.
const INTERRUPTION_CONDITIONS: &[&str] =
    &["TerminationNotice", "PreemptionNotice", "MaintenanceEvent"];

/// Spot/on-demand mixing controller
pub struct SpotOptimizer {
    ctx: Arc<EngineContext>,
}

impl SpotOptimizer {
    /// Build the controller.
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Whether a node is signalling an imminent interruption.
    pub fn interruption_signal(node: &NodeInfo) -> Option<&'static str> {
        for condition in INTERRUPTION_CONDITIONS {
            if node.node.has_condition(condition) {
                return Some("condition");
            }
        }
        let annotations = &node.node.meta.annotations;
        if annotations
            .get(ANNOTATION_SPOT_INTERRUPTION)
            .map(|v| v == "true")
            .unwrap_or(false)
        {
            return Some("annotation");
        }
        if annotations.contains_key(ANNOTATION_AZURE_SCHEDULED_EVENT) {
            return Some("scheduled-event");
        }
        if node
            .node
            .taints
            .iter()
            .any(|t| t.key.contains("termination") || t.key.contains("preempt"))
        {
            return Some("taint");
        }
        None
    }

    async fn plan_mix(&self, snapshot: &ClusterSnapshot) -> Vec<Recommendation> {
        let total = snapshot.nodes.len();
        if total == 0 {
            return Vec::new();
        }
        let spot = snapshot.nodes.iter().filter(|n| n.is_spot).count();
        let ratio_pct = spot as f64 / total as f64 * 100.0;
        let ceiling = f64::from(self.ctx.config.spot.max_spot_percentage);
        if ratio_pct >= ceiling {
            return Vec::new();
        }

        // convertible: on-demand, no GPUs
        let convertible: Vec<&NodeInfo> = snapshot
            .nodes
            .iter()
            .filter(|n| !n.is_spot && n.gpus == 0)
            .collect();
        if convertible.is_empty() {
            return Vec::new();
        }

        // savings come from on-demand minus spot; a node that is already
        // spot-discounted contributes nothing
        let vendor = self.ctx.state.cloud().vendor();
        let mut monthly_saving = 0.0;
        for node in &convertible {
            let spot_hourly = match node.node.instance_type() {
                Some(instance_type) => self
                    .ctx
                    .state
                    .cloud()
                    .spot_hourly_cost(instance_type)
                    .await
                    .ok()
                    .flatten(),
                None => None,
            };
            let spot_hourly = spot_hourly.unwrap_or_else(|| {
                node.on_demand_hourly_usd * (1.0 - estimated_spot_discount(vendor))
            });
            monthly_saving += (node.on_demand_hourly_usd - spot_hourly).max(0.0) * HOURS_PER_MONTH;
        }

        let target_group = snapshot
            .node_groups
            .iter()
            .find(|g| g.lifecycle == Lifecycle::OnDemand)
            .map(|g| g.name.clone())
            .unwrap_or_else(|| "on-demand".to_string());
        vec![Recommendation::new(
            RecommendationKind::SpotOptimize,
            Priority::Medium,
            Target::cluster("NodeGroup", target_group.clone()),
        )
        .with_summary(format!(
            "Spot share is {ratio_pct:.0}% (ceiling {ceiling:.0}%); convert {} on-demand nodes",
            convertible.len()
        ))
        .with_step(format!(
            "Shift eligible workloads in {target_group} to spot capacity"
        ))
        .auto_executable(false)
        .with_monthly_saving(monthly_saving)
        .with_impact(EstimatedImpact {
            nodes_affected: convertible.len() as u32,
            pods_affected: 0,
            monthly_cost_change_usd: -monthly_saving,
            risk: RiskLevel::Medium,
        })
        .with_detail("current_spot_pct", format!("{ratio_pct:.1}"))]
    }

    fn plan_diversity(&self, snapshot: &ClusterSnapshot) -> Vec<Recommendation> {
        let minimum = self.ctx.config.spot.diversity_min_types;
        snapshot
            .node_groups
            .iter()
            .filter(|g| {
                matches!(g.lifecycle, Lifecycle::Spot | Lifecycle::Mixed)
                    && g.instance_types.len() < minimum
            })
            .map(|g| {
                Recommendation::new(
                    RecommendationKind::SpotOptimize,
                    Priority::Medium,
                    Target::cluster("NodeGroup", g.name.clone()),
                )
                .with_summary(format!(
                    "Spot group {} offers {} instance types; {minimum}+ recommended for resilience",
                    g.name,
                    g.instance_types.len()
                ))
                .with_step("Add sibling instance types to the group".to_string())
                .auto_executable(false)
                .with_detail("diversity", "true")
                .with_detail("node_group_id", g.id.clone())
            })
            .collect()
    }

    fn plan_interruptions(&self, snapshot: &ClusterSnapshot) -> Vec<Recommendation> {
        snapshot
            .nodes
            .iter()
            .filter_map(|n| Self::interruption_signal(n).map(|signal| (n, signal)))
            .map(|(n, signal)| {
                Recommendation::new(
                    RecommendationKind::SpotOptimize,
                    Priority::Critical,
                    Target::cluster("Node", n.name()),
                )
                .with_summary(format!(
                    "Spot interruption signalled on {} ({signal}); evacuating",
                    n.name()
                ))
                .with_step(format!("Emergency-drain {}", n.name()))
                .auto_executable(true)
                .with_impact(EstimatedImpact {
                    nodes_affected: 1,
                    pods_affected: n.pod_count as u32,
                    monthly_cost_change_usd: 0.0,
                    risk: RiskLevel::Medium,
                })
                .with_detail("interruption", "true")
                .with_detail("signal", signal)
            })
            .collect()
    }
}

#[async_trait]
impl Controller for SpotOptimizer {
    fn name(&self) -> &'static str {
        "spot-optimizer"
    }

    async fn analyze(&self, snapshot: &ClusterSnapshot) -> Result<Vec<Recommendation>> {
        let mut recommendations = self.plan_interruptions(snapshot);
        recommendations.extend(self.plan_mix(snapshot).await);
        recommendations.extend(self.plan_diversity(snapshot));
        Ok(recommendations)
    }

    async fn execute(&self, rec: &Recommendation) -> Result<bool> {
        if rec.details.get("interruption").map(String::as_str) != Some("true") {
            // mix and diversity recs are advisory
            return Ok(false);
        }
        let clearance = self.ctx.clearance(self.name(), rec).await;
        let _lock = match clearance {
            Clearance::Skip(_) => return Ok(false),
            Clearance::Proceed { lock } => lock,
        };
        let node = &rec.target.name;
        self.ctx.state.audit().record(
            "emergency-drain",
            node.clone(),
            self.name(),
            rec.summary.clone(),
        );
        let report = self.ctx.drainer.emergency_drain(node, self.name()).await?;
        if !report.pdb_overrides.is_empty() {
            warn!(
                node,
                overridden = report.pdb_overrides.len(),
                "disruption budgets overridden during interruption evacuation"
            );
        }
        info!(node, evicted = report.evicted, "interrupted node evacuated");
        Ok(true)
    }
}
