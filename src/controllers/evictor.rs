//! Evictor / consolidator
//!
//! Finds fragmented nodes whose entire workload fits elsewhere and drains
//! them. Feasibility is decided by the scheduling simulator with cumulative
//! tentative placement: a candidate is only emitted when every one of its
//! non-DaemonSet pods has a seat on a non-candidate node *after* all pods
//! already placed in this plan are accounted for.

use crate::cloud::HOURS_PER_MONTH;
use crate::engine::{Clearance, Controller, EngineContext};
use crate::error::Result;
use crate::model::{
    EstimatedImpact, Priority, Recommendation, RecommendationKind, RiskLevel, Target,
};
use crate::packing::{consolidation_candidates, pack};
use crate::simulator::{find_fitting_nodes, SimulationContext};
use crate::state::ClusterSnapshot;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Node-consolidation controller
pub struct Evictor {
    ctx: Arc<EngineContext>,
}

impl Evictor {
    /// Build the controller.
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Plan consolidations for the snapshot. Pure; used by tests directly.
    pub fn plan(&self, snapshot: &ClusterSnapshot) -> Vec<Recommendation> {
        let threshold = self.ctx.config.evictor.fragmentation_threshold;
        let candidates = consolidation_candidates(snapshot, threshold);
        if candidates.is_empty() {
            return Vec::new();
        }
        let packing = pack(snapshot);
        debug!(
            candidates = candidates.len(),
            min_nodes = packing.min_nodes_needed,
            "consolidation pass"
        );

        let capped: Vec<_> = candidates
            .into_iter()
            .take(self.ctx.config.evictor.max_concurrent_evictions)
            .collect();
        let candidate_names: HashSet<String> =
            capped.iter().map(|(n, _)| n.name().to_string()).collect();

        let receivers: Vec<_> = snapshot
            .nodes
            .iter()
            .filter(|n| !candidate_names.contains(n.name()))
            .map(|n| n.node.clone())
            .collect();
        if receivers.is_empty() {
            return Vec::new();
        }

        // Speculative placement state shared across candidates so cumulative
        // capacity is respected.
        let mut speculative: HashMap<String, Vec<crate::model::Pod>> =
            snapshot.pods_by_node.clone();
        let all_nodes = snapshot.raw_nodes();

        let mut recommendations = Vec::new();
        let mut planned_nodes = 0u32;
        for (candidate, score) in &capped {
            let movable: Vec<_> = snapshot
                .pods_on(candidate.name())
                .iter()
                .filter(|p| !p.is_daemonset() && !p.is_completed())
                .cloned()
                .collect();

            let mut placements: Vec<(String, crate::model::Pod)> = Vec::new();
            let mut feasible = true;
            for pod in &movable {
                let sim = SimulationContext {
                    all_nodes: &all_nodes,
                    pods_by_node: &speculative,
                };
                let fitting = find_fitting_nodes(pod, receivers.iter(), &sim);
                match fitting.first() {
                    Some(target) => {
                        placements.push((target.clone(), pod.clone()));
                        speculative
                            .entry(target.clone())
                            .or_default()
                            .push(pod.clone());
                    }
                    None => {
                        feasible = false;
                        break;
                    }
                }
            }
            if !feasible {
                // roll back this candidate's tentative placements
                for (target, pod) in placements {
                    if let Some(pods) = speculative.get_mut(&target) {
                        pods.retain(|p| p.key() != pod.key());
                    }
                }
                debug!(node = candidate.name(), "consolidation infeasible; skipped");
                continue;
            }

            planned_nodes += 1;
            let monthly_saving = candidate.hourly_cost_usd * HOURS_PER_MONTH;
            let rec = Recommendation::new(
                RecommendationKind::Eviction,
                Priority::Medium,
                Target::cluster("Node", candidate.name()),
            )
            .with_summary(format!(
                "Consolidate node {} (fragmentation {:.2}, {} pods movable)",
                candidate.name(),
                score,
                movable.len()
            ))
            .with_step(format!("Cordon and drain node {}", candidate.name()))
            .with_step("Let the autoscaler reclaim the empty node".to_string())
            .with_monthly_saving(monthly_saving)
            .with_impact(EstimatedImpact {
                nodes_affected: 1,
                pods_affected: movable.len() as u32,
                monthly_cost_change_usd: -monthly_saving,
                risk: RiskLevel::Medium,
            })
            .with_detail("fragmentation_score", format!("{score:.3}"))
            .with_detail("movable_pods", movable.len().to_string())
            .auto_executable(true)
            .with_ai_gate(planned_nodes > self.ctx.config.ai_gate.max_evict_nodes);
            recommendations.push(rec);
        }
        recommendations
    }
}

#[async_trait]
impl Controller for Evictor {
    fn name(&self) -> &'static str {
        "evictor"
    }

    async fn prepare(&self) -> Result<()> {
        self.ctx.drainer.reconcile_partial_drains().await?;
        Ok(())
    }

    async fn analyze(&self, snapshot: &ClusterSnapshot) -> Result<Vec<Recommendation>> {
        Ok(self.plan(snapshot))
    }

    async fn execute(&self, rec: &Recommendation) -> Result<bool> {
        let clearance = self.ctx.clearance(self.name(), rec).await;
        let _lock = match clearance {
            Clearance::Skip(_) => return Ok(false),
            Clearance::Proceed { lock } => lock,
        };
        let node = &rec.target.name;
        self.ctx
            .state
            .audit()
            .record("drain-node", node.clone(), self.name(), rec.id.clone());
        match self.ctx.drainer.drain_node(node, self.name()).await {
            Ok(report) => {
                self.ctx.state.audit().record(
                    "drain-complete",
                    node.clone(),
                    self.name(),
                    format!(
                        "evicted={} failed={} partial={}",
                        report.evicted, report.failed, report.partial
                    ),
                );
                info!(node, evicted = report.evicted, "consolidation drain finished");
                Ok(true)
            }
            Err(e) => {
                self.ctx.state.audit().record(
                    "drain-error",
                    node.clone(),
                    self.name(),
                    e.to_string(),
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{node_info, pod_info, snapshot_of};

    fn harness() -> crate::engine::EngineContext {
        crate::enginetest::context_with_defaults()
    }

    #[tokio::test]
    async fn cumulative_capacity_limits_candidates() {
        // two fragmented candidates with one 200m pod each; the only
        // receiver has 300m free, so only the first candidate fits
        let receiver = node_info("receiver", 4000, 64 << 30);
        let snapshot = snapshot_of(
            vec![
                receiver,
                node_info("cand-a", 4000, 16 << 30),
                node_info("cand-b", 4000, 16 << 30),
            ],
            vec![
                pod_info("default", "filler", "receiver", 3700, 1 << 30),
                pod_info("default", "pod-a", "cand-a", 200, 1 << 30),
                pod_info("default", "pod-b", "cand-b", 200, 1 << 30),
            ],
        );
        let ctx = Arc::new(harness());
        let evictor = Evictor::new(ctx);
        let recs = evictor.plan(&snapshot);
        assert_eq!(recs.len(), 1, "second candidate must not fit");
        assert_eq!(recs[0].kind, RecommendationKind::Eviction);
    }

    #[tokio::test]
    async fn no_candidates_below_threshold() {
        let mut busy = node_info("busy", 4000, 16 << 30);
        busy.cpu_requested_milli = 3500;
        busy.memory_requested_bytes = 14 << 30;
        let snapshot = snapshot_of(vec![busy], vec![]);
        let ctx = Arc::new(harness());
        let evictor = Evictor::new(ctx);
        assert!(evictor.plan(&snapshot).is_empty());
    }

    #[tokio::test]
    async fn savings_use_monthly_hours() {
        let mut idle = node_info("idle", 4000, 16 << 30);
        idle.hourly_cost_usd = 0.20;
        let receiver = node_info("receiver", 8000, 64 << 30);
        let snapshot = snapshot_of(
            vec![receiver, idle],
            vec![
                // keeps the receiver below the candidate threshold
                pod_info("default", "anchor", "receiver", 6000, 48 << 30),
                pod_info("default", "only", "idle", 100, 1 << 30),
            ],
        );
        let ctx = Arc::new(harness());
        let evictor = Evictor::new(ctx);
        let recs = evictor.plan(&snapshot);
        assert_eq!(recs.len(), 1);
        let saving = recs[0].estimated_saving.unwrap();
        assert!((saving.monthly_usd - 0.20 * 730.0).abs() < 1e-9);
    }
}
