//! Rebalancer
//!
//! Evens CPU load across nodes. The planner partitions nodes around the
//! fleet average and uses the scheduling simulator (with cumulative
//! tentative placement) to prove each move has a seat before anything is
//! recommended. The executor cordons the hottest node, evicts the planned
//! pods, waits for their owners to report ready again, and uncordons. The
//! busy redistributor is a continuous advisory layer on top.

use crate::drain::{skip_reason, DEFAULT_GRACE_PERIOD_SECONDS};
use crate::engine::{Clearance, Controller, EngineContext};
use crate::error::{OptimizerError, Result};
use crate::model::{
    EstimatedImpact, Pod, Priority, Recommendation, RecommendationKind, RiskLevel, Target,
};
use crate::simulator::{find_fitting_nodes, SimulationContext};
use crate::state::ClusterSnapshot;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Margin around the average that defines over/underloaded, in CPU percent.
const PARTITION_MARGIN_PCT: f64 = 10.0;

/// Workload spread controller
pub struct Rebalancer {
    ctx: Arc<EngineContext>,
}

impl Rebalancer {
    /// Build the controller.
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Plan one rebalance move set for the snapshot.
    pub fn plan(&self, snapshot: &ClusterSnapshot) -> Option<Recommendation> {
        if snapshot.nodes.len() < 2 {
            return None;
        }
        let config = &self.ctx.config.rebalancer;
        let loads: Vec<(String, f64)> = snapshot
            .nodes
            .iter()
            .map(|n| (n.name().to_string(), n.cpu_usage_pct()))
            .collect();
        let max = loads.iter().map(|(_, l)| *l).fold(f64::MIN, f64::max);
        let min = loads.iter().map(|(_, l)| *l).fold(f64::MAX, f64::min);
        if max - min < config.imbalance_threshold_pct {
            return None;
        }
        let avg = loads.iter().map(|(_, l)| *l).sum::<f64>() / loads.len() as f64;
        let overloaded: Vec<String> = loads
            .iter()
            .filter(|(_, l)| *l > avg + PARTITION_MARGIN_PCT)
            .map(|(n, _)| n.clone())
            .collect();
        let underloaded: HashSet<String> = loads
            .iter()
            .filter(|(_, l)| *l < avg - PARTITION_MARGIN_PCT)
            .map(|(n, _)| n.clone())
            .collect();
        if overloaded.is_empty() || underloaded.is_empty() {
            return None;
        }

        let receivers: Vec<_> = snapshot
            .nodes
            .iter()
            .filter(|n| underloaded.contains(n.name()))
            .map(|n| n.node.clone())
            .collect();
        let all_nodes = snapshot.raw_nodes();
        let mut speculative: HashMap<String, Vec<Pod>> = snapshot.pods_by_node.clone();

        let mut moves: Vec<(String, String)> = Vec::new();
        for source in &overloaded {
            for pod in snapshot.pods_on(source) {
                if pod.is_daemonset() || skip_reason(pod).is_some() {
                    continue;
                }
                let sim = SimulationContext {
                    all_nodes: &all_nodes,
                    pods_by_node: &speculative,
                };
                if let Some(target) = find_fitting_nodes(pod, receivers.iter(), &sim).first() {
                    moves.push((pod.key(), target.clone()));
                    speculative
                        .entry(target.clone())
                        .or_default()
                        .push(pod.clone());
                }
            }
        }
        if moves.is_empty() {
            debug!("imbalance detected but no pod has a feasible seat");
            return None;
        }

        // the hottest node is where the executor starts
        let hottest = loads
            .iter()
            .filter(|(n, _)| overloaded.contains(n))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(n, _)| n.clone())?;
        let movable_on_target: Vec<String> = moves
            .iter()
            .filter(|(pod, _)| {
                snapshot
                    .pods_on(&hottest)
                    .iter()
                    .any(|p| p.key() == *pod)
            })
            .map(|(pod, _)| pod.clone())
            .collect();

        let wide = overloaded.len() + underloaded.len() > 3 || moves.len() > 10;
        Some(
            Recommendation::new(
                RecommendationKind::Rebalance,
                Priority::Medium,
                Target::cluster("Node", hottest.clone()),
            )
            .with_summary(format!(
                "Rebalance {} pods from {} hot nodes toward {} cool nodes (spread {:.0}%)",
                moves.len(),
                overloaded.len(),
                underloaded.len(),
                max - min
            ))
            .with_step(format!("Cordon {hottest} and evict the planned pods"))
            .with_step("Wait for owners to report ready, then uncordon".to_string())
            .auto_executable(true)
            .with_ai_gate(wide)
            .with_impact(EstimatedImpact {
                nodes_affected: (overloaded.len() + underloaded.len()) as u32,
                pods_affected: moves.len() as u32,
                monthly_cost_change_usd: 0.0,
                risk: if wide { RiskLevel::High } else { RiskLevel::Medium },
            })
            .with_detail("sources", overloaded.join(","))
            .with_detail(
                "targets",
                underloaded.iter().cloned().collect::<Vec<_>>().join(","),
            )
            .with_detail("movable_pods", movable_on_target.join(",")),
        )
    }

    /// Advisory recommendations for nodes past the overload threshold.
    fn plan_busy(&self, snapshot: &ClusterSnapshot) -> Vec<Recommendation> {
        let config = &self.ctx.config.rebalancer;
        snapshot
            .nodes
            .iter()
            .filter(|n| n.cpu_usage_pct() > config.overloaded_threshold_pct)
            .map(|n| {
                let excess = n.cpu_usage_pct() - config.target_utilization_pct;
                Recommendation::new(
                    RecommendationKind::Rebalance,
                    Priority::High,
                    Target::cluster("Node", n.name()),
                )
                .with_summary(format!(
                    "{} is running at {:.0}% CPU; shed ~{:.0}% toward the {:.0}% target",
                    n.name(),
                    n.cpu_usage_pct(),
                    excess,
                    config.target_utilization_pct
                ))
                .with_step("Move burstable pods to cooler nodes".to_string())
                .auto_executable(false)
                .with_detail("busy", "true")
                .with_impact(EstimatedImpact {
                    nodes_affected: 1,
                    pods_affected: n.pod_count as u32,
                    monthly_cost_change_usd: 0.0,
                    risk: RiskLevel::Medium,
                })
            })
            .collect()
    }

    async fn execute_rebalance(&self, rec: &Recommendation) -> Result<()> {
        let node = rec.target.name.clone();
        let orchestrator = self.ctx.state.orchestrator();
        orchestrator.set_unschedulable(&node, true).await?;
        self.ctx
            .state
            .audit()
            .record("rebalance-cordon", node.clone(), self.name(), rec.id.clone());

        let planned: HashSet<&str> = rec
            .details
            .get("movable_pods")
            .map(|s| s.split(',').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        let pods = orchestrator.list_pods_on_node(&node).await?;

        // per-namespace PDB cache, fail-safe like the drain path
        let mut pdbs_by_ns: HashMap<String, Option<Vec<crate::model::PodDisruptionBudget>>> =
            HashMap::new();
        for pod in &pods {
            let ns = pod.meta.namespace.clone();
            if !pdbs_by_ns.contains_key(&ns) {
                let listed = orchestrator.list_pdbs(&ns).await.ok();
                pdbs_by_ns.insert(ns, listed);
            }
        }

        let mut owners: HashSet<(String, String, String)> = HashSet::new();
        let mut evicted = 0usize;
        let mut attempted = 0usize;
        for pod in &pods {
            if !planned.contains(pod.key().as_str()) || skip_reason(pod).is_some() {
                continue;
            }
            let blocked = match pdbs_by_ns.get(&pod.meta.namespace) {
                Some(Some(pdbs)) => pdbs
                    .iter()
                    .any(|p| p.selector.matches(&pod.meta.labels) && p.disruptions_allowed <= 0),
                Some(None) => true,
                None => false,
            };
            if blocked {
                debug!(pod = %pod.key(), "rebalance move blocked by PDB");
                continue;
            }
            attempted += 1;
            let grace = pod
                .spec
                .termination_grace_period_seconds
                .unwrap_or(DEFAULT_GRACE_PERIOD_SECONDS);
            match orchestrator
                .evict_pod(&pod.meta.namespace, &pod.meta.name, grace)
                .await
            {
                Ok(()) => {
                    evicted += 1;
                    if let Some(owner) = pod.controller_owner() {
                        owners.insert((
                            pod.meta.namespace.clone(),
                            owner.kind.clone(),
                            owner.name.clone(),
                        ));
                    }
                }
                Err(e) => warn!(pod = %pod.key(), error = %e, "rebalance eviction failed"),
            }
        }

        if attempted > 0 && evicted == 0 {
            orchestrator.set_unschedulable(&node, false).await?;
            self.ctx.state.audit().record(
                "rebalance-aborted",
                node.clone(),
                self.name(),
                "all evictions failed".to_string(),
            );
            return Err(OptimizerError::DrainFailed {
                node,
                reason: "rebalance: all evictions failed".to_string(),
            });
        }

        self.wait_for_owners(&owners).await;
        orchestrator.set_unschedulable(&node, false).await?;
        self.ctx.state.audit().record(
            "rebalance-complete",
            node.clone(),
            self.name(),
            format!("moved={evicted}"),
        );
        info!(node, moved = evicted, "rebalance finished");
        Ok(())
    }

    /// Wait until every owner reports `ready >= desired`, bounded by the
    /// reschedule timeout.
    async fn wait_for_owners(&self, owners: &HashSet<(String, String, String)>) {
        if owners.is_empty() {
            return;
        }
        let deadline =
            tokio::time::Instant::now() + self.ctx.config.rebalancer.reschedule_timeout();
        loop {
            let mut converged = true;
            for (namespace, kind, name) in owners {
                match self
                    .ctx
                    .state
                    .orchestrator()
                    .workload_status(namespace, kind, name)
                    .await
                {
                    Ok(status) if status.ready_replicas >= status.desired_replicas => {}
                    Ok(_) => {
                        converged = false;
                        break;
                    }
                    Err(e) => {
                        warn!(workload = %format!("{namespace}/{name}"), error = %e, "status poll failed");
                        converged = false;
                        break;
                    }
                }
            }
            if converged {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("reschedule wait timed out; uncordoning anyway");
                return;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

#[async_trait]
impl Controller for Rebalancer {
    fn name(&self) -> &'static str {
        "rebalancer"
    }

    async fn analyze(&self, snapshot: &ClusterSnapshot) -> Result<Vec<Recommendation>> {
        let mut recommendations: Vec<Recommendation> = self.plan(snapshot).into_iter().collect();
        recommendations.extend(self.plan_busy(snapshot));
        Ok(recommendations)
    }

    async fn execute(&self, rec: &Recommendation) -> Result<bool> {
        if rec.details.contains_key("busy") {
            return Ok(false);
        }
        let clearance = self.ctx.clearance(self.name(), rec).await;
        let _lock = match clearance {
            Clearance::Skip(_) => return Ok(false),
            Clearance::Proceed { lock } => lock,
        };
        self.execute_rebalance(rec).await?;
        Ok(true)
    }
}
