//! GPU optimizer
//!
//! Idle GPU nodes are expensive CPU nodes in disguise. The detector tracks
//! how long each GPU node has been idle; the fallback manager opens an idle
//! node to CPU workloads (and closes it again when GPUs are claimed); the
//! scavenger publishes spare CPU on *active* GPU nodes for low-priority
//! pods. Fallback and scavenging are mutually exclusive per node.

use crate::engine::{Clearance, Controller, EngineContext};
use crate::error::{OptimizerError, Result};
use crate::model::{
    EstimatedImpact, Priority, Recommendation, RecommendationKind, RiskLevel, Taint, TaintEffect,
    Target, ANNOTATION_CPU_HEADROOM, ANNOTATION_GPU_FALLBACK, LABEL_CPU_SCAVENGEABLE, TAINT_GPU,
};
use crate::state::{ClusterSnapshot, NodeInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Headroom drift that forces a republish, as a fraction.
const HEADROOM_DRIFT: f64 = 0.20;

/// GPU fallback and scavenging controller
pub struct GpuOptimizer {
    ctx: Arc<EngineContext>,
    idle_since: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl GpuOptimizer {
    /// Build the controller.
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            idle_since: Mutex::new(HashMap::new()),
        }
    }

    fn is_idle(&self, node: &NodeInfo) -> bool {
        if node.gpus == 0 {
            return false;
        }
        node.gpus_used == 0
            || (node.gpus_used as f64 / node.gpus as f64 * 100.0)
                < self.ctx.config.gpu.idle_threshold_pct
    }

    /// CPU millicores publishable under fallback: allocatable minus the
    /// reserve kept for GPU data-loading bursts.
    fn fallback_headroom(&self, node: &NodeInfo) -> i64 {
        (node.cpu_capacity_milli as f64
            * (100.0 - self.ctx.config.gpu.cpu_headroom_reserve_pct)
            / 100.0) as i64
    }

    /// Spare CPU on an active GPU node after requests and the reserve.
    fn scavenge_headroom(&self, node: &NodeInfo) -> i64 {
        self.fallback_headroom(node) - node.cpu_requested_milli
    }

    fn fallback_enabled(node: &NodeInfo) -> bool {
        node.node
            .meta
            .annotations
            .get(ANNOTATION_GPU_FALLBACK)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    fn scavenging_enabled(node: &NodeInfo) -> bool {
        node.node
            .meta
            .labels
            .get(LABEL_CPU_SCAVENGEABLE)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    fn action_rec(
        &self,
        node: &NodeInfo,
        action: &str,
        summary: String,
        auto: bool,
        priority: Priority,
    ) -> Recommendation {
        Recommendation::new(
            RecommendationKind::GpuOptimize,
            priority,
            Target::cluster("Node", node.name()),
        )
        .with_summary(summary)
        .auto_executable(auto)
        .with_impact(EstimatedImpact {
            nodes_affected: 1,
            pods_affected: 0,
            monthly_cost_change_usd: 0.0,
            risk: RiskLevel::Low,
        })
        .with_detail("action", action)
        .with_detail("node", node.name())
    }

    /// Whether the rest of the fleet can absorb the CPU pods currently on
    /// a fallback node, which gates auto-disable.
    fn fleet_can_absorb(&self, snapshot: &ClusterSnapshot, node: &NodeInfo) -> bool {
        let displaced: i64 = snapshot
            .pods_on(node.name())
            .iter()
            .filter(|p| !p.is_daemonset() && p.effective_requests().gpu.is_none())
            .map(|p| p.effective_requests().cpu_milli)
            .sum();
        let free: i64 = snapshot
            .nodes
            .iter()
            .filter(|n| n.name() != node.name() && !n.node.unschedulable && n.node.is_ready())
            .map(|n| (n.cpu_capacity_milli - n.cpu_requested_milli).max(0))
            .sum();
        free >= displaced
    }
}

#[async_trait]
impl Controller for GpuOptimizer {
    fn name(&self) -> &'static str {
        "gpu-optimizer"
    }

    async fn analyze(&self, snapshot: &ClusterSnapshot) -> Result<Vec<Recommendation>> {
        let config = &self.ctx.config.gpu;
        let mut recommendations = Vec::new();
        let now = Utc::now();
        let mut idle_since = self.idle_since.lock();

        for node in snapshot.nodes.iter().filter(|n| n.gpus > 0) {
            // invariant: CPU pods must never request the GPU resource, even
            // with a zero quantity, or the device plugin will pin them
            for pod in snapshot.pods_on(node.name()) {
                let explicit_zero = pod
                    .spec
                    .containers
                    .iter()
                    .chain(pod.spec.init_containers.iter())
                    .any(|c| c.requests.gpu == Some(0));
                if explicit_zero {
                    recommendations.push(
                        self.action_rec(
                            node,
                            "fix-zero-gpu-request",
                            format!(
                                "Pod {} requests an explicit zero GPU on {}; remove the resource entry",
                                pod.key(),
                                node.name()
                            ),
                            false,
                            Priority::High,
                        ),
                    );
                }
            }

            if self.is_idle(node) {
                let since = *idle_since.entry(node.name().to_string()).or_insert(now);
                let idle_for = (now - since)
                    .to_std()
                    .unwrap_or_default();
                if Self::fallback_enabled(node) || Self::scavenging_enabled(node) {
                    continue;
                }
                if idle_for >= config.idle_duration() {
                    let headroom = self.fallback_headroom(node);
                    recommendations.push(
                        self.action_rec(
                            node,
                            "enable-fallback",
                            format!(
                                "GPU node {} idle for {}m; open {}m CPU to general workloads",
                                node.name(),
                                idle_for.as_secs() / 60,
                                headroom
                            ),
                            true,
                            Priority::Medium,
                        )
                        .with_detail("headroom_milli", headroom.to_string()),
                    );
                } else {
                    debug!(node = node.name(), "GPU node idle, watching");
                }
                continue;
            }

            // active node
            idle_since.remove(node.name());
            if Self::fallback_enabled(node) {
                // GPUs are claimed again; close the node to CPU workloads if
                // the fleet can take the displaced pods
                if self.fleet_can_absorb(snapshot, node) {
                    recommendations.push(self.action_rec(
                        node,
                        "disable-fallback",
                        format!("GPUs reclaimed on {}; restoring the GPU taint", node.name()),
                        true,
                        Priority::High,
                    ));
                } else {
                    recommendations.push(self.action_rec(
                        node,
                        "fallback-stuck",
                        format!(
                            "GPUs reclaimed on {} but the fleet cannot absorb its CPU pods",
                            node.name()
                        ),
                        false,
                        Priority::High,
                    ));
                }
                continue;
            }

            // scavenging on active nodes only
            let headroom = self.scavenge_headroom(node);
            let threshold = config.scavenging_cpu_threshold_millis;
            if Self::scavenging_enabled(node) {
                let published: i64 = node
                    .node
                    .meta
                    .annotations
                    .get(ANNOTATION_CPU_HEADROOM)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                if headroom < threshold {
                    recommendations.push(self.action_rec(
                        node,
                        "disable-scavenging",
                        format!("Headroom on {} fell to {}m; closing to scavengers", node.name(), headroom),
                        true,
                        Priority::Medium,
                    ));
                } else if published > 0
                    && ((headroom - published).abs() as f64 / published as f64) > HEADROOM_DRIFT
                {
                    recommendations.push(
                        self.action_rec(
                            node,
                            "update-scavenging",
                            format!(
                                "Headroom on {} drifted from {published}m to {headroom}m",
                                node.name()
                            ),
                            true,
                            Priority::Low,
                        )
                        .with_detail("headroom_milli", headroom.to_string()),
                    );
                }
            } else if headroom >= threshold {
                recommendations.push(
                    self.action_rec(
                        node,
                        "enable-scavenging",
                        format!(
                            "Active GPU node {} has {}m spare CPU; admit low-priority pods",
                            node.name(),
                            headroom
                        ),
                        true,
                        Priority::Low,
                    )
                    .with_detail("headroom_milli", headroom.to_string()),
                );
            }
        }
        Ok(recommendations)
    }

    async fn execute(&self, rec: &Recommendation) -> Result<bool> {
        let clearance = self.ctx.clearance(self.name(), rec).await;
        let _lock = match clearance {
            Clearance::Skip(_) => return Ok(false),
            Clearance::Proceed { lock } => lock,
        };
        let node = rec
            .details
            .get("node")
            .cloned()
            .ok_or_else(|| OptimizerError::Orchestrator("missing node detail".into()))?;
        let orchestrator = self.ctx.state.orchestrator();
        let action = rec.details.get("action").map(String::as_str).unwrap_or("");
        match action {
            "enable-fallback" => {
                orchestrator.remove_node_taint(&node, TAINT_GPU).await?;
                let mut annotations = BTreeMap::new();
                annotations.insert(ANNOTATION_GPU_FALLBACK.to_string(), Some("true".to_string()));
                annotations.insert(
                    ANNOTATION_CPU_HEADROOM.to_string(),
                    rec.details.get("headroom_milli").cloned(),
                );
                orchestrator.annotate_node(&node, &annotations).await?;
                self.ctx.state.audit().record(
                    "gpu-fallback-enabled",
                    node.clone(),
                    self.name(),
                    rec.summary.clone(),
                );
                info!(node, "GPU fallback enabled");
            }
            "disable-fallback" => {
                orchestrator
                    .add_node_taint(
                        &node,
                        Taint {
                            key: TAINT_GPU.to_string(),
                            value: "present".to_string(),
                            effect: TaintEffect::NoSchedule,
                        },
                    )
                    .await?;
                let mut annotations = BTreeMap::new();
                annotations.insert(ANNOTATION_GPU_FALLBACK.to_string(), None);
                annotations.insert(ANNOTATION_CPU_HEADROOM.to_string(), None);
                orchestrator.annotate_node(&node, &annotations).await?;
                self.ctx.state.audit().record(
                    "gpu-fallback-disabled",
                    node.clone(),
                    self.name(),
                    rec.summary.clone(),
                );
                info!(node, "GPU fallback disabled");
            }
            "enable-scavenging" | "update-scavenging" => {
                let mut labels = BTreeMap::new();
                labels.insert(
                    LABEL_CPU_SCAVENGEABLE.to_string(),
                    Some("true".to_string()),
                );
                orchestrator.label_node(&node, &labels).await?;
                let mut annotations = BTreeMap::new();
                annotations.insert(
                    ANNOTATION_CPU_HEADROOM.to_string(),
                    rec.details.get("headroom_milli").cloned(),
                );
                orchestrator.annotate_node(&node, &annotations).await?;
                self.ctx.state.audit().record(
                    "cpu-scavenging-published",
                    node.clone(),
                    self.name(),
                    rec.summary.clone(),
                );
            }
            "disable-scavenging" => {
                let mut labels = BTreeMap::new();
                labels.insert(LABEL_CPU_SCAVENGEABLE.to_string(), None);
                orchestrator.label_node(&node, &labels).await?;
                let mut annotations = BTreeMap::new();
                annotations.insert(ANNOTATION_CPU_HEADROOM.to_string(), None);
                orchestrator.annotate_node(&node, &annotations).await?;
                self.ctx.state.audit().record(
                    "cpu-scavenging-withdrawn",
                    node.clone(),
                    self.name(),
                    rec.summary.clone(),
                );
            }
            other => {
                warn!(action = other, "advisory GPU action; nothing to execute");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enginetest::context_with_defaults;
    use crate::testutil::{node_info, pod_info, snapshot_of};

    fn gpu_node(name: &str, gpus: i64, used: i64) -> NodeInfo {
        let mut node = node_info(name, 16000, 64 << 30);
        node.gpus = gpus;
        node.node.capacity.gpus = gpus;
        node.gpus_used = used;
        node
    }

    #[tokio::test]
    async fn idle_gpu_node_needs_dwell_time_before_fallback() {
        let ctx = Arc::new(context_with_defaults());
        let optimizer = GpuOptimizer::new(ctx);
        let snapshot = snapshot_of(vec![gpu_node("gpu-1", 4, 0)], vec![]);
        // first observation starts the idle clock; no rec yet
        let recs = optimizer.analyze(&snapshot).await.unwrap();
        assert!(recs.iter().all(|r| r.details.get("action").map(String::as_str)
            != Some("enable-fallback")));

        // backdate the idle clock past the configured dwell
        optimizer.idle_since.lock().insert(
            "gpu-1".to_string(),
            Utc::now() - chrono::Duration::hours(2),
        );
        let recs = optimizer.analyze(&snapshot).await.unwrap();
        let fallback = recs
            .iter()
            .find(|r| r.details.get("action").map(String::as_str) == Some("enable-fallback"))
            .expect("fallback rec");
        // 30% reserve on 16000m leaves 11200m
        assert_eq!(fallback.details.get("headroom_milli").unwrap(), "11200");
    }

    #[tokio::test]
    async fn active_gpu_node_with_headroom_is_scavengeable() {
        let ctx = Arc::new(context_with_defaults());
        let optimizer = GpuOptimizer::new(ctx);
        let snapshot = snapshot_of(vec![gpu_node("gpu-1", 4, 4)], vec![]);
        let recs = optimizer.analyze(&snapshot).await.unwrap();
        let scavenge = recs
            .iter()
            .find(|r| r.details.get("action").map(String::as_str) == Some("enable-scavenging"))
            .expect("scavenging rec");
        assert_eq!(scavenge.details.get("headroom_milli").unwrap(), "11200");
    }

    #[tokio::test]
    async fn fallback_node_is_never_scavenged() {
        let ctx = Arc::new(context_with_defaults());
        let optimizer = GpuOptimizer::new(ctx);
        let mut node = gpu_node("gpu-1", 4, 0);
        node.node
            .meta
            .annotations
            .insert(ANNOTATION_GPU_FALLBACK.into(), "true".into());
        let snapshot = snapshot_of(vec![node], vec![]);
        let recs = optimizer.analyze(&snapshot).await.unwrap();
        assert!(recs
            .iter()
            .all(|r| !r.details.get("action").map(String::as_str).unwrap_or("").contains("scaveng")));
    }

    #[tokio::test]
    async fn zero_gpu_request_is_flagged() {
        let ctx = Arc::new(context_with_defaults());
        let optimizer = GpuOptimizer::new(ctx);
        let mut offender = pod_info("default", "sneaky", "gpu-1", 100, 1 << 30);
        offender.pod.spec.containers[0].requests.gpu = Some(0);
        let snapshot = snapshot_of(vec![gpu_node("gpu-1", 4, 4)], vec![offender]);
        let recs = optimizer.analyze(&snapshot).await.unwrap();
        assert!(recs.iter().any(|r| {
            r.details.get("action").map(String::as_str) == Some("fix-zero-gpu-request")
                && r.priority == Priority::High
        }));
    }

    #[tokio::test]
    async fn reclaimed_gpus_close_fallback_when_fleet_has_room() {
        let ctx = Arc::new(context_with_defaults());
        let optimizer = GpuOptimizer::new(ctx);
        let mut node = gpu_node("gpu-1", 4, 4);
        node.node
            .meta
            .annotations
            .insert(ANNOTATION_GPU_FALLBACK.into(), "true".into());
        let spare = node_info("cpu-1", 16000, 64 << 30);
        let snapshot = snapshot_of(
            vec![node, spare],
            vec![pod_info("default", "cpu-pod", "gpu-1", 2000, 4 << 30)],
        );
        let recs = optimizer.analyze(&snapshot).await.unwrap();
        assert!(recs
            .iter()
            .any(|r| r.details.get("action").map(String::as_str) == Some("disable-fallback")));
    }
}
