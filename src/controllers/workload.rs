//! Workload scaler
//!
//! Four cooperating policies over workloads: HPA max-replica bumps when a
//! workload is pinned at its ceiling, vertical request reductions for
//! over-requested pods, an EMA-based surge detector, and a coordinator that
//! defers horizontal changes whenever a vertical change targets the same
//! workload in the same pass: the vertical change lands first, and the
//! horizontal case is re-evaluated next cycle.

use crate::engine::{Clearance, Controller, EngineContext};
use crate::error::{OptimizerError, Result};
use crate::model::{
    deployment_for_replicaset, EstimatedImpact, Priority, Recommendation, RecommendationKind,
    ResourceRequests, RiskLevel, Target,
};
use crate::state::{ClusterSnapshot, PodInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Smallest vertical CPU suggestion.
const MIN_VERTICAL_CPU_MILLI: i64 = 50;
/// Smallest vertical memory suggestion.
const MIN_VERTICAL_MEMORY_BYTES: i64 = 64 * 1024 * 1024;
/// EMA weight of the old baseline.
const BASELINE_DECAY: f64 = 0.9;

/// HPA/VPA coordinator
pub struct WorkloadScaler {
    ctx: Arc<EngineContext>,
    /// EMA of per-workload CPU usage, updated only outside surges
    baselines: Mutex<HashMap<String, f64>>,
}

impl WorkloadScaler {
    /// Build the controller.
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            baselines: Mutex::new(HashMap::new()),
        }
    }

    fn plan_horizontal(&self, snapshot: &ClusterSnapshot) -> Vec<Recommendation> {
        let config = &self.ctx.config.workload;
        let mut recommendations = Vec::new();
        for hpa in &snapshot.hpas {
            if hpa.current_replicas < hpa.max_replicas {
                continue;
            }
            let new_max = (((hpa.max_replicas as f64) * 1.5).ceil() as i32)
                .min(config.max_replicas_limit);
            if new_max <= hpa.max_replicas {
                continue;
            }
            recommendations.push(
                Recommendation::new(
                    RecommendationKind::WorkloadScale,
                    Priority::High,
                    Target::namespaced(
                        hpa.target_kind.clone(),
                        hpa.meta.namespace.clone(),
                        hpa.target_name.clone(),
                    ),
                )
                .with_summary(format!(
                    "{}/{} is pinned at maxReplicas={}; raise to {new_max}",
                    hpa.meta.namespace, hpa.target_name, hpa.max_replicas
                ))
                .with_step(format!(
                    "Patch HPA {}/{} spec.maxReplicas to {new_max}",
                    hpa.meta.namespace, hpa.meta.name
                ))
                .auto_executable(config.surge_mode)
                .with_impact(EstimatedImpact {
                    nodes_affected: 0,
                    pods_affected: (new_max - hpa.max_replicas) as u32,
                    monthly_cost_change_usd: 0.0,
                    risk: RiskLevel::Medium,
                })
                .with_detail("direction", "horizontal")
                .with_detail("hpa", hpa.meta.name.clone())
                .with_detail("new_max", new_max.to_string()),
            );
        }
        recommendations
    }

    fn plan_vertical(&self, snapshot: &ClusterSnapshot) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();
        for info in &snapshot.pods {
            if info.pod.is_completed() || info.pod.is_daemonset() {
                continue;
            }
            let cpu_low = info.cpu_request_milli > 100
                && info.cpu_usage_milli / (info.cpu_request_milli as f64) < 0.30;
            let mem_low = info.memory_request_bytes > MIN_VERTICAL_MEMORY_BYTES
                && info.memory_usage_bytes / (info.memory_request_bytes as f64) < 0.30;
            if !cpu_low && !mem_low {
                continue;
            }
            let suggested_cpu = if cpu_low {
                ((info.cpu_usage_milli * 1.3) as i64).max(MIN_VERTICAL_CPU_MILLI)
            } else {
                info.cpu_request_milli
            };
            let suggested_mem = if mem_low {
                ((info.memory_usage_bytes * 1.3) as i64).max(MIN_VERTICAL_MEMORY_BYTES)
            } else {
                info.memory_request_bytes
            };
            let Some(container) = info.pod.spec.containers.first() else {
                continue;
            };
            let target = owner_target(info);
            recommendations.push(
                Recommendation::new(RecommendationKind::WorkloadScale, Priority::Medium, target)
                    .with_summary(format!(
                        "Shrink requests of {} (cpu {} → {suggested_cpu}m, mem {} → {suggested_mem})",
                        info.key(),
                        info.cpu_request_milli,
                        info.memory_request_bytes
                    ))
                    .with_step("Lower container requests toward observed usage".to_string())
                    .auto_executable(true)
                    .with_detail("direction", "vertical")
                    .with_detail("resource", if cpu_low { "cpu" } else { "memory" })
                    .with_detail("pod", info.pod.meta.name.clone())
                    .with_detail("container", container.name.clone())
                    .with_detail("suggested_cpu_milli", suggested_cpu.to_string())
                    .with_detail("suggested_memory_bytes", suggested_mem.to_string()),
            );
        }
        recommendations
    }

    fn plan_surges(&self, snapshot: &ClusterSnapshot) -> Vec<Recommendation> {
        let threshold = self.ctx.config.workload.surge_threshold;
        // current per-workload CPU usage
        let mut usage: HashMap<String, (f64, Target)> = HashMap::new();
        for info in &snapshot.pods {
            if info.pod.is_completed() || info.owner_name.is_none() {
                continue;
            }
            let target = owner_target(info);
            let key = format!(
                "{}/{}/{}",
                target.namespace.clone().unwrap_or_default(),
                target.kind,
                target.name
            );
            let entry = usage.entry(key).or_insert((0.0, target));
            entry.0 += info.cpu_usage_milli;
        }

        let mut recommendations = Vec::new();
        let mut baselines = self.baselines.lock();
        for (key, (current, target)) in usage {
            match baselines.get(&key).copied() {
                Some(baseline) if baseline > 0.0 && current / baseline >= threshold => {
                    debug!(workload = %key, current, baseline, "surge detected");
                    recommendations.push(
                        Recommendation::new(
                            RecommendationKind::WorkloadScale,
                            Priority::Critical,
                            target,
                        )
                        .with_summary(format!(
                            "Load surge on {key}: {current:.0}m CPU vs {baseline:.0}m baseline"
                        ))
                        .with_step("Scale the workload out ahead of saturation".to_string())
                        .auto_executable(false)
                        .with_detail("direction", "horizontal")
                        .with_detail("surge", "true")
                        .with_detail("baseline_cpu_milli", format!("{baseline:.0}")),
                    );
                    // the baseline is deliberately NOT updated during a surge
                }
                Some(baseline) => {
                    baselines.insert(key, BASELINE_DECAY * baseline + (1.0 - BASELINE_DECAY) * current);
                }
                None => {
                    baselines.insert(key, current);
                }
            }
        }
        recommendations
    }

    /// Defer horizontal changes that collide with vertical ones.
    fn coordinate(recommendations: &mut [Recommendation]) {
        let vertical_targets: HashSet<(Option<String>, String)> = recommendations
            .iter()
            .filter(|r| r.details.get("direction").map(String::as_str) == Some("vertical"))
            .map(|r| (r.target.namespace.clone(), r.target.name.clone()))
            .collect();
        for rec in recommendations.iter_mut() {
            if rec.details.get("direction").map(String::as_str) == Some("horizontal")
                && vertical_targets.contains(&(rec.target.namespace.clone(), rec.target.name.clone()))
            {
                rec.details.insert("deferred".to_string(), "true".to_string());
                rec.auto_executable = false;
            }
        }
    }
}

fn owner_target(info: &PodInfo) -> Target {
    match (info.owner_kind.as_deref(), info.owner_name.as_deref()) {
        (Some("ReplicaSet"), Some(name)) => match deployment_for_replicaset(name) {
            Some(deploy) => {
                Target::namespaced("Deployment", info.pod.meta.namespace.clone(), deploy)
            }
            None => Target::namespaced("ReplicaSet", info.pod.meta.namespace.clone(), name),
        },
        (Some(kind), Some(name)) => {
            Target::namespaced(kind, info.pod.meta.namespace.clone(), name)
        }
        _ => Target::namespaced("Pod", info.pod.meta.namespace.clone(), info.pod.meta.name.clone()),
    }
}

#[async_trait]
impl Controller for WorkloadScaler {
    fn name(&self) -> &'static str {
        "workload-scaler"
    }

    async fn analyze(&self, snapshot: &ClusterSnapshot) -> Result<Vec<Recommendation>> {
        let mut recommendations = self.plan_horizontal(snapshot);
        recommendations.extend(self.plan_vertical(snapshot));
        recommendations.extend(self.plan_surges(snapshot));
        Self::coordinate(&mut recommendations);
        Ok(recommendations)
    }

    async fn execute(&self, rec: &Recommendation) -> Result<bool> {
        let clearance = self.ctx.clearance(self.name(), rec).await;
        let _lock = match clearance {
            Clearance::Skip(_) => return Ok(false),
            Clearance::Proceed { lock } => lock,
        };
        let namespace = rec
            .target
            .namespace
            .clone()
            .ok_or_else(|| OptimizerError::Orchestrator("workload target not namespaced".into()))?;
        match rec.details.get("direction").map(String::as_str) {
            Some("horizontal") => {
                let hpa = rec
                    .details
                    .get("hpa")
                    .cloned()
                    .ok_or_else(|| OptimizerError::Orchestrator("missing hpa detail".into()))?;
                let new_max: i32 = rec
                    .details
                    .get("new_max")
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| OptimizerError::Orchestrator("missing new_max detail".into()))?;
                self.ctx
                    .state
                    .orchestrator()
                    .patch_hpa_max_replicas(&namespace, &hpa, new_max)
                    .await?;
                self.ctx.state.audit().record(
                    "hpa-max-raise",
                    format!("{namespace}/{hpa}"),
                    self.name(),
                    format!("maxReplicas={new_max}"),
                );
                info!(hpa = %format!("{namespace}/{hpa}"), new_max, "HPA ceiling raised");
                Ok(true)
            }
            Some("vertical") => {
                let container = rec
                    .details
                    .get("container")
                    .cloned()
                    .ok_or_else(|| OptimizerError::Orchestrator("missing container detail".into()))?;
                let requests = ResourceRequests {
                    cpu_milli: rec
                        .details
                        .get("suggested_cpu_milli")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                    memory_bytes: rec
                        .details
                        .get("suggested_memory_bytes")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                    gpu: None,
                };
                self.ctx
                    .state
                    .orchestrator()
                    .patch_workload_requests(
                        &namespace,
                        &rec.target.kind,
                        &rec.target.name,
                        &container,
                        requests,
                    )
                    .await?;
                self.ctx.state.audit().record(
                    "vertical-resize",
                    format!("{namespace}/{}", rec.target.name),
                    self.name(),
                    rec.summary.clone(),
                );
                Ok(true)
            }
            other => {
                warn!(direction = ?other, "unknown workload-scale direction");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enginetest::context_with_defaults;
    use crate::model::{HorizontalPodAutoscaler, ObjectMeta};
    use crate::testutil::{owned_by, pod_info, snapshot_of};

    fn hpa(name: &str, target: &str, min: i32, max: i32, current: i32) -> HorizontalPodAutoscaler {
        HorizontalPodAutoscaler {
            meta: ObjectMeta {
                name: name.into(),
                namespace: "default".into(),
                ..Default::default()
            },
            target_kind: "Deployment".into(),
            target_name: target.into(),
            min_replicas: min,
            max_replicas: max,
            current_replicas: current,
        }
    }

    #[tokio::test]
    async fn hpa_at_max_gets_bumped_ceiling() {
        let ctx = Arc::new(context_with_defaults());
        let scaler = WorkloadScaler::new(ctx);
        let mut snapshot = snapshot_of(vec![], vec![]);
        snapshot.hpas = vec![hpa("web", "web", 1, 4, 4)];
        let recs = scaler.plan_horizontal(&snapshot);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].details.get("new_max").unwrap(), "6");
        // surge mode off: surfaced but never auto-applied
        assert!(!recs[0].auto_executable);
    }

    #[tokio::test]
    async fn hpa_below_max_is_ignored() {
        let ctx = Arc::new(context_with_defaults());
        let scaler = WorkloadScaler::new(ctx);
        let mut snapshot = snapshot_of(vec![], vec![]);
        snapshot.hpas = vec![hpa("web", "web", 1, 4, 2)];
        assert!(scaler.plan_horizontal(&snapshot).is_empty());
    }

    #[tokio::test]
    async fn coordinator_defers_colliding_horizontal() {
        let ctx = Arc::new(context_with_defaults());
        let scaler = WorkloadScaler::new(ctx);
        // vertical candidate: big request, low usage
        let mut info = owned_by(
            pod_info("default", "web-6d4cf56db6-x", "n1", 1000, 2 << 30),
            "ReplicaSet",
            "web-6d4cf56db6",
        );
        info.cpu_usage_milli = 100.0;
        info.memory_usage_bytes = 1e8;
        let mut snapshot = snapshot_of(vec![], vec![info]);
        snapshot.hpas = vec![hpa("web", "web", 1, 4, 4)];

        let recs = scaler.analyze(&snapshot).await.unwrap();
        let horizontal = recs
            .iter()
            .find(|r| r.details.get("direction").map(String::as_str) == Some("horizontal"))
            .expect("horizontal rec");
        let vertical = recs
            .iter()
            .find(|r| r.details.get("direction").map(String::as_str) == Some("vertical"))
            .expect("vertical rec");
        assert_eq!(horizontal.details.get("deferred").unwrap(), "true");
        assert!(!horizontal.auto_executable);
        assert!(vertical.auto_executable);
    }

    #[tokio::test]
    async fn surge_fires_and_freezes_baseline() {
        let ctx = Arc::new(context_with_defaults());
        let scaler = WorkloadScaler::new(ctx);
        let mut calm = owned_by(
            pod_info("default", "api-5b7f9c8d4f-a", "n1", 500, 1 << 30),
            "ReplicaSet",
            "api-5b7f9c8d4f",
        );
        calm.cpu_usage_milli = 100.0;
        let snapshot = snapshot_of(vec![], vec![calm.clone()]);
        assert!(scaler.plan_surges(&snapshot).is_empty(), "first pass seeds");

        let mut surging = calm.clone();
        surging.cpu_usage_milli = 400.0; // 4x baseline, threshold 2.0
        let snapshot = snapshot_of(vec![], vec![surging.clone()]);
        let recs = scaler.plan_surges(&snapshot);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].priority, Priority::Critical);

        // baseline was frozen during the surge: firing again still surges
        let snapshot = snapshot_of(vec![], vec![surging]);
        assert_eq!(scaler.plan_surges(&snapshot).len(), 1);
    }
}
