//! Rightsizer
//!
//! Percentile-driven request tuning: the analyzer reduces each pod's metric
//! history to a `PodAnalysis`, the recommender turns analyses into request
//! changes, the OOM tracker escalates memory after kills, and the actuator
//! applies changes, in-place when the orchestrator supports pod resize and
//! through the owning workload's template otherwise.

use crate::cloud::{UnitCosts, HOURS_PER_MONTH};
use crate::engine::{Clearance, Controller, EngineContext};
use crate::error::{OptimizerError, Result};
use crate::metrics::SeriesKey;
use crate::model::{
    deployment_for_replicaset, EstimatedImpact, Priority, Recommendation, RecommendationKind,
    ResourceRequests, RiskLevel, Target,
};
use crate::state::{ClusterSnapshot, PodInfo};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Smallest CPU request the recommender will suggest.
const MIN_CPU_MILLI: i64 = 10;
/// Smallest memory request the recommender will suggest.
const MIN_MEMORY_BYTES: i64 = 32 * 1024 * 1024;
/// Headroom factor applied on top of the p95.
const P95_HEADROOM: f64 = 1.2;
/// Headroom factor applied on top of the max for under-provisioned CPU.
const MAX_HEADROOM: f64 = 1.3;
/// Minimum samples before the recommender will act.
const MIN_DATA_POINTS: usize = 6;

/// Aggregated view of one pod's resource behavior
#[derive(Debug, Clone)]
pub struct PodAnalysis {
    /// Namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Largest container, which receives request changes
    pub container: String,
    /// Workload owner as `(kind, name)`, post RS→Deployment resolution
    pub owner: Option<(String, String)>,
    /// Sibling replicas
    pub replicas: i32,
    /// Current effective CPU request in millicores
    pub cpu_request_milli: i64,
    /// Current effective memory request in bytes
    pub memory_request_bytes: i64,
    /// p95 CPU over the lookback window
    pub p95_cpu_milli: f64,
    /// p95 memory over the lookback window
    pub p95_memory_bytes: f64,
    /// Max CPU over the lookback window
    pub max_cpu_milli: f64,
    /// Samples behind the percentiles
    pub data_points: usize,
    /// CPU request is far above observed use
    pub over_provisioned_cpu: bool,
    /// Memory request is far above observed use
    pub over_provisioned_memory: bool,
    /// CPU use is pressing against the request
    pub under_provisioned_cpu: bool,
}

/// P95-driven request recommender
pub struct Rightsizer {
    ctx: Arc<EngineContext>,
}

impl Rightsizer {
    /// Build the controller.
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    fn hpa_managed(&self, snapshot: &ClusterSnapshot, info: &PodInfo) -> bool {
        let Some((kind, name)) = resolved_owner(info) else {
            return false;
        };
        snapshot.hpas.iter().any(|hpa| {
            hpa.meta.namespace == info.pod.meta.namespace
                && hpa.target_kind == kind
                && hpa.target_name == name
        })
    }

    /// Analyze one pod against its metric history.
    pub fn analyze_pod(&self, info: &PodInfo) -> Option<PodAnalysis> {
        let config = &self.ctx.config.rightsizer;
        let lookback = config.lookback_window();

        let container = info
            .pod
            .spec
            .containers
            .iter()
            .max_by_key(|c| c.requests.cpu_milli)?
            .name
            .clone();

        // Sum window percentiles across containers; a pod-level view is what
        // the request change is sized against.
        let mut p95_cpu = 0.0;
        let mut p95_mem = 0.0;
        let mut max_cpu = 0.0;
        let mut data_points = 0usize;
        for c in &info.pod.spec.containers {
            let key = SeriesKey::new(&info.pod.meta.namespace, &info.pod.meta.name, &c.name);
            if let Some(window) = self.ctx.state.metrics().pod_window(&key, lookback) {
                p95_cpu += window.cpu.p95;
                p95_mem += window.memory.p95;
                max_cpu += window.cpu.max;
                data_points = data_points.max(window.data_points);
            }
        }
        if data_points == 0 {
            // no window data: fall back to the point-in-time usage
            p95_cpu = info.cpu_usage_milli;
            p95_mem = info.memory_usage_bytes;
            max_cpu = info.cpu_usage_milli;
        }

        let cpu_request = info.cpu_request_milli;
        let mem_request = info.memory_request_bytes;
        let over_bar_cpu = 0.5 * (config.cpu_target_util_pct / 100.0);
        let over_bar_mem = 0.5 * (config.memory_target_util_pct / 100.0);
        let over_cpu = cpu_request > 0 && p95_cpu / (cpu_request as f64) < over_bar_cpu;
        let over_mem = mem_request > 0 && p95_mem / (mem_request as f64) < over_bar_mem;
        let under_cpu = cpu_request > 0 && p95_cpu / cpu_request as f64 > 0.95;

        Some(PodAnalysis {
            namespace: info.pod.meta.namespace.clone(),
            pod: info.pod.meta.name.clone(),
            container,
            owner: resolved_owner(info),
            replicas: info.replicas,
            cpu_request_milli: cpu_request,
            memory_request_bytes: mem_request,
            p95_cpu_milli: p95_cpu,
            p95_memory_bytes: p95_mem,
            max_cpu_milli: max_cpu,
            data_points,
            over_provisioned_cpu: over_cpu,
            over_provisioned_memory: over_mem,
            under_provisioned_cpu: under_cpu,
        })
    }

    /// Turn an analysis into recommendations.
    pub fn recommend(&self, analysis: &PodAnalysis) -> Vec<Recommendation> {
        if analysis.data_points < MIN_DATA_POINTS {
            return Vec::new();
        }
        let unit = UnitCosts::for_vendor(self.ctx.state.cloud().vendor());
        let mut recommendations = Vec::new();

        if analysis.over_provisioned_cpu {
            let suggested =
                ((analysis.p95_cpu_milli * P95_HEADROOM) as i64).max(MIN_CPU_MILLI);
            if suggested < analysis.cpu_request_milli {
                let saving = (analysis.cpu_request_milli - suggested) as f64 / 1000.0
                    * f64::from(analysis.replicas)
                    * unit.vcpu_hour_usd
                    * HOURS_PER_MONTH;
                recommendations.push(self.request_change_rec(
                    analysis,
                    "cpu",
                    analysis.cpu_request_milli,
                    suggested,
                    ResourceRequests {
                        cpu_milli: suggested,
                        memory_bytes: analysis.memory_request_bytes,
                        gpu: None,
                    },
                    Priority::Medium,
                    saving,
                ));
            }
        }
        if analysis.over_provisioned_memory {
            let suggested =
                ((analysis.p95_memory_bytes * P95_HEADROOM) as i64).max(MIN_MEMORY_BYTES);
            if suggested < analysis.memory_request_bytes {
                let saving = (analysis.memory_request_bytes - suggested) as f64
                    / (1024.0 * 1024.0 * 1024.0)
                    * f64::from(analysis.replicas)
                    * unit.gib_hour_usd
                    * HOURS_PER_MONTH;
                recommendations.push(self.request_change_rec(
                    analysis,
                    "memory",
                    analysis.memory_request_bytes,
                    suggested,
                    ResourceRequests {
                        cpu_milli: analysis.cpu_request_milli,
                        memory_bytes: suggested,
                        gpu: None,
                    },
                    Priority::Medium,
                    saving,
                ));
            }
        }
        if analysis.under_provisioned_cpu {
            let suggested = (analysis.max_cpu_milli * MAX_HEADROOM) as i64;
            if suggested > analysis.cpu_request_milli {
                recommendations.push(self.request_change_rec(
                    analysis,
                    "cpu",
                    analysis.cpu_request_milli,
                    suggested,
                    ResourceRequests {
                        cpu_milli: suggested,
                        memory_bytes: analysis.memory_request_bytes,
                        gpu: None,
                    },
                    Priority::High,
                    0.0,
                ));
            }
        }
        recommendations
    }

    #[allow(clippy::too_many_arguments)]
    fn request_change_rec(
        &self,
        analysis: &PodAnalysis,
        resource: &str,
        current: i64,
        suggested: i64,
        requests: ResourceRequests,
        priority: Priority,
        monthly_saving: f64,
    ) -> Recommendation {
        let target = match &analysis.owner {
            Some((kind, name)) => {
                Target::namespaced(kind.clone(), analysis.namespace.clone(), name.clone())
            }
            None => Target::namespaced("Pod", analysis.namespace.clone(), analysis.pod.clone()),
        };
        let mut rec = Recommendation::new(RecommendationKind::PodRightsize, priority, target)
            .with_summary(format!(
                "Rightsize {resource} of {}/{} from {current} to {suggested}",
                analysis.namespace, analysis.pod
            ))
            .with_step(format!(
                "Set {resource} request of container {} to {suggested}",
                analysis.container
            ))
            .auto_executable(true)
            .with_impact(EstimatedImpact {
                nodes_affected: 0,
                pods_affected: analysis.replicas as u32,
                monthly_cost_change_usd: -monthly_saving,
                risk: RiskLevel::Low,
            })
            .with_detail("pod", analysis.pod.clone())
            .with_detail("container", analysis.container.clone())
            .with_detail("resource", resource)
            .with_detail("current_request", current.to_string())
            .with_detail("suggested_request", suggested.to_string())
            .with_detail("suggested_cpu_milli", requests.cpu_milli.to_string())
            .with_detail(
                "suggested_memory_bytes",
                requests.memory_bytes.to_string(),
            )
            .with_detail("data_points", analysis.data_points.to_string());
        if monthly_saving > 0.0 {
            rec = rec.with_monthly_saving(monthly_saving);
        }
        rec
    }

    /// Critical memory bumps for recently OOM-killed containers.
    pub fn oom_recommendations(&self, info: &PodInfo) -> Vec<Recommendation> {
        let multiplier = self.ctx.config.rightsizer.oom_bump_multiplier;
        let mut recommendations = Vec::new();
        for status in &info.pod.status.container_statuses {
            if status.last_termination_reason.as_deref() != Some("OOMKilled") {
                continue;
            }
            let Some(container) = info
                .pod
                .spec
                .containers
                .iter()
                .find(|c| c.name == status.name)
            else {
                continue;
            };
            let current = container.requests.memory_bytes;
            // floor at the current request so a misconfigured multiplier can
            // never shrink an OOMing container
            let suggested = ((current as f64 * multiplier) as i64).max(current);
            let target = match resolved_owner(info) {
                Some((kind, name)) => {
                    Target::namespaced(kind, info.pod.meta.namespace.clone(), name)
                }
                None => Target::namespaced(
                    "Pod",
                    info.pod.meta.namespace.clone(),
                    info.pod.meta.name.clone(),
                ),
            };
            recommendations.push(
                Recommendation::new(RecommendationKind::PodRightsize, Priority::Critical, target)
                    .with_summary(format!(
                        "OOMKilled: bump memory of {}/{} container {} from {current} to {suggested}",
                        info.pod.meta.namespace, info.pod.meta.name, status.name
                    ))
                    .with_step(format!(
                        "Set memory request of container {} to {suggested}",
                        status.name
                    ))
                    .auto_executable(true)
                    .with_impact(EstimatedImpact {
                        nodes_affected: 0,
                        pods_affected: info.replicas as u32,
                        monthly_cost_change_usd: 0.0,
                        risk: RiskLevel::Low,
                    })
                    .with_detail("pod", info.pod.meta.name.clone())
                    .with_detail("container", status.name.clone())
                    .with_detail("resource", "memory")
                    .with_detail("oom", "true")
                    .with_detail("current_request", current.to_string())
                    .with_detail("suggested_request", suggested.to_string())
                    .with_detail(
                        "suggested_cpu_milli",
                        container.requests.cpu_milli.to_string(),
                    )
                    .with_detail("suggested_memory_bytes", suggested.to_string()),
            );
        }
        recommendations
    }
}

/// Owner tuple with the ReplicaSet hop resolved by naming convention.
fn resolved_owner(info: &PodInfo) -> Option<(String, String)> {
    let kind = info.owner_kind.as_deref()?;
    let name = info.owner_name.as_deref()?;
    match kind {
        "ReplicaSet" => match deployment_for_replicaset(name) {
            Some(deployment) => Some(("Deployment".to_string(), deployment.to_string())),
            None => Some(("ReplicaSet".to_string(), name.to_string())),
        },
        _ => Some((kind.to_string(), name.to_string())),
    }
}

#[async_trait]
impl Controller for Rightsizer {
    fn name(&self) -> &'static str {
        "rightsizer"
    }

    async fn analyze(&self, snapshot: &ClusterSnapshot) -> Result<Vec<Recommendation>> {
        let excluded = &self.ctx.config.rightsizer.exclude_namespaces;
        let mut recommendations = Vec::new();
        for info in &snapshot.pods {
            if excluded.contains(&info.pod.meta.namespace) || info.pod.is_completed() {
                continue;
            }
            if self.hpa_managed(snapshot, info) {
                debug!(pod = %info.key(), "skipped: HPA-managed workload");
                continue;
            }
            recommendations.extend(self.oom_recommendations(info));
            if let Some(analysis) = self.analyze_pod(info) {
                recommendations.extend(self.recommend(&analysis));
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
        let namespace = rec
            .target
            .namespace
            .clone()
            .ok_or_else(|| OptimizerError::Orchestrator("rightsize target not namespaced".into()))?;
        let pod = rec
            .details
            .get("pod")
            .cloned()
            .ok_or_else(|| OptimizerError::Orchestrator("missing pod detail".into()))?;
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

        // In-place resize first; the workload patch is the fallback.
        let orchestrator = self.ctx.state.orchestrator();
        if orchestrator
            .resize_pod_in_place(&namespace, &pod, &container, requests)
            .await
            .is_ok()
        {
            self.ctx.state.audit().record(
                "rightsize-in-place",
                format!("{namespace}/{pod}"),
                self.name(),
                rec.summary.clone(),
            );
            info!(pod = %format!("{namespace}/{pod}"), "in-place resize applied");
            return Ok(true);
        }

        orchestrator
            .patch_workload_requests(
                &namespace,
                &rec.target.kind,
                &rec.target.name,
                &container,
                requests,
            )
            .await?;
        self.ctx.state.audit().record(
            "rightsize-patch",
            format!("{namespace}/{}", rec.target.name),
            self.name(),
            rec.summary.clone(),
        );
        info!(
            workload = %format!("{namespace}/{}", rec.target.name),
            kind = %rec.target.kind,
            "workload template patched"
        );
        Ok(true)
    }
}
