//! Shared cluster state and the refresh loop
//!
//! `ClusterState` owns the coordination substrate every controller shares:
//! the atomically published snapshot, the node-lock table, the per-controller
//! circuit breakers, the audit log, and the metrics store. The refresh loop
//! rebuilds the snapshot on the reconcile interval and runs an hourly
//! cleanup (store retention prune, metrics key-cap enforcement, stale-lock
//! expiry).

mod audit;
mod breaker;
mod node_lock;
mod snapshot;

pub use audit::AuditLog;
pub use breaker::{BreakerRegistry, CircuitState};
pub use node_lock::{NodeLockGuard, NodeLockTable};
pub use snapshot::{ClusterSnapshot, NodeInfo, PodInfo};

use crate::cloud::{CloudProvider, UnitCosts};
use crate::config::Config;
use crate::error::{OptimizerError, Result};
use crate::metrics::{MetricsStore, Sample, SeriesKey};
use crate::orchestrator::Orchestrator;
use crate::store::{Store, StoreWriter, WriteRecord};
use arc_swap::ArcSwap;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Hard ceiling on one snapshot rebuild.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared cluster state
pub struct ClusterState {
    orchestrator: Arc<dyn Orchestrator>,
    cloud: Arc<dyn CloudProvider>,
    metrics: Arc<MetricsStore>,
    locks: Arc<NodeLockTable>,
    breakers: Arc<BreakerRegistry>,
    audit: Arc<AuditLog>,
    store: Store,
    writer: StoreWriter,
    snapshot: ArcSwap<ClusterSnapshot>,
    retention: Duration,
}

impl ClusterState {
    /// Assemble the shared state.
    pub fn new(
        config: &Config,
        orchestrator: Arc<dyn Orchestrator>,
        cloud: Arc<dyn CloudProvider>,
        store: Store,
        writer: StoreWriter,
    ) -> Self {
        let metrics = Arc::new(MetricsStore::new(
            config.metrics.retention(),
            config.metrics.max_pod_series,
        ));
        let locks = Arc::new(NodeLockTable::new(config.node_lock_ttl()));
        let breakers = Arc::new(BreakerRegistry::new(5, Duration::from_secs(300)));
        let audit = Arc::new(AuditLog::new(1000, writer.clone()));
        Self {
            orchestrator,
            cloud,
            metrics,
            locks,
            breakers,
            audit,
            store,
            writer,
            snapshot: ArcSwap::from_pointee(ClusterSnapshot::default()),
            retention: config.store.retention(),
        }
    }

    /// Current snapshot. Readers hold the `Arc` for their tick.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.snapshot.load_full()
    }

    /// All nodes of the current snapshot.
    pub fn all_nodes(&self) -> Vec<NodeInfo> {
        self.snapshot.load().nodes.clone()
    }

    /// Node lock table.
    pub fn locks(&self) -> &Arc<NodeLockTable> {
        &self.locks
    }

    /// Circuit breaker registry.
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Audit log.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Metrics store.
    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    /// Persistent store handle.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Writer queue handle.
    pub fn writer(&self) -> &StoreWriter {
        &self.writer
    }

    /// Orchestrator handle.
    pub fn orchestrator(&self) -> &Arc<dyn Orchestrator> {
        &self.orchestrator
    }

    /// Cloud provider handle.
    pub fn cloud(&self) -> &Arc<dyn CloudProvider> {
        &self.cloud
    }

    /// Rebuild and publish the snapshot, bounded by the refresh timeout.
    pub async fn refresh(&self) -> Result<()> {
        match tokio::time::timeout(REFRESH_TIMEOUT, self.build_snapshot()).await {
            Ok(Ok(snapshot)) => {
                debug!(
                    nodes = snapshot.nodes.len(),
                    pods = snapshot.pods.len(),
                    groups = snapshot.node_groups.len(),
                    "snapshot published"
                );
                self.snapshot.store(Arc::new(snapshot));
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(OptimizerError::Timeout {
                operation: "snapshot refresh".to_string(),
            }),
        }
    }

    /// Hourly housekeeping: store retention, metrics caps, stale locks.
    pub async fn cleanup(&self) {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.retention).unwrap_or_else(|_| ChronoDuration::days(90));
        match self.store.prune_older_than(cutoff) {
            Ok(removed) if removed > 0 => info!(removed, "store retention prune"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "store retention prune failed"),
        }
        self.metrics.enforce_retention();
        self.metrics.enforce_key_cap();
        self.locks.expire_stale();
        let dropped = self.writer.dropped_writes();
        if dropped > 0 {
            warn!(dropped, "cumulative dropped store writes");
        }
    }

    async fn build_snapshot(&self) -> Result<ClusterSnapshot> {
        let taken_at = Utc::now();
        let nodes = self.orchestrator.list_nodes().await?;
        let pods = self.orchestrator.list_pods().await?;
        let node_groups = self.cloud.list_node_groups().await?;
        let hpas = self.orchestrator.list_hpas().await?;
        let volumes = self.orchestrator.list_persistent_volumes().await?;
        let services = self.orchestrator.list_services().await?;

        // Ingest the per-interval usage samples before deriving views so the
        // point-in-time fields below observe them.
        self.ingest_usage(taken_at).await?;

        let mut pods_by_node: HashMap<String, Vec<_>> = HashMap::new();
        for pod in &pods {
            if let Some(node) = &pod.spec.node_name {
                pods_by_node.entry(node.clone()).or_default().push(pod.clone());
            }
        }

        // Replica counts per owner, resolved once for the whole pod list.
        let mut replicas_by_owner: HashMap<(String, String, String), i32> = HashMap::new();
        for pod in &pods {
            if let Some(owner) = pod.controller_owner() {
                *replicas_by_owner
                    .entry((
                        pod.meta.namespace.clone(),
                        owner.kind.clone(),
                        owner.name.clone(),
                    ))
                    .or_insert(0) += 1;
            }
        }

        let mut node_infos = Vec::with_capacity(nodes.len());
        let mut total_hourly = 0.0;
        for node in nodes {
            let name = node.meta.name.clone();
            let bound = pods_by_node.get(&name).map(Vec::as_slice).unwrap_or(&[]);
            let mut cpu_requested = 0i64;
            let mut mem_requested = 0i64;
            let mut gpus_used = 0i64;
            let mut pod_count = 0usize;
            for pod in bound {
                let requests = pod.effective_requests();
                cpu_requested += requests.cpu_milli;
                mem_requested += requests.memory_bytes;
                gpus_used += requests.gpu.unwrap_or(0);
                if !pod.is_daemonset() {
                    pod_count += 1;
                }
            }

            let is_spot = node.is_spot();
            let (hourly, on_demand) = self.node_hourly_cost(&node, is_spot).await;
            total_hourly += hourly;

            let usage = self.metrics.latest_node_sample(&name);
            node_infos.push(NodeInfo {
                cpu_capacity_milli: node.capacity.cpu_milli,
                memory_capacity_bytes: node.capacity.memory_bytes,
                gpus: node.capacity.gpus,
                cpu_requested_milli: cpu_requested,
                memory_requested_bytes: mem_requested,
                cpu_usage_milli: usage.map(|s| s.cpu_milli).unwrap_or(0.0),
                memory_usage_bytes: usage.map(|s| s.mem_bytes).unwrap_or(0.0),
                hourly_cost_usd: hourly,
                on_demand_hourly_usd: on_demand,
                is_spot,
                gpus_used,
                pod_count,
                node,
            });
        }

        let mut pod_infos = Vec::with_capacity(pods.len());
        for pod in pods {
            let owner = pod.controller_owner().cloned();
            let replicas = owner
                .as_ref()
                .and_then(|o| {
                    replicas_by_owner
                        .get(&(pod.meta.namespace.clone(), o.kind.clone(), o.name.clone()))
                        .copied()
                })
                .unwrap_or(1);
            let requests = pod.effective_requests();
            let mut cpu_usage = 0.0;
            let mut mem_usage = 0.0;
            for container in &pod.spec.containers {
                let key = SeriesKey::new(&pod.meta.namespace, &pod.meta.name, &container.name);
                if let Some(sample) = self.metrics.latest_pod_sample(&key) {
                    cpu_usage += sample.cpu_milli;
                    mem_usage += sample.mem_bytes;
                }
            }
            pod_infos.push(PodInfo {
                owner_kind: owner.as_ref().map(|o| o.kind.clone()),
                owner_name: owner.as_ref().map(|o| o.name.clone()),
                replicas,
                cpu_request_milli: requests.cpu_milli,
                memory_request_bytes: requests.memory_bytes,
                cpu_usage_milli: cpu_usage,
                memory_usage_bytes: mem_usage,
                pod,
            });
        }

        Ok(ClusterSnapshot {
            taken_at,
            nodes: node_infos,
            node_groups,
            pods: pod_infos,
            hpas,
            volumes,
            services,
            pods_by_node,
            total_hourly_cost_usd: total_hourly,
        })
    }

    /// Hourly cost of a node as `(effective, on_demand)`.
    ///
    /// The effective price is the spot price for spot nodes when the market
    /// offers one. Missing catalog entries fall back to per-unit costs so a
    /// node is never free by accident.
    async fn node_hourly_cost(&self, node: &crate::model::Node, is_spot: bool) -> (f64, f64) {
        let unit = UnitCosts::for_vendor(self.cloud.vendor());
        let fallback = node.capacity.cpu_milli as f64 / 1000.0 * unit.vcpu_hour_usd
            + node.capacity.memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0) * unit.gib_hour_usd;

        let Some(instance_type) = node.instance_type() else {
            return (fallback, fallback);
        };
        let on_demand = match self.cloud.hourly_cost(instance_type).await {
            Ok(price) => {
                self.writer.enqueue(WriteRecord::Pricing {
                    instance_type: instance_type.to_string(),
                    hourly_usd: price,
                });
                price
            }
            Err(_) => match self.store.cached_price(instance_type) {
                Ok(Some(cached)) => cached,
                _ => fallback,
            },
        };
        if is_spot {
            match self.cloud.spot_hourly_cost(instance_type).await {
                Ok(Some(spot)) => (spot, on_demand),
                _ => (
                    on_demand
                        * (1.0 - crate::cloud::estimated_spot_discount(self.cloud.vendor())),
                    on_demand,
                ),
            }
        } else {
            (on_demand, on_demand)
        }
    }

    async fn ingest_usage(&self, taken_at: chrono::DateTime<Utc>) -> Result<()> {
        let node_usage = self.orchestrator.node_usage().await?;
        for usage in node_usage {
            self.metrics.record_node(
                &usage.node,
                Sample {
                    ts: taken_at,
                    cpu_milli: usage.cpu_milli,
                    mem_bytes: usage.memory_bytes,
                },
            );
            self.writer.enqueue(WriteRecord::NodeMetric {
                timestamp: taken_at,
                node: usage.node,
                cpu_milli: usage.cpu_milli,
                memory_bytes: usage.memory_bytes,
            });
        }
        let pod_usage = self.orchestrator.pod_usage().await?;
        for usage in pod_usage {
            self.metrics.record_pod(
                SeriesKey::new(&usage.namespace, &usage.pod, &usage.container),
                Sample {
                    ts: taken_at,
                    cpu_milli: usage.cpu_milli,
                    mem_bytes: usage.memory_bytes,
                },
            );
            self.writer.enqueue(WriteRecord::PodMetric {
                timestamp: taken_at,
                namespace: usage.namespace,
                pod: usage.pod,
                container: usage.container,
                cpu_milli: usage.cpu_milli,
                memory_bytes: usage.memory_bytes,
            });
        }
        Ok(())
    }
}
