//! Drain protocol
//!
//! Moves every evictable pod off a node under PDB, grace-period, and
//! partial-failure constraints. The caller holds the node lock; the drainer
//! refreshes it after each eviction so long drains outlive the lock TTL.
//!
//! Outcomes:
//! - nothing evictable → success, node stays cordoned for its caller
//! - every eviction failed → uncordon, error
//! - some failed → node stays cordoned and is annotated; a TTL reconciler
//!   uncordons it later
//! - all succeeded → success

use crate::config::EvictorConfig;
use crate::error::{OptimizerError, Result};
use crate::model::{
    Pod, PodDisruptionBudget, ANNOTATION_EXCLUDE, ANNOTATION_PARTIAL_DRAIN_AT,
    ANNOTATION_PARTIAL_DRAIN_REASON, SYSTEM_NAMESPACES,
};
use crate::orchestrator::Orchestrator;
use crate::state::{AuditLog, NodeLockTable};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default grace period when a pod does not declare one.
pub const DEFAULT_GRACE_PERIOD_SECONDS: i64 = 30;

/// Result of one drain pass
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Pods evicted
    pub evicted: usize,
    /// Pods whose eviction failed
    pub failed: usize,
    /// Pods skipped by policy
    pub skipped: usize,
    /// Whether the node was left cordoned with a partial-drain annotation
    pub partial: bool,
    /// PDB violations that were overridden (emergency drains only)
    pub pdb_overrides: Vec<String>,
}

/// PDB-aware node drainer
pub struct Drainer {
    orchestrator: Arc<dyn Orchestrator>,
    locks: Arc<NodeLockTable>,
    audit: Arc<AuditLog>,
    config: EvictorConfig,
}

impl Drainer {
    /// Build a drainer.
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        locks: Arc<NodeLockTable>,
        audit: Arc<AuditLog>,
        config: EvictorConfig,
    ) -> Self {
        Self {
            orchestrator,
            locks,
            audit,
            config,
        }
    }

    /// Drain a node, honoring disruption budgets.
    pub async fn drain_node(&self, node: &str, holder: &str) -> Result<DrainReport> {
        self.drain_inner(node, holder, false).await
    }

    /// Emergency drain for a node the cloud is about to terminate. PDB
    /// violations are logged and overridden.
    pub async fn emergency_drain(&self, node: &str, holder: &str) -> Result<DrainReport> {
        self.drain_inner(node, holder, true).await
    }

    async fn drain_inner(&self, node: &str, holder: &str, emergency: bool) -> Result<DrainReport> {
        self.orchestrator.set_unschedulable(node, true).await?;

        let pods = match self.orchestrator.list_pods_on_node(node).await {
            Ok(pods) => pods,
            Err(e) => {
                // Cannot see the node's pods; undo the cordon and bail.
                let _ = self.orchestrator.set_unschedulable(node, false).await;
                return Err(e);
            }
        };

        let pdb_cache = self.prefetch_pdbs(&pods).await;

        let mut report = DrainReport::default();
        let mut evictable = Vec::new();
        for pod in pods {
            match skip_reason(&pod) {
                Some(reason) => {
                    debug!(pod = %pod.key(), reason, "pod skipped by drain policy");
                    report.skipped += 1;
                }
                None => evictable.push(pod),
            }
        }

        if evictable.is_empty() {
            info!(node, "no evictable pods; node is effectively drained");
            return Ok(report);
        }

        let mut failures: Vec<String> = Vec::new();
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout();
        for pod in &evictable {
            if tokio::time::Instant::now() >= deadline {
                failures.push(format!("{}: drain deadline exceeded", pod.key()));
                report.failed += 1;
                continue;
            }
            if let Some(blocked_by) = pdb_blocks(pod, &pdb_cache) {
                if emergency {
                    warn!(
                        pod = %pod.key(),
                        pdb = %blocked_by,
                        "overriding disruption budget during emergency drain"
                    );
                    report.pdb_overrides.push(pod.key());
                } else {
                    failures.push(format!("{}: blocked by PDB {blocked_by}", pod.key()));
                    report.failed += 1;
                    continue;
                }
            }
            let grace = pod
                .spec
                .termination_grace_period_seconds
                .unwrap_or(DEFAULT_GRACE_PERIOD_SECONDS);
            match self
                .orchestrator
                .evict_pod(&pod.meta.namespace, &pod.meta.name, grace)
                .await
            {
                Ok(()) => {
                    report.evicted += 1;
                    self.locks.refresh(node, holder);
                }
                Err(e) => {
                    failures.push(format!("{}: {e}", pod.key()));
                    report.failed += 1;
                }
            }
        }

        if report.evicted == 0 && report.failed > 0 {
            // Total failure: the node can keep serving; undo the cordon.
            let _ = self.orchestrator.set_unschedulable(node, false).await;
            self.audit
                .record("drain-failed", node, holder, failures.join("; "));
            return Err(OptimizerError::DrainFailed {
                node: node.to_string(),
                reason: failures.join("; "),
            });
        }

        if report.failed > 0 {
            report.partial = true;
            let reason = failures.join("; ");
            let mut annotations = BTreeMap::new();
            annotations.insert(
                ANNOTATION_PARTIAL_DRAIN_AT.to_string(),
                Some(Utc::now().to_rfc3339()),
            );
            annotations.insert(
                ANNOTATION_PARTIAL_DRAIN_REASON.to_string(),
                Some(reason.clone()),
            );
            self.orchestrator.annotate_node(node, &annotations).await?;
            self.audit.record("partial-drain", node, holder, reason);
            warn!(
                node,
                evicted = report.evicted,
                failed = report.failed,
                "partial drain; node left cordoned"
            );
        } else {
            info!(node, evicted = report.evicted, "node drained");
        }
        Ok(report)
    }

    /// One PDB list per namespace; a failed list marks the whole namespace
    /// protected (fail-safe).
    async fn prefetch_pdbs(
        &self,
        pods: &[Pod],
    ) -> HashMap<String, Option<Vec<PodDisruptionBudget>>> {
        let namespaces: HashSet<&str> = pods.iter().map(|p| p.meta.namespace.as_str()).collect();
        let mut cache = HashMap::new();
        for namespace in namespaces {
            match self.orchestrator.list_pdbs(namespace).await {
                Ok(pdbs) => {
                    cache.insert(namespace.to_string(), Some(pdbs));
                }
                Err(e) => {
                    warn!(namespace, error = %e, "PDB listing failed; treating namespace as protected");
                    cache.insert(namespace.to_string(), None);
                }
            }
        }
        cache
    }

    /// Uncordon nodes whose partial-drain annotation has outlived its TTL.
    pub async fn reconcile_partial_drains(&self) -> Result<usize> {
        let nodes = self.orchestrator.list_nodes().await?;
        let ttl = self.config.partial_drain_ttl();
        let mut recovered = 0usize;
        for node in nodes {
            let Some(raw) = node.meta.annotations.get(ANNOTATION_PARTIAL_DRAIN_AT) else {
                continue;
            };
            let Ok(annotated_at) = DateTime::parse_from_rfc3339(raw) else {
                warn!(node = %node.meta.name, raw, "unparseable partial-drain timestamp");
                continue;
            };
            let age = Utc::now().signed_duration_since(annotated_at.with_timezone(&Utc));
            if age.to_std().map(|a| a >= ttl).unwrap_or(false) {
                self.orchestrator
                    .set_unschedulable(&node.meta.name, false)
                    .await?;
                let mut annotations = BTreeMap::new();
                annotations.insert(ANNOTATION_PARTIAL_DRAIN_AT.to_string(), None);
                annotations.insert(ANNOTATION_PARTIAL_DRAIN_REASON.to_string(), None);
                self.orchestrator
                    .annotate_node(&node.meta.name, &annotations)
                    .await?;
                self.audit.record(
                    "partial-drain-recovered",
                    &node.meta.name,
                    "drainer",
                    format!("auto-uncordoned after {}s", age.num_seconds()),
                );
                info!(node = %node.meta.name, "partial-drain node auto-uncordoned");
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

/// Policy skip reason for a pod, or `None` when it is evictable.
pub fn skip_reason(pod: &Pod) -> Option<&'static str> {
    if pod.is_daemonset() {
        return Some("daemonset-owned");
    }
    if pod.is_mirror() {
        return Some("mirror pod");
    }
    if pod.is_completed() {
        return Some("completed");
    }
    if SYSTEM_NAMESPACES.contains(&pod.meta.namespace.as_str()) {
        return Some("system namespace");
    }
    if pod.is_system_critical() {
        return Some("system-critical priority class");
    }
    if pod
        .meta
        .annotations
        .get(ANNOTATION_EXCLUDE)
        .map(|v| v == "true")
        .unwrap_or(false)
    {
        return Some("excluded by annotation");
    }
    if (pod.has_empty_dir() && !pod.is_safe_to_evict()) || pod.has_host_path() {
        return Some("local storage");
    }
    None
}

/// Name of the first matching PDB with no disruptions left, if any.
fn pdb_blocks(
    pod: &Pod,
    cache: &HashMap<String, Option<Vec<PodDisruptionBudget>>>,
) -> Option<String> {
    match cache.get(&pod.meta.namespace) {
        Some(Some(pdbs)) => pdbs
            .iter()
            .filter(|pdb| pdb.selector.matches(&pod.meta.labels))
            .find(|pdb| pdb.disruptions_allowed <= 0)
            .map(|pdb| pdb.meta.name.clone()),
        // listing failed earlier: everything in the namespace is protected
        Some(None) => Some("unlisted-pdbs".to_string()),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        LabelSelector, ObjectMeta, PodPhase, Volume, VolumeSource, ANNOTATION_MIRROR_POD,
        ANNOTATION_SAFE_TO_EVICT,
    };
    use crate::orchestrator::{ClusterFixture, StaticOrchestrator};
    use crate::store::{spawn_writer, Store};
    use crate::testutil::{ready_node, running_pod};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        orchestrator: Arc<StaticOrchestrator>,
        drainer: Drainer,
        shutdown: CancellationToken,
        _dir: tempfile::TempDir,
    }

    fn harness(fixture: ClusterFixture) -> Harness {
        let orchestrator = Arc::new(StaticOrchestrator::new(fixture));
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let shutdown = CancellationToken::new();
        let (writer, _handle) = spawn_writer(store, 256, shutdown.clone());
        let locks = Arc::new(NodeLockTable::new(Duration::from_secs(600)));
        let audit = Arc::new(AuditLog::new(100, writer));
        let drainer = Drainer::new(
            orchestrator.clone() as Arc<dyn Orchestrator>,
            locks,
            audit,
            EvictorConfig::default(),
        );
        Harness {
            orchestrator,
            drainer,
            shutdown,
            _dir: dir,
        }
    }

    #[test]
    fn skip_list_covers_protected_pods() {
        let mut daemon = running_pod("default", "fluentd", "n1", 100, 1 << 20);
        daemon.meta.owner_references = vec![crate::model::OwnerReference {
            kind: "DaemonSet".into(),
            name: "fluentd".into(),
            controller: true,
        }];
        assert_eq!(skip_reason(&daemon), Some("daemonset-owned"));

        let mut mirror = running_pod("default", "etcd", "n1", 100, 1 << 20);
        mirror
            .meta
            .annotations
            .insert(ANNOTATION_MIRROR_POD.into(), "x".into());
        assert_eq!(skip_reason(&mirror), Some("mirror pod"));

        let system = running_pod("kube-system", "coredns", "n1", 100, 1 << 20);
        assert_eq!(skip_reason(&system), Some("system namespace"));

        let mut done = running_pod("default", "job", "n1", 100, 1 << 20);
        done.status.phase = PodPhase::Succeeded;
        assert_eq!(skip_reason(&done), Some("completed"));

        let mut scratch = running_pod("default", "cache", "n1", 100, 1 << 20);
        scratch.spec.volumes.push(Volume {
            name: "tmp".into(),
            source: VolumeSource::EmptyDir,
        });
        assert_eq!(skip_reason(&scratch), Some("local storage"));
        scratch
            .meta
            .annotations
            .insert(ANNOTATION_SAFE_TO_EVICT.into(), "true".into());
        assert_eq!(skip_reason(&scratch), None);

        let mut critical = running_pod("default", "api", "n1", 100, 1 << 20);
        critical.spec.priority_class_name = Some("system-cluster-critical".into());
        assert_eq!(
            skip_reason(&critical),
            Some("system-critical priority class")
        );
    }

    #[tokio::test]
    async fn full_drain_evicts_everything() {
        let fixture = ClusterFixture {
            nodes: vec![ready_node("n1", 4000, 16 << 30)],
            pods: vec![
                running_pod("default", "a", "n1", 100, 1 << 20),
                running_pod("default", "b", "n1", 100, 1 << 20),
            ],
            ..Default::default()
        };
        let h = harness(fixture);
        let report = h.drainer.drain_node("n1", "evictor").await.unwrap();
        assert_eq!(report.evicted, 2);
        assert!(!report.partial);
        assert!(h.orchestrator.fixture().pods.is_empty());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn pdb_exhausted_blocks_eviction() {
        let mut protected = running_pod("default", "web-0", "n1", 100, 1 << 20);
        protected
            .meta
            .labels
            .insert("app".to_string(), "web".to_string());
        let mut selector = LabelSelector::default();
        selector
            .match_labels
            .insert("app".to_string(), "web".to_string());
        let fixture = ClusterFixture {
            nodes: vec![ready_node("n1", 4000, 16 << 30)],
            pods: vec![protected],
            pdbs: vec![PodDisruptionBudget {
                meta: ObjectMeta {
                    name: "web-pdb".into(),
                    namespace: "default".into(),
                    ..Default::default()
                },
                selector,
                disruptions_allowed: 0,
            }],
            ..Default::default()
        };
        let h = harness(fixture);
        let result = h.drainer.drain_node("n1", "evictor").await;
        // the only pod is blocked: total failure, node uncordoned
        assert!(result.is_err());
        let state = h.orchestrator.fixture();
        assert_eq!(state.pods.len(), 1);
        assert!(!state.nodes[0].unschedulable);
        assert!(!state.nodes[0]
            .meta
            .annotations
            .contains_key(ANNOTATION_PARTIAL_DRAIN_AT));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn emergency_drain_overrides_pdb() {
        let mut protected = running_pod("default", "web-0", "n1", 100, 1 << 20);
        protected
            .meta
            .labels
            .insert("app".to_string(), "web".to_string());
        let mut selector = LabelSelector::default();
        selector
            .match_labels
            .insert("app".to_string(), "web".to_string());
        let fixture = ClusterFixture {
            nodes: vec![ready_node("n1", 4000, 16 << 30)],
            pods: vec![protected],
            pdbs: vec![PodDisruptionBudget {
                meta: ObjectMeta {
                    name: "web-pdb".into(),
                    namespace: "default".into(),
                    ..Default::default()
                },
                selector,
                disruptions_allowed: 0,
            }],
            ..Default::default()
        };
        let h = harness(fixture);
        let report = h.drainer.emergency_drain("n1", "spot").await.unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.pdb_overrides, vec!["default/web-0".to_string()]);
        assert!(h.orchestrator.fixture().pods.is_empty());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn partial_failure_leaves_cordoned_and_annotated() {
        let fixture = ClusterFixture {
            nodes: vec![ready_node("n1", 4000, 16 << 30)],
            pods: vec![
                running_pod("default", "a", "n1", 100, 1 << 20),
                running_pod("default", "stuck", "n1", 100, 1 << 20),
            ],
            ..Default::default()
        };
        let h = harness(fixture);
        h.orchestrator.fail_evictions_of("default", "stuck");
        let report = h.drainer.drain_node("n1", "evictor").await.unwrap();
        assert!(report.partial);
        assert_eq!(report.evicted, 1);
        assert_eq!(report.failed, 1);
        let state = h.orchestrator.fixture();
        assert!(state.nodes[0].unschedulable);
        assert!(state.nodes[0]
            .meta
            .annotations
            .contains_key(ANNOTATION_PARTIAL_DRAIN_AT));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn expired_partial_drain_is_recovered() {
        let mut node = ready_node("n1", 4000, 16 << 30);
        node.unschedulable = true;
        let stale = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        node.meta
            .annotations
            .insert(ANNOTATION_PARTIAL_DRAIN_AT.into(), stale);
        node.meta
            .annotations
            .insert(ANNOTATION_PARTIAL_DRAIN_REASON.into(), "test".into());
        let fixture = ClusterFixture {
            nodes: vec![node],
            ..Default::default()
        };
        let h = harness(fixture);
        let recovered = h.drainer.reconcile_partial_drains().await.unwrap();
        assert_eq!(recovered, 1);
        let state = h.orchestrator.fixture();
        assert!(!state.nodes[0].unschedulable);
        assert!(state.nodes[0].meta.annotations.is_empty());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn fresh_partial_drain_is_left_alone() {
        let mut node = ready_node("n1", 4000, 16 << 30);
        node.unschedulable = true;
        node.meta.annotations.insert(
            ANNOTATION_PARTIAL_DRAIN_AT.into(),
            Utc::now().to_rfc3339(),
        );
        let fixture = ClusterFixture {
            nodes: vec![node],
            ..Default::default()
        };
        let h = harness(fixture);
        let recovered = h.drainer.reconcile_partial_drains().await.unwrap();
        assert_eq!(recovered, 0);
        assert!(h.orchestrator.fixture().nodes[0].unschedulable);
        h.shutdown.cancel();
    }
}
