//! Orchestrator contract
//!
//! The engine never talks to a cluster API directly; it goes through this
//! trait. A production deployment plugs in a real client; tests and
//! monitor-mode runs use [`StaticOrchestrator`], an in-memory implementation
//! seeded from a cluster manifest.

use crate::error::{OptimizerError, Result};
use crate::model::{
    HorizontalPodAutoscaler, Node, PersistentVolume, Pod, PodDisruptionBudget, ResourceRequests,
    Service, Taint, WorkloadStatus,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Point-in-time node usage sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUsage {
    /// Node name
    pub node: String,
    /// CPU usage in millicores
    pub cpu_milli: f64,
    /// Memory usage in bytes
    pub memory_bytes: f64,
}

/// Point-in-time pod-container usage sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodUsage {
    /// Namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container name
    pub container: String,
    /// CPU usage in millicores
    pub cpu_milli: f64,
    /// Memory usage in bytes
    pub memory_bytes: f64,
}

/// Read/patch surface of the cluster orchestrator
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// List all nodes.
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Fetch one node.
    async fn get_node(&self, name: &str) -> Result<Node>;

    /// List all pods.
    async fn list_pods(&self) -> Result<Vec<Pod>>;

    /// List pods bound to a node.
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>>;

    /// List pod disruption budgets in a namespace.
    async fn list_pdbs(&self, namespace: &str) -> Result<Vec<PodDisruptionBudget>>;

    /// List horizontal pod autoscalers across namespaces.
    async fn list_hpas(&self) -> Result<Vec<HorizontalPodAutoscaler>>;

    /// List persistent volumes.
    async fn list_persistent_volumes(&self) -> Result<Vec<PersistentVolume>>;

    /// List services.
    async fn list_services(&self) -> Result<Vec<Service>>;

    /// Cordon or uncordon a node.
    async fn set_unschedulable(&self, node: &str, unschedulable: bool) -> Result<()>;

    /// Patch node annotations; a `None` value removes the key.
    async fn annotate_node(
        &self,
        node: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<()>;

    /// Patch node labels; a `None` value removes the key.
    async fn label_node(&self, node: &str, labels: &BTreeMap<String, Option<String>>)
        -> Result<()>;

    /// Add a taint to a node, replacing any existing taint with the same key.
    async fn add_node_taint(&self, node: &str, taint: Taint) -> Result<()>;

    /// Remove all taints with the given key from a node.
    async fn remove_node_taint(&self, node: &str, key: &str) -> Result<()>;

    /// Issue an eviction for a pod with the given grace period.
    async fn evict_pod(&self, namespace: &str, name: &str, grace_period_seconds: i64)
        -> Result<()>;

    /// Strategic-merge patch of a workload template's container requests.
    ///
    /// Patching a bare ReplicaSet is accepted but has no effect; its
    /// Deployment owns the template.
    async fn patch_workload_requests(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
        container: &str,
        requests: ResourceRequests,
    ) -> Result<()>;

    /// Attempt an in-place pod resize. Errors when the orchestrator does not
    /// support resize for this pod.
    async fn resize_pod_in_place(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        requests: ResourceRequests,
    ) -> Result<()>;

    /// Merge-patch an HPA's `spec.maxReplicas`.
    async fn patch_hpa_max_replicas(
        &self,
        namespace: &str,
        name: &str,
        max_replicas: i32,
    ) -> Result<()>;

    /// Scale status of a workload (Deployment/StatefulSet/ReplicaSet).
    async fn workload_status(&self, namespace: &str, kind: &str, name: &str)
        -> Result<WorkloadStatus>;

    /// Current per-node usage samples.
    async fn node_usage(&self) -> Result<Vec<NodeUsage>>;

    /// Current per-pod-container usage samples.
    async fn pod_usage(&self) -> Result<Vec<PodUsage>>;
}

/// Serializable cluster fixture backing [`StaticOrchestrator`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterFixture {
    /// Nodes
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Pods
    #[serde(default)]
    pub pods: Vec<Pod>,
    /// Pod disruption budgets
    #[serde(default)]
    pub pdbs: Vec<PodDisruptionBudget>,
    /// Horizontal pod autoscalers
    #[serde(default)]
    pub hpas: Vec<HorizontalPodAutoscaler>,
    /// Persistent volumes
    #[serde(default)]
    pub volumes: Vec<PersistentVolume>,
    /// Services
    #[serde(default)]
    pub services: Vec<Service>,
    /// Node usage samples
    #[serde(default)]
    pub node_usage: Vec<NodeUsage>,
    /// Pod usage samples
    #[serde(default)]
    pub pod_usage: Vec<PodUsage>,
    /// Workload scale statuses keyed by `namespace/kind/name`
    #[serde(default)]
    pub workload_status: BTreeMap<String, WorkloadStatus>,
}

/// In-memory orchestrator over a [`ClusterFixture`]
///
/// Mutations are applied to the fixture so subsequent reads observe them,
/// which is enough to exercise every execution path end to end. Eviction
/// failures can be injected per pod for drain-protocol tests.
pub struct StaticOrchestrator {
    state: RwLock<ClusterFixture>,
    failing_evictions: RwLock<HashSet<String>>,
}

impl StaticOrchestrator {
    /// Wrap a fixture.
    pub fn new(fixture: ClusterFixture) -> Self {
        Self {
            state: RwLock::new(fixture),
            failing_evictions: RwLock::new(HashSet::new()),
        }
    }

    /// Load a fixture from a YAML manifest.
    pub fn from_manifest_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OptimizerError::Config(format!("reading {}: {e}", path.display())))?;
        let fixture: ClusterFixture = serde_yaml::from_str(&content)
            .map_err(|e| OptimizerError::Config(format!("parsing {}: {e}", path.display())))?;
        Ok(Self::new(fixture))
    }

    /// Make evictions of `namespace/name` fail with an orchestrator error.
    pub fn fail_evictions_of(&self, namespace: &str, name: &str) {
        self.failing_evictions
            .write()
            .insert(format!("{namespace}/{name}"));
    }

    /// Snapshot of the current fixture, for assertions.
    pub fn fixture(&self) -> ClusterFixture {
        self.state.read().clone()
    }

    fn node_mut<R>(&self, name: &str, f: impl FnOnce(&mut Node) -> R) -> Result<R> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .iter_mut()
            .find(|n| n.meta.name == name)
            .ok_or_else(|| OptimizerError::Orchestrator(format!("node {name} not found")))?;
        Ok(f(node))
    }
}

#[async_trait]
impl Orchestrator for StaticOrchestrator {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.read().nodes.clone())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.state
            .read()
            .nodes
            .iter()
            .find(|n| n.meta.name == name)
            .cloned()
            .ok_or_else(|| OptimizerError::Orchestrator(format!("node {name} not found")))
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.state.read().pods.clone())
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state
            .read()
            .pods
            .iter()
            .filter(|p| p.spec.node_name.as_deref() == Some(node))
            .cloned()
            .collect())
    }

    async fn list_pdbs(&self, namespace: &str) -> Result<Vec<PodDisruptionBudget>> {
        Ok(self
            .state
            .read()
            .pdbs
            .iter()
            .filter(|p| p.meta.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn list_hpas(&self) -> Result<Vec<HorizontalPodAutoscaler>> {
        Ok(self.state.read().hpas.clone())
    }

    async fn list_persistent_volumes(&self) -> Result<Vec<PersistentVolume>> {
        Ok(self.state.read().volumes.clone())
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        Ok(self.state.read().services.clone())
    }

    async fn set_unschedulable(&self, node: &str, unschedulable: bool) -> Result<()> {
        self.node_mut(node, |n| n.unschedulable = unschedulable)
    }

    async fn annotate_node(
        &self,
        node: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        self.node_mut(node, |n| {
            for (key, value) in annotations {
                match value {
                    Some(v) => {
                        n.meta.annotations.insert(key.clone(), v.clone());
                    }
                    None => {
                        n.meta.annotations.remove(key);
                    }
                }
            }
        })
    }

    async fn label_node(
        &self,
        node: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        self.node_mut(node, |n| {
            for (key, value) in labels {
                match value {
                    Some(v) => {
                        n.meta.labels.insert(key.clone(), v.clone());
                    }
                    None => {
                        n.meta.labels.remove(key);
                    }
                }
            }
        })
    }

    async fn add_node_taint(&self, node: &str, taint: Taint) -> Result<()> {
        self.node_mut(node, |n| {
            n.taints.retain(|t| t.key != taint.key);
            n.taints.push(taint);
        })
    }

    async fn remove_node_taint(&self, node: &str, key: &str) -> Result<()> {
        self.node_mut(node, |n| n.taints.retain(|t| t.key != key))
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        _grace_period_seconds: i64,
    ) -> Result<()> {
        let key = format!("{namespace}/{name}");
        if self.failing_evictions.read().contains(&key) {
            return Err(OptimizerError::Orchestrator(format!(
                "eviction of {key} rejected"
            )));
        }
        let mut state = self.state.write();
        let before = state.pods.len();
        state
            .pods
            .retain(|p| !(p.meta.namespace == namespace && p.meta.name == name));
        if state.pods.len() == before {
            return Err(OptimizerError::Orchestrator(format!("pod {key} not found")));
        }
        Ok(())
    }

    async fn patch_workload_requests(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
        container: &str,
        requests: ResourceRequests,
    ) -> Result<()> {
        // ReplicaSet templates are owned by their Deployment; patching them
        // directly is a no-op, mirroring the real API behavior.
        if kind == "ReplicaSet" {
            return Ok(());
        }
        let mut state = self.state.write();
        for pod in state.pods.iter_mut().filter(|p| {
            p.meta.namespace == namespace
                && p.controller_owner()
                    .map(|o| o.name.starts_with(name))
                    .unwrap_or(false)
        }) {
            for c in pod.spec.containers.iter_mut().filter(|c| c.name == container) {
                c.requests = requests;
            }
        }
        Ok(())
    }

    async fn resize_pod_in_place(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        requests: ResourceRequests,
    ) -> Result<()> {
        let mut state = self.state.write();
        let target = state
            .pods
            .iter_mut()
            .find(|p| p.meta.namespace == namespace && p.meta.name == pod)
            .ok_or_else(|| {
                OptimizerError::Orchestrator(format!("pod {namespace}/{pod} not found"))
            })?;
        let resizable = target.status.resize.is_some()
            || target.spec.containers.iter().any(|c| c.resize_policy.is_some());
        if !resizable {
            return Err(OptimizerError::Orchestrator(format!(
                "pod {namespace}/{pod} does not support in-place resize"
            )));
        }
        for c in target
            .spec
            .containers
            .iter_mut()
            .filter(|c| c.name == container)
        {
            c.requests = requests;
        }
        Ok(())
    }

    async fn patch_hpa_max_replicas(
        &self,
        namespace: &str,
        name: &str,
        max_replicas: i32,
    ) -> Result<()> {
        let mut state = self.state.write();
        let hpa = state
            .hpas
            .iter_mut()
            .find(|h| h.meta.namespace == namespace && h.meta.name == name)
            .ok_or_else(|| {
                OptimizerError::Orchestrator(format!("hpa {namespace}/{name} not found"))
            })?;
        hpa.max_replicas = max_replicas;
        Ok(())
    }

    async fn workload_status(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> Result<WorkloadStatus> {
        let key = format!("{namespace}/{kind}/{name}");
        if let Some(status) = self.state.read().workload_status.get(&key) {
            return Ok(*status);
        }
        // Unknown workloads report converged so waits terminate.
        Ok(WorkloadStatus {
            desired_replicas: 1,
            ready_replicas: 1,
        })
    }

    async fn node_usage(&self) -> Result<Vec<NodeUsage>> {
        Ok(self.state.read().node_usage.clone())
    }

    async fn pod_usage(&self) -> Result<Vec<PodUsage>> {
        Ok(self.state.read().pod_usage.clone())
    }
}
