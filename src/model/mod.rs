//! Cluster object model
//!
//! A compact, owned subset of the orchestrator's object model: everything the
//! optimizer needs to reason about placement, disruption, and cost, and
//! nothing more. Quantities are normalized at the edge (CPU in millicores,
//! memory in bytes) so the engine never parses quantity strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

mod recommendation;

pub use recommendation::{
    EstimatedImpact, EstimatedSaving, Priority, Recommendation, RecommendationKind, RiskLevel,
    Target,
};

/// Annotation that excludes a pod from optimizer-driven eviction.
pub const ANNOTATION_EXCLUDE: &str = "koptimizer.io/exclude";
/// Annotation marking a pod with local storage as safe to evict.
pub const ANNOTATION_SAFE_TO_EVICT: &str = "koptimizer.io/safe-to-evict";
/// Upstream autoscaler equivalent of [`ANNOTATION_SAFE_TO_EVICT`].
pub const ANNOTATION_CA_SAFE_TO_EVICT: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";
/// Annotation identifying static mirror pods.
pub const ANNOTATION_MIRROR_POD: &str = "kubernetes.io/config.mirror";
/// RFC3339 timestamp annotation left on a node after a partial drain.
pub const ANNOTATION_PARTIAL_DRAIN_AT: &str = "koptimizer.io/partial-drain-at";
/// Reason annotation accompanying [`ANNOTATION_PARTIAL_DRAIN_AT`].
pub const ANNOTATION_PARTIAL_DRAIN_REASON: &str = "koptimizer.io/partial-drain-reason";
/// Universal spot-interruption marker honored on any cloud.
pub const ANNOTATION_SPOT_INTERRUPTION: &str = "koptimizer.io/spot-interruption";
/// Azure scheduled-event interruption marker.
pub const ANNOTATION_AZURE_SCHEDULED_EVENT: &str = "koptimizer.io/azure-scheduled-event";
/// Node annotation set while GPU fallback is enabled.
pub const ANNOTATION_GPU_FALLBACK: &str = "koptimizer.io/gpu-fallback";
/// Node annotation publishing scavengeable CPU headroom in millicores.
pub const ANNOTATION_CPU_HEADROOM: &str = "koptimizer.io/cpu-headroom-millis";
/// Node label marking a GPU node as admitting low-priority CPU pods.
pub const LABEL_CPU_SCAVENGEABLE: &str = "koptimizer.io/cpu-scavengeable";
/// Well-known node label carrying the cloud instance type.
pub const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
/// Node label tying a node to its cloud node group.
pub const LABEL_NODE_GROUP: &str = "koptimizer.io/node-group";
/// Well-known node label carrying the capacity lifecycle (spot/on-demand).
pub const LABEL_CAPACITY_TYPE: &str = "node.kubernetes.io/capacity-type";
/// Well-known node label carrying the availability zone.
pub const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";
/// Taint key reserved for GPU nodes.
pub const TAINT_GPU: &str = "nvidia.com/gpu";

/// Namespaces whose pods are never evicted.
pub const SYSTEM_NAMESPACES: &[&str] = &["kube-system", "kube-public", "kube-node-lease"];

/// Priority classes whose pods are never evicted.
pub const CRITICAL_PRIORITY_CLASSES: &[&str] =
    &["system-cluster-critical", "system-node-critical"];

/// Object metadata shared by every modeled object
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object name
    pub name: String,
    /// Namespace; empty for cluster-scoped objects
    #[serde(default)]
    pub namespace: String,
    /// Labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Owner references (controller edges)
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    /// Creation timestamp
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Construct metadata with just a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Namespaced key `namespace/name`.
    pub fn key(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }
}

/// Reference from an object to its managing controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerReference {
    /// Owner kind (`ReplicaSet`, `StatefulSet`, `DaemonSet`, ...)
    pub kind: String,
    /// Owner name
    pub name: String,
    /// Whether this reference is the managing controller
    #[serde(default)]
    pub controller: bool,
}

/// Resource quantities requested by a container
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequests {
    /// CPU request in millicores
    pub cpu_milli: i64,
    /// Memory request in bytes
    pub memory_bytes: i64,
    /// GPU request; `Some(0)` is an explicit (and invalid) zero request,
    /// distinct from no request at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<i64>,
}

/// Node capacity on the axes the optimizer packs against
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeCapacity {
    /// Allocatable CPU in millicores
    pub cpu_milli: i64,
    /// Allocatable memory in bytes
    pub memory_bytes: i64,
    /// Allocatable GPUs
    pub gpus: i64,
}

/// Taint effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    /// New pods are not scheduled unless they tolerate the taint
    NoSchedule,
    /// Scheduler avoids the node but may still place pods
    PreferNoSchedule,
    /// Running pods without a matching toleration are evicted
    NoExecute,
}

/// Node taint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Taint {
    /// Taint key
    pub key: String,
    /// Taint value
    #[serde(default)]
    pub value: String,
    /// Taint effect
    pub effect: TaintEffect,
}

/// Toleration operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TolerationOperator {
    /// Key must exist; value ignored
    Exists,
    /// Key and value must both match
    Equal,
}

/// Pod toleration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toleration {
    /// Taint key; empty with `Exists` tolerates everything
    #[serde(default)]
    pub key: String,
    /// Match operator
    pub operator: TolerationOperator,
    /// Value compared under `Equal`
    #[serde(default)]
    pub value: String,
    /// Effect this toleration applies to; `None` matches all effects
    #[serde(default)]
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    /// Whether this toleration tolerates the given taint.
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }
        match self.operator {
            TolerationOperator::Exists => self.key.is_empty() || self.key == taint.key,
            TolerationOperator::Equal => self.key == taint.key && self.value == taint.value,
        }
    }
}

/// Node condition as reported by the orchestrator or cloud integration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCondition {
    /// Condition type (`Ready`, `TerminationNotice`, `PreemptionNotice`, ...)
    #[serde(rename = "type")]
    pub condition_type: String,
    /// Condition status (`True`, `False`, `Unknown`)
    pub status: String,
}

/// A cluster node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Metadata
    pub meta: ObjectMeta,
    /// Allocatable capacity
    pub capacity: NodeCapacity,
    /// Whether the node is cordoned
    #[serde(default)]
    pub unschedulable: bool,
    /// Current conditions
    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
    /// Taints
    #[serde(default)]
    pub taints: Vec<Taint>,
}

impl Node {
    /// Whether the node reports a `Ready=True` condition.
    pub fn is_ready(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.condition_type == "Ready" && c.status == "True")
    }

    /// Condition with the given type and status `True`, if present.
    pub fn has_condition(&self, condition_type: &str) -> bool {
        self.conditions
            .iter()
            .any(|c| c.condition_type == condition_type && c.status == "True")
    }

    /// Cloud instance type from the well-known label.
    pub fn instance_type(&self) -> Option<&str> {
        self.meta
            .labels
            .get(LABEL_INSTANCE_TYPE)
            .map(String::as_str)
    }

    /// Whether the node runs on interruptible (spot/preemptible) capacity.
    pub fn is_spot(&self) -> bool {
        match self.meta.labels.get(LABEL_CAPACITY_TYPE).map(String::as_str) {
            Some("spot") | Some("SPOT") | Some("preemptible") => true,
            _ => self
                .meta
                .labels
                .get("karpenter.sh/capacity-type")
                .map(|v| v == "spot")
                .unwrap_or(false),
        }
    }

    /// Value of a topology label (zone, hostname, ...), if present.
    pub fn topology_value(&self, key: &str) -> Option<&str> {
        self.meta.labels.get(key).map(String::as_str)
    }

    /// Whether the node carries a taint with the given key.
    pub fn has_taint(&self, key: &str) -> bool {
        self.taints.iter().any(|t| t.key == key)
    }
}

/// Volume source, reduced to the classes the drain protocol cares about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeSource {
    /// Node-local scratch storage, lost on eviction
    EmptyDir,
    /// Host filesystem mount
    HostPath,
    /// Claim against a persistent volume
    PersistentVolumeClaim(String),
    /// Anything else (config maps, secrets, projections)
    Other,
}

/// Pod volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// Source class
    pub source: VolumeSource,
}

/// Container within a pod
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// Container name
    pub name: String,
    /// Resource requests
    #[serde(default)]
    pub requests: ResourceRequests,
    /// In-place resize policy, when the orchestrator supports it
    #[serde(default)]
    pub resize_policy: Option<String>,
}

/// Last observed termination of a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    /// Container name
    pub name: String,
    /// Restart count
    #[serde(default)]
    pub restart_count: i32,
    /// Reason of the last termination (`OOMKilled`, `Error`, ...)
    #[serde(default)]
    pub last_termination_reason: Option<String>,
    /// When the last termination finished
    #[serde(default)]
    pub last_termination_at: Option<DateTime<Utc>>,
}

/// Pod lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    /// Accepted but not scheduled or not all containers started
    Pending,
    /// Bound to a node with all containers started
    Running,
    /// All containers terminated successfully
    Succeeded,
    /// All containers terminated, at least one in failure
    Failed,
    /// State could not be obtained
    Unknown,
}

/// Pod status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodStatus {
    /// Lifecycle phase
    pub phase: PodPhase,
    /// In-place resize state, present when the orchestrator supports resize
    #[serde(default)]
    pub resize: Option<String>,
    /// Per-container statuses
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

impl Default for PodStatus {
    fn default() -> Self {
        Self {
            phase: PodPhase::Running,
            resize: None,
            container_statuses: Vec::new(),
        }
    }
}

/// Pod specification subset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSpec {
    /// Node the pod is bound to
    #[serde(default)]
    pub node_name: Option<String>,
    /// Application containers
    #[serde(default)]
    pub containers: Vec<Container>,
    /// Init containers, run sequentially before the app containers
    #[serde(default)]
    pub init_containers: Vec<Container>,
    /// Tolerations
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    /// Hard node selector
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Affinity rules
    #[serde(default)]
    pub affinity: Option<Affinity>,
    /// Topology spread constraints
    #[serde(default)]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
    /// Priority class name
    #[serde(default)]
    pub priority_class_name: Option<String>,
    /// Grace period used when the pod is evicted
    #[serde(default)]
    pub termination_grace_period_seconds: Option<i64>,
    /// Volumes
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

/// A pod
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    /// Metadata
    pub meta: ObjectMeta,
    /// Specification
    pub spec: PodSpec,
    /// Status
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    /// Namespaced key `namespace/name`.
    pub fn key(&self) -> String {
        self.meta.key()
    }

    /// Effective resource footprint used for scheduling.
    ///
    /// Init containers run sequentially, so a pod occupies
    /// `max(max(init_containers), sum(containers))` on each axis.
    pub fn effective_requests(&self) -> ResourceRequests {
        let sum_cpu: i64 = self.spec.containers.iter().map(|c| c.requests.cpu_milli).sum();
        let sum_mem: i64 = self
            .spec
            .containers
            .iter()
            .map(|c| c.requests.memory_bytes)
            .sum();
        let max_init_cpu = self
            .spec
            .init_containers
            .iter()
            .map(|c| c.requests.cpu_milli)
            .max()
            .unwrap_or(0);
        let max_init_mem = self
            .spec
            .init_containers
            .iter()
            .map(|c| c.requests.memory_bytes)
            .max()
            .unwrap_or(0);
        let gpus: i64 = self
            .spec
            .containers
            .iter()
            .filter_map(|c| c.requests.gpu)
            .sum();
        ResourceRequests {
            cpu_milli: sum_cpu.max(max_init_cpu),
            memory_bytes: sum_mem.max(max_init_mem),
            gpu: if gpus > 0 { Some(gpus) } else { None },
        }
    }

    /// The managing controller reference, if any.
    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        self.meta
            .owner_references
            .iter()
            .find(|o| o.controller)
            .or_else(|| self.meta.owner_references.first())
    }

    /// Whether the pod is owned by a DaemonSet.
    pub fn is_daemonset(&self) -> bool {
        self.controller_owner()
            .map(|o| o.kind == "DaemonSet")
            .unwrap_or(false)
    }

    /// Whether the pod is a static mirror pod.
    pub fn is_mirror(&self) -> bool {
        self.meta.annotations.contains_key(ANNOTATION_MIRROR_POD)
    }

    /// Whether the pod has run to completion.
    pub fn is_completed(&self) -> bool {
        matches!(self.status.phase, PodPhase::Succeeded | PodPhase::Failed)
    }

    /// Whether the pod carries a system-critical priority class.
    pub fn is_system_critical(&self) -> bool {
        self.spec
            .priority_class_name
            .as_deref()
            .map(|p| CRITICAL_PRIORITY_CLASSES.contains(&p))
            .unwrap_or(false)
    }

    /// Whether any volume is an EmptyDir.
    pub fn has_empty_dir(&self) -> bool {
        self.spec
            .volumes
            .iter()
            .any(|v| v.source == VolumeSource::EmptyDir)
    }

    /// Whether any volume is a HostPath mount.
    pub fn has_host_path(&self) -> bool {
        self.spec
            .volumes
            .iter()
            .any(|v| v.source == VolumeSource::HostPath)
    }

    /// Whether the pod is annotated safe-to-evict (either vendor spelling).
    pub fn is_safe_to_evict(&self) -> bool {
        let truthy = |k: &str| {
            self.meta
                .annotations
                .get(k)
                .map(|v| v == "true")
                .unwrap_or(false)
        };
        truthy(ANNOTATION_SAFE_TO_EVICT) || truthy(ANNOTATION_CA_SAFE_TO_EVICT)
    }

    /// Whether the pod requests any GPU, including an explicit zero request.
    pub fn requests_gpu_resource(&self) -> bool {
        self.spec
            .containers
            .iter()
            .chain(self.spec.init_containers.iter())
            .any(|c| c.requests.gpu.is_some())
    }

    /// Whether all taints with scheduling effects are tolerated.
    pub fn tolerates_taints(&self, taints: &[Taint]) -> bool {
        taints
            .iter()
            .filter(|t| {
                matches!(t.effect, TaintEffect::NoSchedule | TaintEffect::NoExecute)
            })
            .all(|t| self.spec.tolerations.iter().any(|tol| tol.tolerates(t)))
    }
}

/// Label selector operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    /// Value must be in the set
    In,
    /// Value must not be in the set
    NotIn,
    /// Key must exist
    Exists,
    /// Key must not exist
    DoesNotExist,
}

/// Label selector expression
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorRequirement {
    /// Label key
    pub key: String,
    /// Operator
    pub operator: SelectorOperator,
    /// Values compared under `In`/`NotIn`
    #[serde(default)]
    pub values: Vec<String>,
}

/// Label selector: exact matches ANDed with expressions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelSelector {
    /// Exact label matches
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    /// Expression matches
    #[serde(default)]
    pub match_expressions: Vec<SelectorRequirement>,
}

impl LabelSelector {
    /// Whether the selector matches the given label set.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (k, v) in &self.match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
        for expr in &self.match_expressions {
            let value = labels.get(&expr.key);
            let ok = match expr.operator {
                SelectorOperator::In => value.map(|v| expr.values.contains(v)).unwrap_or(false),
                SelectorOperator::NotIn => {
                    value.map(|v| !expr.values.contains(v)).unwrap_or(true)
                }
                SelectorOperator::Exists => value.is_some(),
                SelectorOperator::DoesNotExist => value.is_none(),
            };
            if !ok {
                return false;
            }
        }
        true
    }

    /// An empty selector matches every object.
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }
}

/// Node selector operator, a superset of [`SelectorOperator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeSelectorOperator {
    /// Value in set
    In,
    /// Value not in set
    NotIn,
    /// Key exists
    Exists,
    /// Key absent
    DoesNotExist,
    /// Label value, parsed as an integer, is greater than the operand
    Gt,
    /// Label value, parsed as an integer, is less than the operand
    Lt,
}

/// One expression of a node selector term
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSelectorRequirement {
    /// Label key
    pub key: String,
    /// Operator
    pub operator: NodeSelectorOperator,
    /// Operand values
    #[serde(default)]
    pub values: Vec<String>,
}

/// A node selector term; expressions are ANDed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSelectorTerm {
    /// Expressions, all of which must hold
    #[serde(default)]
    pub match_expressions: Vec<NodeSelectorRequirement>,
}

/// Required node affinity; terms are ORed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeAffinity {
    /// Terms, at least one of which must hold
    #[serde(default)]
    pub required_terms: Vec<NodeSelectorTerm>,
}

/// A pod (anti-)affinity term scoped to a topology domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodAffinityTerm {
    /// Selector over candidate pods
    #[serde(default)]
    pub selector: Option<LabelSelector>,
    /// Namespaces to search; empty means the pod's own namespace
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Namespace selector; an empty selector means all namespaces
    #[serde(default)]
    pub namespace_selector: Option<LabelSelector>,
    /// Node label that defines the topology domain
    pub topology_key: String,
}

/// Required pod affinity or anti-affinity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodAffinity {
    /// Required terms; all must hold
    #[serde(default)]
    pub required_terms: Vec<PodAffinityTerm>,
}

/// Affinity rules of a pod
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Affinity {
    /// Node affinity
    #[serde(default)]
    pub node_affinity: Option<NodeAffinity>,
    /// Pod affinity
    #[serde(default)]
    pub pod_affinity: Option<PodAffinity>,
    /// Pod anti-affinity
    #[serde(default)]
    pub pod_anti_affinity: Option<PodAffinity>,
}

/// What to do when a topology spread constraint cannot be satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnsatisfiableAction {
    /// Treat the constraint as hard
    DoNotSchedule,
    /// Treat the constraint as a preference
    ScheduleAnyway,
}

/// Topology spread constraint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySpreadConstraint {
    /// Maximum allowed difference between the most and least loaded domains
    pub max_skew: i64,
    /// Node label defining the domains
    pub topology_key: String,
    /// Hard or soft
    pub when_unsatisfiable: UnsatisfiableAction,
    /// Pods counted toward the spread
    #[serde(default)]
    pub selector: Option<LabelSelector>,
}

/// Pod disruption budget, reduced to its enforcement surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodDisruptionBudget {
    /// Metadata
    pub meta: ObjectMeta,
    /// Selector over protected pods
    pub selector: LabelSelector,
    /// Voluntary disruptions currently allowed
    pub disruptions_allowed: i32,
}

/// Horizontal pod autoscaler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HorizontalPodAutoscaler {
    /// Metadata
    pub meta: ObjectMeta,
    /// Kind of the scale target (`Deployment`, `StatefulSet`)
    pub target_kind: String,
    /// Name of the scale target
    pub target_name: String,
    /// Lower replica bound
    pub min_replicas: i32,
    /// Upper replica bound
    pub max_replicas: i32,
    /// Observed replica count
    pub current_replicas: i32,
}

/// Node-group capacity lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifecycle {
    /// Reserved capacity
    OnDemand,
    /// Interruptible capacity
    Spot,
    /// Mixed instance policy
    Mixed,
}

/// A cloud node group (ASG / MIG / VMSS)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroup {
    /// Provider-scoped identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Primary instance type
    pub instance_type: String,
    /// Instance family of the primary type
    pub instance_family: String,
    /// CPU architecture (`amd64`, `arm64`)
    #[serde(default)]
    pub architecture: String,
    /// Minimum node count
    pub min_count: i32,
    /// Desired node count
    pub desired_count: i32,
    /// Maximum node count
    pub max_count: i32,
    /// Capacity lifecycle
    pub lifecycle: Lifecycle,
    /// All instance types the group may launch
    #[serde(default)]
    pub instance_types: Vec<String>,
}

/// Persistent volume, reduced to the cost surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentVolume {
    /// Metadata
    pub meta: ObjectMeta,
    /// Provisioned capacity in bytes
    pub capacity_bytes: i64,
    /// Bound claim as `(namespace, name)`, if any
    #[serde(default)]
    pub claim: Option<(String, String)>,
    /// Bytes actually used, when the storage integration reports filesystem
    /// stats for the volume
    #[serde(default)]
    pub used_bytes: Option<i64>,
    /// Storage class
    #[serde(default)]
    pub storage_class: String,
}

/// Service, reduced to the cost surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Metadata
    pub meta: ObjectMeta,
    /// Whether the service provisions a cloud load balancer
    pub is_load_balancer: bool,
    /// Number of ready endpoints behind the service
    pub endpoint_count: u32,
}

/// Workload scale status used by the rebalancer's readiness wait
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkloadStatus {
    /// Desired replica count
    pub desired_replicas: i32,
    /// Ready replica count
    pub ready_replicas: i32,
}

/// Resolve a ReplicaSet name to its Deployment by the `<deploy>-<hash>`
/// naming convention. Returns `None` when the name has no hash suffix.
pub fn deployment_for_replicaset(rs_name: &str) -> Option<&str> {
    let idx = rs_name.rfind('-')?;
    let (deploy, hash) = rs_name.split_at(idx);
    let hash = &hash[1..];
    if deploy.is_empty() || hash.is_empty() {
        return None;
    }
    // RS hash suffixes are lowercase alphanumeric
    if hash.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        Some(deploy)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_with_containers(cpu: &[i64], init_cpu: &[i64]) -> Pod {
        Pod {
            meta: ObjectMeta::named("p"),
            spec: PodSpec {
                containers: cpu
                    .iter()
                    .map(|&c| Container {
                        name: "c".into(),
                        requests: ResourceRequests {
                            cpu_milli: c,
                            memory_bytes: c * 1024,
                            gpu: None,
                        },
                        resize_policy: None,
                    })
                    .collect(),
                init_containers: init_cpu
                    .iter()
                    .map(|&c| Container {
                        name: "i".into(),
                        requests: ResourceRequests {
                            cpu_milli: c,
                            memory_bytes: c * 1024,
                            gpu: None,
                        },
                        resize_policy: None,
                    })
                    .collect(),
                ..Default::default()
            },
            status: PodStatus::default(),
        }
    }

    #[test]
    fn effective_requests_take_max_of_init_and_sum() {
        let pod = pod_with_containers(&[200, 300], &[400]);
        assert_eq!(pod.effective_requests().cpu_milli, 500);

        let pod = pod_with_containers(&[100], &[900]);
        assert_eq!(pod.effective_requests().cpu_milli, 900);
    }

    #[test]
    fn toleration_matching() {
        let taint = Taint {
            key: "dedicated".into(),
            value: "gpu".into(),
            effect: TaintEffect::NoSchedule,
        };
        let exists_all = Toleration {
            key: String::new(),
            operator: TolerationOperator::Exists,
            value: String::new(),
            effect: None,
        };
        assert!(exists_all.tolerates(&taint));

        let equal = Toleration {
            key: "dedicated".into(),
            operator: TolerationOperator::Equal,
            value: "cpu".into(),
            effect: None,
        };
        assert!(!equal.tolerates(&taint));
    }

    #[test]
    fn selector_expressions() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());
        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![SelectorRequirement {
                key: "app".into(),
                operator: SelectorOperator::In,
                values: vec!["web".into(), "api".into()],
            }],
        };
        assert!(selector.matches(&labels));

        let absent = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![SelectorRequirement {
                key: "tier".into(),
                operator: SelectorOperator::DoesNotExist,
                values: vec![],
            }],
        };
        assert!(absent.matches(&labels));
    }

    #[test]
    fn replicaset_name_resolution() {
        assert_eq!(deployment_for_replicaset("web-6d4cf56db6"), Some("web"));
        assert_eq!(
            deployment_for_replicaset("api-server-abc123"),
            Some("api-server")
        );
        assert_eq!(deployment_for_replicaset("standalone"), None);
    }
}
