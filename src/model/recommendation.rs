//! Recommendation, the common currency of the engine
//!
//! Every controller's analyze pass produces a list of these; every execute
//! path consumes them subject to the mode and safety gates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Kind of optimization a recommendation carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecommendationKind {
    /// Scale a node group up or down
    NodeScale,
    /// Change a node group's size or instance type
    NodeGroupAdjust,
    /// Change a pod's resource requests
    PodRightsize,
    /// Change a workload's replica bounds
    WorkloadScale,
    /// Drain and remove a node
    Eviction,
    /// Move pods between nodes
    Rebalance,
    /// Shift on-demand capacity to spot
    SpotOptimize,
    /// GPU fallback or scavenging change
    GpuOptimize,
    /// Storage cost opportunity
    Storage,
    /// Network cost opportunity
    Network,
    /// Unexpected cost movement
    CostAnomaly,
}

/// Recommendation priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Informational; act when convenient
    Low,
    /// Meaningful saving or improvement
    Medium,
    /// Significant saving or degradation risk
    High,
    /// Act now (OOM loops, surges, interruptions)
    Critical,
}

/// Risk classification of applying a recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Reversible, narrow blast radius
    Low,
    /// Touches live workloads
    Medium,
    /// Wide blast radius or hard to reverse
    High,
}

/// Target of a recommendation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Object kind (`Node`, `Pod`, `Deployment`, `NodeGroup`, ...)
    pub kind: String,
    /// Namespace, when the target is namespaced
    #[serde(default)]
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl Target {
    /// Cluster-scoped target.
    pub fn cluster(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: None,
            name: name.into(),
        }
    }

    /// Namespaced target.
    pub fn namespaced(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

/// Estimated saving of applying a recommendation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EstimatedSaving {
    /// Monthly saving
    pub monthly_usd: f64,
    /// Annual saving
    pub annual_usd: f64,
}

impl EstimatedSaving {
    /// Build from a monthly figure.
    pub fn monthly(monthly_usd: f64) -> Self {
        Self {
            monthly_usd,
            annual_usd: monthly_usd * 12.0,
        }
    }
}

/// Estimated blast radius of applying a recommendation
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EstimatedImpact {
    /// Nodes affected
    pub nodes_affected: u32,
    /// Pods affected
    pub pods_affected: u32,
    /// Monthly cost change in USD; negative is a saving
    pub monthly_cost_change_usd: f64,
    /// Risk classification
    pub risk: RiskLevel,
}

impl Default for EstimatedImpact {
    fn default() -> Self {
        Self {
            nodes_affected: 0,
            pods_affected: 0,
            monthly_cost_change_usd: 0.0,
            risk: RiskLevel::Low,
        }
    }
}

/// A single optimization recommendation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    /// Unique id within a generation
    pub id: String,
    /// Kind
    pub kind: RecommendationKind,
    /// Priority
    pub priority: Priority,
    /// Target object
    pub target: Target,
    /// One-line human summary
    pub summary: String,
    /// Ordered action steps a human would follow
    pub action_steps: Vec<String>,
    /// Whether the engine may apply this without human approval
    pub auto_executable: bool,
    /// Whether execution must pass the AI safety gate
    pub requires_ai_gate: bool,
    /// Estimated saving, when one can be computed
    #[serde(default)]
    pub estimated_saving: Option<EstimatedSaving>,
    /// Estimated impact
    pub impact: EstimatedImpact,
    /// Action-specific parameters (`node_group_id`, `suggested_request`, ...)
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Recommendation {
    /// Create a recommendation with a fresh id and the given shape.
    pub fn new(kind: RecommendationKind, priority: Priority, target: Target) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            priority,
            target,
            summary: String::new(),
            action_steps: Vec::new(),
            auto_executable: false,
            requires_ai_gate: false,
            estimated_saving: None,
            impact: EstimatedImpact::default(),
            details: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Set the summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Append an action step.
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.action_steps.push(step.into());
        self
    }

    /// Mark auto-executable.
    pub fn auto_executable(mut self, auto: bool) -> Self {
        self.auto_executable = auto;
        self
    }

    /// Require the AI safety gate.
    pub fn with_ai_gate(mut self, required: bool) -> Self {
        self.requires_ai_gate = required;
        self
    }

    /// Set the estimated saving from a monthly figure.
    pub fn with_monthly_saving(mut self, monthly_usd: f64) -> Self {
        self.estimated_saving = Some(EstimatedSaving::monthly(monthly_usd));
        self.impact.monthly_cost_change_usd = -monthly_usd;
        self
    }

    /// Set the estimated impact.
    pub fn with_impact(mut self, impact: EstimatedImpact) -> Self {
        self.impact = impact;
        self
    }

    /// Insert a detail parameter.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Node name this recommendation mutates, when it is node-scoped.
    ///
    /// Node-scoped executions must hold the node lock for their duration.
    pub fn node_scope(&self) -> Option<&str> {
        if self.target.kind == "Node" {
            Some(self.target.name.as_str())
        } else {
            self.details.get("node").map(String::as_str)
        }
    }

    /// Whether this recommendation reshapes node groups or instance families.
    pub fn touches_instance_family(&self) -> bool {
        matches!(
            self.kind,
            RecommendationKind::NodeGroupAdjust | RecommendationKind::SpotOptimize
        ) || self.details.contains_key("suggested_instance_type")
    }
}
