//! Error types for the optimizer engine
//!
//! The taxonomy mirrors the failure-containment design: transient I/O from
//! the orchestrator or cloud provider, validation problems, safety blocks
//! (which are states rather than failures), and fatal configuration errors
//! that abort startup.

use thiserror::Error;

/// Result type for optimizer operations
pub type Result<T> = std::result::Result<T, OptimizerError>;

/// Errors that can occur in the optimizer engine
#[derive(Error, Debug)]
pub enum OptimizerError {
    /// Orchestrator API error (list/get/patch/evict)
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// Cloud provider API error (pricing, node groups, scaling)
    #[error("Cloud provider error: {0}")]
    CloudProvider(String),

    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistent store error
    #[error("Store error: {0}")]
    Store(String),

    /// Metrics store error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Node lock is held by another holder
    #[error("Node {node} is locked by {holder}")]
    NodeLocked {
        /// Node whose lock was contended
        node: String,
        /// Holder currently owning the lock
        holder: String,
    },

    /// Drain failed for a node
    #[error("Drain of node {node} failed: {reason}")]
    DrainFailed {
        /// Node that was being drained
        node: String,
        /// Aggregated failure reason
        reason: String,
    },

    /// A pod disruption budget blocks an eviction
    #[error("PDB violation: {pod} has no disruptions allowed")]
    PdbViolation {
        /// Pod protected by the budget, as `namespace/name`
        pod: String,
    },

    /// The AI safety gate rejected or could not validate an action
    #[error("Safety gate rejected: {reason}")]
    GateRejected {
        /// Reasoning returned by the gate, or the failure description
        reason: String,
    },

    /// An instance-family migration is in progress
    #[error("Family lock: {0}")]
    FamilyLock(String),

    /// An operation exceeded its deadline
    #[error("Timeout during {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// Alert channel failure
    #[error("Alert delivery failed: {0}")]
    Alert(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OptimizerError {
    /// Whether this error is a safety block rather than a failure.
    ///
    /// Safety blocks (gate rejections, family locks, PDB violations, lock
    /// contention) leave the recommendation pending and are not recorded as
    /// controller failures by the circuit breaker.
    pub fn is_safety_block(&self) -> bool {
        matches!(
            self,
            OptimizerError::GateRejected { .. }
                | OptimizerError::FamilyLock(_)
                | OptimizerError::PdbViolation { .. }
                | OptimizerError::NodeLocked { .. }
        )
    }
}
