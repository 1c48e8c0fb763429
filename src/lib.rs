//! KOptimizer: cluster cost and capacity optimizer
//!
//! A fleet of cooperating control loops observes a container-orchestration
//! cluster, derives rightsizing and scaling opportunities, and either
//! recommends or actuates changes while preserving workload safety
//! guarantees (disruption budgets, affinity, termination grace).
//!
//! ## Architecture
//!
//! - [`state`]: the shared substrate: immutable snapshots, node locks,
//!   circuit breakers, the audit log, the metrics store
//! - [`simulator`]: placement feasibility (taints, affinity, topology
//!   spread, resources, GPU)
//! - [`packing`]: fragmentation scoring and the first-fit-decreasing
//!   min-bins estimate
//! - [`drain`]: PDB-aware eviction with partial-failure recovery
//! - [`engine`]: the controller trait, the three-mode execution gating,
//!   and the ticker runtime
//! - [`controllers`]: the fleet: evictor, node autoscaler, rightsizer,
//!   workload scaler, rebalancer, spot, GPU, hibernation, storage,
//!   network, cost anomaly
//! - [`gate`]: the AI safety gate and the instance-family lock
//! - [`orchestrator`] / [`cloud`]: external-collaborator contracts with
//!   in-memory fixtures
//!
//! Execution is gated by mode: `monitor` and `recommend` never mutate the
//! cluster; `active` mutates subject to the safety gate, the family lock,
//! and per-node locks.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod alerts;
pub mod cloud;
pub mod config;
pub mod controllers;
pub mod drain;
pub mod engine;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod packing;
pub mod simulator;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod testutil;

#[cfg(test)]
mod enginetest;

pub use config::{CloudVendor, Config, Mode};
pub use engine::{Controller, Engine, EngineContext};
pub use error::{OptimizerError, Result};
pub use model::{Priority, Recommendation, RecommendationKind};
pub use state::{ClusterSnapshot, ClusterState};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
