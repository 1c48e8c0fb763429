//! Persistent store
//!
//! sled trees keyed by big-endian millisecond timestamps so retention
//! pruning is a range scan. All timestamped writes flow through the single
//! async writer ([`writer`]); the only synchronous write path is the
//! hibernation state, whose wake-restore invariant needs read-your-write
//! durability the at-most-once queue cannot give.

use crate::error::{OptimizerError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

mod writer;

pub use writer::{spawn_writer, StoreWriter, WriteRecord};

/// One audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the action happened
    pub timestamp: DateTime<Utc>,
    /// Action verb (`drain-node`, `scale-up`, `dry-run-rightsize`, ...)
    pub action: String,
    /// Acted-upon object
    pub target: String,
    /// Controller or subsystem that acted
    pub actor: String,
    /// Free-form detail
    pub detail: String,
}

/// Persisted hibernation state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedHibernationState {
    /// Whether the cluster is currently hibernated
    pub hibernated: bool,
    /// Desired count per node group before hibernation
    #[serde(default)]
    pub saved_desired: BTreeMap<String, i32>,
    /// Minimum count per node group before hibernation
    #[serde(default)]
    pub saved_min: BTreeMap<String, i32>,
}

/// A row of the cost history
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostPoint {
    /// Observation time
    pub timestamp: DateTime<Utc>,
    /// Extrapolated daily cost in USD
    pub daily_cost_usd: f64,
}

const TREE_COST_HISTORY: &str = "cost_history";
const TREE_NODE_METRICS: &str = "node_metrics";
const TREE_POD_METRICS: &str = "pod_metrics";
const TREE_AUDIT: &str = "audit";
const TREE_PRICING: &str = "pricing";
const TREE_HIBERNATION: &str = "hibernation";
const HIBERNATION_KEY: &[u8] = b"state";

/// Handle over the sled database. Clones share the same underlying trees.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    cost_history: sled::Tree,
    node_metrics: sled::Tree,
    pod_metrics: sled::Tree,
    audit: sled::Tree,
    pricing: sled::Tree,
    hibernation: sled::Tree,
}

fn ts_key(ts: DateTime<Utc>, suffix: &[u8]) -> Vec<u8> {
    let mut key = ts.timestamp_millis().to_be_bytes().to_vec();
    key.extend_from_slice(suffix);
    key
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).map_err(|e| OptimizerError::Store(e.to_string()))?;
        let open_tree = |name: &str| {
            db.open_tree(name)
                .map_err(|e| OptimizerError::Store(e.to_string()))
        };
        Ok(Self {
            cost_history: open_tree(TREE_COST_HISTORY)?,
            node_metrics: open_tree(TREE_NODE_METRICS)?,
            pod_metrics: open_tree(TREE_POD_METRICS)?,
            audit: open_tree(TREE_AUDIT)?,
            pricing: open_tree(TREE_PRICING)?,
            hibernation: open_tree(TREE_HIBERNATION)?,
            db,
        })
    }

    pub(crate) fn apply(&self, record: &WriteRecord) -> Result<()> {
        match record {
            WriteRecord::CostHistory(point) => {
                let value = serde_json::to_vec(point)?;
                self.cost_history
                    .insert(ts_key(point.timestamp, &[]), value)
                    .map_err(|e| OptimizerError::Store(e.to_string()))?;
            }
            WriteRecord::NodeMetric {
                timestamp,
                node,
                cpu_milli,
                memory_bytes,
            } => {
                let value = serde_json::to_vec(&(node, cpu_milli, memory_bytes))?;
                self.node_metrics
                    .insert(ts_key(*timestamp, node.as_bytes()), value)
                    .map_err(|e| OptimizerError::Store(e.to_string()))?;
            }
            WriteRecord::PodMetric {
                timestamp,
                namespace,
                pod,
                container,
                cpu_milli,
                memory_bytes,
            } => {
                let suffix = format!("{namespace}/{pod}/{container}");
                let value =
                    serde_json::to_vec(&(namespace, pod, container, cpu_milli, memory_bytes))?;
                self.pod_metrics
                    .insert(ts_key(*timestamp, suffix.as_bytes()), value)
                    .map_err(|e| OptimizerError::Store(e.to_string()))?;
            }
            WriteRecord::Audit(entry) => {
                let value = serde_json::to_vec(entry)?;
                self.audit
                    .insert(ts_key(entry.timestamp, entry.actor.as_bytes()), value)
                    .map_err(|e| OptimizerError::Store(e.to_string()))?;
            }
            WriteRecord::Pricing {
                instance_type,
                hourly_usd,
            } => {
                let value = serde_json::to_vec(hourly_usd)?;
                self.pricing
                    .insert(instance_type.as_bytes(), value)
                    .map_err(|e| OptimizerError::Store(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Cost points newer than `since`, oldest first.
    pub fn cost_history_since(&self, since: DateTime<Utc>) -> Result<Vec<CostPoint>> {
        let start = ts_key(since, &[]);
        let mut points = Vec::new();
        for item in self.cost_history.range(start..) {
            let (_, value) = item.map_err(|e| OptimizerError::Store(e.to_string()))?;
            points.push(serde_json::from_slice(&value)?);
        }
        Ok(points)
    }

    /// Audit entries newer than `since`, oldest first.
    pub fn audit_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditRecord>> {
        let start = ts_key(since, &[]);
        let mut entries = Vec::new();
        for item in self.audit.range(start..) {
            let (_, value) = item.map_err(|e| OptimizerError::Store(e.to_string()))?;
            entries.push(serde_json::from_slice(&value)?);
        }
        Ok(entries)
    }

    /// Cached hourly price for an instance type, if any.
    pub fn cached_price(&self, instance_type: &str) -> Result<Option<f64>> {
        match self
            .pricing
            .get(instance_type.as_bytes())
            .map_err(|e| OptimizerError::Store(e.to_string()))?
        {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Persist hibernation state durably (synchronous path, flushed).
    pub fn save_hibernation_state(&self, state: &SavedHibernationState) -> Result<()> {
        let value = serde_json::to_vec(state)?;
        self.hibernation
            .insert(HIBERNATION_KEY, value)
            .map_err(|e| OptimizerError::Store(e.to_string()))?;
        self.hibernation
            .flush()
            .map_err(|e| OptimizerError::Store(e.to_string()))?;
        Ok(())
    }

    /// Load hibernation state; default when never saved.
    pub fn load_hibernation_state(&self) -> Result<SavedHibernationState> {
        match self
            .hibernation
            .get(HIBERNATION_KEY)
            .map_err(|e| OptimizerError::Store(e.to_string()))?
        {
            Some(value) => Ok(serde_json::from_slice(&value)?),
            None => Ok(SavedHibernationState::default()),
        }
    }

    /// Remove every timestamped row older than `cutoff`. Returns rows removed.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0u64;
        let end = ts_key(cutoff, &[]);
        for tree in [&self.cost_history, &self.node_metrics, &self.pod_metrics, &self.audit] {
            let keys: Vec<_> = tree
                .range(..end.clone())
                .keys()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| OptimizerError::Store(e.to_string()))?;
            for key in keys {
                tree.remove(key)
                    .map_err(|e| OptimizerError::Store(e.to_string()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Flush all trees and the underlying database.
    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| OptimizerError::Store(e.to_string()))?;
        Ok(())
    }

    /// Earliest representable timestamp, used for full-history scans.
    pub fn epoch() -> DateTime<Utc> {
        Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn cost_history_round_trip() {
        let (_dir, store) = temp_store();
        let now = Utc::now();
        store
            .apply(&WriteRecord::CostHistory(CostPoint {
                timestamp: now - ChronoDuration::days(1),
                daily_cost_usd: 100.0,
            }))
            .unwrap();
        store
            .apply(&WriteRecord::CostHistory(CostPoint {
                timestamp: now,
                daily_cost_usd: 120.0,
            }))
            .unwrap();
        let points = store
            .cost_history_since(now - ChronoDuration::days(2))
            .unwrap();
        assert_eq!(points.len(), 2);
        assert!((points[1].daily_cost_usd - 120.0).abs() < f64::EPSILON);
    }

    #[test]
    fn retention_prune_removes_old_rows() {
        let (_dir, store) = temp_store();
        let now = Utc::now();
        store
            .apply(&WriteRecord::NodeMetric {
                timestamp: now - ChronoDuration::days(100),
                node: "n1".into(),
                cpu_milli: 100.0,
                memory_bytes: 1024.0,
            })
            .unwrap();
        store
            .apply(&WriteRecord::NodeMetric {
                timestamp: now,
                node: "n1".into(),
                cpu_milli: 200.0,
                memory_bytes: 2048.0,
            })
            .unwrap();
        let removed = store
            .prune_older_than(now - ChronoDuration::days(90))
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn hibernation_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            let mut state = SavedHibernationState {
                hibernated: true,
                ..Default::default()
            };
            state.saved_desired.insert("ng-1".into(), 5);
            state.saved_min.insert("ng-1".into(), 2);
            store.save_hibernation_state(&state).unwrap();
        }
        let store = Store::open(dir.path()).unwrap();
        let state = store.load_hibernation_state().unwrap();
        assert!(state.hibernated);
        assert_eq!(state.saved_desired.get("ng-1"), Some(&5));
        assert_eq!(state.saved_min.get("ng-1"), Some(&2));
    }
}
