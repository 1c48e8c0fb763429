//! Node lock table
//!
//! A named mutual-exclusion token per node. Any mutation of a node (drain,
//! rebalance, scale-down selection) must hold its lock, which is how the
//! evictor, autoscaler, and rebalancer serialize on shared nodes without
//! message passing. Locks expire after a TTL so a crashed holder cannot
//! wedge a node forever; long operations refresh mid-flight.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct LockEntry {
    holder: String,
    acquired_at: DateTime<Utc>,
}

/// Table of per-node locks
pub struct NodeLockTable {
    locks: DashMap<String, LockEntry>,
    ttl: Duration,
}

impl NodeLockTable {
    /// Create a table with the given stale-lock TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            ttl,
        }
    }

    fn is_expired(&self, entry: &LockEntry) -> bool {
        let age = Utc::now().signed_duration_since(entry.acquired_at);
        age.to_std().map(|a| a >= self.ttl).unwrap_or(false)
    }

    /// Try to acquire the lock on `node` for `holder`.
    ///
    /// Succeeds when the node is unlocked, the existing lock has expired, or
    /// `holder` already owns it (re-entry refreshes the acquisition time).
    pub fn try_lock(&self, node: &str, holder: &str) -> bool {
        let mut acquired = false;
        let entry = self
            .locks
            .entry(node.to_string())
            .and_modify(|e| {
                if e.holder == holder || self.is_expired(e) {
                    e.holder = holder.to_string();
                    e.acquired_at = Utc::now();
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                LockEntry {
                    holder: holder.to_string(),
                    acquired_at: Utc::now(),
                }
            });
        drop(entry);
        if !acquired {
            debug!(node, holder, "node lock contended");
        }
        acquired
    }

    /// Release the lock; only the current holder may unlock.
    pub fn unlock(&self, node: &str, holder: &str) -> bool {
        let removed = self
            .locks
            .remove_if(node, |_, entry| entry.holder == holder)
            .is_some();
        if !removed {
            warn!(node, holder, "unlock by non-holder ignored");
        }
        removed
    }

    /// Push the acquisition time forward; only the holder may refresh.
    pub fn refresh(&self, node: &str, holder: &str) -> bool {
        match self.locks.get_mut(node) {
            Some(mut entry) if entry.holder == holder => {
                entry.acquired_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Current holder of a node's lock, ignoring expired entries.
    pub fn holder_of(&self, node: &str) -> Option<String> {
        self.locks.get(node).and_then(|entry| {
            if self.is_expired(&entry) {
                None
            } else {
                Some(entry.holder.clone())
            }
        })
    }

    /// Drop every expired lock. Returns the number removed.
    pub fn expire_stale(&self) -> usize {
        let stale: Vec<String> = self
            .locks
            .iter()
            .filter(|e| self.is_expired(e.value()))
            .map(|e| e.key().clone())
            .collect();
        for node in &stale {
            self.locks.remove_if(node, |_, entry| self.is_expired(entry));
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "expired stale node locks");
        }
        stale.len()
    }

    /// Acquire as an RAII guard that unlocks on drop.
    pub fn guard(self: &Arc<Self>, node: &str, holder: &str) -> Option<NodeLockGuard> {
        if self.try_lock(node, holder) {
            Some(NodeLockGuard {
                table: Arc::clone(self),
                node: node.to_string(),
                holder: holder.to_string(),
            })
        } else {
            None
        }
    }
}

/// RAII guard over a node lock
pub struct NodeLockGuard {
    table: Arc<NodeLockTable>,
    node: String,
    holder: String,
}

impl NodeLockGuard {
    /// Refresh the underlying lock during a long operation.
    pub fn refresh(&self) {
        self.table.refresh(&self.node, &self.holder);
    }

    /// Locked node name.
    pub fn node(&self) -> &str {
        &self.node
    }
}

impl Drop for NodeLockGuard {
    fn drop(&mut self) {
        self.table.unlock(&self.node, &self.holder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusion_and_reentry() {
        let table = NodeLockTable::new(Duration::from_secs(600));
        assert!(table.try_lock("n1", "evictor"));
        assert!(!table.try_lock("n1", "rebalancer"));
        // re-entry by the same holder succeeds
        assert!(table.try_lock("n1", "evictor"));
        assert_eq!(table.holder_of("n1").as_deref(), Some("evictor"));
    }

    #[test]
    fn only_holder_unlocks_or_refreshes() {
        let table = NodeLockTable::new(Duration::from_secs(600));
        assert!(table.try_lock("n1", "evictor"));
        assert!(!table.unlock("n1", "rebalancer"));
        assert!(!table.refresh("n1", "rebalancer"));
        assert!(table.unlock("n1", "evictor"));
        assert!(table.try_lock("n1", "rebalancer"));
    }

    #[test]
    fn expired_lock_is_stealable() {
        let table = NodeLockTable::new(Duration::from_millis(0));
        assert!(table.try_lock("n1", "evictor"));
        // zero TTL: the lock is immediately stale
        assert!(table.try_lock("n1", "rebalancer"));
        assert_eq!(table.holder_of("n1"), None);
        assert_eq!(table.expire_stale(), 1);
    }

    #[test]
    fn guard_unlocks_on_drop() {
        let table = Arc::new(NodeLockTable::new(Duration::from_secs(600)));
        {
            let _guard = table.guard("n1", "evictor").unwrap();
            assert!(table.guard("n1", "rebalancer").is_none());
        }
        assert!(table.guard("n1", "rebalancer").is_some());
    }
}
