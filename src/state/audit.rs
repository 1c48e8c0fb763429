//! Audit log
//!
//! Append-only record of everything the engine did or decided not to do.
//! Entries land in a capped in-memory tail for fast reads and flow to the
//! persistent store through the async writer.

use crate::store::{AuditRecord, StoreWriter, WriteRecord};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::debug;

/// Audit log with an in-memory tail
pub struct AuditLog {
    tail: Mutex<VecDeque<AuditRecord>>,
    cap: usize,
    writer: StoreWriter,
}

impl AuditLog {
    /// Create a log retaining `cap` entries in memory.
    pub fn new(cap: usize, writer: StoreWriter) -> Self {
        Self {
            tail: Mutex::new(VecDeque::with_capacity(cap)),
            cap,
            writer,
        }
    }

    /// Append an entry.
    pub fn record(
        &self,
        action: impl Into<String>,
        target: impl Into<String>,
        actor: impl Into<String>,
        detail: impl Into<String>,
    ) {
        let entry = AuditRecord {
            timestamp: Utc::now(),
            action: action.into(),
            target: target.into(),
            actor: actor.into(),
            detail: detail.into(),
        };
        debug!(
            action = %entry.action,
            target = %entry.target,
            actor = %entry.actor,
            "audit"
        );
        self.writer.enqueue(WriteRecord::Audit(entry.clone()));
        let mut tail = self.tail.lock();
        if tail.len() == self.cap {
            tail.pop_front();
        }
        tail.push_back(entry);
    }

    /// Most recent `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<AuditRecord> {
        let tail = self.tail.lock();
        tail.iter().rev().take(n).rev().cloned().collect()
    }
}
