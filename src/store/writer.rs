//! Single-writer queue in front of the persistent store
//!
//! Every controller enqueues; exactly one task writes. The queue is bounded
//! and lossy under pressure: a full queue drops the write and bumps an
//! observable counter instead of stalling a control loop.

use super::{AuditRecord, CostPoint, Store};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One write destined for the store
#[derive(Debug, Clone)]
pub enum WriteRecord {
    /// Append to `cost_history`
    CostHistory(CostPoint),
    /// Append to `node_metrics`
    NodeMetric {
        /// Sample time
        timestamp: DateTime<Utc>,
        /// Node name
        node: String,
        /// CPU usage in millicores
        cpu_milli: f64,
        /// Memory usage in bytes
        memory_bytes: f64,
    },
    /// Append to `pod_metrics`
    PodMetric {
        /// Sample time
        timestamp: DateTime<Utc>,
        /// Namespace
        namespace: String,
        /// Pod name
        pod: String,
        /// Container name
        container: String,
        /// CPU usage in millicores
        cpu_milli: f64,
        /// Memory usage in bytes
        memory_bytes: f64,
    },
    /// Append to the audit table
    Audit(AuditRecord),
    /// Upsert the pricing cache
    Pricing {
        /// Instance type name
        instance_type: String,
        /// On-demand hourly price
        hourly_usd: f64,
    },
}

/// Producer handle to the writer queue. Cheap to clone.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::Sender<WriteRecord>,
    dropped: Arc<AtomicU64>,
}

impl StoreWriter {
    /// Enqueue a write without blocking. Full queue drops the record.
    pub fn enqueue(&self, record: WriteRecord) {
        if self.tx.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of writes dropped because the queue was full.
    pub fn dropped_writes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Spawn the writer task. On cancellation it drains whatever is already
/// queued, flushes, and exits.
pub fn spawn_writer(
    store: Store,
    capacity: usize,
    shutdown: CancellationToken,
) -> (StoreWriter, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<WriteRecord>(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    let handle_dropped = Arc::clone(&dropped);

    let handle = tokio::spawn(async move {
        info!(capacity, "store writer started");
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(record) => {
                            if let Err(e) = store.apply(&record) {
                                error!(error = %e, "store write failed");
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown.cancelled() => {
                    rx.close();
                    let mut drained = 0usize;
                    while let Ok(record) = rx.try_recv() {
                        if let Err(e) = store.apply(&record) {
                            error!(error = %e, "store write failed during drain");
                        }
                        drained += 1;
                    }
                    debug!(drained, "store writer drained on shutdown");
                    break;
                }
            }
        }
        if let Err(e) = store.flush() {
            error!(error = %e, "final store flush failed");
        }
        let lost = handle_dropped.load(Ordering::Relaxed);
        if lost > 0 {
            warn!(dropped = lost, "writes were dropped under queue pressure");
        }
        info!("store writer stopped");
    });

    (StoreWriter { tx, dropped }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writer_applies_and_drains_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let shutdown = CancellationToken::new();
        let (writer, handle) = spawn_writer(store.clone(), 16, shutdown.clone());

        writer.enqueue(WriteRecord::Audit(AuditRecord {
            timestamp: Utc::now(),
            action: "drain-node".into(),
            target: "n1".into(),
            actor: "evictor".into(),
            detail: String::new(),
        }));

        shutdown.cancel();
        handle.await.unwrap();

        let entries = store.audit_since(Store::epoch()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "drain-node");
        assert_eq!(writer.dropped_writes(), 0);
    }
}
