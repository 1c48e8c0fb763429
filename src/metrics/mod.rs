//! Time-series metrics store
//!
//! Two families of series, per node and per (namespace, pod, container),
//! each a weakly time-ordered sequence of `(ts, cpu_milli, mem_bytes)`
//! samples. The store derives percentile windows for the rightsizer and the
//! surge detector, enforces a retention horizon, and caps the pod-series key
//! count with LRU-by-latest-sample eviction.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Key of a pod-container series
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container name
    pub container: String,
}

impl SeriesKey {
    /// Construct a key.
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

/// One usage sample
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sample {
    /// Observation time
    pub ts: DateTime<Utc>,
    /// CPU in millicores
    pub cpu_milli: f64,
    /// Memory in bytes
    pub mem_bytes: f64,
}

/// Percentiles over one axis of a window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Percentiles {
    /// Median
    pub p50: f64,
    /// 95th percentile
    pub p95: f64,
    /// 99th percentile
    pub p99: f64,
    /// Maximum
    pub max: f64,
}

/// Derived view over a series for a duration
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsWindow {
    /// CPU percentiles in millicores
    pub cpu: Percentiles,
    /// Memory percentiles in bytes
    pub memory: Percentiles,
    /// Number of samples in the window
    pub data_points: usize,
}

#[derive(Default)]
struct Series {
    samples: VecDeque<Sample>,
}

impl Series {
    fn push(&mut self, sample: Sample) {
        // Weak ordering: accept out-of-order arrivals but keep the tail sorted
        // enough for range scans by inserting before newer samples.
        if let Some(last) = self.samples.back() {
            if sample.ts < last.ts {
                let pos = self
                    .samples
                    .iter()
                    .rposition(|s| s.ts <= sample.ts)
                    .map(|i| i + 1)
                    .unwrap_or(0);
                self.samples.insert(pos, sample);
                return;
            }
        }
        self.samples.push_back(sample);
    }

    fn evict_older_than(&mut self, cutoff: DateTime<Utc>) {
        while let Some(front) = self.samples.front() {
            if front.ts < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn latest_ts(&self) -> Option<DateTime<Utc>> {
        self.samples.back().map(|s| s.ts)
    }

    fn window(&self, since: DateTime<Utc>) -> MetricsWindow {
        let mut cpu: Vec<f64> = Vec::new();
        let mut mem: Vec<f64> = Vec::new();
        for sample in self.samples.iter().filter(|s| s.ts >= since) {
            cpu.push(sample.cpu_milli);
            mem.push(sample.mem_bytes);
        }
        MetricsWindow {
            data_points: cpu.len(),
            cpu: percentiles(&mut cpu),
            memory: percentiles(&mut mem),
        }
    }
}

fn percentiles(values: &mut [f64]) -> Percentiles {
    if values.is_empty() {
        return Percentiles::default();
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let at = |q: f64| {
        let idx = ((q * values.len() as f64).ceil() as usize).max(1) - 1;
        values[idx.min(values.len() - 1)]
    };
    Percentiles {
        p50: at(0.50),
        p95: at(0.95),
        p99: at(0.99),
        max: values[values.len() - 1],
    }
}

struct Inner {
    nodes: HashMap<String, Series>,
    pods: HashMap<SeriesKey, Series>,
}

/// Thread-safe metrics store
pub struct MetricsStore {
    inner: Mutex<Inner>,
    retention: Duration,
    max_pod_series: usize,
}

impl MetricsStore {
    /// Create a store with the given retention horizon and pod-series cap.
    pub fn new(retention: Duration, max_pod_series: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: HashMap::new(),
                pods: HashMap::new(),
            }),
            retention,
            max_pod_series,
        }
    }

    /// Record a node sample.
    pub fn record_node(&self, node: &str, sample: Sample) {
        let mut inner = self.inner.lock();
        inner.nodes.entry(node.to_string()).or_default().push(sample);
    }

    /// Record a pod-container sample.
    pub fn record_pod(&self, key: SeriesKey, sample: Sample) {
        let mut inner = self.inner.lock();
        inner.pods.entry(key).or_default().push(sample);
        if inner.pods.len() > self.max_pod_series {
            evict_lru(&mut inner.pods, self.max_pod_series);
        }
    }

    /// Derived window over a node series.
    pub fn node_window(&self, node: &str, duration: Duration) -> Option<MetricsWindow> {
        let since = Utc::now()
            - ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(7));
        let inner = self.inner.lock();
        inner.nodes.get(node).map(|s| s.window(since))
    }

    /// Derived window over a pod-container series.
    pub fn pod_window(&self, key: &SeriesKey, duration: Duration) -> Option<MetricsWindow> {
        let since = Utc::now()
            - ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(7));
        let inner = self.inner.lock();
        inner.pods.get(key).map(|s| s.window(since))
    }

    /// Latest node sample, when one exists.
    pub fn latest_node_sample(&self, node: &str) -> Option<Sample> {
        let inner = self.inner.lock();
        inner.nodes.get(node).and_then(|s| s.samples.back().copied())
    }

    /// Latest pod-container sample, when one exists.
    pub fn latest_pod_sample(&self, key: &SeriesKey) -> Option<Sample> {
        let inner = self.inner.lock();
        inner.pods.get(key).and_then(|s| s.samples.back().copied())
    }

    /// Drop samples older than the retention horizon and prune empty series.
    pub fn enforce_retention(&self) {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.retention).unwrap_or_else(|_| ChronoDuration::days(7));
        let mut inner = self.inner.lock();
        for series in inner.nodes.values_mut() {
            series.evict_older_than(cutoff);
        }
        for series in inner.pods.values_mut() {
            series.evict_older_than(cutoff);
        }
        inner.nodes.retain(|_, s| !s.samples.is_empty());
        inner.pods.retain(|_, s| !s.samples.is_empty());
    }

    /// Enforce the pod-series key cap immediately.
    pub fn enforce_key_cap(&self) {
        let mut inner = self.inner.lock();
        if inner.pods.len() > self.max_pod_series {
            evict_lru(&mut inner.pods, self.max_pod_series);
        }
    }

    /// Number of pod-container series currently held.
    pub fn pod_series_count(&self) -> usize {
        self.inner.lock().pods.len()
    }
}

/// Evict least-recently-sampled series until the map is back at the cap.
fn evict_lru(pods: &mut HashMap<SeriesKey, Series>, cap: usize) {
    let excess = pods.len().saturating_sub(cap);
    if excess == 0 {
        return;
    }
    let mut by_age: Vec<(SeriesKey, DateTime<Utc>)> = pods
        .iter()
        .map(|(k, s)| {
            (
                k.clone(),
                s.latest_ts().unwrap_or(DateTime::<Utc>::MIN_UTC),
            )
        })
        .collect();
    by_age.sort_by_key(|(_, ts)| *ts);
    for (key, _) in by_age.into_iter().take(excess) {
        pods.remove(&key);
    }
}
