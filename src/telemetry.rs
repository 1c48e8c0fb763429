//! Prometheus metrics
//!
//! The registry is public; exposition transport lives outside the engine.

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

/// Engine-wide metric handles
pub struct Telemetry {
    registry: Registry,
    /// Controller cycles run, by controller
    pub cycles_total: IntCounterVec,
    /// Controller cycles that failed, by controller
    pub cycle_failures_total: IntCounterVec,
    /// Recommendations produced, by controller
    pub recommendations_total: IntCounterVec,
    /// Recommendations executed, by controller
    pub executions_total: IntCounterVec,
    /// Store writes dropped under queue pressure
    pub dropped_writes: IntGauge,
}

impl Telemetry {
    /// Create and register all metrics.
    pub fn new() -> Self {
        let registry = Registry::new();
        let cycles_total = IntCounterVec::new(
            Opts::new("koptimizer_cycles_total", "Controller cycles run"),
            &["controller"],
        )
        .unwrap_or_else(|_| unreachable!("static metric definition"));
        let cycle_failures_total = IntCounterVec::new(
            Opts::new("koptimizer_cycle_failures_total", "Controller cycles failed"),
            &["controller"],
        )
        .unwrap_or_else(|_| unreachable!("static metric definition"));
        let recommendations_total = IntCounterVec::new(
            Opts::new(
                "koptimizer_recommendations_total",
                "Recommendations produced",
            ),
            &["controller"],
        )
        .unwrap_or_else(|_| unreachable!("static metric definition"));
        let executions_total = IntCounterVec::new(
            Opts::new("koptimizer_executions_total", "Recommendations executed"),
            &["controller"],
        )
        .unwrap_or_else(|_| unreachable!("static metric definition"));
        let dropped_writes = IntGauge::new(
            "koptimizer_dropped_writes",
            "Store writes dropped under queue pressure",
        )
        .unwrap_or_else(|_| unreachable!("static metric definition"));

        for metric in [
            Box::new(cycles_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(cycle_failures_total.clone()),
            Box::new(recommendations_total.clone()),
            Box::new(executions_total.clone()),
            Box::new(dropped_writes.clone()),
        ] {
            let _ = registry.register(metric);
        }

        Self {
            registry,
            cycles_total,
            cycle_failures_total,
            recommendations_total,
            executions_total,
            dropped_writes,
        }
    }

    /// The underlying registry, for exposition by the caller.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
