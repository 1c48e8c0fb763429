//! Controller engine
//!
//! Every optimization concern is a [`Controller`]: a reconciler that wakes on
//! the shared interval, reads one snapshot, produces recommendations, and
//! executes them through the shared gating preamble. The engine owns the
//! tickers, the refresh loop, the hourly cleanup, and the circuit-breaker
//! wiring; controllers own nothing but their policy.

mod registry;

pub use registry::{RecState, RecommendationRegistry};

use crate::alerts::{Alert, AlertManager, AlertSeverity};
use crate::config::{Config, Mode};
use crate::drain::Drainer;
use crate::error::Result;
use crate::gate::{AiSafetyGate, FamilyLockGuard};
use crate::model::{Priority, Recommendation};
use crate::state::{CircuitState, ClusterSnapshot, ClusterState, NodeLockGuard};
use crate::telemetry::Telemetry;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A long-running reconciler owning one optimization concern
#[async_trait]
pub trait Controller: Send + Sync {
    /// Stable controller name, used for breakers, locks, and audit entries.
    fn name(&self) -> &'static str;

    /// Housekeeping before analysis (partial-drain reconciliation and the
    /// like). Errors are logged but do not skip the cycle.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Produce recommendations from one immutable snapshot.
    async fn analyze(&self, snapshot: &ClusterSnapshot) -> Result<Vec<Recommendation>>;

    /// Execute one recommendation. Implementations call
    /// [`EngineContext::clearance`] first and report `Ok(false)` for a
    /// [`Clearance::Skip`]: a blocked recommendation is left pending, not
    /// treated as a failure.
    async fn execute(&self, rec: &Recommendation) -> Result<bool>;
}

/// Outcome of the shared execution preamble
pub enum Clearance {
    /// All gates passed; proceed, holding the node lock when one applies
    Proceed {
        /// Node lock guard for node-scoped work; released on drop
        lock: Option<NodeLockGuard>,
    },
    /// A gate declined; leave the recommendation pending
    Skip(String),
}

/// Services shared by every controller
pub struct EngineContext {
    /// Engine configuration
    pub config: Config,
    /// Shared cluster state
    pub state: Arc<ClusterState>,
    /// AI safety gate, when enabled
    pub gate: Option<Arc<AiSafetyGate>>,
    /// Family lock guard
    pub family_guard: Arc<FamilyLockGuard>,
    /// PDB-aware drainer
    pub drainer: Arc<Drainer>,
    /// Alert channels
    pub alerts: Arc<AlertManager>,
    /// Prometheus handles
    pub telemetry: Arc<Telemetry>,
    /// Surfaced recommendations
    pub registry: Arc<RecommendationRegistry>,
}

impl EngineContext {
    /// The shared execution preamble, in gate order:
    ///
    /// 1. non-active mode or a dry-run controller → audit a dry-run entry
    /// 2. not auto-executable → skip
    /// 3. AI gate (fail-closed when required but absent)
    /// 4. family lock for instance-family operations
    /// 5. node lock for node-scoped operations
    pub async fn clearance(&self, controller: &str, rec: &Recommendation) -> Clearance {
        if self.config.mode != Mode::Active
            || self
                .config
                .dry_run_controllers
                .iter()
                .any(|c| c == controller)
        {
            self.state.audit().record(
                format!("dry-run-{:?}", rec.kind).to_lowercase(),
                rec.target.name.clone(),
                controller,
                rec.summary.clone(),
            );
            return Clearance::Skip("not in active mode".to_string());
        }
        if !rec.auto_executable {
            return Clearance::Skip("not auto-executable".to_string());
        }

        let validation_required = rec.requires_ai_gate
            || self
                .gate
                .as_ref()
                .map(|g| g.requires_validation(rec))
                .unwrap_or(false);
        if validation_required {
            match &self.gate {
                None => {
                    // fail-closed: a required gate that is absent blocks
                    self.state.audit().record(
                        "gate-missing",
                        rec.target.name.clone(),
                        controller,
                        rec.id.clone(),
                    );
                    return Clearance::Skip("safety gate required but not configured".into());
                }
                Some(gate) => {
                    let decision = gate.validate(rec).await;
                    self.state.audit().record(
                        if decision.approved {
                            "gate-approved"
                        } else {
                            "gate-rejected"
                        },
                        rec.target.name.clone(),
                        controller,
                        decision.reasoning.clone(),
                    );
                    if !decision.approved {
                        return Clearance::Skip(decision.reasoning);
                    }
                }
            }
        }

        if rec.touches_instance_family() {
            if let Err(e) = self
                .family_guard
                .validate_node_group_action(&format!("{:?}", rec.kind))
            {
                return Clearance::Skip(e.to_string());
            }
        }

        let lock = match rec.node_scope() {
            Some(node) => match self.state.locks().guard(node, controller) {
                Some(guard) => Some(guard),
                None => {
                    return Clearance::Skip(format!("node {node} is locked"));
                }
            },
            None => None,
        };
        Clearance::Proceed { lock }
    }

    /// Raise an alert for a critical recommendation.
    pub async fn alert_critical(&self, controller: &str, rec: &Recommendation) {
        if rec.priority != Priority::Critical {
            return;
        }
        let alert = Alert {
            alert_type: format!("{controller}-{:?}", rec.kind).to_lowercase(),
            severity: AlertSeverity::Critical,
            title: rec.summary.clone(),
            message: format!(
                "{} (target {} {}, id {})",
                rec.summary, rec.target.kind, rec.target.name, rec.id
            ),
        };
        if let Err(e) = self.alerts.send(&alert).await {
            warn!(error = %e, "critical alert delivery failed");
        }
    }
}

/// The engine: refresh loop plus one ticker per controller
pub struct Engine {
    ctx: Arc<EngineContext>,
    controllers: Vec<Arc<dyn Controller>>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Assemble an engine.
    pub fn new(
        ctx: Arc<EngineContext>,
        controllers: Vec<Arc<dyn Controller>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            controllers,
            shutdown,
        }
    }

    /// Run until the shutdown token fires.
    pub async fn run(self) {
        info!(
            mode = ?self.ctx.config.mode,
            controllers = self.controllers.len(),
            "engine starting"
        );

        // Take the first snapshot before any controller wakes up.
        if let Err(e) = self.ctx.state.refresh().await {
            error!(error = %e, "initial snapshot refresh failed");
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(refresh_loop(
            Arc::clone(&self.ctx),
            self.shutdown.clone(),
        )));
        for controller in &self.controllers {
            tasks.push(tokio::spawn(controller_loop(
                Arc::clone(&self.ctx),
                Arc::clone(controller),
                self.shutdown.clone(),
            )));
        }

        self.shutdown.cancelled().await;
        for task in tasks {
            let _ = task.await;
        }
        info!("engine stopped");
    }
}

async fn refresh_loop(ctx: Arc<EngineContext>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.config.reconcile_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut cleanup = tokio::time::interval(Duration::from_secs(3600));
    cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    cleanup.reset();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = ctx.state.refresh().await {
                    error!(error = %e, "snapshot refresh failed");
                }
                ctx.telemetry
                    .dropped_writes
                    .set(ctx.state.writer().dropped_writes() as i64);
            }
            _ = cleanup.tick() => {
                ctx.state.cleanup().await;
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

async fn controller_loop(
    ctx: Arc<EngineContext>,
    controller: Arc<dyn Controller>,
    shutdown: CancellationToken,
) {
    // small start jitter so controllers do not stampede the first snapshot
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
    tokio::time::sleep(jitter).await;

    let name = controller.name();
    let mut ticker = tokio::time::interval(ctx.config.reconcile_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(controller = name, "controller loop started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !ctx.state.breakers().allow(name) {
                    debug!(controller = name, "skipped: circuit breaker open");
                    continue;
                }
                ctx.telemetry.cycles_total.with_label_values(&[name]).inc();
                match run_cycle(&ctx, controller.as_ref()).await {
                    Ok(executed) => {
                        ctx.state.breakers().record_success(name);
                        if executed > 0 {
                            debug!(controller = name, executed, "cycle complete");
                        }
                    }
                    Err(e) => {
                        ctx.telemetry
                            .cycle_failures_total
                            .with_label_values(&[name])
                            .inc();
                        ctx.state.breakers().record_failure(name);
                        ctx.state.audit().record(
                            "cycle-failed",
                            "-",
                            name,
                            e.to_string(),
                        );
                        error!(controller = name, error = %e, "cycle failed");
                        if ctx.state.breakers().state(name) == CircuitState::Open {
                            let alert = Alert {
                                alert_type: format!("breaker-{name}"),
                                severity: AlertSeverity::Warning,
                                title: format!("{name} circuit breaker open"),
                                message: format!("{name} is being skipped after repeated failures; last error: {e}"),
                            };
                            if let Err(alert_err) = ctx.alerts.send(&alert).await {
                                warn!(error = %alert_err, "breaker alert delivery failed");
                            }
                        }
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    info!(controller = name, "controller loop stopped");
}

/// One controller tick: prepare, analyze one snapshot, execute in order.
pub async fn run_cycle(ctx: &EngineContext, controller: &dyn Controller) -> Result<usize> {
    if let Err(e) = controller.prepare().await {
        warn!(controller = controller.name(), error = %e, "prepare failed");
    }

    let snapshot = ctx.state.snapshot();
    let recommendations = controller.analyze(&snapshot).await?;
    ctx.telemetry
        .recommendations_total
        .with_label_values(&[controller.name()])
        .inc_by(recommendations.len() as u64);
    ctx.registry.publish(controller.name(), &recommendations);

    let mut executed = 0usize;
    let mut first_error: Option<crate::error::OptimizerError> = None;
    for rec in &recommendations {
        ctx.alert_critical(controller.name(), rec).await;
        match controller.execute(rec).await {
            Ok(true) => {
                executed += 1;
                ctx.telemetry
                    .executions_total
                    .with_label_values(&[controller.name()])
                    .inc();
            }
            Ok(false) => {}
            Err(e) if e.is_safety_block() => {
                // deliberate block: the rec stays pending, not a failure
                debug!(controller = controller.name(), rec_id = %rec.id, reason = %e, "execution blocked");
            }
            Err(e) => {
                warn!(controller = controller.name(), rec_id = %rec.id, error = %e, "execution failed");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(executed),
    }
}
