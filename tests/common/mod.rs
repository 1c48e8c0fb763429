#![allow(dead_code)]

//! Shared harness for the integration suites

use koptimizer::alerts::AlertManager;
use koptimizer::cloud::{CloudFixture, StaticCloudProvider};
use koptimizer::config::Config;
use koptimizer::drain::Drainer;
use koptimizer::engine::{EngineContext, RecommendationRegistry};
use koptimizer::gate::{AiSafetyGate, FamilyLockGuard, HeuristicOracle};
use koptimizer::orchestrator::{ClusterFixture, StaticOrchestrator};
use koptimizer::state::ClusterState;
use koptimizer::store::{spawn_writer, Store};
use koptimizer::telemetry::Telemetry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Harness {
    pub ctx: Arc<EngineContext>,
    pub orchestrator: Arc<StaticOrchestrator>,
    pub cloud: Arc<StaticCloudProvider>,
    pub shutdown: CancellationToken,
}

/// Wire a full engine context over in-memory fixtures.
pub fn harness(config: Config, fixture: ClusterFixture, cloud_fixture: CloudFixture) -> Harness {
    harness_with_gate(config, fixture, cloud_fixture, true)
}

/// Same as [`harness`], optionally withholding the gate even when the
/// configuration enables it (for fail-closed tests).
pub fn harness_with_gate(
    config: Config,
    fixture: ClusterFixture,
    cloud_fixture: CloudFixture,
    wire_gate: bool,
) -> Harness {
    let orchestrator = Arc::new(StaticOrchestrator::new(fixture));
    let cloud = Arc::new(StaticCloudProvider::new(
        config.cloud_provider,
        cloud_fixture,
    ));
    let dir = tempfile::tempdir().expect("tempdir").into_path();
    let store = Store::open(&dir).expect("store opens");
    let shutdown = CancellationToken::new();
    let (writer, _task) = spawn_writer(
        store.clone(),
        config.store.write_queue_capacity,
        shutdown.clone(),
    );
    let state = Arc::new(ClusterState::new(
        &config,
        orchestrator.clone(),
        cloud.clone(),
        store,
        writer,
    ));
    let gate = if wire_gate && config.ai_gate.enabled {
        Some(Arc::new(
            AiSafetyGate::new(
                config.ai_gate.clone(),
                config.cluster_name.clone(),
                Some(Arc::new(HeuristicOracle::new(&config.ai_gate))),
            )
            .expect("valid gate config"),
        ))
    } else {
        None
    };
    let drainer = Arc::new(Drainer::new(
        orchestrator.clone(),
        Arc::clone(state.locks()),
        Arc::clone(state.audit()),
        config.evictor.clone(),
    ));
    let ctx = Arc::new(EngineContext {
        alerts: Arc::new(AlertManager::new(config.alerts.clone())),
        telemetry: Arc::new(Telemetry::new()),
        registry: Arc::new(RecommendationRegistry::new()),
        family_guard: Arc::new(FamilyLockGuard::new(Vec::new())),
        config,
        state,
        gate,
        drainer,
    });
    Harness {
        ctx,
        orchestrator,
        cloud,
        shutdown,
    }
}

/// An `active`-mode configuration that passes validation.
pub fn active_config() -> Config {
    let mut config = Config::default();
    config.mode = koptimizer::Mode::Active;
    config.region = "us-east-1".to_string();
    config.ai_gate.enabled = true;
    config
}

/// A `monitor`-mode configuration that passes validation.
pub fn monitor_config() -> Config {
    let mut config = Config::default();
    config.region = "us-east-1".to_string();
    config
}
