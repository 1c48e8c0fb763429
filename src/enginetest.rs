//! Unit-test harness for controller tests
//!
//! Builds a full [`EngineContext`] over the in-memory orchestrator and cloud
//! fixtures with a throwaway sled store. Only compiled for tests.

use crate::alerts::AlertManager;
use crate::cloud::{CloudFixture, StaticCloudProvider};
use crate::config::Config;
use crate::drain::Drainer;
use crate::engine::{EngineContext, RecommendationRegistry};
use crate::gate::{AiSafetyGate, FamilyLockGuard, HeuristicOracle};
use crate::orchestrator::{ClusterFixture, StaticOrchestrator};
use crate::state::ClusterState;
use crate::store::{spawn_writer, Store};
use crate::telemetry::Telemetry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A fully wired engine context plus handles for assertions
pub struct TestHarness {
    /// The context under test
    pub ctx: Arc<EngineContext>,
    /// The orchestrator fixture
    pub orchestrator: Arc<StaticOrchestrator>,
    /// The cloud fixture
    pub cloud: Arc<StaticCloudProvider>,
    /// Cancels the writer task
    pub shutdown: CancellationToken,
}

/// Build a harness over the given config and fixtures.
pub fn harness_with(
    config: Config,
    fixture: ClusterFixture,
    cloud_fixture: CloudFixture,
) -> TestHarness {
    let ctx = build_context(config, fixture, cloud_fixture);
    TestHarness {
        orchestrator: ctx.1,
        cloud: ctx.2,
        shutdown: ctx.3,
        ctx: Arc::new(ctx.0),
    }
}

/// A context over empty fixtures and default configuration.
pub fn context_with_defaults() -> EngineContext {
    build_context(
        Config::default(),
        ClusterFixture::default(),
        CloudFixture::default(),
    )
    .0
}

fn build_context(
    config: Config,
    fixture: ClusterFixture,
    cloud_fixture: CloudFixture,
) -> (
    EngineContext,
    Arc<StaticOrchestrator>,
    Arc<StaticCloudProvider>,
    CancellationToken,
) {
    let orchestrator = Arc::new(StaticOrchestrator::new(fixture));
    let cloud = Arc::new(StaticCloudProvider::new(
        config.cloud_provider,
        cloud_fixture,
    ));
    // into_path keeps the directory for sled's lifetime
    let dir = tempfile::tempdir().expect("tempdir").into_path();
    let store = Store::open(&dir).expect("store opens");
    let shutdown = CancellationToken::new();
    let (writer, _task) = spawn_writer(store.clone(), config.store.write_queue_capacity, shutdown.clone());

    let state = Arc::new(ClusterState::new(
        &config,
        orchestrator.clone(),
        cloud.clone(),
        store,
        writer,
    ));
    let gate = if config.ai_gate.enabled {
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
    let family_guard = Arc::new(FamilyLockGuard::new(Vec::new()));
    let drainer = Arc::new(Drainer::new(
        orchestrator.clone(),
        Arc::clone(state.locks()),
        Arc::clone(state.audit()),
        config.evictor.clone(),
    ));
    let ctx = EngineContext {
        config,
        state,
        gate,
        family_guard,
        drainer,
        alerts: Arc::new(AlertManager::new(Default::default())),
        telemetry: Arc::new(Telemetry::new()),
        registry: Arc::new(RecommendationRegistry::new()),
    };
    (ctx, orchestrator, cloud, shutdown)
}
