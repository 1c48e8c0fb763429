//! koptimizerd, the optimizer daemon
//!
//! Wires the engine against the configured collaborators and runs until
//! interrupted. Without a live orchestrator adapter the daemon runs over a
//! cluster manifest file, which is the supported shape for monitor and
//! recommend modes.

use anyhow::Context;
use clap::Parser;
use koptimizer::alerts::AlertManager;
use koptimizer::cloud::{CloudFixture, CloudProvider, StaticCloudProvider};
use koptimizer::config::{self, Mode};
use koptimizer::controllers::{self, HibernationManager};
use koptimizer::drain::Drainer;
use koptimizer::engine::{Engine, EngineContext, RecommendationRegistry};
use koptimizer::gate::{AiSafetyGate, FamilyLockGuard, HeuristicOracle};
use koptimizer::orchestrator::{ClusterFixture, StaticOrchestrator};
use koptimizer::state::ClusterState;
use koptimizer::store::{spawn_writer, Store};
use koptimizer::telemetry::Telemetry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "koptimizerd", version = koptimizer::VERSION)]
#[command(about = "Cluster cost and capacity optimizer")]
struct Args {
    /// Path to the YAML configuration document
    #[arg(long, env = "KOPTIMIZER_CONFIG")]
    config: Option<PathBuf>,

    /// Cluster manifest backing the in-memory orchestrator
    #[arg(long, env = "KOPTIMIZER_CLUSTER_MANIFEST")]
    cluster_manifest: Option<PathBuf>,

    /// Cloud fixture (node groups and instance catalog)
    #[arg(long, env = "KOPTIMIZER_CLOUD_MANIFEST")]
    cloud_manifest: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = config::load(args.config.as_deref()).context("loading configuration")?;
    info!(
        version = koptimizer::VERSION,
        mode = ?config.mode,
        provider = ?config.cloud_provider,
        region = %config.region,
        cluster = %config.cluster_name,
        "koptimizer starting"
    );

    let orchestrator: Arc<StaticOrchestrator> = match &args.cluster_manifest {
        Some(path) => Arc::new(
            StaticOrchestrator::from_manifest_file(path).context("loading cluster manifest")?,
        ),
        None => {
            warn!("no cluster manifest given; starting over an empty cluster view");
            Arc::new(StaticOrchestrator::new(ClusterFixture::default()))
        }
    };
    let cloud_fixture: CloudFixture = match &args.cloud_manifest {
        Some(path) => {
            let content =
                std::fs::read_to_string(path).context("reading cloud manifest")?;
            serde_yaml::from_str(&content).context("parsing cloud manifest")?
        }
        None => CloudFixture::default(),
    };
    let cloud = Arc::new(StaticCloudProvider::new(config.cloud_provider, cloud_fixture));

    let store = Store::open(std::path::Path::new(&config.store.path))
        .context("opening the persistent store")?;
    let shutdown = CancellationToken::new();
    let (writer, writer_task) = spawn_writer(
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

    let gate = if config.ai_gate.enabled {
        Some(Arc::new(
            AiSafetyGate::new(
                config.ai_gate.clone(),
                config.cluster_name.clone(),
                Some(Arc::new(HeuristicOracle::new(&config.ai_gate))),
            )
            .context("building the safety gate")?,
        ))
    } else {
        None
    };

    let catalog = cloud.instance_catalog().await.unwrap_or_default();
    let family_guard = Arc::new(FamilyLockGuard::new(catalog));

    let drainer = Arc::new(Drainer::new(
        orchestrator.clone(),
        Arc::clone(state.locks()),
        Arc::clone(state.audit()),
        config.evictor.clone(),
    ));

    let hibernation_enabled = config.hibernation.enabled;
    let ctx = Arc::new(EngineContext {
        alerts: Arc::new(AlertManager::new(config.alerts.clone())),
        telemetry: Arc::new(Telemetry::new()),
        registry: Arc::new(RecommendationRegistry::new()),
        config,
        state,
        gate,
        family_guard,
        drainer,
    });

    let mut scheduler = if hibernation_enabled {
        let manager = Arc::new(HibernationManager::new(Arc::clone(&ctx))?);
        Some(HibernationManager::start_scheduler(manager).await?)
    } else {
        None
    };

    if ctx.config.mode != Mode::Active {
        info!("mode is not active; recommendations will be surfaced but never applied");
    }

    let fleet = controllers::build(&ctx);
    let engine = Engine::new(Arc::clone(&ctx), fleet, shutdown.clone());

    let stopper = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            stopper.cancel();
        }
    });

    engine.run().await;

    if let Some(scheduler) = scheduler.as_mut() {
        if let Err(e) = scheduler.shutdown().await {
            warn!(error = %e, "cron scheduler shutdown failed");
        }
    }
    writer_task.await.ok();
    info!("koptimizer stopped");
    Ok(())
}
