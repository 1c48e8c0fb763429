//! The controller fleet
//!
//! One module per optimization concern. [`build`] assembles the enabled set
//! in a fixed order; the engine runs them concurrently, so the order only
//! affects log readability.

mod autoscaler;
mod cost;
mod evictor;
mod gpu;
mod hibernation;
mod network;
mod rebalancer;
mod rightsizer;
mod spot;
mod storage;
mod workload;

pub use autoscaler::NodeAutoscaler;
pub use cost::CostAnomalyWatcher;
pub use evictor::Evictor;
pub use gpu::GpuOptimizer;
pub use hibernation::HibernationManager;
pub use network::NetworkPolicy;
pub use rebalancer::Rebalancer;
pub use rightsizer::{PodAnalysis, Rightsizer};
pub use spot::SpotOptimizer;
pub use storage::StoragePolicy;
pub use workload::WorkloadScaler;

use crate::engine::{Controller, EngineContext};
use std::sync::Arc;

/// Assemble every enabled tick-driven controller.
///
/// Hibernation is cron-driven and is wired separately through
/// [`HibernationManager::start_scheduler`].
pub fn build(ctx: &Arc<EngineContext>) -> Vec<Arc<dyn Controller>> {
    let mut controllers: Vec<Arc<dyn Controller>> = Vec::new();
    if ctx.config.evictor.enabled {
        controllers.push(Arc::new(Evictor::new(Arc::clone(ctx))));
    }
    if ctx.config.autoscaler.enabled {
        controllers.push(Arc::new(NodeAutoscaler::new(Arc::clone(ctx))));
    }
    if ctx.config.rightsizer.enabled {
        controllers.push(Arc::new(Rightsizer::new(Arc::clone(ctx))));
    }
    if ctx.config.workload.enabled {
        controllers.push(Arc::new(WorkloadScaler::new(Arc::clone(ctx))));
    }
    if ctx.config.rebalancer.enabled {
        controllers.push(Arc::new(Rebalancer::new(Arc::clone(ctx))));
    }
    if ctx.config.spot.enabled {
        controllers.push(Arc::new(SpotOptimizer::new(Arc::clone(ctx))));
    }
    if ctx.config.gpu.enabled {
        controllers.push(Arc::new(GpuOptimizer::new(Arc::clone(ctx))));
    }
    if ctx.config.storage.enabled {
        controllers.push(Arc::new(StoragePolicy::new(Arc::clone(ctx))));
    }
    if ctx.config.network.enabled {
        controllers.push(Arc::new(NetworkPolicy::new(Arc::clone(ctx))));
    }
    if ctx.config.cost_anomaly.enabled {
        controllers.push(Arc::new(CostAnomalyWatcher::new(Arc::clone(ctx))));
    }
    controllers
}
