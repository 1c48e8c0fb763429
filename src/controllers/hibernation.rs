//! Scheduled hibernation
//!
//! Cron-driven, not tick-driven: at the hibernate schedule every
//! non-excluded node group is scaled to one node after its desired/min
//! counts are saved; at the wake schedule the saved counts are restored.
//! The saved state is persisted through the store's synchronous path so a
//! restart between hibernate and wake still restores the true counts.
//!
//! Failure containment: if every group fails to scale the controller stays
//! "not hibernated" so no phantom state is persisted; one success is enough
//! to mark hibernated and persist whatever was saved.

use crate::config::Mode;
use crate::engine::EngineContext;
use crate::error::{OptimizerError, Result};
use crate::store::SavedHibernationState;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Desired and minimum count of a hibernated group.
const HIBERNATED_COUNT: i32 = 1;

/// Hibernate/wake coordinator
pub struct HibernationManager {
    ctx: Arc<EngineContext>,
    state: Mutex<SavedHibernationState>,
}

impl HibernationManager {
    /// Load persisted state and build the manager.
    pub fn new(ctx: Arc<EngineContext>) -> Result<Self> {
        let state = ctx.state.store().load_hibernation_state()?;
        if state.hibernated {
            info!(
                groups = state.saved_desired.len(),
                "resuming in hibernated state"
            );
        }
        Ok(Self {
            ctx,
            state: Mutex::new(state),
        })
    }

    /// Whether the cluster is currently hibernated.
    pub async fn is_hibernated(&self) -> bool {
        self.state.lock().await.hibernated
    }

    /// Scale every non-excluded group down to one node.
    pub async fn hibernate(&self) -> Result<()> {
        if self.ctx.config.mode != Mode::Active {
            self.ctx.state.audit().record(
                "dry-run-hibernate",
                "cluster",
                "hibernation",
                "mode is not active".to_string(),
            );
            return Ok(());
        }
        let mut state = self.state.lock().await;
        if state.hibernated {
            info!("already hibernated; schedule fire ignored");
            return Ok(());
        }
        let excluded = &self.ctx.config.hibernation.excluded_node_groups;
        let groups = self.ctx.state.cloud().list_node_groups().await?;
        let mut successes = 0usize;
        let mut attempts = 0usize;
        for group in groups {
            if excluded.contains(&group.name) || excluded.contains(&group.id) {
                continue;
            }
            attempts += 1;
            match self
                .ctx
                .state
                .cloud()
                .set_group_bounds(&group.id, HIBERNATED_COUNT, HIBERNATED_COUNT)
                .await
            {
                Ok(()) => {
                    state.saved_desired.insert(group.id.clone(), group.desired_count);
                    state.saved_min.insert(group.id.clone(), group.min_count);
                    successes += 1;
                    self.ctx.state.audit().record(
                        "hibernate-group",
                        group.id.clone(),
                        "hibernation",
                        format!(
                            "saved desired={} min={}",
                            group.desired_count, group.min_count
                        ),
                    );
                }
                Err(e) => {
                    warn!(group = %group.id, error = %e, "hibernation scale failed");
                }
            }
        }
        if attempts == 0 {
            info!("no hibernatable node groups");
            return Ok(());
        }
        if successes == 0 {
            // every group failed: do not persist a phantom hibernated state
            state.saved_desired.clear();
            state.saved_min.clear();
            self.ctx.state.audit().record(
                "hibernate-failed",
                "cluster",
                "hibernation",
                "no group scaled successfully".to_string(),
            );
            return Err(OptimizerError::CloudProvider(
                "hibernation failed for every node group".to_string(),
            ));
        }
        state.hibernated = true;
        self.ctx.state.store().save_hibernation_state(&state)?;
        info!(successes, attempts, "cluster hibernated");
        Ok(())
    }

    /// Restore every saved group to its pre-hibernation counts.
    pub async fn wake(&self) -> Result<()> {
        if self.ctx.config.mode != Mode::Active {
            self.ctx.state.audit().record(
                "dry-run-wake",
                "cluster",
                "hibernation",
                "mode is not active".to_string(),
            );
            return Ok(());
        }
        let mut state = self.state.lock().await;
        if !state.hibernated {
            info!("not hibernated; wake ignored");
            return Ok(());
        }
        let saved: Vec<(String, i32, i32)> = state
            .saved_desired
            .iter()
            .map(|(id, desired)| {
                let min = state.saved_min.get(id).copied().unwrap_or(0);
                (id.clone(), min, *desired)
            })
            .collect();
        let mut failed = Vec::new();
        for (id, min, desired) in saved {
            match self
                .ctx
                .state
                .cloud()
                .set_group_bounds(&id, min, desired)
                .await
            {
                Ok(()) => {
                    state.saved_desired.remove(&id);
                    state.saved_min.remove(&id);
                    self.ctx.state.audit().record(
                        "wake-group",
                        id.clone(),
                        "hibernation",
                        format!("restored desired={desired} min={min}"),
                    );
                }
                Err(e) => {
                    warn!(group = %id, error = %e, "wake restore failed");
                    failed.push(id);
                }
            }
        }
        if state.saved_desired.is_empty() {
            state.hibernated = false;
        }
        self.ctx.state.store().save_hibernation_state(&state)?;
        if failed.is_empty() {
            info!("cluster awake");
            Ok(())
        } else {
            Err(OptimizerError::CloudProvider(format!(
                "wake failed for groups: {}",
                failed.join(", ")
            )))
        }
    }

    /// Install the cron jobs and start the scheduler.
    pub async fn start_scheduler(manager: Arc<Self>) -> Result<JobScheduler> {
        let config = &manager.ctx.config.hibernation;
        let (Some(hibernate_cron), Some(wake_cron)) =
            (config.hibernate_cron.clone(), config.wake_cron.clone())
        else {
            return Err(OptimizerError::Config(
                "hibernation schedules missing".to_string(),
            ));
        };
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| OptimizerError::Config(format!("cron scheduler: {e}")))?;

        let for_hibernate = Arc::clone(&manager);
        let hibernate_job = Job::new_async(hibernate_cron.as_str(), move |_id, _sched| {
            let manager = Arc::clone(&for_hibernate);
            Box::pin(async move {
                if let Err(e) = manager.hibernate().await {
                    error!(error = %e, "scheduled hibernation failed");
                }
            })
        })
        .map_err(|e| OptimizerError::Config(format!("hibernate_cron: {e}")))?;
        scheduler
            .add(hibernate_job)
            .await
            .map_err(|e| OptimizerError::Config(format!("cron scheduler: {e}")))?;

        let for_wake = Arc::clone(&manager);
        let wake_job = Job::new_async(wake_cron.as_str(), move |_id, _sched| {
            let manager = Arc::clone(&for_wake);
            Box::pin(async move {
                if let Err(e) = manager.wake().await {
                    error!(error = %e, "scheduled wake failed");
                }
            })
        })
        .map_err(|e| OptimizerError::Config(format!("wake_cron: {e}")))?;
        scheduler
            .add(wake_job)
            .await
            .map_err(|e| OptimizerError::Config(format!("cron scheduler: {e}")))?;

        scheduler
            .start()
            .await
            .map_err(|e| OptimizerError::Config(format!("cron scheduler: {e}")))?;
        info!(hibernate = %hibernate_cron, wake = %wake_cron, "hibernation schedules armed");
        Ok(scheduler)
    }
}
