//! Cost anomaly watcher
//!
//! Appends the fleet's extrapolated daily cost to the history table every
//! cycle and raises a `CostAnomaly` recommendation when today's figure
//! jumps past the trailing-window mean by more than the configured
//! percentage.

use crate::engine::{Clearance, Controller, EngineContext};
use crate::error::Result;
use crate::model::{Priority, Recommendation, RecommendationKind, Target};
use crate::state::ClusterSnapshot;
use crate::store::{CostPoint, WriteRecord};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::warn;

/// Minimum history length before anomalies are judged.
const MIN_HISTORY_POINTS: usize = 3;

/// Daily-cost anomaly controller
pub struct CostAnomalyWatcher {
    ctx: Arc<EngineContext>,
}

impl CostAnomalyWatcher {
    /// Build the controller.
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Controller for CostAnomalyWatcher {
    fn name(&self) -> &'static str {
        "cost-anomaly"
    }

    async fn analyze(&self, snapshot: &ClusterSnapshot) -> Result<Vec<Recommendation>> {
        let config = &self.ctx.config.cost_anomaly;
        let daily = snapshot.daily_cost_usd();
        let since = Utc::now() - ChronoDuration::days(config.window_days as i64);
        // read the trailing window before appending today's point
        let history = self.ctx.state.store().cost_history_since(since)?;

        self.ctx
            .state
            .writer()
            .enqueue(WriteRecord::CostHistory(CostPoint {
                timestamp: snapshot.taken_at,
                daily_cost_usd: daily,
            }));

        if history.len() < MIN_HISTORY_POINTS {
            return Ok(Vec::new());
        }
        let mean =
            history.iter().map(|p| p.daily_cost_usd).sum::<f64>() / history.len() as f64;
        if mean <= 0.0 {
            return Ok(Vec::new());
        }
        let jump_pct = (daily - mean) / mean * 100.0;
        if jump_pct <= config.threshold_pct {
            return Ok(Vec::new());
        }
        warn!(daily, mean, jump_pct, "cost anomaly detected");
        Ok(vec![Recommendation::new(
            RecommendationKind::CostAnomaly,
            Priority::High,
            Target::cluster("Cluster", self.ctx.config.cluster_name.clone()),
        )
        .with_summary(format!(
            "Daily cost {daily:.2} USD is {jump_pct:.0}% above the {:.2} USD trailing mean",
            mean
        ))
        .with_step("Review recent scale-ups and node-group changes".to_string())
        .auto_executable(false)
        .with_detail("daily_cost_usd", format!("{daily:.2}"))
        .with_detail("trailing_mean_usd", format!("{mean:.2}"))
        .with_detail("jump_pct", format!("{jump_pct:.1}"))])
    }

    async fn execute(&self, rec: &Recommendation) -> Result<bool> {
        if let Clearance::Proceed { .. } = self.ctx.clearance(self.name(), rec).await {
            unreachable!("cost anomalies are not auto-executable");
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enginetest::context_with_defaults;
    use crate::testutil::{node_info, snapshot_of};

    fn seed_history(ctx: &EngineContext, days: &[f64]) {
        for (i, cost) in days.iter().enumerate() {
            ctx.state
                .store()
                .apply(&WriteRecord::CostHistory(CostPoint {
                    timestamp: Utc::now() - ChronoDuration::days(days.len() as i64 - i as i64),
                    daily_cost_usd: *cost,
                }))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn stable_costs_raise_nothing() {
        let ctx = Arc::new(context_with_defaults());
        seed_history(&ctx, &[24.0, 25.0, 24.5]);
        let watcher = CostAnomalyWatcher::new(Arc::clone(&ctx));
        // one node at 0.10/h extrapolates to 2.40/day: below the mean
        let snapshot = snapshot_of(vec![node_info("n1", 4000, 16 << 30)], vec![]);
        assert!(watcher.analyze(&snapshot).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cost_jump_raises_anomaly() {
        let ctx = Arc::new(context_with_defaults());
        seed_history(&ctx, &[2.0, 2.1, 1.9]);
        let watcher = CostAnomalyWatcher::new(Arc::clone(&ctx));
        // ten nodes at 0.10/h: 24 USD/day against a ~2 USD mean
        let nodes = (0..10)
            .map(|i| node_info(&format!("n{i}"), 4000, 16 << 30))
            .collect();
        let recs = watcher.analyze(&snapshot_of(nodes, vec![])).await.unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, RecommendationKind::CostAnomaly);
        assert!(!recs[0].auto_executable);
    }

    #[tokio::test]
    async fn short_history_is_inconclusive() {
        let ctx = Arc::new(context_with_defaults());
        seed_history(&ctx, &[2.0]);
        let watcher = CostAnomalyWatcher::new(Arc::clone(&ctx));
        let nodes = (0..10)
            .map(|i| node_info(&format!("n{i}"), 4000, 16 << 30))
            .collect();
        assert!(watcher
            .analyze(&snapshot_of(nodes, vec![]))
            .await
            .unwrap()
            .is_empty());
    }
}
