//! Storage policy
//!
//! Flags persistent volumes that cost money without earning it: unbound
//! volumes, volumes bound to claims no pod mounts, and mounted volumes
//! whose reported usage sits far below their provisioned capacity. Cost
//! estimates use the vendor's per-GB-month rate unless the configuration
//! overrides it. Advisory only; storage is never reshaped automatically.

use crate::cloud::storage_gb_month_usd;
use crate::engine::{Clearance, Controller, EngineContext};
use crate::error::Result;
use crate::model::{PersistentVolume, Priority, Recommendation, RecommendationKind, Target};
use crate::state::ClusterSnapshot;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Idle- and over-provisioned-volume detector
pub struct StoragePolicy {
    ctx: Arc<EngineContext>,
}

impl StoragePolicy {
    /// Build the controller.
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    fn gb_month_rate(&self) -> f64 {
        self.ctx
            .config
            .storage
            .gb_month_usd
            .unwrap_or_else(|| storage_gb_month_usd(self.ctx.state.cloud().vendor()))
    }

    /// Over-provisioning check for a mounted volume with reported usage.
    fn over_provisioned_rec(
        &self,
        volume: &PersistentVolume,
        gb_month: f64,
    ) -> Option<Recommendation> {
        let used = volume.used_bytes?;
        if volume.capacity_bytes <= 0 {
            return None;
        }
        let ratio = used as f64 / volume.capacity_bytes as f64;
        if ratio >= self.ctx.config.storage.min_utilization_ratio {
            return None;
        }
        let capacity_gb = volume.capacity_bytes as f64 / BYTES_PER_GB;
        let used_gb = used as f64 / BYTES_PER_GB;
        let reclaimable_gb = capacity_gb - used_gb;
        Some(
            Recommendation::new(
                RecommendationKind::Storage,
                Priority::Low,
                Target::cluster("PersistentVolume", volume.meta.name.clone()),
            )
            .with_summary(format!(
                "Volume {} uses {used_gb:.0} of {capacity_gb:.0} GB ({:.0}%)",
                volume.meta.name,
                ratio * 100.0
            ))
            .with_step(format!(
                "Shrink the volume toward {used_gb:.0} GB plus growth headroom"
            ))
            .auto_executable(false)
            .with_monthly_saving(reclaimable_gb * gb_month)
            .with_detail("capacity_gb", format!("{capacity_gb:.0}"))
            .with_detail("used_gb", format!("{used_gb:.0}"))
            .with_detail("utilization_pct", format!("{:.1}", ratio * 100.0)),
        )
    }
}

#[async_trait]
impl Controller for StoragePolicy {
    fn name(&self) -> &'static str {
        "storage-policy"
    }

    async fn analyze(&self, snapshot: &ClusterSnapshot) -> Result<Vec<Recommendation>> {
        let gb_month = self.gb_month_rate();
        let claims_in_use: HashSet<(String, String)> = snapshot
            .pods
            .iter()
            .flat_map(|info| {
                info.pod.spec.volumes.iter().filter_map(|v| match &v.source {
                    crate::model::VolumeSource::PersistentVolumeClaim(claim) => {
                        Some((info.pod.meta.namespace.clone(), claim.clone()))
                    }
                    _ => None,
                })
            })
            .collect();

        let mut recommendations = Vec::new();
        for volume in &snapshot.volumes {
            let gb = volume.capacity_bytes as f64 / BYTES_PER_GB;
            let monthly = gb * gb_month;
            match &volume.claim {
                None => {
                    recommendations.push(
                        Recommendation::new(
                            RecommendationKind::Storage,
                            Priority::Medium,
                            Target::cluster("PersistentVolume", volume.meta.name.clone()),
                        )
                        .with_summary(format!(
                            "Volume {} ({gb:.0} GB, {}) is unbound",
                            volume.meta.name, volume.storage_class
                        ))
                        .with_step("Verify and delete the released volume".to_string())
                        .auto_executable(false)
                        .with_monthly_saving(monthly)
                        .with_detail("capacity_gb", format!("{gb:.0}")),
                    );
                }
                Some((namespace, claim)) => {
                    if !claims_in_use.contains(&(namespace.clone(), claim.clone())) {
                        recommendations.push(
                            Recommendation::new(
                                RecommendationKind::Storage,
                                Priority::Low,
                                Target::cluster("PersistentVolume", volume.meta.name.clone()),
                            )
                            .with_summary(format!(
                                "Volume {} is bound to {namespace}/{claim} but no pod mounts it",
                                volume.meta.name
                            ))
                            .with_step("Confirm the claim is abandoned before reclaiming".to_string())
                            .auto_executable(false)
                            .with_monthly_saving(monthly)
                            .with_detail("claim", format!("{namespace}/{claim}")),
                        );
                    } else if let Some(rec) = self.over_provisioned_rec(volume, gb_month) {
                        recommendations.push(rec);
                    }
                }
            }
        }
        Ok(recommendations)
    }

    async fn execute(&self, rec: &Recommendation) -> Result<bool> {
        // storage recs are never auto-executable; the preamble stops here
        if let Clearance::Proceed { .. } = self.ctx.clearance(self.name(), rec).await {
            unreachable!("storage recommendations are not auto-executable");
        }
        Ok(false)
    }
}
