//! AI safety gate
//!
//! High-impact recommendations pass through an approval oracle before they
//! may execute. The gate itself is pure policy: it decides *whether*
//! validation is required, and it fails closed. An absent oracle, an oracle
//! error, and a timeout all mean "not approved".

mod family;

pub use family::{instance_family, FamilyLockGuard};

use crate::config::AiGateConfig;
use crate::error::{OptimizerError, Result};
use crate::model::{Recommendation, RiskLevel};
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{debug, warn};

/// Request handed to the approval oracle
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    /// The recommendation being assessed
    pub recommendation: Recommendation,
    /// Cluster the action targets
    pub cluster_name: String,
    /// Whether the cluster's configured zone is inside business hours
    pub business_hours: bool,
}

/// Oracle decision
#[derive(Debug, Clone)]
pub struct GateDecision {
    /// Whether the action is approved
    pub approved: bool,
    /// Oracle reasoning, for the audit log
    pub reasoning: String,
}

/// External approval oracle
#[async_trait]
pub trait SafetyOracle: Send + Sync {
    /// Assess a validation request.
    async fn assess(&self, request: &ValidationRequest) -> Result<GateDecision>;
}

/// Conservative local oracle used when no external service is wired in.
///
/// Approves only low-risk actions whose cost movement stays within twice the
/// gate's cost threshold; everything else is left for a human.
pub struct HeuristicOracle {
    cost_threshold_usd: f64,
}

impl HeuristicOracle {
    /// Build from the gate configuration.
    pub fn new(config: &AiGateConfig) -> Self {
        Self {
            cost_threshold_usd: config.cost_threshold_usd,
        }
    }
}

#[async_trait]
impl SafetyOracle for HeuristicOracle {
    async fn assess(&self, request: &ValidationRequest) -> Result<GateDecision> {
        let rec = &request.recommendation;
        if rec.impact.risk == RiskLevel::High {
            return Ok(GateDecision {
                approved: false,
                reasoning: "high-risk action requires human approval".to_string(),
            });
        }
        let limit = self.cost_threshold_usd * 2.0;
        if rec.impact.monthly_cost_change_usd.abs() > limit {
            return Ok(GateDecision {
                approved: false,
                reasoning: format!(
                    "cost movement {:.0} USD/month exceeds the {:.0} USD heuristic limit",
                    rec.impact.monthly_cost_change_usd, limit
                ),
            });
        }
        Ok(GateDecision {
            approved: true,
            reasoning: "within heuristic risk and cost bounds".to_string(),
        })
    }
}

/// The safety gate
pub struct AiSafetyGate {
    config: AiGateConfig,
    timezone: Tz,
    cluster_name: String,
    oracle: Option<Arc<dyn SafetyOracle>>,
}

impl AiSafetyGate {
    /// Build the gate. The time zone must be a valid IANA name; the
    /// configuration validator has already checked it.
    pub fn new(
        config: AiGateConfig,
        cluster_name: String,
        oracle: Option<Arc<dyn SafetyOracle>>,
    ) -> Result<Self> {
        let timezone: Tz = config
            .timezone
            .parse()
            .map_err(|_| OptimizerError::Config(format!("unknown time zone {}", config.timezone)))?;
        Ok(Self {
            config,
            timezone,
            cluster_name,
            oracle,
        })
    }

    /// Whether `now` falls within configured business hours in the gate's zone.
    pub fn is_business_hours(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.timezone);
        let hour = local.hour() as u8;
        hour >= self.config.business_start_hour && hour < self.config.business_end_hour
    }

    /// Whether this recommendation must be validated before execution.
    ///
    /// Outside business hours the cost and blast-radius thresholds are
    /// halved, pulling more actions into the gate.
    pub fn requires_validation(&self, rec: &Recommendation) -> bool {
        let tighten = if self.is_business_hours(Utc::now()) {
            1.0
        } else {
            0.5
        };
        let cost_threshold = self.config.cost_threshold_usd * tighten;
        let node_threshold = (f64::from(self.config.max_evict_nodes) * tighten).max(1.0) as u32;
        rec.requires_ai_gate
            || rec.impact.monthly_cost_change_usd.abs() > cost_threshold
            || rec.impact.nodes_affected > node_threshold
            || rec.impact.risk == RiskLevel::High
    }

    /// Validate a recommendation. Fail-closed: no oracle, an oracle error,
    /// or a timeout all return `approved=false`.
    pub async fn validate(&self, rec: &Recommendation) -> GateDecision {
        let Some(oracle) = &self.oracle else {
            warn!(rec_id = %rec.id, "safety gate required but no oracle configured");
            return GateDecision {
                approved: false,
                reasoning: "no safety oracle configured".to_string(),
            };
        };
        let request = ValidationRequest {
            recommendation: rec.clone(),
            cluster_name: self.cluster_name.clone(),
            business_hours: self.is_business_hours(Utc::now()),
        };
        match tokio::time::timeout(self.config.timeout(), oracle.assess(&request)).await {
            Ok(Ok(decision)) => {
                debug!(
                    rec_id = %rec.id,
                    approved = decision.approved,
                    reasoning = %decision.reasoning,
                    "safety gate decision"
                );
                decision
            }
            Ok(Err(e)) => {
                warn!(rec_id = %rec.id, error = %e, "safety oracle failed");
                GateDecision {
                    approved: false,
                    reasoning: format!("oracle error: {e}"),
                }
            }
            Err(_) => {
                warn!(rec_id = %rec.id, "safety oracle timed out");
                GateDecision {
                    approved: false,
                    reasoning: "oracle timeout".to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, RecommendationKind, Target};

    fn gate(oracle: Option<Arc<dyn SafetyOracle>>) -> AiSafetyGate {
        let config = AiGateConfig {
            enabled: true,
            ..Default::default()
        };
        AiSafetyGate::new(config, "test".into(), oracle).unwrap()
    }

    fn rec() -> Recommendation {
        Recommendation::new(
            RecommendationKind::Eviction,
            Priority::Medium,
            Target::cluster("Node", "n1"),
        )
    }

    struct ApproveAll;

    #[async_trait]
    impl SafetyOracle for ApproveAll {
        async fn assess(&self, _request: &ValidationRequest) -> Result<GateDecision> {
            Ok(GateDecision {
                approved: true,
                reasoning: "ok".into(),
            })
        }
    }

    struct NeverReturns;

    #[async_trait]
    impl SafetyOracle for NeverReturns {
        async fn assess(&self, _request: &ValidationRequest) -> Result<GateDecision> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn missing_oracle_fails_closed() {
        let gate = gate(None);
        let decision = gate.validate(&rec()).await;
        assert!(!decision.approved);
    }

    #[tokio::test]
    async fn timeout_fails_closed() {
        let config = AiGateConfig {
            enabled: true,
            timeout_secs: 0,
            ..Default::default()
        };
        let gate = AiSafetyGate::new(config, "test".into(), Some(Arc::new(NeverReturns))).unwrap();
        let decision = gate.validate(&rec()).await;
        assert!(!decision.approved);
        assert_eq!(decision.reasoning, "oracle timeout");
    }

    #[tokio::test]
    async fn oracle_approval_passes_through() {
        let gate = gate(Some(Arc::new(ApproveAll)));
        let decision = gate.validate(&rec()).await;
        assert!(decision.approved);
    }

    #[test]
    fn validation_required_for_flagged_or_risky() {
        let gate = gate(None);
        let mut flagged = rec();
        flagged.requires_ai_gate = true;
        assert!(gate.requires_validation(&flagged));

        let mut risky = rec();
        risky.impact.risk = RiskLevel::High;
        assert!(gate.requires_validation(&risky));

        let mut wide = rec();
        wide.impact.nodes_affected = 50;
        assert!(gate.requires_validation(&wide));

        assert!(!gate.requires_validation(&rec()));
    }

    #[tokio::test]
    async fn heuristic_oracle_rejects_high_risk() {
        let config = AiGateConfig::default();
        let oracle = HeuristicOracle::new(&config);
        let mut risky = rec();
        risky.impact.risk = RiskLevel::High;
        let decision = oracle
            .assess(&ValidationRequest {
                recommendation: risky,
                cluster_name: "test".into(),
                business_hours: true,
            })
            .await
            .unwrap();
        assert!(!decision.approved);
    }
}
