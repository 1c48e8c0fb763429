//! Recommendation registry
//!
//! The in-memory view an external API surface reads: the latest generation
//! of recommendations per controller, each with a review state.

use crate::model::Recommendation;
use dashmap::DashMap;

/// Review state of a surfaced recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecState {
    /// Surfaced, not yet reviewed
    Pending,
    /// Approved by a human
    Approved,
    /// Dismissed by a human
    Dismissed,
}

#[derive(Clone)]
struct Entry {
    recommendation: Recommendation,
    state: RecState,
    controller: String,
}

/// Registry of surfaced recommendations
#[derive(Default)]
pub struct RecommendationRegistry {
    entries: DashMap<String, Entry>,
}

impl RecommendationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a controller's generation with a fresh set of recommendations.
    pub fn publish(&self, controller: &str, recommendations: &[Recommendation]) {
        self.entries.retain(|_, e| e.controller != controller);
        for rec in recommendations {
            self.entries.insert(
                rec.id.clone(),
                Entry {
                    recommendation: rec.clone(),
                    state: RecState::Pending,
                    controller: controller.to_string(),
                },
            );
        }
    }

    /// Change the review state of a recommendation.
    pub fn set_state(&self, id: &str, state: RecState) -> bool {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    /// Review state of a recommendation, if surfaced.
    pub fn state_of(&self, id: &str) -> Option<RecState> {
        self.entries.get(id).map(|e| e.state)
    }

    /// All surfaced recommendations.
    pub fn list(&self) -> Vec<Recommendation> {
        self.entries
            .iter()
            .map(|e| e.recommendation.clone())
            .collect()
    }

    /// Number of surfaced recommendations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, RecommendationKind, Target};

    fn rec(name: &str) -> Recommendation {
        Recommendation::new(
            RecommendationKind::Eviction,
            Priority::Low,
            Target::cluster("Node", name),
        )
    }

    #[test]
    fn publish_replaces_generation() {
        let registry = RecommendationRegistry::new();
        let first = vec![rec("a"), rec("b")];
        registry.publish("evictor", &first);
        assert_eq!(registry.len(), 2);

        let second = vec![rec("c")];
        registry.publish("evictor", &second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.state_of(&second[0].id), Some(RecState::Pending));
        // other controllers' generations are untouched
        registry.publish("spot", &[rec("d")]);
        registry.publish("evictor", &[]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn review_state_transitions() {
        let registry = RecommendationRegistry::new();
        let recs = vec![rec("a")];
        registry.publish("evictor", &recs);
        assert!(registry.set_state(&recs[0].id, RecState::Approved));
        assert_eq!(registry.state_of(&recs[0].id), Some(RecState::Approved));
        assert!(!registry.set_state("missing", RecState::Dismissed));
    }
}
