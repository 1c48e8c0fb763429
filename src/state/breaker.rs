//! Per-controller circuit breakers
//!
//! A controller whose cycles keep failing is skipped for a cooldown instead
//! of hammering the orchestrator. One successful cycle while half-open
//! closes the breaker again.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing; cycles are skipped until the cooldown passes
    Open,
    /// Cooldown passed; one probe cycle is allowed
    HalfOpen,
}

#[derive(Debug)]
struct BreakerEntry {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            opened_at: None,
        }
    }
}

/// Registry of breakers keyed by controller name
pub struct BreakerRegistry {
    entries: DashMap<String, BreakerEntry>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl BreakerRegistry {
    /// Create a registry.
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            failure_threshold,
            cooldown,
        }
    }

    /// Whether the named controller may run a cycle now.
    ///
    /// An open breaker whose cooldown has elapsed transitions to half-open
    /// and admits exactly this cycle as the probe.
    pub fn allow(&self, name: &str) -> bool {
        let mut entry = self.entries.entry(name.to_string()).or_default();
        match entry.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = entry
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    entry.state = CircuitState::HalfOpen;
                    info!(controller = name, "circuit breaker half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful cycle.
    pub fn record_success(&self, name: &str) {
        let mut entry = self.entries.entry(name.to_string()).or_default();
        if entry.state == CircuitState::HalfOpen {
            info!(controller = name, "circuit breaker closed");
        }
        entry.state = CircuitState::Closed;
        entry.failures = 0;
        entry.opened_at = None;
    }

    /// Record a failed cycle.
    pub fn record_failure(&self, name: &str) {
        let mut entry = self.entries.entry(name.to_string()).or_default();
        entry.failures += 1;
        let tripped = entry.state == CircuitState::HalfOpen
            || entry.failures >= self.failure_threshold;
        if tripped && entry.state != CircuitState::Open {
            entry.state = CircuitState::Open;
            entry.opened_at = Some(Instant::now());
            warn!(
                controller = name,
                failures = entry.failures,
                "circuit breaker open"
            );
        }
    }

    /// Current state of the named breaker.
    pub fn state(&self, name: &str) -> CircuitState {
        self.entries
            .get(name)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold() {
        let registry = BreakerRegistry::new(3, Duration::from_secs(60));
        assert!(registry.allow("evictor"));
        registry.record_failure("evictor");
        registry.record_failure("evictor");
        assert!(registry.allow("evictor"));
        registry.record_failure("evictor");
        assert_eq!(registry.state("evictor"), CircuitState::Open);
        assert!(!registry.allow("evictor"));
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let registry = BreakerRegistry::new(1, Duration::from_millis(0));
        registry.record_failure("spot");
        assert_eq!(registry.state("spot"), CircuitState::Open);
        // zero cooldown: next allow() is the half-open probe
        assert!(registry.allow("spot"));
        assert_eq!(registry.state("spot"), CircuitState::HalfOpen);
        registry.record_success("spot");
        assert_eq!(registry.state("spot"), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let registry = BreakerRegistry::new(1, Duration::from_millis(0));
        registry.record_failure("gpu");
        assert!(registry.allow("gpu"));
        registry.record_failure("gpu");
        assert_eq!(registry.state("gpu"), CircuitState::Open);
    }
}
