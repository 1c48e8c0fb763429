//! Family lock guard
//!
//! Instance-type changes are constrained to the same hardware family and
//! architecture, and node-group actions are blocked entirely while a family
//! migration is in flight.

use crate::cloud::InstanceType;
use crate::error::{OptimizerError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use tracing::info;

/// Hardware family of an instance type.
///
/// Handles the three vendor naming schemes: `m5.xlarge` → `m5`,
/// `n2-standard-8` → `n2`, `Standard_D8s_v3` → `D`.
pub fn instance_family(instance_type: &str) -> String {
    let trimmed = instance_type
        .strip_prefix("Standard_")
        .unwrap_or(instance_type);
    if let Some((family, _)) = trimmed.split_once('.') {
        return family.to_string();
    }
    if let Some((family, _)) = trimmed.split_once('-') {
        return family.to_string();
    }
    trimmed
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect()
}

/// Guard over instance-family changes
pub struct FamilyLockGuard {
    catalog: RwLock<Vec<InstanceType>>,
    migrations: Mutex<HashSet<String>>,
}

impl FamilyLockGuard {
    /// Build a guard over the given catalog.
    pub fn new(catalog: Vec<InstanceType>) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            migrations: Mutex::new(HashSet::new()),
        }
    }

    /// Replace the catalog after a provider refresh.
    pub fn set_catalog(&self, catalog: Vec<InstanceType>) {
        *self.catalog.write() = catalog;
    }

    /// Mark a family migration as in progress.
    pub fn begin_migration(&self, family: impl Into<String>) {
        let family = family.into();
        info!(family = %family, "family migration started");
        self.migrations.lock().insert(family);
    }

    /// Mark a family migration as finished.
    pub fn end_migration(&self, family: &str) {
        info!(family, "family migration finished");
        self.migrations.lock().remove(family);
    }

    /// Whether any family migration is in flight.
    pub fn migration_in_progress(&self) -> bool {
        !self.migrations.lock().is_empty()
    }

    /// Reject node-group actions while a migration is in flight.
    pub fn validate_node_group_action(&self, kind: &str) -> Result<()> {
        let migrations = self.migrations.lock();
        if let Some(family) = migrations.iter().next() {
            return Err(OptimizerError::FamilyLock(format!(
                "{kind} blocked: family {family} migration in progress"
            )));
        }
        Ok(())
    }

    /// Instance types in the same family and architecture as `current`,
    /// ordered by CPU size. Empty when the catalog does not know `current`.
    pub fn allowed_sizes(&self, current: &str) -> Vec<InstanceType> {
        let catalog = self.catalog.read();
        let Some(current_entry) = catalog.iter().find(|t| t.name == current) else {
            return Vec::new();
        };
        let mut sizes: Vec<InstanceType> = catalog
            .iter()
            .filter(|t| {
                t.family == current_entry.family && t.architecture == current_entry.architecture
            })
            .cloned()
            .collect();
        sizes.sort_by_key(|t| t.cpu_milli);
        sizes
    }

    /// Next size up within the family, when one exists.
    pub fn next_size_up(&self, current: &str) -> Option<InstanceType> {
        let sizes = self.allowed_sizes(current);
        let idx = sizes.iter().position(|t| t.name == current)?;
        sizes.get(idx + 1).cloned()
    }

    /// Next size down within the family, when one exists.
    pub fn next_size_down(&self, current: &str) -> Option<InstanceType> {
        let sizes = self.allowed_sizes(current);
        let idx = sizes.iter().position(|t| t.name == current)?;
        idx.checked_sub(1).and_then(|i| sizes.get(i).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, family: &str, arch: &str, cpu: i64) -> InstanceType {
        InstanceType {
            name: name.into(),
            family: family.into(),
            architecture: arch.into(),
            cpu_milli: cpu,
            memory_bytes: cpu * 4 * (1 << 20),
            hourly_usd: cpu as f64 / 1000.0 * 0.04,
            spot_hourly_usd: None,
        }
    }

    #[test]
    fn family_parsing_per_vendor() {
        assert_eq!(instance_family("m5.xlarge"), "m5");
        assert_eq!(instance_family("c6g.2xlarge"), "c6g");
        assert_eq!(instance_family("n2-standard-8"), "n2");
        assert_eq!(instance_family("Standard_D8s_v3"), "D");
    }

    #[test]
    fn allowed_sizes_stay_in_family_and_arch() {
        let guard = FamilyLockGuard::new(vec![
            entry("m5.large", "m5", "amd64", 2000),
            entry("m5.xlarge", "m5", "amd64", 4000),
            entry("m5.2xlarge", "m5", "amd64", 8000),
            entry("m6g.xlarge", "m6g", "arm64", 4000),
            entry("c5.xlarge", "c5", "amd64", 4000),
        ]);
        let sizes = guard.allowed_sizes("m5.xlarge");
        let names: Vec<_> = sizes.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["m5.large", "m5.xlarge", "m5.2xlarge"]);
        assert_eq!(guard.next_size_up("m5.xlarge").unwrap().name, "m5.2xlarge");
        assert_eq!(guard.next_size_down("m5.large"), None);
    }

    #[test]
    fn migration_blocks_node_group_actions() {
        let guard = FamilyLockGuard::new(Vec::new());
        guard.validate_node_group_action("scale-up").unwrap();
        guard.begin_migration("m5");
        assert!(guard.validate_node_group_action("scale-up").is_err());
        guard.end_migration("m5");
        guard.validate_node_group_action("scale-up").unwrap();
    }
}
