//! Cloud provider contract
//!
//! Pricing, node-group discovery, and scaling all go through this trait.
//! [`StaticCloudProvider`] backs tests and monitor-mode runs with a fixed
//! catalog and records every scaling call it receives.

use crate::config::CloudVendor;
use crate::error::{OptimizerError, Result};
use crate::model::NodeGroup;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One entry of an instance catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    /// Type name (`m5.xlarge`, `n2-standard-8`, `Standard_D8s_v3`)
    pub name: String,
    /// Hardware family (`m5`, `n2`, `D`)
    pub family: String,
    /// CPU architecture (`amd64`, `arm64`)
    pub architecture: String,
    /// vCPUs in millicores
    pub cpu_milli: i64,
    /// Memory in bytes
    pub memory_bytes: i64,
    /// On-demand hourly price in USD
    pub hourly_usd: f64,
    /// Spot hourly price in USD, when the market offers one
    #[serde(default)]
    pub spot_hourly_usd: Option<f64>,
}

/// Per-unit resource prices used when the catalog has no exact entry.
///
/// Figures are the vendors' general-purpose families (AWS m5, GCP n2,
/// Azure D series).
#[derive(Debug, Clone, Copy)]
pub struct UnitCosts {
    /// USD per vCPU-hour
    pub vcpu_hour_usd: f64,
    /// USD per GiB-hour
    pub gib_hour_usd: f64,
}

impl UnitCosts {
    /// Unit costs for a vendor.
    pub fn for_vendor(vendor: CloudVendor) -> Self {
        match vendor {
            CloudVendor::Aws => Self {
                vcpu_hour_usd: 0.04,
                gib_hour_usd: 0.00643,
            },
            CloudVendor::Gcp => Self {
                vcpu_hour_usd: 0.031611,
                gib_hour_usd: 0.004237,
            },
            CloudVendor::Azure => Self {
                vcpu_hour_usd: 0.043,
                gib_hour_usd: 0.005,
            },
        }
    }
}

/// Price per provisioned GB-month of general-purpose block storage, per
/// vendor (AWS gp3, GCP pd-balanced, Azure Standard SSD).
pub fn storage_gb_month_usd(vendor: CloudVendor) -> f64 {
    match vendor {
        CloudVendor::Aws => 0.08,
        CloudVendor::Gcp => 0.10,
        CloudVendor::Azure => 0.075,
    }
}

/// Typical spot discount per vendor, used only when the market price is
/// unavailable.
pub fn estimated_spot_discount(vendor: CloudVendor) -> f64 {
    match vendor {
        CloudVendor::Aws => 0.65,
        CloudVendor::Gcp => 0.70,
        CloudVendor::Azure => 0.60,
    }
}

/// Hours in a billing month used for monthly cost derivation.
pub const HOURS_PER_MONTH: f64 = 730.0;

/// Cloud provider adapter surface
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// The vendor this adapter talks to.
    fn vendor(&self) -> CloudVendor;

    /// Discover node groups.
    async fn list_node_groups(&self) -> Result<Vec<NodeGroup>>;

    /// Set a node group's desired count.
    async fn set_desired_count(&self, group_id: &str, desired: i32) -> Result<()>;

    /// Set a node group's minimum and desired counts together, as
    /// hibernation does.
    async fn set_group_bounds(&self, group_id: &str, min: i32, desired: i32) -> Result<()>;

    /// On-demand hourly price of an instance type.
    async fn hourly_cost(&self, instance_type: &str) -> Result<f64>;

    /// Spot hourly price of an instance type, when offered.
    async fn spot_hourly_cost(&self, instance_type: &str) -> Result<Option<f64>>;

    /// Full instance catalog for the configured region.
    async fn instance_catalog(&self) -> Result<Vec<InstanceType>>;
}

/// Serializable fixture backing [`StaticCloudProvider`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudFixture {
    /// Node groups
    #[serde(default)]
    pub node_groups: Vec<NodeGroup>,
    /// Instance catalog
    #[serde(default)]
    pub catalog: Vec<InstanceType>,
}

/// In-memory cloud provider over a [`CloudFixture`]
pub struct StaticCloudProvider {
    vendor: CloudVendor,
    state: RwLock<CloudFixture>,
    scaling_calls: RwLock<Vec<(String, i32)>>,
    failing_groups: RwLock<Vec<String>>,
}

impl StaticCloudProvider {
    /// Wrap a fixture.
    pub fn new(vendor: CloudVendor, fixture: CloudFixture) -> Self {
        Self {
            vendor,
            state: RwLock::new(fixture),
            scaling_calls: RwLock::new(Vec::new()),
            failing_groups: RwLock::new(Vec::new()),
        }
    }

    /// Make scaling calls for a group fail, for hibernation failure tests.
    pub fn fail_scaling_of(&self, group_id: &str) {
        self.failing_groups.write().push(group_id.to_string());
    }

    /// Scaling calls observed so far, as `(group_id, desired)`.
    pub fn scaling_calls(&self) -> Vec<(String, i32)> {
        self.scaling_calls.read().clone()
    }

    /// Current fixture, for assertions.
    pub fn fixture(&self) -> CloudFixture {
        self.state.read().clone()
    }

    fn catalog_entry(&self, instance_type: &str) -> Option<InstanceType> {
        self.state
            .read()
            .catalog
            .iter()
            .find(|t| t.name == instance_type)
            .cloned()
    }
}

#[async_trait]
impl CloudProvider for StaticCloudProvider {
    fn vendor(&self) -> CloudVendor {
        self.vendor
    }

    async fn list_node_groups(&self) -> Result<Vec<NodeGroup>> {
        Ok(self.state.read().node_groups.clone())
    }

    async fn set_desired_count(&self, group_id: &str, desired: i32) -> Result<()> {
        if self.failing_groups.read().iter().any(|g| g == group_id) {
            return Err(OptimizerError::CloudProvider(format!(
                "scaling of group {group_id} rejected"
            )));
        }
        let mut state = self.state.write();
        let group = state
            .node_groups
            .iter_mut()
            .find(|g| g.id == group_id)
            .ok_or_else(|| {
                OptimizerError::CloudProvider(format!("node group {group_id} not found"))
            })?;
        group.desired_count = desired;
        self.scaling_calls
            .write()
            .push((group_id.to_string(), desired));
        Ok(())
    }

    async fn set_group_bounds(&self, group_id: &str, min: i32, desired: i32) -> Result<()> {
        if self.failing_groups.read().iter().any(|g| g == group_id) {
            return Err(OptimizerError::CloudProvider(format!(
                "scaling of group {group_id} rejected"
            )));
        }
        let mut state = self.state.write();
        let group = state
            .node_groups
            .iter_mut()
            .find(|g| g.id == group_id)
            .ok_or_else(|| {
                OptimizerError::CloudProvider(format!("node group {group_id} not found"))
            })?;
        group.min_count = min;
        group.desired_count = desired;
        self.scaling_calls
            .write()
            .push((group_id.to_string(), desired));
        Ok(())
    }

    async fn hourly_cost(&self, instance_type: &str) -> Result<f64> {
        self.catalog_entry(instance_type)
            .map(|t| t.hourly_usd)
            .ok_or_else(|| {
                OptimizerError::CloudProvider(format!("no price for {instance_type}"))
            })
    }

    async fn spot_hourly_cost(&self, instance_type: &str) -> Result<Option<f64>> {
        Ok(self
            .catalog_entry(instance_type)
            .and_then(|t| t.spot_hourly_usd))
    }

    async fn instance_catalog(&self) -> Result<Vec<InstanceType>> {
        Ok(self.state.read().catalog.clone())
    }
}
