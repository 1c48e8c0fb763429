//! Configuration loading and validation
//!
//! Defaults live in code; overrides merge from the YAML document and then
//! from the environment. Validation runs once at startup and is fatal:
//! a process with an invalid configuration must not reach the control loops.

use crate::error::{OptimizerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Surface recommendations only; nothing is executed
    Monitor,
    /// Emit recommendations; never mutate the cluster
    Recommend,
    /// Allowed to mutate, subject to gates
    Active,
}

/// Supported cloud vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudVendor {
    /// Amazon Web Services
    Aws,
    /// Google Cloud
    Gcp,
    /// Microsoft Azure
    Azure,
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Execution mode
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Cloud vendor
    #[serde(default = "default_vendor")]
    pub cloud_provider: CloudVendor,
    /// Cloud region
    #[serde(default)]
    pub region: String,
    /// Cluster name used in audit entries and alerts
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// Seconds between snapshot refreshes and controller wakeups
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_interval_secs: u64,
    /// Minutes after which a stale node lock expires
    #[serde(default = "default_lock_ttl_mins")]
    pub node_lock_ttl_mins: u64,
    /// Controllers forced into dry-run regardless of mode
    #[serde(default)]
    pub dry_run_controllers: Vec<String>,
    /// AI safety gate
    #[serde(default)]
    pub ai_gate: AiGateConfig,
    /// Evictor / consolidator
    #[serde(default)]
    pub evictor: EvictorConfig,
    /// Node autoscaler
    #[serde(default)]
    pub autoscaler: AutoscalerConfig,
    /// Rightsizer
    #[serde(default)]
    pub rightsizer: RightsizerConfig,
    /// Workload scaler
    #[serde(default)]
    pub workload: WorkloadConfig,
    /// Rebalancer
    #[serde(default)]
    pub rebalancer: RebalancerConfig,
    /// Spot optimizer
    #[serde(default)]
    pub spot: SpotConfig,
    /// GPU optimizer
    #[serde(default)]
    pub gpu: GpuConfig,
    /// Hibernation schedules
    #[serde(default)]
    pub hibernation: HibernationConfig,
    /// Storage policy
    #[serde(default)]
    pub storage: StorageConfig,
    /// Network policy
    #[serde(default)]
    pub network: NetworkConfig,
    /// Cost anomaly watcher
    #[serde(default)]
    pub cost_anomaly: CostAnomalyConfig,
    /// Persistent store
    #[serde(default)]
    pub store: StoreConfig,
    /// Metrics store
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Alert channels
    #[serde(default)]
    pub alerts: AlertsConfig,
}

fn default_mode() -> Mode {
    Mode::Monitor
}
fn default_vendor() -> CloudVendor {
    CloudVendor::Aws
}
fn default_cluster_name() -> String {
    "default".to_string()
}
fn default_reconcile_secs() -> u64 {
    60
}
fn default_lock_ttl_mins() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            cloud_provider: default_vendor(),
            region: String::new(),
            cluster_name: default_cluster_name(),
            reconcile_interval_secs: default_reconcile_secs(),
            node_lock_ttl_mins: default_lock_ttl_mins(),
            dry_run_controllers: Vec::new(),
            ai_gate: AiGateConfig::default(),
            evictor: EvictorConfig::default(),
            autoscaler: AutoscalerConfig::default(),
            rightsizer: RightsizerConfig::default(),
            workload: WorkloadConfig::default(),
            rebalancer: RebalancerConfig::default(),
            spot: SpotConfig::default(),
            gpu: GpuConfig::default(),
            hibernation: HibernationConfig::default(),
            storage: StorageConfig::default(),
            network: NetworkConfig::default(),
            cost_anomaly: CostAnomalyConfig::default(),
            store: StoreConfig::default(),
            metrics: MetricsConfig::default(),
            alerts: AlertsConfig::default(),
        }
    }
}

impl Config {
    /// Reconcile interval as a [`Duration`].
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    /// Node lock TTL as a [`Duration`].
    pub fn node_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.node_lock_ttl_mins * 60)
    }
}

/// AI safety gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiGateConfig {
    /// Whether the gate is configured at all
    #[serde(default)]
    pub enabled: bool,
    /// Absolute monthly cost change above which validation is required
    #[serde(default = "default_cost_threshold")]
    pub cost_threshold_usd: f64,
    /// Node count above which validation is required
    #[serde(default = "default_max_evict_nodes")]
    pub max_evict_nodes: u32,
    /// Scale-up percentage above which validation is required
    #[serde(default = "default_scale_threshold_pct")]
    pub scale_threshold_pct: f64,
    /// Gate call timeout in seconds; a timeout means not approved
    #[serde(default = "default_gate_timeout_secs")]
    pub timeout_secs: u64,
    /// IANA time zone driving the business-hours check
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// First business hour (inclusive, 24h clock)
    #[serde(default = "default_business_start")]
    pub business_start_hour: u8,
    /// Last business hour (exclusive, 24h clock)
    #[serde(default = "default_business_end")]
    pub business_end_hour: u8,
}

fn default_cost_threshold() -> f64 {
    500.0
}
fn default_max_evict_nodes() -> u32 {
    3
}
fn default_scale_threshold_pct() -> f64 {
    50.0
}
fn default_gate_timeout_secs() -> u64 {
    30
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_business_start() -> u8 {
    9
}
fn default_business_end() -> u8 {
    17
}

impl Default for AiGateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cost_threshold_usd: default_cost_threshold(),
            max_evict_nodes: default_max_evict_nodes(),
            scale_threshold_pct: default_scale_threshold_pct(),
            timeout_secs: default_gate_timeout_secs(),
            timezone: default_timezone(),
            business_start_hour: default_business_start(),
            business_end_hour: default_business_end(),
        }
    }
}

impl AiGateConfig {
    /// Gate timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Evictor / consolidator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictorConfig {
    /// Whether the evictor runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fragmentation score above which a node is a consolidation candidate
    #[serde(default = "default_fragmentation_threshold")]
    pub fragmentation_threshold: f64,
    /// Upper bound on node drains per tick
    #[serde(default = "default_max_concurrent_evictions")]
    pub max_concurrent_evictions: usize,
    /// Drain deadline in seconds
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Minutes before a partially drained node is auto-uncordoned
    #[serde(default = "default_partial_drain_ttl_mins")]
    pub partial_drain_ttl_mins: u64,
}

fn default_true() -> bool {
    true
}
fn default_fragmentation_threshold() -> f64 {
    0.6
}
fn default_max_concurrent_evictions() -> usize {
    3
}
fn default_drain_timeout_secs() -> u64 {
    300
}
fn default_partial_drain_ttl_mins() -> u64 {
    30
}

impl Default for EvictorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fragmentation_threshold: default_fragmentation_threshold(),
            max_concurrent_evictions: default_max_concurrent_evictions(),
            drain_timeout_secs: default_drain_timeout_secs(),
            partial_drain_ttl_mins: default_partial_drain_ttl_mins(),
        }
    }
}

impl EvictorConfig {
    /// Drain timeout as a [`Duration`].
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Partial-drain TTL as a [`Duration`].
    pub fn partial_drain_ttl(&self) -> Duration {
        Duration::from_secs(self.partial_drain_ttl_mins * 60)
    }
}

/// Node autoscaler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    /// Whether the autoscaler runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Utilization percent above which scale-up is considered
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: f64,
    /// Utilization percent below which (on both axes) a node is underutilized
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: f64,
    /// Upper bound on nodes added per scale-up
    #[serde(default = "default_max_scale_up_nodes")]
    pub max_scale_up_nodes: i32,
    /// Upper bound on nodes removed per scale-down
    #[serde(default = "default_max_scale_down_nodes")]
    pub max_scale_down_nodes: i32,
}

fn default_scale_up_threshold() -> f64 {
    80.0
}
fn default_scale_down_threshold() -> f64 {
    30.0
}
fn default_max_scale_up_nodes() -> i32 {
    3
}
fn default_max_scale_down_nodes() -> i32 {
    2
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scale_up_threshold: default_scale_up_threshold(),
            scale_down_threshold: default_scale_down_threshold(),
            max_scale_up_nodes: default_max_scale_up_nodes(),
            max_scale_down_nodes: default_max_scale_down_nodes(),
        }
    }
}

/// Rightsizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RightsizerConfig {
    /// Whether the rightsizer runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Days of history consulted per pod
    #[serde(default = "default_lookback_days")]
    pub lookback_window_days: u64,
    /// Target CPU utilization percent for requests
    #[serde(default = "default_target_util")]
    pub cpu_target_util_pct: f64,
    /// Target memory utilization percent for requests
    #[serde(default = "default_target_util")]
    pub memory_target_util_pct: f64,
    /// Memory bump factor applied after an OOM kill
    #[serde(default = "default_oom_bump")]
    pub oom_bump_multiplier: f64,
    /// Namespaces never rightsized
    #[serde(default = "default_excluded_namespaces")]
    pub exclude_namespaces: Vec<String>,
}

fn default_lookback_days() -> u64 {
    7
}
fn default_target_util() -> f64 {
    80.0
}
fn default_oom_bump() -> f64 {
    2.5
}
fn default_excluded_namespaces() -> Vec<String> {
    vec!["kube-system".to_string()]
}

impl Default for RightsizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_window_days: default_lookback_days(),
            cpu_target_util_pct: default_target_util(),
            memory_target_util_pct: default_target_util(),
            oom_bump_multiplier: default_oom_bump(),
            exclude_namespaces: default_excluded_namespaces(),
        }
    }
}

impl RightsizerConfig {
    /// Lookback window as a [`Duration`].
    pub fn lookback_window(&self) -> Duration {
        Duration::from_secs(self.lookback_window_days * 24 * 3600)
    }
}

/// Workload scaler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Whether the workload scaler runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Hard cap on proposed HPA max replicas
    #[serde(default = "default_max_replicas_limit")]
    pub max_replicas_limit: i32,
    /// Ratio of current usage to baseline that declares a surge
    #[serde(default = "default_surge_threshold")]
    pub surge_threshold: f64,
    /// Whether HPA max bumps auto-execute
    #[serde(default)]
    pub surge_mode: bool,
}

fn default_max_replicas_limit() -> i32 {
    20
}
fn default_surge_threshold() -> f64 {
    2.0
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_replicas_limit: default_max_replicas_limit(),
            surge_threshold: default_surge_threshold(),
            surge_mode: false,
        }
    }
}

/// Rebalancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancerConfig {
    /// Whether the rebalancer runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// CPU-percent spread between hottest and coolest node that triggers a plan
    #[serde(default = "default_imbalance_threshold")]
    pub imbalance_threshold_pct: f64,
    /// Seconds to wait for evicted workloads to report ready again
    #[serde(default = "default_reschedule_timeout_secs")]
    pub reschedule_timeout_secs: u64,
    /// Percent above which a node is flagged by the busy redistributor
    #[serde(default = "default_overloaded_threshold")]
    pub overloaded_threshold_pct: f64,
    /// Utilization percent the redistributor steers toward
    #[serde(default = "default_target_utilization")]
    pub target_utilization_pct: f64,
}

fn default_imbalance_threshold() -> f64 {
    40.0
}
fn default_reschedule_timeout_secs() -> u64 {
    60
}
fn default_overloaded_threshold() -> f64 {
    90.0
}
fn default_target_utilization() -> f64 {
    70.0
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            imbalance_threshold_pct: default_imbalance_threshold(),
            reschedule_timeout_secs: default_reschedule_timeout_secs(),
            overloaded_threshold_pct: default_overloaded_threshold(),
            target_utilization_pct: default_target_utilization(),
        }
    }
}

impl RebalancerConfig {
    /// Reschedule wait as a [`Duration`].
    pub fn reschedule_timeout(&self) -> Duration {
        Duration::from_secs(self.reschedule_timeout_secs)
    }
}

/// Spot optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotConfig {
    /// Whether the spot optimizer runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Canonical ceiling on the spot share of the fleet, in percent
    #[serde(default = "default_max_spot_percentage")]
    pub max_spot_percentage: u8,
    /// Minimum instance-type diversity for spot groups
    #[serde(default = "default_diversity_min_types")]
    pub diversity_min_types: usize,
}

fn default_max_spot_percentage() -> u8 {
    70
}
fn default_diversity_min_types() -> usize {
    3
}

impl Default for SpotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_spot_percentage: default_max_spot_percentage(),
            diversity_min_types: default_diversity_min_types(),
        }
    }
}

impl SpotConfig {
    /// Derived fractional view of [`Self::max_spot_percentage`].
    pub fn max_spot_fraction(&self) -> f64 {
        f64::from(self.max_spot_percentage) / 100.0
    }
}

/// GPU optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuConfig {
    /// Whether the GPU optimizer runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// GPU utilization percent below which a node counts as idle
    #[serde(default = "default_gpu_idle_threshold")]
    pub idle_threshold_pct: f64,
    /// Minutes a node must stay idle before fallback is recommended
    #[serde(default = "default_gpu_idle_mins")]
    pub idle_duration_mins: u64,
    /// CPU percent reserved for GPU data-loading bursts under fallback
    #[serde(default = "default_cpu_headroom_reserve")]
    pub cpu_headroom_reserve_pct: f64,
    /// Millicores of headroom above which an active GPU node is scavengeable
    #[serde(default = "default_scavenging_threshold")]
    pub scavenging_cpu_threshold_millis: i64,
}

fn default_gpu_idle_threshold() -> f64 {
    10.0
}
fn default_gpu_idle_mins() -> u64 {
    30
}
fn default_cpu_headroom_reserve() -> f64 {
    30.0
}
fn default_scavenging_threshold() -> i64 {
    1000
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_threshold_pct: default_gpu_idle_threshold(),
            idle_duration_mins: default_gpu_idle_mins(),
            cpu_headroom_reserve_pct: default_cpu_headroom_reserve(),
            scavenging_cpu_threshold_millis: default_scavenging_threshold(),
        }
    }
}

impl GpuConfig {
    /// Idle duration as a [`Duration`].
    pub fn idle_duration(&self) -> Duration {
        Duration::from_secs(self.idle_duration_mins * 60)
    }
}

/// Hibernation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HibernationConfig {
    /// Whether scheduled hibernation runs
    #[serde(default)]
    pub enabled: bool,
    /// Cron expression triggering hibernation
    #[serde(default)]
    pub hibernate_cron: Option<String>,
    /// Cron expression triggering wake
    #[serde(default)]
    pub wake_cron: Option<String>,
    /// Node groups never hibernated
    #[serde(default)]
    pub excluded_node_groups: Vec<String>,
}

/// Storage policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Whether the storage policy runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Override of the vendor's per-GB-month rate; unset uses the
    /// per-vendor estimate
    #[serde(default)]
    pub gb_month_usd: Option<f64>,
    /// Used/provisioned ratio below which a mounted volume counts as
    /// over-provisioned
    #[serde(default = "default_min_utilization_ratio")]
    pub min_utilization_ratio: f64,
}

fn default_min_utilization_ratio() -> f64 {
    0.3
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gb_month_usd: None,
            min_utilization_ratio: default_min_utilization_ratio(),
        }
    }
}

/// Network policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Whether the network policy runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Monthly cost of an idle load balancer used for estimates
    #[serde(default = "default_lb_month_usd")]
    pub load_balancer_month_usd: f64,
    /// Zone count above which a workload's replica spread is flagged as
    /// cross-zone-heavy
    #[serde(default = "default_max_workload_zones")]
    pub max_workload_zones: usize,
}

fn default_lb_month_usd() -> f64 {
    18.0
}
fn default_max_workload_zones() -> usize {
    2
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            load_balancer_month_usd: default_lb_month_usd(),
            max_workload_zones: default_max_workload_zones(),
        }
    }
}

/// Cost anomaly watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostAnomalyConfig {
    /// Whether the watcher runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Percent jump over the trailing mean that raises an anomaly
    #[serde(default = "default_anomaly_threshold")]
    pub threshold_pct: f64,
    /// Trailing window in days
    #[serde(default = "default_anomaly_window")]
    pub window_days: u64,
}

fn default_anomaly_threshold() -> f64 {
    30.0
}
fn default_anomaly_window() -> u64 {
    7
}

impl Default for CostAnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_pct: default_anomaly_threshold(),
            window_days: default_anomaly_window(),
        }
    }
}

/// Persistent store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database directory
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Days of history retained before the periodic prune
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    /// Bounded write-queue capacity
    #[serde(default = "default_write_queue_capacity")]
    pub write_queue_capacity: usize,
}

fn default_store_path() -> String {
    "./koptimizer.db".to_string()
}
fn default_retention_days() -> u64 {
    90
}
fn default_write_queue_capacity() -> usize {
    4096
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            retention_days: default_retention_days(),
            write_queue_capacity: default_write_queue_capacity(),
        }
    }
}

impl StoreConfig {
    /// Retention window as a [`Duration`].
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 3600)
    }
}

/// Metrics store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Days of samples retained per series
    #[serde(default = "default_metrics_retention_days")]
    pub retention_days: u64,
    /// Cap on distinct pod-container series
    #[serde(default = "default_max_pod_series")]
    pub max_pod_series: usize,
}

fn default_metrics_retention_days() -> u64 {
    7
}
fn default_max_pod_series() -> usize {
    100_000
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention_days: default_metrics_retention_days(),
            max_pod_series: default_max_pod_series(),
        }
    }
}

impl MetricsConfig {
    /// Retention window as a [`Duration`].
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 3600)
    }
}

/// SMTP channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// SMTP relay host
    pub host: String,
    /// SMTP relay port
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Sender address
    pub from: String,
    /// Recipient addresses
    pub to: Vec<String>,
    /// Relay username, when authentication is required
    #[serde(default)]
    pub username: Option<String>,
    /// Relay password
    #[serde(default)]
    pub password: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}

/// Alert channel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Webhook endpoint receiving JSON payloads
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// SMTP channel
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    /// Minutes of cooldown per alert type
    #[serde(default = "default_alert_cooldown_mins")]
    pub cooldown_mins: u64,
}

fn default_alert_cooldown_mins() -> u64 {
    60
}

impl AlertsConfig {
    /// Cooldown as a [`Duration`].
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_mins * 60)
    }
}

/// Load configuration: file (when present), then environment, then validate.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => load_from_file(p)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Parse a configuration document from a YAML file.
pub fn load_from_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| OptimizerError::Config(format!("reading {}: {e}", path.display())))?;
    serde_yaml::from_str(&content)
        .map_err(|e| OptimizerError::Config(format!("parsing {}: {e}", path.display())))
}

/// Apply environment-variable fallbacks.
///
/// Explicit variables win over provider-native detection; both only fill
/// fields the document left empty, except `CLOUD_PROVIDER` which always
/// wins when set.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(provider) = std::env::var("CLOUD_PROVIDER") {
        match provider.to_lowercase().as_str() {
            "aws" => config.cloud_provider = CloudVendor::Aws,
            "gcp" => config.cloud_provider = CloudVendor::Gcp,
            "azure" => config.cloud_provider = CloudVendor::Azure,
            _ => {}
        }
    } else if std::env::var("GOOGLE_CLOUD_PROJECT").is_ok() {
        config.cloud_provider = CloudVendor::Gcp;
    } else if std::env::var("AZURE_SUBSCRIPTION_ID").is_ok() {
        config.cloud_provider = CloudVendor::Azure;
    }

    if config.region.is_empty() {
        if let Ok(region) = std::env::var("REGION") {
            config.region = region;
        } else if let Ok(region) = std::env::var("AWS_REGION") {
            config.region = region;
        }
    }
    if config.cluster_name == default_cluster_name() {
        if let Ok(name) = std::env::var("CLUSTER_NAME") {
            config.cluster_name = name;
        }
    }
}

/// Startup validation. Any failure here is fatal.
pub fn validate(config: &Config) -> Result<()> {
    if config.region.is_empty() {
        return Err(OptimizerError::Config(
            "region must be set (config or REGION/AWS_REGION)".to_string(),
        ));
    }
    if config.cluster_name.is_empty() {
        return Err(OptimizerError::Config("cluster_name must not be empty".to_string()));
    }
    if config.autoscaler.scale_up_threshold <= config.autoscaler.scale_down_threshold {
        return Err(OptimizerError::Config(format!(
            "scale_up_threshold ({}) must exceed scale_down_threshold ({})",
            config.autoscaler.scale_up_threshold, config.autoscaler.scale_down_threshold
        )));
    }
    let oom = config.rightsizer.oom_bump_multiplier;
    if !(1.0..=10.0).contains(&oom) {
        return Err(OptimizerError::Config(format!(
            "oom_bump_multiplier must be within [1.0, 10.0], got {oom}"
        )));
    }
    if config.workload.surge_threshold < 1.0 {
        return Err(OptimizerError::Config(format!(
            "surge_threshold must be >= 1.0, got {}",
            config.workload.surge_threshold
        )));
    }
    let utilization = config.storage.min_utilization_ratio;
    if !(0.0..=1.0).contains(&utilization) {
        return Err(OptimizerError::Config(format!(
            "min_utilization_ratio must be within [0.0, 1.0], got {utilization}"
        )));
    }
    if config.spot.max_spot_percentage > 90 {
        return Err(OptimizerError::Config(format!(
            "max_spot_percentage must be <= 90, got {}",
            config.spot.max_spot_percentage
        )));
    }
    if config.mode == Mode::Active && !config.ai_gate.enabled {
        return Err(OptimizerError::Config(
            "active mode requires the AI safety gate to be enabled".to_string(),
        ));
    }
    if config.ai_gate.timezone.parse::<chrono_tz::Tz>().is_err() {
        return Err(OptimizerError::Config(format!(
            "unknown IANA time zone: {}",
            config.ai_gate.timezone
        )));
    }
    if config.hibernation.enabled
        && (config.hibernation.hibernate_cron.is_none() || config.hibernation.wake_cron.is_none())
    {
        return Err(OptimizerError::Config(
            "hibernation requires both hibernate_cron and wake_cron".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            region: "us-east-1".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn defaults_validate_with_region() {
        validate(&valid()).unwrap();
    }

    #[test]
    fn active_mode_requires_gate() {
        let mut config = valid();
        config.mode = Mode::Active;
        assert!(validate(&config).is_err());
        config.ai_gate.enabled = true;
        validate(&config).unwrap();
    }

    #[test]
    fn threshold_ordering_enforced() {
        let mut config = valid();
        config.autoscaler.scale_up_threshold = 20.0;
        config.autoscaler.scale_down_threshold = 30.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn oom_multiplier_bounds() {
        let mut config = valid();
        config.rightsizer.oom_bump_multiplier = 0.5;
        assert!(validate(&config).is_err());
        config.rightsizer.oom_bump_multiplier = 12.0;
        assert!(validate(&config).is_err());
        config.rightsizer.oom_bump_multiplier = 2.5;
        validate(&config).unwrap();
    }

    #[test]
    fn spot_percentage_capped() {
        let mut config = valid();
        config.spot.max_spot_percentage = 95;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn yaml_round_trip() {
        let yaml = r#"
mode: recommend
cloud_provider: gcp
region: europe-west1
autoscaler:
  scale_up_threshold: 85
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mode, Mode::Recommend);
        assert_eq!(config.cloud_provider, CloudVendor::Gcp);
        assert!((config.autoscaler.scale_up_threshold - 85.0).abs() < f64::EPSILON);
        // untouched sub-blocks keep their defaults
        assert_eq!(config.evictor.max_concurrent_evictions, 3);
    }
}
