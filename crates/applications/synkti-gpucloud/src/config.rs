//! Simulator configuration
//!
//! Every timing distribution and failure-injection probability is a tunable
//! with a documented default. Configuration loads from JSON; any field left
//! out falls back to its default.

use crate::error::{Result, SimError};
use crate::types::{GpuSku, Quota, Region, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Uniform delay distribution in simulated seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl DelayRange {
    pub fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    /// Constant delay
    pub fn fixed(secs: f64) -> Self {
        Self::new(secs, secs)
    }

    pub fn min(&self) -> Duration {
        Duration::from_secs_f64(self.min_secs.max(0.0))
    }

    pub fn max(&self) -> Duration {
        Duration::from_secs_f64(self.max_secs.max(0.0))
    }

    fn validate(&self, what: &str) -> Result<()> {
        if !self.min_secs.is_finite() || !self.max_secs.is_finite() || self.min_secs < 0.0 {
            return Err(SimError::config(format!("{}: delays must be finite and non-negative", what)));
        }
        if self.min_secs > self.max_secs {
            return Err(SimError::config(format!(
                "{}: min {}s exceeds max {}s",
                what, self.min_secs, self.max_secs
            )));
        }
        Ok(())
    }
}

/// Inventory of one GPU SKU in one region
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub region: Region,
    pub sku: GpuSku,

    /// Physical GPUs
    pub total_units: u32,

    /// Committed units may reach `total_units * overcommit_ratio`
    #[serde(default = "default_overcommit_ratio")]
    pub overcommit_ratio: f64,
}

fn default_overcommit_ratio() -> f64 {
    1.0
}

impl PoolSpec {
    pub fn new(region: Region, sku: GpuSku, total_units: u32) -> Self {
        Self {
            region,
            sku,
            total_units,
            overcommit_ratio: default_overcommit_ratio(),
        }
    }

    pub fn with_overcommit(mut self, ratio: f64) -> Self {
        self.overcommit_ratio = ratio;
        self
    }

    /// Committable units after overcommit
    pub fn capacity(&self) -> u32 {
        (f64::from(self.total_units) * self.overcommit_ratio).floor() as u32
    }
}

/// Synthetic telemetry tunables
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Default bucket width for metric queries
    pub sample_interval_secs: u64,

    /// Time for utilization to reach steady state after a job starts
    pub ramp_up_secs: f64,

    /// Time for utilization to fall back after a job ends
    pub decay_secs: f64,

    /// Jitter amplitude in percentage points
    pub jitter_pct: f64,

    /// Utilization of an idle instance
    pub idle_utilization_pct: f64,

    /// Ambient temperature (°C)
    pub ambient_temp_c: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 10,
            ramp_up_secs: 30.0,
            decay_secs: 30.0,
            jitter_pct: 3.0,
            idle_utilization_pct: 1.0,
            ambient_temp_c: 35.0,
        }
    }
}

impl MetricsConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }
}

/// Simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Root seed for every pseudo-random draw
    pub seed: u64,

    /// `provisioning -> running` delay
    pub provisioning_delay: DelayRange,

    /// Chance that provisioning ends in `failed`
    pub provisioning_failure_probability: f64,

    /// `terminating -> terminated` delay
    pub teardown_delay: DelayRange,

    /// Chance that a started job fails before its declared duration
    pub job_failure_probability: f64,

    /// Concurrent job slots per GPU (1 = no oversubscription)
    pub job_slots_per_gpu: u32,

    /// Queued jobs allowed per instance
    pub max_queue_depth: usize,

    /// Largest GPU count accepted for one instance
    pub max_gpus_per_instance: u32,

    /// Quota for tenants without an override
    pub default_quota: Quota,

    /// Per-tenant quota overrides
    pub tenant_quotas: HashMap<TenantId, Quota>,

    /// GPU inventory
    pub pools: Vec<PoolSpec>,

    pub metrics: MetricsConfig,

    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        let pools = Region::ALL
            .iter()
            .flat_map(|&region| {
                GpuSku::ALL
                    .iter()
                    .map(move |&sku| PoolSpec::new(region, sku, default_pool_units(sku)))
            })
            .collect();

        Self {
            seed: 42,
            provisioning_delay: DelayRange::new(2.0, 8.0),
            provisioning_failure_probability: 0.02,
            teardown_delay: DelayRange::new(1.0, 3.0),
            job_failure_probability: 0.10,
            job_slots_per_gpu: 1,
            max_queue_depth: 64,
            max_gpus_per_instance: 8,
            default_quota: Quota::default(),
            tenant_quotas: HashMap::new(),
            pools,
            metrics: MetricsConfig::default(),
            event_buffer: 1024,
        }
    }
}

fn default_pool_units(sku: GpuSku) -> u32 {
    match sku {
        GpuSku::A100 => 64,
        GpuSku::H100 => 32,
        GpuSku::V100 => 64,
        GpuSku::Rtx4090 => 128,
    }
}

impl SimConfig {
    /// Deterministic test profile: fixed delays, no injected failures
    pub fn deterministic() -> Self {
        Self {
            provisioning_delay: DelayRange::fixed(5.0),
            provisioning_failure_probability: 0.0,
            teardown_delay: DelayRange::fixed(2.0),
            job_failure_probability: 0.0,
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: SimConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Set seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set provisioning delay
    pub fn with_provisioning_delay(mut self, delay: DelayRange) -> Self {
        self.provisioning_delay = delay;
        self
    }

    /// Set provisioning failure probability
    pub fn with_provisioning_failure(mut self, p: f64) -> Self {
        self.provisioning_failure_probability = p;
        self
    }

    /// Set teardown delay
    pub fn with_teardown_delay(mut self, delay: DelayRange) -> Self {
        self.teardown_delay = delay;
        self
    }

    /// Set job failure probability
    pub fn with_job_failure(mut self, p: f64) -> Self {
        self.job_failure_probability = p;
        self
    }

    /// Set job slots per GPU
    pub fn with_job_slots_per_gpu(mut self, slots: u32) -> Self {
        self.job_slots_per_gpu = slots;
        self
    }

    /// Set per-instance queue depth
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set default tenant quota
    pub fn with_default_quota(mut self, quota: Quota) -> Self {
        self.default_quota = quota;
        self
    }

    /// Override one tenant's quota
    pub fn with_tenant_quota(mut self, tenant: impl Into<TenantId>, quota: Quota) -> Self {
        self.tenant_quotas.insert(tenant.into(), quota);
        self
    }

    /// Replace the inventory
    pub fn with_pools(mut self, pools: Vec<PoolSpec>) -> Self {
        self.pools = pools;
        self
    }

    /// Set metrics tunables
    pub fn with_metrics(mut self, metrics: MetricsConfig) -> Self {
        self.metrics = metrics;
        self
    }

    /// Quota applying to `tenant`
    pub fn quota_for(&self, tenant: &TenantId) -> Quota {
        self.tenant_quotas
            .get(tenant)
            .copied()
            .unwrap_or(self.default_quota)
    }

    /// Check every value for consistency
    pub fn validate(&self) -> Result<()> {
        self.provisioning_delay.validate("provisioning_delay")?;
        self.teardown_delay.validate("teardown_delay")?;

        for (name, p) in [
            ("provisioning_failure_probability", self.provisioning_failure_probability),
            ("job_failure_probability", self.job_failure_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(SimError::config(format!("{} must be within [0, 1], got {}", name, p)));
            }
        }

        if self.job_slots_per_gpu == 0 {
            return Err(SimError::config("job_slots_per_gpu must be at least 1"));
        }
        if self.max_gpus_per_instance == 0 {
            return Err(SimError::config("max_gpus_per_instance must be at least 1"));
        }
        if self.metrics.sample_interval_secs == 0 {
            return Err(SimError::config("metrics.sample_interval_secs must be positive"));
        }
        if self.event_buffer == 0 {
            return Err(SimError::config("event_buffer must be positive"));
        }
        if self.pools.is_empty() {
            return Err(SimError::config("at least one pool is required"));
        }

        let mut seen = HashSet::new();
        for pool in &self.pools {
            if !seen.insert((pool.region, pool.sku)) {
                return Err(SimError::config(format!(
                    "duplicate pool for {} in {}",
                    pool.sku, pool.region
                )));
            }
            if pool.total_units == 0 {
                return Err(SimError::config(format!(
                    "pool {} in {} has no units",
                    pool.sku, pool.region
                )));
            }
            if !pool.overcommit_ratio.is_finite() || pool.overcommit_ratio < 1.0 {
                return Err(SimError::config(format!(
                    "pool {} in {}: overcommit ratio must be >= 1.0, got {}",
                    pool.sku, pool.region, pool.overcommit_ratio
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SimConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pools.len(), 12);
        assert_eq!(config.provisioning_delay, DelayRange::new(2.0, 8.0));
        assert_eq!(config.job_slots_per_gpu, 1);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SimConfig = serde_json::from_str(
            r#"{
                "seed": 7,
                "pools": [{ "region": "us-east-1", "sku": "A100", "total_units": 2 }]
            }"#,
        )
        .unwrap();

        assert_eq!(config.seed, 7);
        assert_eq!(config.pools.len(), 1);
        assert_eq!(config.pools[0].overcommit_ratio, 1.0);
        assert_eq!(config.job_failure_probability, 0.10);
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_probability() {
        let config = SimConfig::default().with_job_failure(1.5);
        assert!(matches!(config.validate(), Err(SimError::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_delay() {
        let config = SimConfig::default().with_provisioning_delay(DelayRange::new(8.0, 2.0));
        assert!(matches!(config.validate(), Err(SimError::Config(_))));
    }

    #[test]
    fn test_rejects_duplicate_pool() {
        let config = SimConfig::default().with_pools(vec![
            PoolSpec::new(Region::UsEast1, GpuSku::A100, 2),
            PoolSpec::new(Region::UsEast1, GpuSku::A100, 4),
        ]);
        assert!(matches!(config.validate(), Err(SimError::Config(_))));
    }

    #[test]
    fn test_rejects_undercommit() {
        let config = SimConfig::default()
            .with_pools(vec![PoolSpec::new(Region::UsEast1, GpuSku::A100, 2).with_overcommit(0.5)]);
        assert!(matches!(config.validate(), Err(SimError::Config(_))));
    }

    #[test]
    fn test_pool_capacity_with_overcommit() {
        let pool = PoolSpec::new(Region::EuWest1, GpuSku::H100, 4).with_overcommit(1.5);
        assert_eq!(pool.capacity(), 6);
    }

    #[test]
    fn test_tenant_quota_override() {
        let custom = Quota {
            max_instances: 1,
            max_gpus: 2,
            max_active_jobs: 3,
        };
        let config = SimConfig::default().with_tenant_quota("usr_002", custom);
        assert_eq!(config.quota_for(&TenantId::from("usr_002")), custom);
        assert_eq!(config.quota_for(&TenantId::from("usr_001")), Quota::default());
    }

    #[test]
    fn test_from_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("synkti-gpucloud-{}.json", std::process::id()));
        let config = SimConfig::deterministic().with_seed(99);
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = SimConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.seed, 99);
        assert_eq!(loaded.provisioning_delay, DelayRange::fixed(5.0));
        assert_eq!(loaded.job_failure_probability, 0.0);
    }
}
