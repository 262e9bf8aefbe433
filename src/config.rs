//! Disk quota configuration
//!
//! Plain value object, loadable from YAML:
//!
//! ```yaml
//! enabled: true
//! cacheCleanupFrequency: 30
//! cacheCleanupUnits: SECONDS
//! maxConcurrentCleanUps: 2
//! globalExpirationPolicyName: LRU
//! globalQuota: { value: 2.0, units: GiB }
//! diskBlockSize: 4096
//! layerQuotas:
//!   - layer: topp:states
//!     expirationPolicyName: LFU
//!     quota: { value: 100.0, units: MiB }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::expiration::PolicyRegistry;
use crate::lock::LockConfig;
use crate::logging::LogConfig;
use crate::quota::{LayerQuota, Quota, StorageUnit};
use crate::storage::TileCacheConfig;

/// Granularity of the cleanup scheduler
pub const CLEANUP_TICK: Duration = Duration::from_secs(1);

/// Unit of the cleanup frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    pub fn to_millis(self, amount: u64) -> u64 {
        let factor = match self {
            TimeUnit::Milliseconds => 1,
            TimeUnit::Seconds => 1_000,
            TimeUnit::Minutes => 60_000,
            TimeUnit::Hours => 3_600_000,
            TimeUnit::Days => 86_400_000,
        };
        amount.saturating_mul(factor)
    }
}

/// Disk quota settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiskQuotaConfig {
    pub enabled: bool,
    pub cache_cleanup_frequency: i64,
    pub cache_cleanup_units: Option<TimeUnit>,
    pub max_concurrent_clean_ups: i32,
    pub global_expiration_policy_name: String,
    pub global_quota: Quota,
    pub disk_block_size: i64,
    pub layer_quotas: Vec<LayerQuota>,
    pub lock: LockConfig,
    pub cache: TileCacheConfig,
    pub log: LogConfig,
}

impl Default for DiskQuotaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_cleanup_frequency: 10,
            cache_cleanup_units: Some(TimeUnit::Seconds),
            max_concurrent_clean_ups: 2,
            global_expiration_policy_name: "LFU".to_string(),
            global_quota: Quota::new(500.0, StorageUnit::MiB),
            disk_block_size: 4096,
            layer_quotas: Vec::new(),
            lock: LockConfig::default(),
            cache: TileCacheConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl DiskQuotaConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject settings the quota subsystem cannot run with
    pub fn validate(&self, policies: &PolicyRegistry) -> Result<()> {
        if self.disk_block_size <= 0 {
            return Err(Error::Config("diskBlockSize must be > 0".into()));
        }
        if self.cache_cleanup_units.is_none() {
            return Err(Error::Config("cacheCleanupUnits must be set".into()));
        }
        if self.cache_cleanup_frequency <= 0 {
            return Err(Error::Config("cacheCleanupFrequency must be > 0".into()));
        }
        if self.max_concurrent_clean_ups <= 0 {
            return Err(Error::Config("maxConcurrentCleanUps must be > 0".into()));
        }
        if !policies.contains(&self.global_expiration_policy_name) {
            return Err(Error::Config(format!(
                "unknown global expiration policy {}",
                self.global_expiration_policy_name
            )));
        }
        for layer in &self.layer_quotas {
            if layer.quota.is_none() {
                return Err(Error::Config(format!(
                    "layer quota for {} has no quota",
                    layer.layer
                )));
            }
            if let Some(name) = &layer.expiration_policy_name {
                if !policies.contains(name) {
                    return Err(Error::Config(format!(
                        "unknown expiration policy {} for layer {}",
                        name, layer.layer
                    )));
                }
            }
        }
        Ok(())
    }

    /// Cleanup poll interval, clamped down to whole scheduler ticks
    pub fn cleanup_interval(&self) -> Result<Duration> {
        let units = self
            .cache_cleanup_units
            .ok_or_else(|| Error::Config("cacheCleanupUnits must be set".into()))?;
        let frequency = u64::try_from(self.cache_cleanup_frequency)
            .map_err(|_| Error::Config("cacheCleanupFrequency must be > 0".into()))?;

        let requested = units.to_millis(frequency);
        let tick = CLEANUP_TICK.as_millis() as u64;
        let clamped = requested - requested % tick;
        if clamped == 0 {
            return Err(Error::Config(format!(
                "cleanup interval of {} ms is shorter than {:?}",
                requested, CLEANUP_TICK
            )));
        }
        if clamped != requested {
            warn!(
                "Cleanup interval {} ms is not a multiple of {:?}, using {} ms",
                requested, CLEANUP_TICK, clamped
            );
        }
        Ok(Duration::from_millis(clamped))
    }

    pub fn layer_quota(&self, layer: &str) -> Option<&LayerQuota> {
        self.layer_quotas.iter().find(|q| q.layer == layer)
    }

    /// Expiration policy name for `layer`, falling back to the global one
    pub fn policy_name_for(&self, layer: &str) -> &str {
        self.layer_quota(layer)
            .and_then(|q| q.expiration_policy_name.as_deref())
            .unwrap_or(&self.global_expiration_policy_name)
    }

    /// Block size as an unsigned count of bytes
    pub fn block_size(&self) -> u64 {
        self.disk_block_size.max(1) as u64
    }
}
