//! Configuration management for Quotagate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{QuotaError, Result};
use crate::ratelimit::{FailMode, DEFAULT_IDLE_TTL_MULTIPLIER};

/// Environment variable prefix for overrides, e.g. `QUOTAGATE__ENGINE__SHARD_COUNT`.
const ENV_PREFIX: &str = "QUOTAGATE";

/// Main configuration for the Quotagate engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotagateConfig {
    /// Engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Background maintenance configuration
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Path to the policy table
    #[serde(default)]
    pub policies_path: Option<String>,
}

/// Request-path configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of counter store shards (rounded up to a power of two)
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// What to do when no policy matches a request
    #[serde(default)]
    pub missing_policy_fail_mode: FailMode,

    /// Idle TTL as a multiple of a policy's window or bucket drain time
    #[serde(default = "default_idle_ttl_multiplier")]
    pub idle_ttl_multiplier: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            missing_policy_fail_mode: FailMode::default(),
            idle_ttl_multiplier: default_idle_ttl_multiplier(),
        }
    }
}

fn default_shard_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    cpus * 4
}

fn default_idle_ttl_multiplier() -> u32 {
    DEFAULT_IDLE_TTL_MULTIPLIER
}

/// Replenisher and evictor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Replenisher tick interval in milliseconds
    #[serde(default = "default_replenish_interval")]
    pub replenish_interval_ms: u64,

    /// Evictor sweep interval in milliseconds
    #[serde(default = "default_evict_interval")]
    pub evict_interval_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            replenish_interval_ms: default_replenish_interval(),
            evict_interval_ms: default_evict_interval(),
        }
    }
}

fn default_replenish_interval() -> u64 {
    100
}

fn default_evict_interval() -> u64 {
    30_000
}

impl MaintenanceConfig {
    pub fn replenish_interval(&self) -> Duration {
        Duration::from_millis(self.replenish_interval_ms.max(1))
    }

    pub fn evict_interval(&self) -> Duration {
        Duration::from_millis(self.evict_interval_ms.max(1))
    }
}

impl QuotagateConfig {
    /// Load configuration from a file, with `QUOTAGATE__*` environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(QuotaError::Config(format!(
                "configuration file {} does not exist",
                path.display()
            )));
        }

        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| QuotaError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QuotagateConfig::default();
        assert!(config.engine.shard_count >= 4);
        assert_eq!(config.engine.missing_policy_fail_mode, FailMode::Closed);
        assert_eq!(config.engine.idle_ttl_multiplier, 4);
        assert_eq!(
            config.maintenance.replenish_interval(),
            Duration::from_millis(100)
        );
        assert!(config.policies_path.is_none());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
engine:
  shard_count: 16
  missing_policy_fail_mode: open
maintenance:
  evict_interval_ms: 5000
policies_path: /etc/quotagate/policies.yaml
"#;
        let config = QuotagateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.engine.shard_count, 16);
        assert_eq!(config.engine.missing_policy_fail_mode, FailMode::Open);
        assert_eq!(config.engine.idle_ttl_multiplier, 4);
        assert_eq!(config.maintenance.evict_interval(), Duration::from_secs(5));
        assert_eq!(config.maintenance.replenish_interval_ms, 100);
        assert_eq!(
            config.policies_path.as_deref(),
            Some("/etc/quotagate/policies.yaml")
        );
    }

    #[test]
    fn test_from_missing_file() {
        let err = QuotagateConfig::from_file("/nonexistent/quotagate.yaml").unwrap_err();
        assert!(matches!(err, QuotaError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("quotagate-{}.yaml", std::process::id()));
        std::fs::write(&path, "maintenance:\n  replenish_interval_ms: 25\n").unwrap();

        let config = QuotagateConfig::from_file(&path).unwrap();
        assert_eq!(config.maintenance.replenish_interval_ms, 25);
        assert_eq!(config.maintenance.evict_interval_ms, 30_000);

        std::fs::remove_file(&path).unwrap();
    }
}
