//! Configuration for a registry node.

use crate::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a registry node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryNodeConfig {
    /// Directory holding the durable store.
    pub data_dir: PathBuf,
    /// Start the node in read-only mode: snapshot requests are served but no
    /// mutating transaction runs.
    pub read_only: bool,
    /// Agent recovery loop settings.
    pub recovery: RecoveryConfig,
}

/// Settings for the agent recovery scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Delay between recovery scans. The scheduler re-arms itself with this
    /// delay after every tick, whatever the tick's outcome.
    pub tick_interval: Duration,
    /// Minimum time an agent must have spent in `Warning` before it is
    /// restored to `Online`.
    pub grace_period: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            grace_period: Duration::from_secs(300),
        }
    }
}

impl Default for RegistryNodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/disk-registry"),
            read_only: false,
            recovery: RecoveryConfig::default(),
        }
    }
}

impl RegistryNodeConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| RegistryError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.recovery.tick_interval.is_zero() {
            return Err(RegistryError::InvalidConfig {
                field: "recovery.tick_interval".to_string(),
                reason: "Tick interval must be non-zero".to_string(),
            });
        }

        if self.recovery.grace_period.is_zero() {
            return Err(RegistryError::InvalidConfig {
                field: "recovery.grace_period".to_string(),
                reason: "Grace period must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal development configuration.
    pub fn development() -> Self {
        Self {
            data_dir: PathBuf::from("./registry-data"),
            read_only: false,
            recovery: RecoveryConfig {
                tick_interval: Duration::from_secs(5),
                grace_period: Duration::from_secs(30),
            },
        }
    }
}
