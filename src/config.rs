use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::remote::RetryConfig;
use crate::{DEFAULT_DAILY_GOAL_ML, DEFAULT_RETRY_CEILING};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub health_path: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".into(),
            request_timeout_ms: 10_000,
            health_path: "/health".into(),
        }
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.base_url).map_err(|e| invalid("base_url", e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("base_url", "must use http or https"));
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", "must be greater than 0"));
        }
        if !self.health_path.starts_with('/') {
            return Err(invalid("health_path", "must start with '/'"));
        }
        Ok(())
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub health_check_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive non-timeout probe failures before going offline.
    pub failure_threshold: u32,
    pub wait_for_connection_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
            failure_threshold: 3,
            wait_for_connection_timeout_ms: 30_000,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health_check_interval_ms == 0 {
            return Err(invalid("health_check_interval_ms", "must be greater than 0"));
        }
        if self.probe_timeout_ms == 0 {
            return Err(invalid("probe_timeout_ms", "must be greater than 0"));
        }
        if self.probe_timeout_ms > self.health_check_interval_ms {
            return Err(invalid(
                "probe_timeout_ms",
                "must not exceed health_check_interval_ms",
            ));
        }
        if self.failure_threshold == 0 {
            return Err(invalid("failure_threshold", "must be greater than 0"));
        }
        Ok(())
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Operations with `retry_count` at or above this are evicted before a pass.
    pub retry_ceiling: u32,
    /// Queues longer than this are replayed in batches.
    pub batch_threshold: usize,
    pub batch_size: usize,
    pub poor_batch_size: usize,
    pub inter_batch_pause_ms: u64,
    pub reconnect_settle_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: DEFAULT_RETRY_CEILING,
            batch_threshold: 10,
            batch_size: 5,
            poor_batch_size: 3,
            inter_batch_pause_ms: 2_000,
            reconnect_settle_ms: 1_000,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_ceiling == 0 {
            return Err(invalid("retry_ceiling", "must be greater than 0"));
        }
        if self.batch_size == 0 || self.poor_batch_size == 0 {
            return Err(invalid("batch_size", "batch sizes must be greater than 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `None` opens an in-memory database.
    pub database_path: Option<PathBuf>,
    /// Snapshot file for the fallback store; `None` keeps it memory-only.
    pub fallback_snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub default_daily_goal: u32,
    /// Retry policy for the remote half of an online write.
    pub write_retry: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_daily_goal: DEFAULT_DAILY_GOAL_ML,
            write_retry: RetryConfig {
                max_retries: 3,
                ..RetryConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub remote: RemoteConfig,
    pub network: NetworkConfig,
    pub retry: RetryConfig,
    pub sync: SyncConfig,
    pub store: StoreConfig,
    pub coordinator: CoordinatorConfig,
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.remote.validate()?;
        self.network.validate()?;
        self.retry.validate()?;
        self.coordinator.write_retry.validate()?;
        self.sync.validate()?;
        if self.coordinator.default_daily_goal == 0 {
            return Err(invalid("default_daily_goal", "must be greater than 0"));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}
