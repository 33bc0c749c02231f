use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::RemoteError;
use crate::config::ConfigError;

const JITTER_RATIO: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// One retry after the initial attempt, used to replay a conflict winner.
    #[must_use]
    pub fn single_retry(&self) -> Self {
        Self {
            max_retries: 1,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid {
                field: "backoff_factor",
                reason: "must be a finite number >= 1.0".into(),
            });
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::Invalid {
                field: "max_delay_ms",
                reason: "must be >= base_delay_ms".into(),
            });
        }
        Ok(())
    }
}

/// `min(base * factor^attempt, max)` scaled by `1 + jitter_unit * 10%`.
///
/// `jitter_unit` is clamped to `[-1, 1]` and ignored when jitter is disabled.
#[must_use]
pub fn backoff_delay_with(attempt: u32, config: &RetryConfig, jitter_unit: f64) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let raw = config.base_delay_ms as f64 * config.backoff_factor.powi(exponent);
    // 0 * inf is NaN for a zero base delay at huge attempt counts
    let capped = if raw.is_nan() {
        0.0
    } else {
        raw.min(config.max_delay_ms as f64)
    };

    let delay = if config.jitter {
        let unit = if jitter_unit.is_finite() {
            jitter_unit.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        capped * (1.0 + unit * JITTER_RATIO)
    } else {
        capped
    };

    Duration::from_millis(delay.max(0.0).round() as u64)
}

#[must_use]
pub fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let unit = if config.jitter {
        rand::thread_rng().gen_range(-1.0..=1.0)
    } else {
        0.0
    };
    backoff_delay_with(attempt, config, unit)
}

/// Runs `operation` up to `max_retries + 1` times.
///
/// Non-retryable errors return immediately. Between attempts the task sleeps
/// for `backoff_delay(attempt - 1)`.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = operation_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => {
                debug!(operation = operation_name, error = %e, "Non-retryable failure");
                return Err(e);
            }
            Err(e) if attempt >= config.max_retries => {
                warn!(
                    operation = operation_name,
                    attempts = attempt + 1,
                    error = %e,
                    "Retries exhausted"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = backoff_delay(attempt, config);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
