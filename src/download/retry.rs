//! Retry with exponential backoff for transient transfer failures

use crate::error::DlError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(with = "duration_str")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "duration_str")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (0-based), without jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(retry.min(63) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let range = delay.as_millis() as f64 * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * range;
        delay + Duration::from_millis(jitter.abs() as u64)
    }
}

/// Durations in config files are written as "200ms", "30s"
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Runs a fallible async operation until it succeeds, fails permanently or
/// runs out of retries
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retry while the error reports itself as retryable
    pub async fn execute<F, Fut, T>(&self, func: F) -> Result<T, DlError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DlError>>,
    {
        self.execute_if(func, DlError::is_retryable).await
    }

    /// Retry while `should_retry` accepts the error. Misconfiguration is
    /// never retried.
    pub async fn execute_if<F, Fut, T, P>(&self, mut func: F, should_retry: P) -> Result<T, DlError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DlError>>,
        P: Fn(&DlError) -> bool,
    {
        let mut retry = 0;
        loop {
            let error = match func().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if error.is_misconfiguration() {
                warn!(error = %error, "Not retrying misconfiguration");
                return Err(error);
            }
            if !should_retry(&error) {
                debug!(error = %error, "Not retrying permanent error");
                return Err(error);
            }
            if retry >= self.config.max_retries {
                warn!(error = %error, attempts = retry + 1, "Giving up after retries");
                return Err(error);
            }

            let delay = self.config.with_jitter(self.config.backoff(retry));
            warn!(error = %error, retry = retry + 1, ?delay, "Retrying after transient error");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

/// Retry configuration builder
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn initial_delay(mut self, initial_delay: Duration) -> Self {
        self.config.initial_delay = initial_delay;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.config.max_delay = max_delay;
        self
    }

    pub fn backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.config.backoff_multiplier = backoff_multiplier;
        self
    }

    /// Set jitter factor, clamped to 0.0..=1.0
    pub fn jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.config.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    pub fn build(self) -> RetryConfig {
        self.config
    }
}
