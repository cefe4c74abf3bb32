//! Orchestrator configuration

use crate::core::task::Priority;
use crate::error::DlError;
use crate::limit::OriginRule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Orchestrator configuration, constructed once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum number of tasks in RUNNING state at once
    pub max_concurrent: usize,
    /// Priority used when the caller does not pick one
    pub default_priority: Priority,
    /// Request budget per origin
    pub per_origin_rules: HashMap<String, OriginRule>,
    /// Host suffixes that map a URL to an origin
    pub origin_hosts: HashMap<String, Vec<String>>,
    /// Per-transfer bandwidth cap in bytes per second (0 = unlimited)
    pub default_speed_limit_bps: u64,
    /// Trailing window for throughput telemetry, in seconds
    pub rate_window_secs: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let per_origin_rules = HashMap::from([
            ("twitter".to_string(), OriginRule::new(100, 900)), // 100 per 15 minutes
            ("bilibili".to_string(), OriginRule::new(5, 1)),
            ("youtube".to_string(), OriginRule::new(10_000, 86_400)), // daily quota
        ]);

        let origin_hosts = HashMap::from([
            (
                "youtube".to_string(),
                vec!["youtube.com".to_string(), "youtu.be".to_string()],
            ),
            (
                "twitter".to_string(),
                vec!["twitter.com".to_string(), "x.com".to_string()],
            ),
            (
                "bilibili".to_string(),
                vec!["bilibili.com".to_string(), "b23.tv".to_string()],
            ),
        ]);

        Self {
            max_concurrent: 3,
            default_priority: Priority::Normal,
            per_origin_rules,
            origin_hosts,
            default_speed_limit_bps: 0,
            rate_window_secs: 1.0,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a JSON file. Missing keys take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DlError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot run with
    pub fn validate(&self) -> Result<(), DlError> {
        if self.max_concurrent == 0 {
            return Err(DlError::InvalidArgument(
                "max_concurrent must be greater than 0".to_string(),
            ));
        }
        if !(self.rate_window_secs.is_finite() && self.rate_window_secs > 0.0) {
            return Err(DlError::InvalidArgument(
                "rate_window_secs must be positive".to_string(),
            ));
        }
        for (origin, rule) in &self.per_origin_rules {
            rule.validate(origin)?;
        }
        Ok(())
    }

    /// Set maximum concurrency
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Set default priority
    pub fn with_default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }

    /// Set per-transfer speed limit (0 = unlimited)
    pub fn with_speed_limit(mut self, bytes_per_second: u64) -> Self {
        self.default_speed_limit_bps = bytes_per_second;
        self
    }

    /// Add or replace an origin rule
    pub fn with_origin_rule(mut self, origin: impl Into<String>, rule: OriginRule) -> Self {
        self.per_origin_rules.insert(origin.into(), rule);
        self
    }

    /// Map host suffixes to an origin
    pub fn with_origin_hosts<I, S>(mut self, origin: impl Into<String>, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.origin_hosts
            .insert(origin.into(), hosts.into_iter().map(Into::into).collect());
        self
    }

    /// Drop all origin rules and host mappings
    pub fn without_origins(mut self) -> Self {
        self.per_origin_rules.clear();
        self.origin_hosts.clear();
        self
    }

    /// Telemetry window as a Duration
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs_f64(self.rate_window_secs)
    }
}
