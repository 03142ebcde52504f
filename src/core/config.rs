use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{CoordError, Result};

/// How resources inside one stage are dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// One at a time, in the stage's normalized manifest order
    Sequential,
    /// At most `n` concurrent loads, the rest queued FIFO
    BoundedParallel(usize),
    /// Every ready resource is dispatched at once
    Parallel,
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self::BoundedParallel(4)
    }
}

impl fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::BoundedParallel(n) => write!(f, "bounded:{}", n),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

impl FromStr for ConcurrencyPolicy {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            other => {
                let n = other
                    .strip_prefix("bounded:")
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or_else(|| {
                        CoordError::configuration_field(
                            format!("unknown concurrency policy '{}'", other),
                            "policy",
                        )
                    })?;
                Ok(Self::BoundedParallel(n))
            }
        }
    }
}

/// What the ledger does when a `Failed` resource is requested again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// A failed resource stays failed for the lifetime of the ledger
    #[default]
    Never,
    /// One more attempt is allowed after the first failure
    Once,
    /// Every new request after a failure re-runs the load
    Unlimited,
}

impl RetryPolicy {
    /// Whether an entry that has already been claimed `attempts` times and
    /// ended `Failed` may be claimed again
    pub fn allows_retry(&self, attempts: u32) -> bool {
        match self {
            Self::Never => false,
            Self::Once => attempts < 2,
            Self::Unlimited => true,
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Dispatch policy inside a stage
    pub policy: ConcurrencyPolicy,
    /// Default per-resource fetch timeout (descriptors may override)
    pub resource_timeout: Option<Duration>,
    /// Re-request behaviour for failed resources
    pub on_failed_retry: RetryPolicy,
    /// Capacity of the event notification ring
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            policy: ConcurrencyPolicy::default(),
            resource_timeout: Some(Duration::from_secs(30)),
            on_failed_retry: RetryPolicy::Never,
            event_capacity: 256,
        }
    }
}

impl CoordinatorConfig {
    /// Create a new builder for CoordinatorConfig
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let ConcurrencyPolicy::BoundedParallel(0) = self.policy {
            return Err(CoordError::configuration_field(
                "bounded parallelism must allow at least one load",
                "policy",
            ));
        }
        if self.resource_timeout == Some(Duration::ZERO) {
            return Err(CoordError::configuration_field(
                "resource_timeout must be greater than 0",
                "resource_timeout",
            ));
        }
        if self.event_capacity == 0 {
            return Err(CoordError::configuration_field(
                "event_capacity must be greater than 0",
                "event_capacity",
            ));
        }
        Ok(())
    }

    /// One load at a time, in manifest order
    pub fn sequential() -> Self {
        Self {
            policy: ConcurrencyPolicy::Sequential,
            ..Default::default()
        }
    }

    /// Unbounded fan-out inside each stage
    pub fn parallel() -> Self {
        Self {
            policy: ConcurrencyPolicy::Parallel,
            ..Default::default()
        }
    }
}

/// Builder for CoordinatorConfig
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
        }
    }

    pub fn policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    /// Set the default per-resource timeout (`None` waits forever)
    pub fn resource_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.resource_timeout = timeout;
        self
    }

    pub fn on_failed_retry(mut self, retry: RetryPolicy) -> Self {
        self.config.on_failed_retry = retry;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<CoordinatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for CoordinatorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.on_failed_retry, RetryPolicy::Never);
    }

    #[test]
    fn test_presets() {
        assert_eq!(
            CoordinatorConfig::sequential().policy,
            ConcurrencyPolicy::Sequential
        );
        assert_eq!(
            CoordinatorConfig::parallel().policy,
            ConcurrencyPolicy::Parallel
        );
    }

    #[test]
    fn test_validation_errors() {
        let mut config = CoordinatorConfig::default();

        config.policy = ConcurrencyPolicy::BoundedParallel(0);
        assert!(config.validate().is_err());
        config.policy = ConcurrencyPolicy::BoundedParallel(2);

        config.resource_timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());
        config.resource_timeout = None;

        config.event_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = CoordinatorConfig::builder()
            .policy(ConcurrencyPolicy::BoundedParallel(8))
            .resource_timeout(Some(Duration::from_millis(500)))
            .on_failed_retry(RetryPolicy::Once)
            .event_capacity(16)
            .build()
            .unwrap();

        assert_eq!(config.policy, ConcurrencyPolicy::BoundedParallel(8));
        assert_eq!(config.resource_timeout, Some(Duration::from_millis(500)));
        assert_eq!(config.on_failed_retry, RetryPolicy::Once);
        assert_eq!(config.event_capacity, 16);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "sequential".parse::<ConcurrencyPolicy>().unwrap(),
            ConcurrencyPolicy::Sequential
        );
        assert_eq!(
            "bounded:3".parse::<ConcurrencyPolicy>().unwrap(),
            ConcurrencyPolicy::BoundedParallel(3)
        );
        assert!("bounded:x".parse::<ConcurrencyPolicy>().is_err());
        assert_eq!(ConcurrencyPolicy::BoundedParallel(3).to_string(), "bounded:3");
    }

    #[test]
    fn test_retry_policy() {
        assert!(!RetryPolicy::Never.allows_retry(1));
        assert!(RetryPolicy::Once.allows_retry(1));
        assert!(!RetryPolicy::Once.allows_retry(2));
        assert!(RetryPolicy::Unlimited.allows_retry(10));
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"policy":"parallel"}"#).unwrap();
        assert_eq!(config.policy, ConcurrencyPolicy::Parallel);
        assert_eq!(config.event_capacity, 256);
    }
}
