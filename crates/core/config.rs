//! Configuration types for the job queue.

use chrono::TimeDelta;
use std::time::Duration;

use crate::backoff::{BackoffPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::error::{JobrowError, Result};
use crate::strategy::StrategyKind;

/// Default age after which a lock is considered abandoned.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Default queue name.
pub const DEFAULT_QUEUE: &str = "default";

/// Default number of selections the optimistic strategy attempts per claim.
pub const DEFAULT_OPTIMISTIC_RETRIES: u32 = 5;

/// Configuration shared by the reservation engine, lifecycle and client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Failures after which a job is marked as failed.
    pub max_attempts: u32,
    /// Lock age after which another worker may reclaim a job.
    pub lock_timeout: Duration,
    /// Queue used when an enqueued job names none.
    pub default_queue: String,
    /// Force a claim strategy instead of selecting one from store capabilities.
    pub strategy: Option<StrategyKind>,
    /// Bound on selection retries for the optimistic strategy.
    pub optimistic_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            default_queue: DEFAULT_QUEUE.to_string(),
            strategy: None,
            optimistic_max_retries: DEFAULT_OPTIMISTIC_RETRIES,
        }
    }
}

impl QueueConfig {
    /// Create a new builder.
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::new()
    }

    /// Load configuration from `JOBROW_*` environment variables.
    ///
    /// Unset variables keep their defaults; set but unparsable ones are errors.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup("JOBROW_MAX_ATTEMPTS") {
            config.max_attempts = parse_env("JOBROW_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("JOBROW_LOCK_TIMEOUT_SECS") {
            config.lock_timeout =
                Duration::from_secs(parse_env("JOBROW_LOCK_TIMEOUT_SECS", &value)?);
        }
        if let Some(value) = lookup("JOBROW_DEFAULT_QUEUE") {
            config.default_queue = value;
        }
        if let Some(value) = lookup("JOBROW_STRATEGY") {
            config.strategy = Some(parse_env("JOBROW_STRATEGY", &value)?);
        }
        if let Some(value) = lookup("JOBROW_OPTIMISTIC_RETRIES") {
            config.optimistic_max_retries = parse_env("JOBROW_OPTIMISTIC_RETRIES", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the queue cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(JobrowError::Config(
                "max_attempts must be positive".to_string(),
            ));
        }
        if self.lock_timeout.is_zero() {
            return Err(JobrowError::Config(
                "lock_timeout must be positive".to_string(),
            ));
        }
        if self.default_queue.is_empty() {
            return Err(JobrowError::Config(
                "default_queue must not be empty".to_string(),
            ));
        }
        if self.optimistic_max_retries == 0 {
            return Err(JobrowError::Config(
                "optimistic_max_retries must be positive".to_string(),
            ));
        }
        self.lock_timeout_delta()?;
        Ok(())
    }

    /// The lock timeout as a signed delta for timestamp arithmetic.
    pub fn lock_timeout_delta(&self) -> Result<TimeDelta> {
        TimeDelta::from_std(self.lock_timeout)
            .map_err(|e| JobrowError::Config(format!("lock_timeout out of range: {}", e)))
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.max_attempts)
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| JobrowError::Config(format!("invalid {}={:?}: {}", key, value, e)))
}

/// Builder for QueueConfig.
#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of attempts.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.max_attempts = max_attempts;
        self
    }

    /// Set the lock timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    /// Set the default queue.
    pub fn default_queue(mut self, queue: impl Into<String>) -> Self {
        self.config.default_queue = queue.into();
        self
    }

    /// Force a claim strategy.
    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.config.strategy = Some(strategy);
        self
    }

    /// Set the optimistic strategy's retry bound.
    pub fn optimistic_max_retries(mut self, retries: u32) -> Self {
        self.config.optimistic_max_retries = retries;
        self
    }

    /// Validate and build the QueueConfig.
    pub fn build(self) -> Result<QueueConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_attempts, 25);
        assert_eq!(config.lock_timeout, Duration::from_secs(3600));
        assert_eq!(config.default_queue, "default");
        assert!(config.strategy.is_none());
        assert_eq!(config.optimistic_max_retries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = QueueConfig::builder()
            .max_attempts(3)
            .lock_timeout(Duration::from_secs(30))
            .default_queue("mail")
            .strategy(StrategyKind::RowLock)
            .optimistic_max_retries(9)
            .build()
            .unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.default_queue, "mail");
        assert_eq!(config.strategy, Some(StrategyKind::RowLock));
        assert_eq!(config.optimistic_max_retries, 9);
        assert_eq!(config.backoff().max_attempts(), 3);
    }

    #[test]
    fn test_builder_rejects_invalid() {
        assert!(QueueConfig::builder().max_attempts(0).build().is_err());
        assert!(QueueConfig::builder()
            .lock_timeout(Duration::ZERO)
            .build()
            .is_err());
        assert!(QueueConfig::builder().default_queue("").build().is_err());
        assert!(QueueConfig::builder()
            .optimistic_max_retries(0)
            .build()
            .is_err());
    }

    #[test]
    fn test_lock_timeout_delta() {
        let config = QueueConfig::default();
        assert_eq!(config.lock_timeout_delta().unwrap(), TimeDelta::minutes(60));
    }

    #[test]
    fn test_from_lookup_empty_is_default() {
        let config = QueueConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, QueueConfig::default());
    }

    #[test]
    fn test_from_lookup_reads_all_keys() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("JOBROW_MAX_ATTEMPTS", "7"),
            ("JOBROW_LOCK_TIMEOUT_SECS", " 120 "),
            ("JOBROW_DEFAULT_QUEUE", "reports"),
            ("JOBROW_STRATEGY", "optimistic"),
            ("JOBROW_OPTIMISTIC_RETRIES", "2"),
        ]))
        .unwrap();
        assert_eq!(config.max_attempts, 7);
        assert_eq!(config.lock_timeout, Duration::from_secs(120));
        assert_eq!(config.default_queue, "reports");
        assert_eq!(config.strategy, Some(StrategyKind::Optimistic));
        assert_eq!(config.optimistic_max_retries, 2);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = QueueConfig::from_lookup(lookup(&[("JOBROW_MAX_ATTEMPTS", "lots")])).unwrap_err();
        assert!(matches!(err, JobrowError::Config(_)));
        assert!(err.to_string().contains("JOBROW_MAX_ATTEMPTS"));

        assert!(QueueConfig::from_lookup(lookup(&[("JOBROW_STRATEGY", "magic")])).is_err());
        assert!(QueueConfig::from_lookup(lookup(&[("JOBROW_MAX_ATTEMPTS", "0")])).is_err());
    }
}
