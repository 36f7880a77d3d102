//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use rand::Rng;
use std::time::Duration;

/// Configuration for the queue, workers and auditor.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Entity types mirrored into the index and covered by audits.
    pub entity_types: Vec<String>,
    /// Number of concurrent sync workers.
    pub worker_count: usize,
    /// Retry configuration for failed index writes.
    pub retry: RetryConfig,
    /// Time budget for each search index call.
    pub index_timeout: Duration,
    /// Time budget for each primary store call made by the auditor.
    pub primary_timeout: Duration,
    /// Maximum number of waiting tasks before enqueue fails.
    pub max_queue_len: usize,
    /// Dead-lettered tasks kept for inspection.
    pub dead_letter_limit: usize,
    /// Ids compared per batch between cancellation checks.
    pub audit_batch_size: usize,
    /// Interval for scheduled audits. None disables scheduling.
    pub audit_interval: Option<Duration>,
    /// Whether scheduled audits enqueue repairs for the drift they find.
    pub auto_repair: bool,
}

impl EngineConfig {
    /// Creates a configuration covering the given entity types.
    pub fn new<I, S>(entity_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entity_types: entity_types.into_iter().map(Into::into).collect(),
            worker_count: 4,
            retry: RetryConfig::default(),
            index_timeout: Duration::from_secs(5),
            primary_timeout: Duration::from_secs(5),
            max_queue_len: 100_000,
            dead_letter_limit: 10_000,
            audit_batch_size: 1_000,
            audit_interval: None,
            auto_repair: false,
        }
    }

    /// Sets the worker count.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the search index call timeout.
    pub fn with_index_timeout(mut self, timeout: Duration) -> Self {
        self.index_timeout = timeout;
        self
    }

    /// Sets the primary store call timeout.
    pub fn with_primary_timeout(mut self, timeout: Duration) -> Self {
        self.primary_timeout = timeout;
        self
    }

    /// Sets the queue capacity.
    pub fn with_max_queue_len(mut self, len: usize) -> Self {
        self.max_queue_len = len;
        self
    }

    /// Sets how many dead letters are retained.
    pub fn with_dead_letter_limit(mut self, limit: usize) -> Self {
        self.dead_letter_limit = limit;
        self
    }

    /// Sets the audit batch size.
    pub fn with_audit_batch_size(mut self, size: usize) -> Self {
        self.audit_batch_size = size;
        self
    }

    /// Enables scheduled audits.
    pub fn with_audit_interval(mut self, interval: Duration, auto_repair: bool) -> Self {
        self.audit_interval = Some(interval);
        self.auto_repair = auto_repair;
        self
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.entity_types.is_empty() {
            return Err(SyncError::InvalidConfig("no entity types configured".into()));
        }
        if self.worker_count == 0 {
            return Err(SyncError::InvalidConfig("worker_count must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::InvalidConfig("max_attempts must be at least 1".into()));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(SyncError::InvalidConfig(format!(
                "backoff_multiplier must be a finite value of at least 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        if self.max_queue_len == 0 {
            return Err(SyncError::InvalidConfig("max_queue_len must be at least 1".into()));
        }
        if self.audit_batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "audit_batch_size must be at least 1".into(),
            ));
        }
        if self.audit_interval == Some(Duration::ZERO) {
            return Err(SyncError::InvalidConfig("audit_interval must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(["listing"])
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before a task is dead-lettered.
    pub max_attempts: u32,
    /// Base delay.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Creates a configuration that retries immediately.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::no_retry()
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Delay before retrying a task that has failed `attempt` times.
    ///
    /// `initial_delay * multiplier^attempt` plus optional jitter, capped at
    /// `max_delay`. A multiplier that yields a negative or NaN delay falls
    /// back to zero.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();

        let mut delay_secs = if base_delay.is_nan() {
            0.0
        } else {
            base_delay.clamp(0.0, max_secs)
        };
        if self.add_jitter && delay_secs > 0.0 {
            delay_secs += delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
        }

        Duration::try_from_secs_f64(delay_secs.min(max_secs)).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_builder() {
        let config = EngineConfig::new(["listing", "user"])
            .with_worker_count(2)
            .with_index_timeout(Duration::from_millis(500))
            .with_audit_interval(Duration::from_secs(60), true);

        assert_eq!(config.entity_types, vec!["listing", "user"]);
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.index_timeout, Duration::from_millis(500));
        assert_eq!(config.audit_interval, Some(Duration::from_secs(60)));
        assert!(config.auto_repair);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn engine_config_rejects_bad_values() {
        assert!(EngineConfig::new(Vec::<String>::new()).validate().is_err());
        assert!(EngineConfig::default().with_worker_count(0).validate().is_err());
        assert!(EngineConfig::default()
            .with_retry(RetryConfig::new(0))
            .validate()
            .is_err());
        assert!(EngineConfig::default()
            .with_audit_interval(Duration::ZERO, false)
            .validate()
            .is_err());
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn retry_delay_jitter_bounds() {
        let config = RetryConfig::new(5).with_initial_delay(Duration::from_millis(100));

        let delay = config.delay_for_attempt(1);
        assert!(delay >= Duration::from_millis(200));
        assert!(delay <= Duration::from_millis(250));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        for attempt in 0..10 {
            assert!(config.delay_for_attempt(attempt) <= Duration::from_secs(5));
        }
        assert_eq!(config.with_jitter(false).delay_for_attempt(5), Duration::from_secs(5));
    }

    #[test]
    fn engine_config_rejects_unusable_backoff() {
        for multiplier in [-2.0, 0.5, f64::NAN, f64::INFINITY] {
            let config = EngineConfig::default()
                .with_retry(RetryConfig::new(5).with_backoff_multiplier(multiplier));
            assert!(
                matches!(config.validate(), Err(SyncError::InvalidConfig(_))),
                "multiplier {multiplier} accepted"
            );
        }
    }

    #[test]
    fn retry_delay_never_negative() {
        for multiplier in [-2.0, f64::NAN, f64::NEG_INFINITY] {
            let config = RetryConfig::new(5)
                .with_initial_delay(Duration::from_millis(100))
                .with_backoff_multiplier(multiplier);
            for attempt in 0..5 {
                assert!(config.delay_for_attempt(attempt) <= config.max_delay);
            }
        }
    }
}
