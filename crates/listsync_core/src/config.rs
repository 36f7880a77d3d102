//! Transaction coordinator configuration.

use crate::types::IsolationLevel;
use std::time::Duration;

/// Configuration for a [`TransactionCoordinator`](crate::TransactionCoordinator).
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Time budget for each primary store call.
    pub adapter_timeout: Duration,

    /// Isolation level used by [`begin_default`](crate::TransactionCoordinator::begin_default).
    pub default_isolation: IsolationLevel,

    /// How many finished transactions stay visible to `status` lookups.
    pub history_limit: usize,

    /// Transactions examined per batch by the staleness sweep.
    pub cleanup_batch_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            adapter_timeout: Duration::from_secs(5),
            default_isolation: IsolationLevel::ReadCommitted,
            history_limit: 1024,
            cleanup_batch_size: 64,
        }
    }
}

impl CoordinatorConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-call primary store timeout.
    #[must_use]
    pub const fn with_adapter_timeout(mut self, timeout: Duration) -> Self {
        self.adapter_timeout = timeout;
        self
    }

    /// Sets the default isolation level.
    #[must_use]
    pub const fn with_default_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.default_isolation = isolation;
        self
    }

    /// Sets the finished-transaction history size.
    #[must_use]
    pub const fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Sets the staleness sweep batch size.
    #[must_use]
    pub const fn with_cleanup_batch_size(mut self, size: usize) -> Self {
        self.cleanup_batch_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.adapter_timeout, Duration::from_secs(5));
        assert_eq!(config.default_isolation, IsolationLevel::ReadCommitted);
        assert_eq!(config.history_limit, 1024);
    }

    #[test]
    fn builder_pattern() {
        let config = CoordinatorConfig::new()
            .with_adapter_timeout(Duration::from_millis(250))
            .with_default_isolation(IsolationLevel::Serializable)
            .with_cleanup_batch_size(8);

        assert_eq!(config.adapter_timeout, Duration::from_millis(250));
        assert_eq!(config.default_isolation, IsolationLevel::Serializable);
        assert_eq!(config.cleanup_batch_size, 8);
    }
}
