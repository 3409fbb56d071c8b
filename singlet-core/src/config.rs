//! Ambient configuration for the mutation pipeline and batch/cache
//! context. No file or environment loading lives here; these are
//! plain builder-style structs the caller constructs and passes in.

use std::time::Duration;

/// Retry policy for transient backend errors: up to
/// three attempts, exponential backoff capped at 100/200/400ms.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Backoff for the k-th retry (0-indexed): `initial_backoff * 2^k`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.initial_backoff * 2u32.saturating_pow(attempt)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// Batch/cache context configuration: the default coalescing
/// delay, the hard per-batch timeout, and the bulk-read chunk size.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub default_batch_delay: Duration,
    pub hard_timeout: Duration,
    pub max_batch_size: usize,
    pub retry: RetryConfig,
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_batch_delay(mut self, delay: Duration) -> Self {
        self.default_batch_delay = delay;
        self
    }

    pub fn with_hard_timeout(mut self, timeout: Duration) -> Self {
        self.hard_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_batch_delay: Duration::from_millis(10),
            hard_timeout: Duration::from_secs(10),
            max_batch_size: 100,
            retry: RetryConfig::default(),
        }
    }
}

/// Top-level configuration for one tenant's runtime. ALL values have a
/// sensible default; none are loaded from a file or environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub default_query_limit: u32,
    pub batch: BatchConfig,
    /// Whether an ambient tenant id is required for all operations. When
    /// true and no tenant id is in scope, entry points fail with
    /// `ConfigurationError::TenancyRequired`.
    pub tenancy_required: bool,
}

impl ModelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_query_limit(mut self, limit: u32) -> Self {
        self.default_query_limit = limit;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_tenancy_required(mut self, required: bool) -> Self {
        self.tenancy_required = required;
        self
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default_query_limit: 100,
            batch: BatchConfig::default(),
            tenancy_required: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_doubles_per_attempt() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.backoff_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn builder_overrides_apply() {
        let config = ModelConfig::new()
            .with_default_query_limit(25)
            .with_tenancy_required(true);
        assert_eq!(config.default_query_limit, 25);
        assert!(config.tenancy_required);
    }
}
