//! Database, cache and retry configuration.
//!
//! Configuration values are plain structs passed at construction; nothing
//! here is global. Every policy constant that is not dictated by behaviour
//! (timeouts, retry counts, cache sizes) lives in one of these structs with
//! a documented default.

use crate::error::{CoreError, CoreResult};
use rand::Rng;
use std::time::Duration;

/// Name of the collection every database has.
pub const DEFAULT_COLLECTION: &str = "_default";

/// Configuration for the per-collection change cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries retained per channel before oldest-first eviction.
    pub channel_cache_max_length: usize,
    /// How long a skipped sequence may stay pending before it is aborted.
    pub skipped_seq_max_wait: Duration,
    /// Maximum number of aborted-sequence markers remembered.
    pub max_aborted_markers: usize,
    /// Whether every entry is also added to the `*` channel.
    pub enable_star_channel: bool,
    /// Interval of the background skipped-sequence sweeper.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            channel_cache_max_length: 500,
            skipped_seq_max_wait: Duration::from_secs(60),
            max_aborted_markers: 10_000,
            enable_star_channel: true,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-channel capacity.
    #[must_use]
    pub const fn with_max_length(mut self, len: usize) -> Self {
        self.channel_cache_max_length = len;
        self
    }

    /// Sets the skipped-sequence abort timeout.
    #[must_use]
    pub const fn with_skipped_max_wait(mut self, wait: Duration) -> Self {
        self.skipped_seq_max_wait = wait;
        self
    }

    /// Enables or disables the `*` channel.
    #[must_use]
    pub const fn with_star_channel(mut self, enabled: bool) -> Self {
        self.enable_star_channel = enabled;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> CoreResult<()> {
        if self.channel_cache_max_length == 0 {
            return Err(CoreError::InvalidConfig(
                "channel_cache_max_length must be positive".into(),
            ));
        }
        if self.max_aborted_markers == 0 {
            return Err(CoreError::InvalidConfig(
                "max_aborted_markers must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for compare-and-swap retry behaviour.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of write attempts.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given attempt budget.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
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

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        let delay_secs = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Configuration for opening a [`crate::Database`].
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database name, used in logs.
    pub name: String,
    /// Collections to open. `_default` is always present.
    pub collections: Vec<String>,
    /// Change cache settings, shared by every collection.
    pub cache: CacheConfig,
    /// CAS retry policy for document writes.
    pub cas_retry: RetryConfig,
    /// Maximum revision depth kept per branch when pruning.
    pub revs_limit: u32,
    /// Whether `put` may create a conflicting branch.
    pub allow_conflicts: bool,
    /// Age after which tombstoned losing branches are pruned.
    pub tombstone_max_age: Option<Duration>,
}

impl DatabaseConfig {
    /// Creates a configuration for a database with only `_default`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collections: vec![DEFAULT_COLLECTION.to_string()],
            cache: CacheConfig::default(),
            cas_retry: RetryConfig::default(),
            revs_limit: 1000,
            allow_conflicts: false,
            tombstone_max_age: None,
        }
    }

    /// Adds a named collection.
    #[must_use]
    pub fn with_collection(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.collections.contains(&name) {
            self.collections.push(name);
        }
        self
    }

    /// Sets the cache configuration.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the CAS retry policy.
    #[must_use]
    pub fn with_cas_retry(mut self, retry: RetryConfig) -> Self {
        self.cas_retry = retry;
        self
    }

    /// Sets the revision depth limit.
    #[must_use]
    pub fn with_revs_limit(mut self, limit: u32) -> Self {
        self.revs_limit = limit;
        self
    }

    /// Allows `put` to create conflicting branches.
    #[must_use]
    pub fn with_allow_conflicts(mut self, allow: bool) -> Self {
        self.allow_conflicts = allow;
        self
    }

    /// Sets the tombstone branch retention.
    #[must_use]
    pub fn with_tombstone_max_age(mut self, age: Duration) -> Self {
        self.tombstone_max_age = Some(age);
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(CoreError::InvalidConfig("database name is empty".into()));
        }
        if self.revs_limit == 0 {
            return Err(CoreError::InvalidConfig("revs_limit must be positive".into()));
        }
        if self.cas_retry.max_attempts == 0 {
            return Err(CoreError::InvalidConfig(
                "cas_retry.max_attempts must be positive".into(),
            ));
        }
        if let Some(bad) = self
            .collections
            .iter()
            .find(|c| c.is_empty() || c.contains(':'))
        {
            return Err(CoreError::InvalidConfig(format!(
                "invalid collection name {bad:?}"
            )));
        }
        self.cache.validate()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new("db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_config_builder() {
        let config = DatabaseConfig::new("travel")
            .with_collection("hotels")
            .with_collection("hotels")
            .with_revs_limit(50)
            .with_allow_conflicts(true);

        assert_eq!(config.collections, vec!["_default", "hotels"]);
        assert_eq!(config.revs_limit, 50);
        assert!(config.allow_conflicts);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(DatabaseConfig::new("").validate().is_err());
        assert!(DatabaseConfig::new("db").with_revs_limit(0).validate().is_err());
        assert!(DatabaseConfig::new("db")
            .with_collection("a:b")
            .validate()
            .is_err());
        assert!(CacheConfig::new().with_max_length(0).validate().is_err());
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5));

        let delay = config.delay_for_attempt(8);
        assert!(delay <= Duration::from_millis(6250)); // 5s + 25% jitter
        assert!(delay >= Duration::from_secs(5));
    }

    #[test]
    fn no_retry_has_single_attempt() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.delay_for_attempt(1), Duration::ZERO);
    }
}
