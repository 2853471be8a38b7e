//! # Engine Configuration
//!
//! Tunables for the catalog sync engine, built with a fail-fast builder.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::SyncEngineConfig;
//! use std::time::Duration;
//!
//! let config = SyncEngineConfig::builder()
//!     .database_url("sqlite:///var/lib/catalog-sync/engine.db")
//!     .lock_lease(Duration::from_secs(600))
//!     .worker_concurrency(8)
//!     .build()
//!     .expect("Failed to build config");
//! ```
//!
//! ## Error Handling
//!
//! The builder validates every value and returns [`Error::Config`] with an
//! actionable message:
//!
//! ```should_panic
//! use core_runtime::config::SyncEngineConfig;
//!
//! let config = SyncEngineConfig::builder()
//!     .build()
//!     .expect("Should fail - missing database url");
//! ```

use crate::error::{Error, Result};
use std::time::Duration;

/// Default lease of a source lock.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(5 * 60);
/// Default base delay between blocking lock attempts.
pub const DEFAULT_LOCK_RETRY_DELAY: Duration = Duration::from_millis(200);
/// Default lifetime of a per-run remote set.
pub const DEFAULT_REMOTE_SET_TTL: Duration = Duration::from_secs(12 * 60 * 60);
/// Default retry ceiling for transient failures.
pub const DEFAULT_MAX_RETRIES: u32 = 4;
/// Default feed page size.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Configuration of the sync engine.
///
/// Use [`SyncEngineConfigBuilder`] to construct instances.
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// sqlx connection URL of the database holding watermarks and the task queue
    pub database_url: String,

    /// Lease of a source lock; a crashed holder loses the lock after this long
    pub lock_lease: Duration,

    /// How often a held lock renews its lease
    pub lock_heartbeat: Duration,

    /// Base delay between attempts of a blocking lock acquisition
    pub lock_retry_delay: Duration,

    /// Lifetime of per-run remote sets, refreshed on every write
    pub remote_set_ttl: Duration,

    /// Retry ceiling for transient failures
    pub max_retries: u32,

    /// Backoff base; attempt `n` waits `retry_base_delay * 2^n`
    pub retry_base_delay: Duration,

    /// Delay between consecutive sources when fanning out a provider
    pub source_stagger: Duration,

    /// Queue poll interval of an idle worker
    pub poll_interval: Duration,

    /// Units of work a worker runs at once
    pub worker_concurrency: usize,

    /// Page size requested from catalog feeds
    pub page_size: u32,

    /// Processing tasks untouched for this long are handed back to the queue
    pub stale_task_after: Duration,
}

impl SyncEngineConfig {
    /// Creates a new builder.
    pub fn builder() -> SyncEngineConfigBuilder {
        SyncEngineConfigBuilder::default()
    }

    /// Backoff before retry number `attempt` (zero based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.retry_base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a value would make the engine unsafe or
    /// unable to make progress.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::Config("Database URL cannot be empty".to_string()));
        }

        if self.lock_lease.is_zero() {
            return Err(Error::Config(
                "Lock lease must be greater than zero".to_string(),
            ));
        }

        if self.lock_heartbeat.is_zero() || self.lock_heartbeat >= self.lock_lease {
            return Err(Error::Config(format!(
                "Lock heartbeat ({:?}) must be non-zero and shorter than the lease ({:?})",
                self.lock_heartbeat, self.lock_lease
            )));
        }

        if self.remote_set_ttl.is_zero() {
            return Err(Error::Config(
                "Remote set TTL must be greater than zero".to_string(),
            ));
        }

        if self.worker_concurrency == 0 {
            return Err(Error::Config(
                "Worker concurrency must be at least 1".to_string(),
            ));
        }

        if self.page_size == 0 {
            return Err(Error::Config("Page size must be at least 1".to_string()));
        }

        if self.poll_interval.is_zero() {
            return Err(Error::Config(
                "Poll interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for [`SyncEngineConfig`].
#[derive(Debug, Default)]
pub struct SyncEngineConfigBuilder {
    database_url: Option<String>,
    lock_lease: Option<Duration>,
    lock_heartbeat: Option<Duration>,
    lock_retry_delay: Option<Duration>,
    remote_set_ttl: Option<Duration>,
    max_retries: Option<u32>,
    retry_base_delay: Option<Duration>,
    source_stagger: Option<Duration>,
    poll_interval: Option<Duration>,
    worker_concurrency: Option<usize>,
    page_size: Option<u32>,
    stale_task_after: Option<Duration>,
}

impl SyncEngineConfigBuilder {
    /// Sets the sqlx database URL (e.g. `sqlite:///path/engine.db`).
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Sets the lock lease. The heartbeat defaults to a third of it.
    pub fn lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = Some(lease);
        self
    }

    pub fn lock_heartbeat(mut self, interval: Duration) -> Self {
        self.lock_heartbeat = Some(interval);
        self
    }

    pub fn lock_retry_delay(mut self, delay: Duration) -> Self {
        self.lock_retry_delay = Some(delay);
        self
    }

    pub fn remote_set_ttl(mut self, ttl: Duration) -> Self {
        self.remote_set_ttl = Some(ttl);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = Some(delay);
        self
    }

    pub fn source_stagger(mut self, stagger: Duration) -> Self {
        self.source_stagger = Some(stagger);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn worker_concurrency(mut self, concurrency: usize) -> Self {
        self.worker_concurrency = Some(concurrency);
        self
    }

    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn stale_task_after(mut self, after: Duration) -> Self {
        self.stale_task_after = Some(after);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the database URL is missing or any value fails
    /// [`SyncEngineConfig::validate`].
    pub fn build(self) -> Result<SyncEngineConfig> {
        let database_url = self.database_url.ok_or_else(|| {
            Error::Config("Database URL is required. Use .database_url() to set it.".to_string())
        })?;

        let lock_lease = self.lock_lease.unwrap_or(DEFAULT_LOCK_LEASE);

        let config = SyncEngineConfig {
            database_url,
            lock_lease,
            lock_heartbeat: self.lock_heartbeat.unwrap_or(lock_lease / 3),
            lock_retry_delay: self.lock_retry_delay.unwrap_or(DEFAULT_LOCK_RETRY_DELAY),
            remote_set_ttl: self.remote_set_ttl.unwrap_or(DEFAULT_REMOTE_SET_TTL),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_base_delay: self.retry_base_delay.unwrap_or(Duration::from_secs(1)),
            source_stagger: self.source_stagger.unwrap_or(Duration::from_secs(5)),
            poll_interval: self.poll_interval.unwrap_or(Duration::from_millis(500)),
            worker_concurrency: self.worker_concurrency.unwrap_or(4),
            page_size: self.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            stale_task_after: self
                .stale_task_after
                .unwrap_or(Duration::from_secs(30 * 60)),
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = SyncEngineConfig::builder()
            .database_url("sqlite::memory:")
            .build()
            .unwrap();

        assert_eq!(config.lock_lease, Duration::from_secs(300));
        assert_eq!(config.lock_heartbeat, Duration::from_secs(100));
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.page_size, 100);
        assert_eq!(config.source_stagger, Duration::from_secs(5));
    }

    #[test]
    fn test_builder_requires_database_url() {
        let result = SyncEngineConfig::builder().build();

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Database URL is required"));
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_lease() {
        let result = SyncEngineConfig::builder()
            .database_url("sqlite::memory:")
            .lock_lease(Duration::from_secs(10))
            .lock_heartbeat(Duration::from_secs(10))
            .build();

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = SyncEngineConfig::builder()
            .database_url("sqlite::memory:")
            .worker_concurrency(0)
            .build();

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Worker concurrency"));
    }

    #[test]
    fn test_retry_delay_is_exponential() {
        let config = SyncEngineConfig::builder()
            .database_url("sqlite::memory:")
            .retry_base_delay(Duration::from_millis(250))
            .build()
            .unwrap();

        assert_eq!(config.retry_delay(0), Duration::from_millis(250));
        assert_eq!(config.retry_delay(1), Duration::from_millis(500));
        assert_eq!(config.retry_delay(3), Duration::from_secs(2));
    }
}
