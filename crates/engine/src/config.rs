//! Engine configuration.
//!
//! Every field has a default, so a TOML file only needs the keys it changes.
//! Durations are integer milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What `enqueue` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait up to `enqueue_timeout_ms`, then fail with a queue timeout.
    #[default]
    Block,
    /// Fail immediately.
    Reject,
}

/// How many pooled units to borrow and return on start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialisationPolicy {
    #[default]
    None,
    One,
    All,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: WorkerPoolConfig,
    pub correlator: CorrelatorConfig,
    pub store: ReplyStoreConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = courier_core::parse_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = courier_core::load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.pool.queue_capacity == 0, "pool.queue_capacity must be > 0"),
            (self.pool.concurrency == 0, "pool.concurrency must be > 0"),
            (self.pool.max_active_units == 0, "pool.max_active_units must be > 0"),
            (self.pool.poll_timeout_ms == 0, "pool.poll_timeout_ms must be > 0"),
            (
                self.correlator.marker_capacity == 0,
                "correlator.marker_capacity must be > 0",
            ),
            (
                self.correlator.monitor_interval_ms == 0,
                "correlator.monitor_interval_ms must be > 0",
            ),
            (self.correlator.lock_stripes == 0, "correlator.lock_stripes must be > 0"),
            (self.store.max_capacity == 0, "store.max_capacity must be > 0"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(courier_core::Error::invalid_config(*reason).into()),
            None => Ok(()),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Bounded queue capacity.
    pub queue_capacity: usize,
    /// Number of worker tasks.
    pub concurrency: usize,
    /// How long a worker waits on an empty queue before re-checking state.
    pub poll_timeout_ms: u64,
    /// How long a blocking enqueue waits for space.
    pub enqueue_timeout_ms: u64,
    pub overflow: OverflowPolicy,
    /// How long a worker waits for a pooled unit.
    pub borrow_timeout_ms: u64,
    /// Pool size in pooled mode.
    pub max_active_units: usize,
    pub initialisation: InitialisationPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            concurrency: 4,
            poll_timeout_ms: 100,
            enqueue_timeout_ms: 1000,
            overflow: OverflowPolicy::Block,
            borrow_timeout_ms: 1000,
            max_active_units: 8,
            initialisation: InitialisationPolicy::None,
        }
    }
}

impl WorkerPoolConfig {
    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    #[must_use]
    pub const fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    #[must_use]
    pub const fn borrow_timeout(&self) -> Duration {
        Duration::from_millis(self.borrow_timeout_ms)
    }
}

/// Reply correlation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Reply timeout per dispatch; `0` waits indefinitely.
    pub reply_timeout_ms: u64,
    /// Extra wait after the timeout before declaring it.
    pub grace_period_ms: u64,
    /// Return `ResponseTimeout` instead of no reply.
    pub fail_on_timeout: bool,
    pub monitor_interval_ms: u64,
    /// Processed marker ring capacity.
    pub marker_capacity: usize,
    /// Marker expiry; `0` keeps markers until evicted by capacity.
    pub marker_ttl_ms: u64,
    /// Age after which an unclaimed reply group is dropped as missed.
    pub orphan_ttl_ms: u64,
    pub lock_stripes: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 5000,
            grace_period_ms: 1000,
            fail_on_timeout: true,
            monitor_interval_ms: 100,
            marker_capacity: 50_000,
            marker_ttl_ms: 0,
            orphan_ttl_ms: 60_000,
            lock_stripes: 16,
        }
    }
}

impl CorrelatorConfig {
    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reply_timeout_ms = timeout.map_or(0, duration_ms);
        self
    }

    #[must_use]
    pub fn with_fail_on_timeout(mut self, fail: bool) -> Self {
        self.fail_on_timeout = fail;
        self
    }

    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = duration_ms(grace);
        self
    }

    #[must_use]
    pub fn with_marker_capacity(mut self, capacity: usize) -> Self {
        self.marker_capacity = capacity;
        self
    }

    #[must_use]
    pub const fn reply_timeout(&self) -> Option<Duration> {
        match self.reply_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    #[must_use]
    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    #[must_use]
    pub const fn marker_ttl(&self) -> Option<Duration> {
        match self.marker_ttl_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    #[must_use]
    pub const fn orphan_ttl(&self) -> Duration {
        Duration::from_millis(self.orphan_ttl_ms)
    }
}

/// Pending reply store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyStoreConfig {
    pub max_capacity: u64,
    /// Entry time-to-live; `0` disables expiry.
    pub ttl_ms: u64,
}

impl Default for ReplyStoreConfig {
    fn default() -> Self {
        Self {
            max_capacity: 100_000,
            ttl_ms: 300_000, // 5 minutes
        }
    }
}

impl ReplyStoreConfig {
    #[must_use]
    pub const fn ttl(&self) -> Option<Duration> {
        match self.ttl_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::error::Error;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.pool.queue_capacity, 1024);
        assert_eq!(config.pool.concurrency, 4);
        assert_eq!(config.correlator.grace_period(), Duration::from_millis(1000));
        assert_eq!(config.correlator.marker_capacity, 50_000);
        assert_eq!(config.correlator.marker_ttl(), None);
        assert_eq!(config.store.ttl(), Some(Duration::from_secs(300)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [pool]
            concurrency = 2
            overflow = "reject"

            [correlator]
            reply_timeout_ms = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.concurrency, 2);
        assert_eq!(config.pool.overflow, OverflowPolicy::Reject);
        assert_eq!(config.pool.queue_capacity, 1024);
        assert_eq!(config.correlator.reply_timeout(), None);
        assert!(config.correlator.fail_on_timeout);
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let result = EngineConfig::from_toml_str("[pool]\nconcurrency = 0\n");
        assert!(matches!(
            result,
            Err(Error::Core(courier_core::Error::InvalidConfig { .. }))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.toml");
        std::fs::write(&path, "[store]\nmax_capacity = 10\nttl_ms = 0\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.store.max_capacity, 10);
        assert_eq!(config.store.ttl(), None);
    }

    #[test]
    fn test_reply_timeout_builder() {
        let config = CorrelatorConfig::default()
            .with_reply_timeout(Some(Duration::from_millis(500)))
            .with_fail_on_timeout(false);
        assert_eq!(config.reply_timeout(), Some(Duration::from_millis(500)));
        assert!(!config.fail_on_timeout);
    }
}
