//! Pool configuration options

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::errors::{PoolError, PoolResult};

/// Default number of times an acquire restarts after a creation failure or
/// a rejected `before_use` hook.
pub const DEFAULT_ACQUIRE_RETRIES: usize = 3;

/// Configuration for resource pool sizing and timing
///
/// # Examples
///
/// ```
/// use respool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_min_size(2)
///     .with_max_size(16)
///     .with_acquire_timeout(Duration::from_secs(3))
///     .with_max_idle_time(Duration::from_secs(60));
///
/// assert_eq!(config.max_size, 16);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfiguration {
    /// Population the maintenance cycle keeps alive
    pub min_size: usize,

    /// Hard cap on objects tracked by the pool (queued + checked out)
    pub max_size: usize,

    /// Default wait for an object when the call does not override it
    pub acquire_timeout: Duration,

    /// Idle age past which a queued object is evicted
    pub max_idle_time: Duration,

    /// Period between automatic maintenance runs, zero disables them
    pub maintenance_interval: Duration,

    /// Default retry budget for acquire
    pub acquire_retries: usize,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            min_size: 5,
            max_size: 20,
            acquire_timeout: Duration::from_secs(3),
            max_idle_time: Duration::from_secs(15),
            maintenance_interval: Duration::from_secs(30),
            acquire_retries: DEFAULT_ACQUIRE_RETRIES,
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum pool population
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set the maximum pool size
    ///
    /// # Examples
    ///
    /// ```
    /// use respool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::new()
    ///     .with_max_size(50);
    ///
    /// assert_eq!(config.max_size, 50);
    /// ```
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set the default acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the idle eviction threshold
    pub fn with_max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = idle;
        self
    }

    /// Set the maintenance period, `Duration::ZERO` turns the timer off
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Disable the background maintenance timer
    pub fn without_maintenance(self) -> Self {
        self.with_maintenance_interval(Duration::ZERO)
    }

    /// Set the default acquire retry budget
    pub fn with_acquire_retries(mut self, retries: usize) -> Self {
        self.acquire_retries = retries;
        self
    }

    /// Check the sizing invariant `min_size < max_size`
    ///
    /// # Examples
    ///
    /// ```
    /// use respool::{PoolConfiguration, PoolError};
    ///
    /// let config = PoolConfiguration::new().with_min_size(4).with_max_size(4);
    ///
    /// assert!(matches!(
    ///     config.validate(),
    ///     Err(PoolError::InvalidConfiguration { min_size: 4, max_size: 4 })
    /// ));
    /// ```
    pub fn validate(&self) -> PoolResult<()> {
        if self.min_size >= self.max_size {
            return Err(PoolError::InvalidConfiguration {
                min_size: self.min_size,
                max_size: self.max_size,
            });
        }
        Ok(())
    }

    /// Whether the background maintenance timer should run
    pub fn maintenance_enabled(&self) -> bool {
        !self.maintenance_interval.is_zero()
    }
}
