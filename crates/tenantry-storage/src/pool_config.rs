//! Connection pool configuration.
//!
//! Limits applied to every tenant pool plus the policy of the pool cache
//! itself (capacity bound and optional idle eviction).

use std::time::Duration;
use tenantry_core::{Result, TenancyError};

/// Default minimum idle connections per tenant pool.
pub const DEFAULT_MIN_CONNECTIONS: u32 = 0;

/// Default maximum concurrent connections per tenant pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 50;

/// Default time to wait for a free connection.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of live tenant pools kept by the cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Minimum cache capacity.
pub const MIN_CACHE_CAPACITY: usize = 1;

/// Maximum cache capacity.
pub const MAX_CACHE_CAPACITY: usize = 100_000;

/// Default interval between idle-eviction sweeps.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Pool limits and cache policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPoolConfig {
    /// Minimum idle connections kept open per tenant pool
    pub min_connections: u32,
    /// Maximum concurrent connections per tenant pool
    pub max_connections: u32,
    /// How long to wait for a connection before failing
    pub acquire_timeout: Duration,
    /// Maximum number of tenant pools held at once (LRU beyond this)
    pub cache_capacity: usize,
    /// Close pools unused for this long. `None` keeps pools for the process lifetime.
    pub idle_timeout: Option<Duration>,
    /// How often the idle reaper sweeps the cache
    pub reap_interval: Duration,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            idle_timeout: None,
            reap_interval: DEFAULT_REAP_INTERVAL,
        }
    }
}

impl ConnectionPoolConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `TENANTRY_POOL_MIN_CONNECTIONS` | 0 |
    /// | `TENANTRY_POOL_MAX_CONNECTIONS` | 50 |
    /// | `TENANTRY_POOL_ACQUIRE_TIMEOUT_SECS` | 30 |
    /// | `TENANTRY_POOL_CACHE_CAPACITY` | 1000 |
    /// | `TENANTRY_POOL_IDLE_EVICT_SECS` | unset (no idle eviction) |
    /// | `TENANTRY_POOL_REAP_INTERVAL_SECS` | 60 |
    pub fn from_env() -> Self {
        let min_connections = std::env::var("TENANTRY_POOL_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MIN_CONNECTIONS);

        let max_connections = std::env::var("TENANTRY_POOL_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let acquire_timeout = std::env::var("TENANTRY_POOL_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT);

        let cache_capacity = std::env::var("TENANTRY_POOL_CACHE_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CACHE_CAPACITY);

        let idle_timeout = std::env::var("TENANTRY_POOL_IDLE_EVICT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let reap_interval = std::env::var("TENANTRY_POOL_REAP_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REAP_INTERVAL);

        Self {
            min_connections,
            max_connections,
            acquire_timeout,
            cache_capacity,
            idle_timeout,
            reap_interval,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(TenancyError::Configuration(
                "max_connections must be at least 1".into(),
            ));
        }

        if self.min_connections > self.max_connections {
            return Err(TenancyError::Configuration(format!(
                "min_connections ({}) cannot exceed max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }

        if !(MIN_CACHE_CAPACITY..=MAX_CACHE_CAPACITY).contains(&self.cache_capacity) {
            return Err(TenancyError::Configuration(format!(
                "cache_capacity must be between {} and {}",
                MIN_CACHE_CAPACITY, MAX_CACHE_CAPACITY
            )));
        }

        Ok(())
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }
}
