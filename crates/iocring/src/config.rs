//! iocring configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls on the config value
//! 2. Environment variables (`from_env()`)
//! 3. Library defaults (`new()`)
//!
//! # Example
//!
//! ```rust,ignore
//! use iocring::config::PortConfig;
//!
//! let config = PortConfig::from_env().workers(8);
//! let port = CompletionPort::start(config)?;
//! ```

use iocring_core::env::env_get;
use std::time::Duration;

/// Compiled-in defaults.
pub mod defaults {
    /// io_uring submission queue entries (power of two).
    pub const SQ_ENTRIES: u32 = 256;
    /// Completion worker threads.
    pub const WORKERS: usize = 4;
    /// Upper bound on worker threads.
    pub const MAX_WORKERS: usize = 64;
    /// Idle worker park timeout.
    pub const PARK_TIMEOUT_US: u64 = 500;
    /// CQEs reaped per reactor iteration.
    pub const COMPLETION_BATCH: usize = 256;
    /// Idle operations kept by an operation pool.
    pub const POOL_MAX_IDLE: usize = 1024;
    /// Listen backlog for accept servers.
    pub const BACKLOG: i32 = 256;
}

/// Completion port configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// io_uring SQ size (power of 2)
    pub sq_entries: u32,
    /// Number of completion worker threads
    pub workers: usize,
    /// How long an idle worker parks before re-checking the queue
    pub park_timeout: Duration,
    /// Max completions reaped per reactor loop iteration
    pub completion_batch: usize,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl PortConfig {
    /// Library defaults, no environment lookup.
    pub fn new() -> Self {
        Self {
            sq_entries: defaults::SQ_ENTRIES,
            workers: defaults::WORKERS,
            park_timeout: Duration::from_micros(defaults::PARK_TIMEOUT_US),
            completion_batch: defaults::COMPLETION_BATCH,
        }
    }

    /// Library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `IOCRING_SQ_ENTRIES` - io_uring submission queue size
    /// - `IOCRING_WORKERS` - completion worker threads
    /// - `IOCRING_PARK_TIMEOUT_US` - idle worker park timeout in microseconds
    /// - `IOCRING_COMPLETION_BATCH` - CQEs reaped per iteration
    pub fn from_env() -> Self {
        Self {
            sq_entries: env_get("IOCRING_SQ_ENTRIES", defaults::SQ_ENTRIES),
            workers: env_get("IOCRING_WORKERS", defaults::WORKERS),
            park_timeout: Duration::from_micros(env_get(
                "IOCRING_PARK_TIMEOUT_US",
                defaults::PARK_TIMEOUT_US,
            )),
            completion_batch: env_get("IOCRING_COMPLETION_BATCH", defaults::COMPLETION_BATCH),
        }
    }

    pub fn sq_entries(mut self, n: u32) -> Self {
        self.sq_entries = n;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.min(defaults::MAX_WORKERS);
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn completion_batch(mut self, n: usize) -> Self {
        self.completion_batch = n;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.sq_entries == 0 || !self.sq_entries.is_power_of_two() {
            return Err("sq_entries must be a non-zero power of two");
        }
        if self.workers == 0 {
            return Err("workers must be at least 1");
        }
        if self.workers > defaults::MAX_WORKERS {
            return Err("workers exceeds maximum");
        }
        if self.completion_batch == 0 {
            return Err("completion_batch must be at least 1");
        }
        Ok(())
    }
}

/// Operation pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle operations retained; extra released operations are dropped
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self { max_idle: defaults::POOL_MAX_IDLE }
    }

    /// - `IOCRING_POOL_MAX_IDLE` - idle operations retained
    pub fn from_env() -> Self {
        Self { max_idle: env_get("IOCRING_POOL_MAX_IDLE", defaults::POOL_MAX_IDLE) }
    }

    pub fn max_idle(mut self, n: usize) -> Self {
        self.max_idle = n;
        self
    }
}

/// Accept server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen backlog
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self { backlog: defaults::BACKLOG }
    }

    /// - `IOCRING_BACKLOG` - listen backlog
    pub fn from_env() -> Self {
        Self { backlog: env_get("IOCRING_BACKLOG", defaults::BACKLOG) }
    }

    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.backlog <= 0 {
            return Err("backlog must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(PortConfig::new().validate().is_ok());
        assert!(ServerConfig::new().validate().is_ok());
        assert_eq!(ServerConfig::new().backlog, 256);
    }

    #[test]
    fn test_builder_clamps_workers() {
        let config = PortConfig::new().workers(10_000);
        assert_eq!(config.workers, defaults::MAX_WORKERS);
    }

    #[test]
    fn test_validate_rejects() {
        assert!(PortConfig::new().sq_entries(100).validate().is_err());
        assert!(PortConfig::new().workers(0).validate().is_err());
        assert!(ServerConfig::new().backlog(0).validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("IOCRING_COMPLETION_BATCH", "64");
        let config = PortConfig::from_env();
        assert_eq!(config.completion_batch, 64);
        std::env::remove_var("IOCRING_COMPLETION_BATCH");
    }
}
