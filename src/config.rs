//! Configuration management with serde serialization/deserialization
//!
//! The library never reads the environment; the embedding application builds a
//! [`Config`] (or loads one from JSON) and hands the relevant sections to the
//! queue, the resource pool and the health monitor.

use crate::{CollectorError, HealthThresholds};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for a collection run
///
/// # Examples
///
/// ```rust
/// use legis_collector::Config;
///
/// let config = Config::default();
/// assert_eq!(config.resource_pool.capacity, 40);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Prefetch and dispatch settings for streaming queues
    pub queue: QueueConfig,

    /// Browser-session pool settings
    pub resource_pool: ResourcePoolConfig,

    /// Thresholds used by the health monitor
    pub health: HealthThresholds,
}

impl Config {
    pub fn from_json_str(content: &str) -> Result<Self, CollectorError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.queue.page_size_hint == 0 {
            return Err(CollectorError::Configuration(
                "Page size hint must be greater than 0".to_string(),
            ));
        }

        if self.queue.low_water_mark == Some(0) {
            return Err(CollectorError::Configuration(
                "Low-water-mark must be greater than 0".to_string(),
            ));
        }

        if self.queue.worker_pool_size == 0 {
            return Err(CollectorError::Configuration(
                "Worker pool size must be greater than 0".to_string(),
            ));
        }

        if self.queue.dispatch_queue_capacity == 0 {
            return Err(CollectorError::Configuration(
                "Dispatch queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.resource_pool.capacity == 0 {
            return Err(CollectorError::Configuration(
                "Resource pool capacity must be greater than 0".to_string(),
            ));
        }

        if self.health.check_interval.is_zero() {
            return Err(CollectorError::Configuration(
                "Health check interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Settings for a [`StreamingQueue`](crate::StreamingQueue) and its worker pools
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Expected number of items per page (default: 20)
    ///
    /// Also the default low-water-mark.
    pub page_size_hint: usize,

    /// Buffer occupancy below which the next page is requested (default: page size hint)
    pub low_water_mark: Option<usize>,

    /// Number of workers running item handlers (default: number of CPUs)
    pub worker_pool_size: usize,

    /// Run page fetches on the handler pool instead of a dedicated fetch worker (default: false)
    ///
    /// When enabled, one pool of `worker_pool_size` workers carries both the
    /// single in-flight fetch and the handlers, so handlers get `worker_pool_size - 1`
    /// workers in the worst case.
    pub share_worker_pool: bool,

    /// Jobs that may wait in a worker pool's channel before submission awaits (default: 1000)
    pub dispatch_queue_capacity: usize,
}

impl QueueConfig {
    pub fn effective_low_water_mark(&self) -> usize {
        self.low_water_mark.unwrap_or(self.page_size_hint)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            page_size_hint: 20,
            low_water_mark: None,
            worker_pool_size: num_cpus::get().max(1),
            share_worker_pool: false,
            dispatch_queue_capacity: 1000,
        }
    }
}

/// Settings for the [`ResourcePool`](crate::ResourcePool) of browser sessions
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourcePoolConfig {
    /// Maximum number of live resources (default: 40)
    ///
    /// Each resource is typically a browser process, so this bounds the
    /// number of processes the host has to carry.
    pub capacity: usize,

    /// How long `close` waits for leases still on loan (default: 10 seconds)
    pub close_grace_period: Duration,
}

impl Default for ResourcePoolConfig {
    fn default() -> Self {
        Self {
            capacity: 40,
            close_grace_period: Duration::from_secs(10),
        }
    }
}
