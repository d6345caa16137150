use std::time::Duration;

use crate::error::{Error, Result};
use crate::pool::PoolConfig;
use crate::stages::ErrorPolicy;

/// Configuration shared by the stages of a [`super::Pipeline`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PipelineConfig {
    /// Capacity of each channel between stages. Zero makes every hand-off a
    /// rendezvous.
    pub channel_capacity: usize,
    /// Capacity of each transform's error channel. Errors that find it full
    /// are dropped.
    pub error_capacity: usize,
    /// Policy used by [`super::Pipeline::transform`]
    pub error_policy: ErrorPolicy,
    /// How long [`super::Pipeline::stop_gracefully`] waits before aborting
    pub stop_grace: Duration,
    /// Settings for pools started by the pipeline
    pub pool: PoolConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 16,
            error_capacity: crate::stages::ERROR_CAPACITY,
            error_policy: ErrorPolicy::FailFast,
            stop_grace: Duration::from_secs(5),
            pool: PoolConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity;
        self
    }

    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.stop_grace.is_zero() {
            return Err(Error::config("stop grace period must be positive"));
        }
        self.pool.validate()
    }
}
