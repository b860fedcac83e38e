//! Scheduler configuration.

use crate::PinningStrategy;
use crate::error::SchedulerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of fibers in the pool.
pub const DEFAULT_FIBER_COUNT: usize = 256;

/// Default stack size for each fiber (256 KiB).
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Configuration for the fiber scheduler.
///
/// Every field has a default, so partial configurations deserialize cleanly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of fibers in the fixed pool. Must exceed the worker count so that
    /// at least one fiber is free to park into.
    pub fiber_count: usize,
    /// Stack size for each fiber in bytes.
    pub stack_size: usize,
    /// How worker threads are pinned to logical cores.
    pub pinning: PinningStrategy,
    /// How long a worker polls an unmet dependency before parking the fiber.
    pub dependency_timeout: Duration,
    /// Upper bound for one idle sleep. A missed wakeup costs at most this long.
    pub idle_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fiber_count: DEFAULT_FIBER_COUNT,
            stack_size: DEFAULT_STACK_SIZE,
            pinning: PinningStrategy::Linear,
            dependency_timeout: Duration::from_micros(500),
            idle_timeout: Duration::from_millis(2),
        }
    }
}

impl SchedulerConfig {
    pub(crate) fn validate(&self, worker_count: usize) -> Result<(), SchedulerError> {
        if self.fiber_count <= worker_count {
            return Err(SchedulerError::InvalidConfig {
                reason: format!(
                    "fiber_count ({}) must exceed the worker count ({})",
                    self.fiber_count, worker_count
                ),
            });
        }
        if self.stack_size == 0 {
            return Err(SchedulerError::InvalidConfig {
                reason: "stack_size must be non-zero".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.fiber_count, 256);
        assert_eq!(config.stack_size, 256 * 1024);
        assert_eq!(config.pinning, PinningStrategy::Linear);
        assert!(config.dependency_timeout < config.idle_timeout);
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{ "fiber_count": 32, "pinning": "None" }"#).unwrap();
        assert_eq!(config.fiber_count, 32);
        assert_eq!(config.pinning, PinningStrategy::None);
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
    }

    #[test]
    fn test_validate_rejects_small_pool() {
        let config = SchedulerConfig {
            fiber_count: 4,
            ..Default::default()
        };
        assert!(config.validate(4).is_err());
        assert!(config.validate(3).is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_stack() {
        let config = SchedulerConfig {
            stack_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(1),
            Err(SchedulerError::InvalidConfig { .. })
        ));
    }
}
