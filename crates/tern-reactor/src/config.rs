//! Reactor configuration.

use crate::error::{ReactorError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reactor-wide tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactorConfig {
    /// Worker poll cadence in milliseconds
    #[serde(default = "default_worker_tick_ms")]
    pub worker_tick_ms: u64,

    /// Inbound frames processed per channel per worker tick
    #[serde(default = "default_max_reads_per_tick")]
    pub max_reads_per_tick: usize,

    /// Send buffers retained for reuse
    #[serde(default = "default_buffer_pool_capacity")]
    pub buffer_pool_capacity: usize,

    /// Largest buffer `get_buffer` will hand out
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_worker_tick_ms() -> u64 {
    5
}

fn default_max_reads_per_tick() -> usize {
    64
}

fn default_buffer_pool_capacity() -> usize {
    64
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            worker_tick_ms: default_worker_tick_ms(),
            max_reads_per_tick: default_max_reads_per_tick(),
            buffer_pool_capacity: default_buffer_pool_capacity(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl ReactorConfig {
    /// Parse from TOML, filling missing fields with defaults
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the document does not parse or a value
    /// is out of range.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| ReactorError::invalid(format!("reactor config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.worker_tick_ms == 0 {
            return Err(ReactorError::invalid("worker_tick_ms must be positive"));
        }
        if self.max_reads_per_tick == 0 {
            return Err(ReactorError::invalid("max_reads_per_tick must be positive"));
        }
        if self.max_message_size == 0 {
            return Err(ReactorError::invalid("max_message_size must be positive"));
        }
        Ok(())
    }

    /// Worker poll cadence
    #[must_use]
    pub fn worker_tick(&self) -> Duration {
        Duration::from_millis(self.worker_tick_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReactorConfig::default();
        assert_eq!(config.worker_tick(), Duration::from_millis(5));
        assert_eq!(config.max_reads_per_tick, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = ReactorConfig::from_toml_str("worker_tick_ms = 2\n").unwrap();
        assert_eq!(config.worker_tick_ms, 2);
        assert_eq!(config.buffer_pool_capacity, 64);
    }

    #[test]
    fn test_rejects_zero_tick() {
        let err = ReactorConfig::from_toml_str("worker_tick_ms = 0").unwrap_err();
        assert!(err.to_string().contains("worker_tick_ms"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(ReactorConfig::from_toml_str("worker_tick_ms = \"fast\"").is_err());
    }
}
