use std::time::Duration;
use serde::{Serialize, Deserialize};

use crate::core::errors::{ChainedQueryError, Result};

/// Sequencer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Evict a head that stays in `Loading` for longer than this.
    /// `None` keeps the head until it settles, however long that takes.
    pub stall_timeout: Option<Duration>,
    /// How often the stall monitor inspects the head
    pub stall_check_interval: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            stall_timeout: None,
            stall_check_interval: Duration::from_secs(1),
        }
    }
}

impl SequencerConfig {
    /// Create a new builder for SequencerConfig
    pub fn builder() -> SequencerConfigBuilder {
        SequencerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.stall_check_interval.is_zero() {
            return Err(ChainedQueryError::configuration_field(
                "stall_check_interval must be greater than 0",
                "stall_check_interval",
            ));
        }
        if let Some(timeout) = self.stall_timeout {
            if timeout.is_zero() {
                return Err(ChainedQueryError::configuration_field(
                    "stall_timeout must be greater than 0",
                    "stall_timeout",
                ));
            }
            if timeout < self.stall_check_interval {
                return Err(ChainedQueryError::configuration_field(
                    "stall_timeout cannot be shorter than stall_check_interval",
                    "stall_timeout",
                ));
            }
        }
        Ok(())
    }

    /// Configuration for development/testing: short stall eviction so a
    /// hung fetch shows up quickly.
    pub fn development() -> Self {
        Self {
            stall_timeout: Some(Duration::from_secs(30)),
            stall_check_interval: Duration::from_millis(250),
        }
    }

    /// Strict ordering: never evict the head.
    pub fn strict() -> Self {
        Self::default()
    }

    /// Whether the stall monitor should run
    pub fn stall_monitor_enabled(&self) -> bool {
        self.stall_timeout.is_some()
    }
}

/// Builder for SequencerConfig
pub struct SequencerConfigBuilder {
    config: SequencerConfig,
}

impl SequencerConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: SequencerConfig::default(),
        }
    }

    /// Set the stall timeout
    pub fn stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.stall_timeout = timeout;
        self
    }

    /// Set the stall monitor interval
    pub fn stall_check_interval(mut self, interval: Duration) -> Self {
        self.config.stall_check_interval = interval;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<SequencerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SequencerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SequencerConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.stall_monitor_enabled());
    }

    #[test]
    fn test_presets() {
        assert!(SequencerConfig::development().validate().is_ok());
        assert!(SequencerConfig::development().stall_monitor_enabled());
        assert!(!SequencerConfig::strict().stall_monitor_enabled());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = SequencerConfig::default();

        config.stall_check_interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.stall_check_interval = Duration::from_secs(1);

        config.stall_timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());

        config.stall_timeout = Some(Duration::from_millis(500));
        assert!(config.validate().is_err());

        config.stall_timeout = Some(Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SequencerConfig::builder()
            .stall_timeout(Some(Duration::from_secs(10)))
            .stall_check_interval(Duration::from_millis(100))
            .build()
            .unwrap();

        assert_eq!(config.stall_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.stall_check_interval, Duration::from_millis(100));

        let err = SequencerConfig::builder()
            .stall_check_interval(Duration::ZERO)
            .build();
        assert!(err.is_err());
    }
}
