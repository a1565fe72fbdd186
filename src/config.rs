//! Pipeline configuration.

use crate::error::{Error, Result};
use crate::rate::MAX_RATE_PER_SECOND;

/// Configuration for a pipeline's root stage
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PipelineConfig {
    /// Name used in logs and as the input queue's name prefix
    pub name: String,
    /// Aggregate number of items all sources may emit per second
    pub rate_per_second: u32,
    /// Capacity of the shared input queue
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "pipeline".to_string(),
            rate_per_second: 1000,
            queue_capacity: 1000,
        }
    }
}

impl PipelineConfig {
    /// Create a configuration with the given rate and input capacity
    pub fn new(rate_per_second: u32, queue_capacity: usize) -> Self {
        Self {
            rate_per_second,
            queue_capacity,
            ..Self::default()
        }
    }

    /// Set the pipeline name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the aggregate admission rate
    pub fn rate_per_second(mut self, rate: u32) -> Self {
        self.rate_per_second = rate;
        self
    }

    /// Set the shared input queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Reject values that would produce a pipeline that never makes progress
    pub fn validate(&self) -> Result<()> {
        if self.rate_per_second == 0 || self.rate_per_second > MAX_RATE_PER_SECOND {
            return Err(Error::InvalidRate);
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidCapacity {
                queue: self.input_queue_name(),
            });
        }
        Ok(())
    }

    pub(crate) fn input_queue_name(&self) -> String {
        format!("{}/input", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = PipelineConfig::default()
            .name("ingest")
            .rate_per_second(50)
            .queue_capacity(10);
        assert_eq!(config.name, "ingest");
        assert_eq!(config.rate_per_second, 50);
        assert_eq!(config.queue_capacity, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(matches!(
            PipelineConfig::new(0, 10).validate(),
            Err(Error::InvalidRate)
        ));
        assert!(matches!(
            PipelineConfig::new(10, 0).validate(),
            Err(Error::InvalidCapacity { queue }) if queue == "pipeline/input"
        ));
        assert!(PipelineConfig::new(MAX_RATE_PER_SECOND, 10).validate().is_ok());
        assert!(matches!(
            PipelineConfig::new(2_000_000_000, 10).validate(),
            Err(Error::InvalidRate)
        ));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_deserialize_with_defaults() {
        let config: PipelineConfig = serde_json::from_str(r#"{"rate_per_second": 20}"#).unwrap();
        assert_eq!(config.rate_per_second, 20);
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.name, "pipeline");
    }
}
