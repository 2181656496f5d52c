//! Test data builders for line configurations

use prodline::config::{HealthConfig, TimingConfig};
use prodline::{LineConfig, StageKind, StationConfig};

/// Builder for fast, deterministic line configurations.
///
/// Defaults: millisecond timings, zero-cost stations without failures, one
/// product per millisecond at intake, health monitoring off.
pub struct LineConfigBuilder {
    config: LineConfig,
}

impl LineConfigBuilder {
    pub fn new() -> Self {
        let mut config = LineConfig::default();
        config.seed = Some(42);
        config.channel_capacity = 4;
        config.intake.production_rate_per_minute = 60_000;
        config.timing = TimingConfig {
            channel_timeout_ms: 20,
            pause_poll_ms: 5,
            stop_grace_ms: 1000,
            metrics_interval_ms: 20,
        };
        config.health.enabled = false;
        for stage in StageKind::ALL {
            *config.stations.get_mut(stage) = StationConfig::new(0, 1, 0.0);
        }
        // Quiet inspection unless a test asks for rework
        config.rework.test_pass_probability = 1.0;
        config.rework.rework_rate = 0.0;
        Self { config }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    pub fn rate_per_minute(mut self, rate: u32) -> Self {
        self.config.intake.production_rate_per_minute = rate;
        self
    }

    pub fn failure_rate(mut self, stage: StageKind, rate: f64) -> Self {
        self.config.stations.get_mut(stage).failure_rate = rate;
        self
    }

    pub fn rework(mut self, max_passes: u32, test_pass_probability: f64) -> Self {
        self.config.rework.max_passes = max_passes;
        self.config.rework.test_pass_probability = test_pass_probability;
        self
    }

    pub fn health(mut self, check_interval_ms: u64, unresponsive_threshold_ms: u64) -> Self {
        self.config.health = HealthConfig {
            enabled: true,
            check_interval_ms,
            unresponsive_threshold_ms,
        };
        self
    }

    pub fn build(self) -> LineConfig {
        self.config
    }
}

impl Default for LineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_produces_valid_config() {
        let config = LineConfigBuilder::new()
            .capacity(2)
            .failure_rate(StageKind::Packaging, 1.0)
            .build();

        assert!(config.validate().is_ok());
        assert_eq!(config.channel_capacity, 2);
        assert_eq!(config.stations.packaging.failure_rate, 1.0);
    }
}
