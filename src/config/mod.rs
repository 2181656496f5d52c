//! Configuration module for the production line
//!
//! A [`LineConfig`] describes one line: channel capacity, timing knobs for the
//! station loops, intake cadence, rework bounds, health monitoring and the
//! per-stage processing settings. Every field has a default, so a config file
//! only needs to mention what it changes.
//!
//! # Files
//!
//! Configs are stored as TOML (`.toml` extension) or JSON (anything else).
//!
//! # Example
//!
//! ```ignore
//! use prodline::config::LineConfig;
//!
//! let mut config = LineConfig::load("line.toml")?;
//! config.stations.assembler.failure_rate = 0.1;
//! config.validate()?;
//! config.save("line.toml")?;
//! ```

use crate::error::{LineError, Result};
use crate::pipeline::id::StageKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default capacity of each hand-off channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 20;

/// Default products generated per minute
pub const DEFAULT_PRODUCTION_RATE: u32 = 10;

// ==================== Line Config ====================

/// Complete configuration of one production line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineConfig {
    /// Capacity of each of the four channels
    pub channel_capacity: usize,

    /// RNG seed for reproducible runs. Each station derives its own stream.
    pub seed: Option<u64>,

    pub timing: TimingConfig,
    pub intake: IntakeConfig,
    pub rework: ReworkConfig,
    pub health: HealthConfig,
    pub stations: StationsConfig,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            seed: None,
            timing: TimingConfig::default(),
            intake: IntakeConfig::default(),
            rework: ReworkConfig::default(),
            health: HealthConfig::default(),
            stations: StationsConfig::default(),
        }
    }
}

impl LineConfig {
    /// Load a config file. `.toml` files are parsed as TOML, anything else as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LineError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: Self = if is_toml(path) {
            toml::from_str(&content).map_err(|e| {
                LineError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| {
                LineError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })?
        };

        tracing::debug!("Loaded line config from {:?}", path);
        Ok(config)
    }

    /// Load a config file, falling back to defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load line config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save to a file, choosing the format from the extension like [`load`](Self::load)
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_toml(path) {
            toml::to_string_pretty(self)
                .map_err(|e| LineError::Serialization(format!("Failed to serialize config: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| LineError::Serialization(format!("Failed to serialize config: {}", e)))?
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;

        tracing::info!("Saved line config to {:?}", path);
        Ok(())
    }

    /// Check every value is inside its permitted range
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(LineError::InvalidSetting(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.intake.production_rate_per_minute == 0 {
            return Err(LineError::InvalidSetting(
                "intake.production_rate_per_minute must be at least 1".to_string(),
            ));
        }

        self.timing.validate()?;
        self.rework.validate()?;
        self.health.validate()?;

        for stage in StageKind::ALL {
            self.stations
                .get(stage)
                .validate()
                .map_err(|e| e.with_context(format!("stations.{}", stage.metric_prefix())))?;
        }
        Ok(())
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
}

fn check_probability(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(LineError::InvalidSetting(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )))
    }
}

fn check_nonzero(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        Err(LineError::InvalidSetting(format!("{} must be non-zero", name)))
    } else {
        Ok(())
    }
}

// ==================== Timing ====================

/// Bounded waits used by station loops and background threads (milliseconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Bounded push/pop wait inside a station loop
    pub channel_timeout_ms: u64,
    /// Re-check interval of a paused station
    pub pause_poll_ms: u64,
    /// Grace period for a worker to exit on stop before it is abandoned
    pub stop_grace_ms: u64,
    /// Statistics sampling cadence
    pub metrics_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            channel_timeout_ms: 5000,
            pause_poll_ms: 100,
            stop_grace_ms: 5000,
            metrics_interval_ms: 1000,
        }
    }
}

impl TimingConfig {
    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        check_nonzero("timing.channel_timeout_ms", self.channel_timeout_ms)?;
        check_nonzero("timing.pause_poll_ms", self.pause_poll_ms)?;
        check_nonzero("timing.metrics_interval_ms", self.metrics_interval_ms)
    }
}

// ==================== Intake ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    pub production_rate_per_minute: u32,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            production_rate_per_minute: DEFAULT_PRODUCTION_RATE,
        }
    }
}

impl IntakeConfig {
    /// Time between two generation ticks
    pub fn interval(&self) -> Duration {
        Duration::from_millis(60_000 / u64::from(self.production_rate_per_minute.max(1)))
    }
}

// ==================== Rework ====================

/// Inspection and rework behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReworkConfig {
    /// Times a product may be sent back before inspection rejects it
    pub max_passes: u32,
    /// Rework chance when exactly one test fails
    pub rework_rate: f64,
    /// Pass probability of each individual quality test
    pub test_pass_probability: f64,
}

impl Default for ReworkConfig {
    fn default() -> Self {
        Self {
            max_passes: 3,
            rework_rate: 0.08,
            test_pass_probability: 0.85,
        }
    }
}

impl ReworkConfig {
    fn validate(&self) -> Result<()> {
        check_probability("rework.rework_rate", self.rework_rate)?;
        check_probability("rework.test_pass_probability", self.test_pass_probability)
    }
}

// ==================== Health ====================

/// Worker health monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    /// A worker whose heartbeat is older than this is force-terminated
    pub unresponsive_threshold_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 5000,
            unresponsive_threshold_ms: 30_000,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn unresponsive_threshold(&self) -> Duration {
        Duration::from_millis(self.unresponsive_threshold_ms)
    }

    fn validate(&self) -> Result<()> {
        check_nonzero("health.check_interval_ms", self.check_interval_ms)?;
        check_nonzero("health.unresponsive_threshold_ms", self.unresponsive_threshold_ms)
    }
}

// ==================== Stations ====================

/// Processing settings of one station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    pub min_processing_ms: u64,
    pub max_processing_ms: u64,
    /// Probability in `[0, 1]` that the stage rejects a product
    pub failure_rate: f64,
}

impl StationConfig {
    pub fn new(min_processing_ms: u64, max_processing_ms: u64, failure_rate: f64) -> Self {
        Self {
            min_processing_ms,
            max_processing_ms,
            failure_rate,
        }
    }

    /// Default settings for a stage
    pub fn for_stage(stage: StageKind) -> Self {
        match stage {
            StageKind::Intake => Self::new(50, 150, 0.0),
            StageKind::Assembler => Self::new(200, 400, 0.02),
            StageKind::QualityInspection => Self::new(150, 300, 0.03),
            StageKind::Packaging => Self::new(180, 350, 0.01),
            StageKind::Shipping => Self::new(100, 200, 0.005),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_processing_ms > self.max_processing_ms {
            return Err(LineError::InvalidSetting(format!(
                "min_processing_ms ({}) exceeds max_processing_ms ({})",
                self.min_processing_ms, self.max_processing_ms
            )));
        }
        check_probability("failure_rate", self.failure_rate)
    }
}

/// Settings for every stage of the line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationsConfig {
    pub intake: StationConfig,
    pub assembler: StationConfig,
    pub quality_inspection: StationConfig,
    pub packaging: StationConfig,
    pub shipping: StationConfig,
}

impl Default for StationsConfig {
    fn default() -> Self {
        Self {
            intake: StationConfig::for_stage(StageKind::Intake),
            assembler: StationConfig::for_stage(StageKind::Assembler),
            quality_inspection: StationConfig::for_stage(StageKind::QualityInspection),
            packaging: StationConfig::for_stage(StageKind::Packaging),
            shipping: StationConfig::for_stage(StageKind::Shipping),
        }
    }
}

impl StationsConfig {
    pub fn get(&self, stage: StageKind) -> &StationConfig {
        match stage {
            StageKind::Intake => &self.intake,
            StageKind::Assembler => &self.assembler,
            StageKind::QualityInspection => &self.quality_inspection,
            StageKind::Packaging => &self.packaging,
            StageKind::Shipping => &self.shipping,
        }
    }

    pub fn get_mut(&mut self, stage: StageKind) -> &mut StationConfig {
        match stage {
            StageKind::Intake => &mut self.intake,
            StageKind::Assembler => &mut self.assembler,
            StageKind::QualityInspection => &mut self.quality_inspection,
            StageKind::Packaging => &mut self.packaging,
            StageKind::Shipping => &mut self.shipping,
        }
    }
}
