use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::{DEFAULT_MAX_CONCURRENT, DEFAULT_TIMEOUT};
use crate::selector::{SelectionPolicy, ZoneSelector};
use crate::zone::ZoneLabel;

pub const MAX_ZOOM: u8 = 24;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid configuration: {0}")]
pub struct ConfigError(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub endpoint: String,
    pub max_concurrent: usize,
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000/segmenta_ai".to_string(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Settings for refining every stored site in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Sites refined at the same time. Segmentation calls stay under the
    /// gateway's own ceiling regardless.
    pub max_parallel_sites: usize,
    /// Watchdog on a single step, covering capture, detection and the store write.
    pub step_timeout_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_parallel_sites: DEFAULT_MAX_CONCURRENT,
            step_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

impl BatchConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_sites == 0 {
            return Err(ConfigError("max_parallel_sites must be positive".to_string()));
        }
        if self.step_timeout_secs == 0 {
            return Err(ConfigError("step_timeout_secs must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    pub max_rounds: u32,
    pub center_tolerance_px: f64,
    /// Segmentation attempts per round before the round counts as no detection.
    pub max_attempts: u32,
    pub min_image_bytes: usize,
    pub default_zoom: u8,
    pub default_crop_size: u32,
    pub policy: SelectionPolicy,
    pub relevant_labels: Vec<ZoneLabel>,
    /// Legacy secondary stop on density gain between rounds. Off when `None`.
    pub min_density_improvement: Option<usize>,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            center_tolerance_px: 20.0,
            max_attempts: 2,
            min_image_bytes: 100,
            default_zoom: 18,
            default_crop_size: 300,
            policy: SelectionPolicy::LargestArea,
            relevant_labels: ZoneLabel::site_relevant(),
            min_density_improvement: None,
        }
    }
}

impl RefinementConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_rounds == 0 {
            return Err(ConfigError("max_rounds must be positive".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError("max_attempts must be positive".to_string()));
        }
        if !(self.center_tolerance_px.is_finite() && self.center_tolerance_px > 0.0) {
            return Err(ConfigError(format!(
                "center_tolerance_px must be positive, got {}",
                self.center_tolerance_px
            )));
        }
        if self.default_crop_size == 0 {
            return Err(ConfigError("default_crop_size must be positive".to_string()));
        }
        if self.default_zoom > MAX_ZOOM {
            return Err(ConfigError(format!(
                "default_zoom must be at most {MAX_ZOOM}, got {}",
                self.default_zoom
            )));
        }
        if self.relevant_labels.is_empty() {
            return Err(ConfigError("relevant_labels must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn selector(&self) -> ZoneSelector {
        ZoneSelector::new(self.relevant_labels.clone(), self.policy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    pub log_level: String,
    /// Directory for rolling log files; console only when unset.
    pub log_dir: Option<String>,
    pub segmentation: GatewayConfig,
    pub refinement: RefinementConfig,
    pub batch: BatchConfig,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            segmentation: GatewayConfig::default(),
            refinement: RefinementConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

impl LocatorConfig {
    /// Loads a YAML or JSON config, picked by file extension.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config: LocatorConfig = common::deserialize_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segmentation.max_concurrent == 0 {
            return Err(ConfigError("max_concurrent must be positive".to_string()));
        }
        if self.segmentation.timeout_secs == 0 {
            return Err(ConfigError("timeout_secs must be positive".to_string()));
        }
        self.refinement.validate()?;
        self.batch.validate()
    }
}
