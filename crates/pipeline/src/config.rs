use std::fs;
use std::path::Path;

use frame_scheduler::FrameSchedulerConfig;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub frame_scheduler: FrameSchedulerConfig,
    /// Frames the control context may run ahead of the raster context.
    pub layer_tree_capacity: usize,
    pub vsync_capacity: usize,
    pub ignore_raster_cache: bool,
    /// Display refresh period in nanoseconds, used by the simulated display.
    pub presentation_interval_nanos: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_scheduler: FrameSchedulerConfig::default(),
            layer_tree_capacity: 2,
            vsync_capacity: 4,
            ignore_raster_cache: false,
            presentation_interval_nanos: 16_666_667,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        log::info!("[pipeline] loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_scheduler.merged_lease_frames == 0 {
            return Err(ConfigError::Invalid(
                "frame_scheduler.merged_lease_frames must be positive".to_string(),
            ));
        }
        if self.layer_tree_capacity == 0 {
            return Err(ConfigError::Invalid(
                "layer_tree_capacity must be positive".to_string(),
            ));
        }
        if self.vsync_capacity == 0 {
            return Err(ConfigError::Invalid(
                "vsync_capacity must be positive".to_string(),
            ));
        }
        if self.presentation_interval_nanos == 0 {
            return Err(ConfigError::Invalid(
                "presentation_interval_nanos must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
