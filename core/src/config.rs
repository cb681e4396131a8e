use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::processing::interpolation::InterpolationMethod;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Pipeline-wide settings. Every field is optional in serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_concurrent_streams: usize,
    pub default_window_size: usize,
    pub interpolation_method: InterpolationMethod,
    pub time_alignment_tolerance_ms: i64,
    pub enable_performance_monitoring: bool,
    pub memory_limit_mb: f64,
    pub processing_timeout_ms: u64,
    pub monitor_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 100,
            default_window_size: 100,
            interpolation_method: InterpolationMethod::Linear,
            time_alignment_tolerance_ms: 100,
            enable_performance_monitoring: true,
            memory_limit_mb: 512.0,
            processing_timeout_ms: 5000,
            monitor_interval_ms: 5000,
        }
    }
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_window_size == 0 {
            return Err(ConfigError::Invalid("default_window_size must be positive".into()));
        }
        if self.processing_timeout_ms == 0 {
            return Err(ConfigError::Invalid("processing_timeout_ms must be positive".into()));
        }
        if self.time_alignment_tolerance_ms < 0 {
            return Err(ConfigError::Invalid(
                "time_alignment_tolerance_ms must not be negative".into(),
            ));
        }
        Ok(())
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }
}
