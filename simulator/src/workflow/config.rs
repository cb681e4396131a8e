use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use telemetrycore::PipelineConfig;

use crate::generator::profile::GeneratorConfig;

/// Everything a simulated run needs: pipeline settings, the synthetic source,
/// stream names and per-stage option overrides keyed by stage name.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub pipeline: PipelineConfig,
    pub generator: GeneratorConfig,
    pub streams: Vec<String>,
    pub stage_options: BTreeMap<String, Value>,
}

impl WorkflowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: WorkflowConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_args(streams: usize, samples: usize, rate_hz: f64, seed: u64) -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            generator: GeneratorConfig {
                samples,
                sample_rate_hz: rate_hz,
                seed,
                ..Default::default()
            },
            streams: (0..streams).map(|index| format!("sensor-{index}")).collect(),
            stage_options: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.streams.is_empty(), "workflow needs at least one stream");
        self.pipeline
            .validate()
            .context("validating pipeline section")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn config_from_args_names_streams() {
        let cfg = WorkflowConfig::from_args(3, 40, 20.0, 9);
        assert_eq!(cfg.streams, vec!["sensor-0", "sensor-1", "sensor-2"]);
        assert_eq!(cfg.generator.samples, 40);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_load_reads_yaml() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(
            b"pipeline:\n  max_concurrent_streams: 4\n  enable_performance_monitoring: false\n\
generator:\n  samples: 12\nstreams: [gps, baro]\n\
stage_options:\n  window:\n    operations: [mean, max]\n",
        )
        .unwrap();
        let path = temp.into_temp_path();
        let cfg = WorkflowConfig::load(&path).unwrap();
        assert_eq!(cfg.pipeline.max_concurrent_streams, 4);
        assert_eq!(cfg.generator.samples, 12);
        assert_eq!(cfg.streams.len(), 2);
        assert!(cfg.stage_options.contains_key("window"));
    }

    #[test]
    fn config_without_streams_is_rejected() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"generator:\n  samples: 5\n").unwrap();
        let path = temp.into_temp_path();
        assert!(WorkflowConfig::load(&path).is_err());
    }
}
