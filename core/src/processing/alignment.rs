use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::config::PipelineConfig;
use crate::prelude::{
    parse_options, DataType, Payload, ProcessingContext, ProcessingStage, StageError, StageResult,
    StageType, TelemetryDataPoint,
};
use crate::telemetry::log::LogManager;
use crate::telemetry::metrics::MetricsRecorder;

pub const DEFAULT_TOLERANCE_MS: i64 = 100;

#[derive(Debug, Clone)]
struct AlignmentSettings {
    reference_stream: Option<String>,
    tolerance_ms: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AlignmentOptions {
    reference_stream: Option<String>,
    tolerance_ms: Option<i64>,
}

/// Resamples several streams onto the timestamps of a reference stream.
pub struct TimeAlignmentStage {
    name: String,
    default_tolerance_ms: i64,
    settings: Mutex<AlignmentSettings>,
    metrics: MetricsRecorder,
    logger: LogManager,
}

impl TimeAlignmentStage {
    pub fn new(tolerance_ms: i64) -> Self {
        Self {
            name: "alignment".to_string(),
            default_tolerance_ms: tolerance_ms,
            settings: Mutex::new(AlignmentSettings {
                reference_stream: None,
                tolerance_ms,
            }),
            metrics: MetricsRecorder::new(),
            logger: LogManager::new("alignment"),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.time_alignment_tolerance_ms)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_reference(self, stream_id: impl Into<String>) -> Self {
        if let Ok(mut settings) = self.settings.lock() {
            settings.reference_stream = Some(stream_id.into());
        }
        self
    }

    fn settings(&self) -> StageResult<AlignmentSettings> {
        self.settings
            .lock()
            .map(|s| s.clone())
            .map_err(|_| StageError::Internal("alignment settings poisoned".into()))
    }

    fn align(
        &self,
        streams: Vec<(String, Vec<TelemetryDataPoint>)>,
        settings: &AlignmentSettings,
    ) -> Vec<(String, Vec<TelemetryDataPoint>)> {
        let Some(reference_index) = reference_index(&streams, settings.reference_stream.as_deref())
        else {
            return streams;
        };

        let mut reference_times: Vec<i64> = streams[reference_index]
            .1
            .iter()
            .map(|point| point.timestamp)
            .collect();
        reference_times.sort_unstable();

        streams
            .into_iter()
            .enumerate()
            .map(|(index, (stream_id, points))| {
                if index == reference_index {
                    return (stream_id, points);
                }
                let aligned = align_stream(points, &reference_times, settings.tolerance_ms);
                self.logger.debug(&format!(
                    "{} aligned {}/{} reference points",
                    stream_id,
                    aligned.len(),
                    reference_times.len()
                ));
                (stream_id, aligned)
            })
            .collect()
    }
}

impl Default for TimeAlignmentStage {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE_MS)
    }
}

fn reference_index(
    streams: &[(String, Vec<TelemetryDataPoint>)],
    configured: Option<&str>,
) -> Option<usize> {
    if streams.is_empty() {
        return None;
    }
    let configured = configured.and_then(|id| streams.iter().position(|(stream_id, _)| stream_id == id));
    Some(configured.unwrap_or(0))
}

/// Picks, for every reference timestamp, the closest sample within `tolerance_ms`.
///
/// Equidistant candidates resolve to the earlier sample.
fn align_stream(
    mut points: Vec<TelemetryDataPoint>,
    reference_times: &[i64],
    tolerance_ms: i64,
) -> Vec<TelemetryDataPoint> {
    points.sort_by_key(|point| point.timestamp);
    let mut aligned = Vec::with_capacity(reference_times.len());

    for &target in reference_times {
        let upper = points.partition_point(|point| point.timestamp < target);
        let candidates = [upper.checked_sub(1), Some(upper)];
        let closest = candidates
            .into_iter()
            .flatten()
            .filter_map(|index| points.get(index))
            .map(|point| ((point.timestamp - target).abs(), point))
            .filter(|(error, _)| *error <= tolerance_ms)
            .min_by_key(|(error, _)| *error);

        if let Some((error, point)) = closest {
            let mut copy = point.clone();
            copy.set_meta("aligned", true);
            copy.set_meta("original_timestamp", point.timestamp);
            copy.set_meta("alignment_error", error);
            copy.timestamp = target;
            aligned.push(copy);
        }
    }
    aligned
}

#[async_trait]
impl ProcessingStage for TimeAlignmentStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage_type(&self) -> StageType {
        StageType::Transformation
    }

    fn input_types(&self) -> &[DataType] {
        &DataType::ALL
    }

    fn output_types(&self) -> &[DataType] {
        &DataType::ALL
    }

    async fn process(&self, input: Payload, _context: &ProcessingContext) -> StageResult<Payload> {
        let settings = self.settings()?;
        Ok(match input {
            Payload::Streams(streams) => Payload::Streams(self.align(streams, &settings)),
            other => other,
        })
    }

    fn configure(&self, options: &Value) -> StageResult<()> {
        let options: AlignmentOptions = parse_options(options)?;
        if matches!(options.tolerance_ms, Some(tolerance) if tolerance < 0) {
            return Err(StageError::InvalidOptions("tolerance_ms must not be negative".into()));
        }
        let mut settings = self
            .settings
            .lock()
            .map_err(|_| StageError::Internal("alignment settings poisoned".into()))?;
        if let Some(reference) = options.reference_stream {
            settings.reference_stream = Some(reference);
        }
        if let Some(tolerance) = options.tolerance_ms {
            settings.tolerance_ms = tolerance;
        }
        Ok(())
    }

    fn reset(&self) {
        if let Ok(mut settings) = self.settings.lock() {
            settings.reference_stream = None;
            settings.tolerance_ms = self.default_tolerance_ms;
        }
        self.metrics.reset();
    }

    fn recorder(&self) -> &MetricsRecorder {
        &self.metrics
    }
}
