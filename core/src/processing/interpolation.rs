use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PipelineConfig;
use crate::math::interp::{hermite_blend, lerp, nearest};
use crate::prelude::{
    parse_options, DataType, Metadata, Payload, ProcessingContext, ProcessingStage, SampleValue,
    StageError, StageResult, StageType, TelemetryDataPoint,
};
use crate::telemetry::log::LogManager;
use crate::telemetry::metrics::MetricsRecorder;

pub const DEFAULT_SAMPLE_RATE_HZ: f64 = 10.0;
pub const DEFAULT_MAX_GAP_MS: i64 = 5000;
/// Upper bound on samples synthesized for one gap; larger gaps are left unfilled.
pub const MAX_SYNTHESIZED_PER_GAP: i64 = 10_000;
const QUALITY_PENALTY: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpolationMethod {
    #[default]
    Linear,
    Cubic,
    Nearest,
    ZeroOrderHold,
    ForwardFill,
    BackwardFill,
}

impl InterpolationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterpolationMethod::Linear => "linear",
            InterpolationMethod::Cubic => "cubic",
            InterpolationMethod::Nearest => "nearest",
            InterpolationMethod::ZeroOrderHold => "zero_order_hold",
            InterpolationMethod::ForwardFill => "forward_fill",
            InterpolationMethod::BackwardFill => "backward_fill",
        }
    }

    /// Value at fraction `t` between `start` and `end`.
    ///
    /// Forward fill holds the end value and backward fill holds the start value.
    pub fn blend(&self, start: &SampleValue, end: &SampleValue, t: f64) -> SampleValue {
        let held = |pick_start: bool| if pick_start { start.clone() } else { end.clone() };
        let kernel: fn(f64, f64, f64) -> f64 = match self {
            InterpolationMethod::Linear => lerp,
            InterpolationMethod::Cubic => hermite_blend,
            InterpolationMethod::Nearest => nearest,
            InterpolationMethod::ZeroOrderHold | InterpolationMethod::BackwardFill => {
                return held(true)
            }
            InterpolationMethod::ForwardFill => return held(false),
        };
        start
            .zip_with(end, |a, b| kernel(a, b, t))
            .unwrap_or_else(|| held(t < 0.5))
    }
}

#[derive(Debug, Clone, Copy)]
struct InterpolationSettings {
    method: InterpolationMethod,
    max_gap_ms: i64,
    default_sample_rate: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct InterpolationOptions {
    method: Option<InterpolationMethod>,
    max_gap_ms: Option<i64>,
    default_sample_rate: Option<f64>,
}

/// Fills time gaps inside a batch with synthesized samples.
pub struct InterpolationStage {
    name: String,
    defaults: InterpolationSettings,
    settings: Mutex<InterpolationSettings>,
    metrics: MetricsRecorder,
    logger: LogManager,
}

impl InterpolationStage {
    pub fn new(method: InterpolationMethod) -> Self {
        let defaults = InterpolationSettings {
            method,
            max_gap_ms: DEFAULT_MAX_GAP_MS,
            default_sample_rate: DEFAULT_SAMPLE_RATE_HZ,
        };
        Self {
            name: "interpolation".to_string(),
            defaults,
            settings: Mutex::new(defaults),
            metrics: MetricsRecorder::new(),
            logger: LogManager::new("interpolation"),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.interpolation_method)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn method(&self) -> InterpolationMethod {
        self.settings
            .lock()
            .map(|s| s.method)
            .unwrap_or(self.defaults.method)
    }

    fn settings(&self) -> StageResult<InterpolationSettings> {
        self.settings
            .lock()
            .map(|s| *s)
            .map_err(|_| StageError::Internal("interpolation settings poisoned".into()))
    }

    fn interpolate(
        &self,
        mut points: Vec<TelemetryDataPoint>,
        context: &ProcessingContext,
        settings: &InterpolationSettings,
    ) -> Vec<TelemetryDataPoint> {
        if points.len() <= 1 {
            return points;
        }
        points.sort_by_key(|point| point.timestamp);

        let sample_rate = context
            .sample_rate
            .filter(|rate| rate.is_finite() && *rate > 0.0)
            .unwrap_or(settings.default_sample_rate);
        let expected_interval = 1000.0 / sample_rate;

        let mut output = Vec::with_capacity(points.len());
        let mut synthesized = 0usize;
        let mut skipped_gaps = 0usize;
        let mut iter = points.into_iter().peekable();

        while let Some(start) = iter.next() {
            if let Some(end) = iter.peek() {
                let gap = end.timestamp - start.timestamp;
                let missing = (gap as f64 / expected_interval).floor() as i64 - 1;
                if missing > 0 && missing <= MAX_SYNTHESIZED_PER_GAP && gap <= settings.max_gap_ms {
                    let fill = synthesize(&start, end, missing, settings.method);
                    synthesized += fill.len();
                    output.push(start);
                    output.extend(fill);
                    continue;
                }
                if missing > 0 {
                    skipped_gaps += 1;
                }
            }
            output.push(start);
        }

        if synthesized > 0 || skipped_gaps > 0 {
            self.logger.debug(&format!(
                "{}: synthesized {} samples, left {} gaps above {} ms",
                context.stream_id, synthesized, skipped_gaps, settings.max_gap_ms
            ));
        }
        output
    }
}

impl Default for InterpolationStage {
    fn default() -> Self {
        Self::new(InterpolationMethod::default())
    }
}

fn synthesize(
    start: &TelemetryDataPoint,
    end: &TelemetryDataPoint,
    missing: i64,
    method: InterpolationMethod,
) -> Vec<TelemetryDataPoint> {
    let gap = (end.timestamp - start.timestamp) as f64;
    let quality = start.quality.min(end.quality) * QUALITY_PENALTY;
    (1..=missing)
        .map(|i| {
            let t = i as f64 / (missing + 1) as f64;
            let mut metadata = Metadata::new();
            metadata.insert("interpolated".into(), Value::Bool(true));
            metadata.insert("interpolation_method".into(), Value::from(method.as_str()));
            metadata.insert("interpolation_position".into(), Value::from(t));
            TelemetryDataPoint {
                timestamp: start.timestamp + (gap * t).round() as i64,
                value: method.blend(&start.value, &end.value, t),
                quality,
                metadata,
            }
        })
        .collect()
}

#[async_trait]
impl ProcessingStage for InterpolationStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage_type(&self) -> StageType {
        StageType::Interpolation
    }

    fn input_types(&self) -> &[DataType] {
        &[DataType::Numeric, DataType::Vector, DataType::Matrix]
    }

    fn output_types(&self) -> &[DataType] {
        &[DataType::Numeric, DataType::Vector, DataType::Matrix]
    }

    async fn process(&self, input: Payload, context: &ProcessingContext) -> StageResult<Payload> {
        let settings = self.settings()?;
        Ok(match input {
            Payload::Single(point) => Payload::Single(point),
            Payload::Batch(points) => Payload::Batch(self.interpolate(points, context, &settings)),
            Payload::Streams(streams) => Payload::Streams(
                streams
                    .into_iter()
                    .map(|(stream_id, points)| {
                        let filled = self.interpolate(points, context, &settings);
                        (stream_id, filled)
                    })
                    .collect(),
            ),
        })
    }

    fn configure(&self, options: &Value) -> StageResult<()> {
        let options: InterpolationOptions = parse_options(options)?;
        if matches!(options.max_gap_ms, Some(gap) if gap < 0) {
            return Err(StageError::InvalidOptions("max_gap_ms must not be negative".into()));
        }
        if matches!(options.default_sample_rate, Some(rate) if !(rate.is_finite() && rate > 0.0)) {
            return Err(StageError::InvalidOptions("default_sample_rate must be positive".into()));
        }
        let mut settings = self
            .settings
            .lock()
            .map_err(|_| StageError::Internal("interpolation settings poisoned".into()))?;
        if let Some(method) = options.method {
            settings.method = method;
        }
        if let Some(gap) = options.max_gap_ms {
            settings.max_gap_ms = gap;
        }
        if let Some(rate) = options.default_sample_rate {
            settings.default_sample_rate = rate;
        }
        Ok(())
    }

    fn reset(&self) {
        if let Ok(mut settings) = self.settings.lock() {
            *settings = self.defaults;
        }
        self.metrics.reset();
    }

    fn recorder(&self) -> &MetricsRecorder {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair(gap: i64) -> Payload {
        Payload::Batch(vec![
            TelemetryDataPoint::numeric(1_000, 0.0),
            TelemetryDataPoint::numeric(1_000 + gap, 10.0).with_quality(0.5),
        ])
    }

    async fn run(stage: &InterpolationStage, payload: Payload) -> Vec<TelemetryDataPoint> {
        let ctx = ProcessingContext::new("s1", DataType::Numeric).with_sample_rate(10.0);
        stage.process(payload, &ctx).await.unwrap().into_batch().unwrap()
    }

    #[tokio::test]
    async fn fills_gap_with_evenly_spaced_samples() {
        let stage = InterpolationStage::new(InterpolationMethod::Linear);
        let out = run(&stage, pair(500)).await;
        assert_eq!(out.len(), 6);
        let timestamps: Vec<i64> = out.iter().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![1000, 1100, 1200, 1300, 1400, 1500]);
        assert_eq!(out[1].value, SampleValue::Numeric(2.0));
        assert!((out[1].quality - 0.4).abs() < 1e-12);
        assert_eq!(out[1].meta("interpolated"), Some(&json!(true)));
        assert_eq!(out[1].meta("interpolation_method"), Some(&json!("linear")));
        assert_eq!(out[1].meta("interpolation_position"), Some(&json!(0.2)));
    }

    #[tokio::test]
    async fn gaps_above_limit_are_left_alone() {
        let stage = InterpolationStage::new(InterpolationMethod::Linear);
        stage.configure(&json!({"max_gap_ms": 100})).unwrap();
        let out = run(&stage, pair(5000)).await;
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn oversampled_gaps_are_not_filled() {
        let stage = InterpolationStage::new(InterpolationMethod::Linear);
        let ctx = ProcessingContext::new("s1", DataType::Numeric).with_sample_rate(1.0e7);
        let out = stage
            .process(pair(5000), &ctx)
            .await
            .unwrap()
            .into_batch()
            .unwrap();
        assert_eq!(out.len(), 2);

        let ctx = ProcessingContext::new("s1", DataType::Numeric).with_sample_rate(1_000.0);
        let out = stage.process(pair(5000), &ctx).await.unwrap().into_batch().unwrap();
        assert_eq!(out.len(), 5001);
    }

    #[tokio::test]
    async fn small_batches_pass_through() {
        let stage = InterpolationStage::new(InterpolationMethod::Linear);
        assert!(run(&stage, Payload::Batch(vec![])).await.is_empty());
        let single = run(&stage, Payload::Batch(vec![TelemetryDataPoint::numeric(5, 1.0)])).await;
        assert_eq!(single.len(), 1);
    }

    #[tokio::test]
    async fn unsorted_batches_are_sorted_first() {
        let stage = InterpolationStage::new(InterpolationMethod::ZeroOrderHold);
        let batch = Payload::Batch(vec![
            TelemetryDataPoint::numeric(300, 3.0),
            TelemetryDataPoint::numeric(0, 1.0),
        ]);
        let out = run(&stage, batch).await;
        let timestamps: Vec<i64> = out.iter().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![0, 100, 200, 300]);
        assert_eq!(out[1].value, SampleValue::Numeric(1.0));
        assert_eq!(out[2].value, SampleValue::Numeric(1.0));
    }

    #[test]
    fn hold_methods_keep_their_documented_mapping() {
        let start = SampleValue::Numeric(1.0);
        let end = SampleValue::Numeric(9.0);
        assert_eq!(InterpolationMethod::ZeroOrderHold.blend(&start, &end, 0.9), start);
        assert_eq!(InterpolationMethod::ForwardFill.blend(&start, &end, 0.1), end);
        assert_eq!(InterpolationMethod::BackwardFill.blend(&start, &end, 0.9), start);
        assert_eq!(InterpolationMethod::Nearest.blend(&start, &end, 0.7), end);
    }

    #[test]
    fn cubic_blends_vectors_element_wise() {
        let start = SampleValue::Vector(vec![0.0, 10.0]);
        let end = SampleValue::Vector(vec![4.0, 30.0]);
        assert_eq!(
            InterpolationMethod::Cubic.blend(&start, &end, 0.5),
            SampleValue::Vector(vec![2.0, 20.0])
        );
    }

    #[test]
    fn mismatched_shapes_fall_back_to_nearest() {
        let start = SampleValue::Vector(vec![0.0, 1.0]);
        let end = SampleValue::Vector(vec![5.0]);
        assert_eq!(InterpolationMethod::Linear.blend(&start, &end, 0.25), start);
    }

    #[test]
    fn reset_restores_configured_defaults() {
        let stage = InterpolationStage::new(InterpolationMethod::Cubic);
        stage.configure(&json!({"method": "nearest"})).unwrap();
        assert_eq!(stage.method(), InterpolationMethod::Nearest);
        stage.reset();
        assert_eq!(stage.method(), InterpolationMethod::Cubic);
    }
}
