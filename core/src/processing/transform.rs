use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::math::stats::StatsHelper;
use crate::prelude::{
    parse_options, DataType, Metadata, Payload, ProcessingContext, ProcessingStage, SampleValue,
    StageError, StageResult, StageType, TelemetryDataPoint,
};
use crate::telemetry::log::LogManager;
use crate::telemetry::metrics::MetricsRecorder;

/// Custom per-type value transformation. An error fails the stage for that call.
pub type TransformFn = Arc<dyn Fn(SampleValue) -> StageResult<SampleValue> + Send + Sync>;

const DEFAULT_PRECISION: u32 = 6;
const MAX_PRECISION: u32 = 15;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TransformOptions {
    precision: Option<u32>,
}

/// Per-type normalization stage. Invalid input is coerced, never rejected.
pub struct TransformationStage {
    name: String,
    precision: Mutex<u32>,
    custom: Mutex<HashMap<DataType, TransformFn>>,
    metrics: MetricsRecorder,
    logger: LogManager,
}

impl TransformationStage {
    pub fn new() -> Self {
        Self::named("transformation")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            precision: Mutex::new(DEFAULT_PRECISION),
            custom: Mutex::new(HashMap::new()),
            metrics: MetricsRecorder::new(),
            logger: LogManager::new("transformation"),
        }
    }

    pub fn with_transformation<F>(self, data_type: DataType, transform: F) -> Self
    where
        F: Fn(SampleValue) -> StageResult<SampleValue> + Send + Sync + 'static,
    {
        self.set_transformation(data_type, transform);
        self
    }

    /// Overrides the default normalization for `data_type`.
    pub fn set_transformation<F>(&self, data_type: DataType, transform: F)
    where
        F: Fn(SampleValue) -> StageResult<SampleValue> + Send + Sync + 'static,
    {
        if let Ok(mut custom) = self.custom.lock() {
            custom.insert(data_type, Arc::new(transform));
        }
    }

    fn precision(&self) -> u32 {
        self.precision.lock().map(|p| *p).unwrap_or(DEFAULT_PRECISION)
    }

    /// Default normalization for one value.
    pub fn normalize(value: SampleValue, data_type: DataType, precision: u32) -> SampleValue {
        let round = |v: f64| StatsHelper::round_to(v, precision);
        match data_type {
            DataType::Numeric => match value {
                SampleValue::Numeric(v) => SampleValue::Numeric(round(v)),
                _ => SampleValue::Numeric(0.0),
            },
            DataType::Vector => match value {
                SampleValue::Vector(values) => {
                    SampleValue::Vector(values.into_iter().map(round).collect())
                }
                SampleValue::Matrix(rows) => SampleValue::Vector(vec![0.0; rows.len()]),
                _ => SampleValue::Vector(vec![0.0; 3]),
            },
            DataType::Matrix => match value {
                SampleValue::Matrix(rows) => SampleValue::Matrix(
                    rows.into_iter()
                        .map(|row| row.into_iter().map(round).collect())
                        .collect(),
                ),
                SampleValue::Vector(row) => {
                    SampleValue::Matrix(vec![row.into_iter().map(round).collect()])
                }
                _ => SampleValue::Matrix(vec![vec![0.0]]),
            },
            DataType::String => match value {
                SampleValue::Text(text) => SampleValue::Text(text.trim().to_string()),
                _ => SampleValue::Text(String::new()),
            },
            DataType::Boolean => SampleValue::Bool(value.is_truthy()),
            DataType::Object => match value {
                passed @ (SampleValue::Object(_) | SampleValue::Vector(_) | SampleValue::Matrix(_)) => {
                    passed
                }
                _ => SampleValue::Object(Metadata::new()),
            },
        }
    }

    fn transform_point(
        &self,
        mut point: TelemetryDataPoint,
        context: &ProcessingContext,
        custom: Option<&TransformFn>,
        precision: u32,
    ) -> StageResult<TelemetryDataPoint> {
        let value = std::mem::replace(&mut point.value, SampleValue::Null);
        point.value = match custom {
            Some(transform) => transform(value)?,
            None => Self::normalize(value, context.data_type, precision),
        };
        point.set_meta("transformed", true);
        point.set_meta("transform_type", context.data_type.as_str());
        point.set_meta("transformed_at", context.timestamp);
        Ok(point)
    }
}

impl Default for TransformationStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessingStage for TransformationStage {
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

    async fn process(&self, input: Payload, context: &ProcessingContext) -> StageResult<Payload> {
        let custom = self
            .custom
            .lock()
            .map_err(|_| StageError::Internal("transformation table poisoned".into()))?
            .get(&context.data_type)
            .cloned();
        let precision = self.precision();
        input.map_points(|point| self.transform_point(point, context, custom.as_ref(), precision))
    }

    fn configure(&self, options: &Value) -> StageResult<()> {
        let options: TransformOptions = parse_options(options)?;
        if let Some(precision) = options.precision {
            if precision > MAX_PRECISION {
                return Err(StageError::InvalidOptions(format!(
                    "precision {} exceeds {}",
                    precision, MAX_PRECISION
                )));
            }
            if let Ok(mut current) = self.precision.lock() {
                *current = precision;
            }
            self.logger.debug(&format!("precision set to {}", precision));
        }
        Ok(())
    }

    fn reset(&self) {
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

    async fn run(stage: &TransformationStage, value: SampleValue, data_type: DataType) -> TelemetryDataPoint {
        let ctx = ProcessingContext::new("s1", data_type);
        stage
            .process(Payload::Single(TelemetryDataPoint::new(0, value)), &ctx)
            .await
            .unwrap()
            .into_single()
            .unwrap()
    }

    #[tokio::test]
    async fn numeric_values_round_to_six_digits() {
        let stage = TransformationStage::new();
        let out = run(&stage, SampleValue::Numeric(42.123456789), DataType::Numeric).await;
        assert_eq!(out.value, SampleValue::Numeric(42.123457));
        assert_eq!(out.meta("transformed"), Some(&json!(true)));
        assert_eq!(out.meta("transform_type"), Some(&json!("numeric")));
    }

    #[tokio::test]
    async fn non_finite_values_become_zero() {
        let stage = TransformationStage::new();
        let inf = run(&stage, SampleValue::Numeric(f64::INFINITY), DataType::Numeric).await;
        let nan = run(&stage, SampleValue::Numeric(f64::NAN), DataType::Numeric).await;
        assert_eq!(inf.value, SampleValue::Numeric(0.0));
        assert_eq!(nan.value, SampleValue::Numeric(0.0));

        let vector = run(
            &stage,
            SampleValue::Vector(vec![1.0, f64::NEG_INFINITY, 2.0000004]),
            DataType::Vector,
        )
        .await;
        assert_eq!(vector.value, SampleValue::Vector(vec![1.0, 0.0, 2.0]));
    }

    #[tokio::test]
    async fn mismatched_shapes_are_coerced() {
        let stage = TransformationStage::new();
        let vector = run(&stage, SampleValue::Text("x".into()), DataType::Vector).await;
        assert_eq!(vector.value, SampleValue::Vector(vec![0.0, 0.0, 0.0]));

        let matrix = run(&stage, SampleValue::Numeric(3.0), DataType::Matrix).await;
        assert_eq!(matrix.value, SampleValue::Matrix(vec![vec![0.0]]));

        let text = run(&stage, SampleValue::Text("  idle \n".into()), DataType::String).await;
        assert_eq!(text.value, SampleValue::Text("idle".into()));

        let flag = run(&stage, SampleValue::Numeric(2.0), DataType::Boolean).await;
        assert_eq!(flag.value, SampleValue::Bool(true));

        let object = run(&stage, SampleValue::Null, DataType::Object).await;
        assert_eq!(object.value, SampleValue::Object(Metadata::new()));

        let array = run(&stage, SampleValue::Vector(vec![1.5, 2.0]), DataType::Object).await;
        assert_eq!(array.value, SampleValue::Vector(vec![1.5, 2.0]));
        let text = run(&stage, SampleValue::Text("x".into()), DataType::Object).await;
        assert_eq!(text.value, SampleValue::Object(Metadata::new()));
    }

    #[tokio::test]
    async fn custom_transformation_overrides_default() {
        let stage = TransformationStage::new().with_transformation(DataType::Numeric, |value| match value {
            SampleValue::Numeric(v) => Ok(SampleValue::Numeric(v * 2.0)),
            other => Ok(other),
        });
        let out = run(&stage, SampleValue::Numeric(1.5), DataType::Numeric).await;
        assert_eq!(out.value, SampleValue::Numeric(3.0));

        let untouched = run(&stage, SampleValue::Vector(vec![1.0]), DataType::Vector).await;
        assert_eq!(untouched.value, SampleValue::Vector(vec![1.0]));
    }

    #[tokio::test]
    async fn failing_custom_transformation_is_an_error() {
        let stage = TransformationStage::new().with_transformation(DataType::Numeric, |_| {
            Err(StageError::InvalidInput("sensor offline".into()))
        });
        let ctx = ProcessingContext::new("s1", DataType::Numeric);
        let result = stage
            .process(Payload::Single(TelemetryDataPoint::numeric(0, 1.0)), &ctx)
            .await;
        assert!(matches!(result, Err(StageError::InvalidInput(_))));
    }

    #[test]
    fn configure_validates_precision() {
        let stage = TransformationStage::new();
        assert!(stage.configure(&json!({"precision": 2})).is_ok());
        assert_eq!(stage.precision(), 2);
        assert!(stage.configure(&json!({"precision": 40})).is_err());
        assert!(stage.configure(&json!({"unknown": 1})).is_err());
    }
}
