use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::telemetry::metrics::{MetricsRecorder, StageMetrics};

/// Open key/value metadata carried by samples and contexts.
pub type Metadata = serde_json::Map<String, Value>;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Declared type of a sample; selects which stages apply and which branch they take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Numeric,
    Vector,
    Matrix,
    String,
    Boolean,
    Object,
}

impl DataType {
    pub const ALL: [DataType; 6] = [
        DataType::Numeric,
        DataType::Vector,
        DataType::Matrix,
        DataType::String,
        DataType::Boolean,
        DataType::Object,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Numeric => "numeric",
            DataType::Vector => "vector",
            DataType::Matrix => "matrix",
            DataType::String => "string",
            DataType::Boolean => "boolean",
            DataType::Object => "object",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime value of a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Null,
    Bool(bool),
    Numeric(f64),
    Vector(Vec<f64>),
    Matrix(Vec<Vec<f64>>),
    Text(String),
    Object(Metadata),
}

impl SampleValue {
    /// Truthiness used when coercing to a boolean.
    pub fn is_truthy(&self) -> bool {
        match self {
            SampleValue::Null => false,
            SampleValue::Bool(flag) => *flag,
            SampleValue::Numeric(value) => *value != 0.0 && !value.is_nan(),
            SampleValue::Text(text) => !text.is_empty(),
            SampleValue::Vector(_) | SampleValue::Matrix(_) | SampleValue::Object(_) => true,
        }
    }

    /// Flattens a scalar or vector into a row of numbers.
    pub fn as_row(&self) -> Option<Vec<f64>> {
        match self {
            SampleValue::Numeric(value) => Some(vec![*value]),
            SampleValue::Vector(values) => Some(values.clone()),
            _ => None,
        }
    }

    pub fn matches(&self, data_type: DataType) -> bool {
        matches!(
            (self, data_type),
            (SampleValue::Numeric(_), DataType::Numeric)
                | (SampleValue::Vector(_), DataType::Vector)
                | (SampleValue::Matrix(_), DataType::Matrix)
                | (SampleValue::Text(_), DataType::String)
                | (SampleValue::Bool(_), DataType::Boolean)
                | (SampleValue::Object(_), DataType::Object)
        )
    }

    /// Combines two numeric values of identical shape element by element.
    ///
    /// Returns `None` when the shapes differ or either side is not numeric.
    pub fn zip_with<F>(&self, other: &SampleValue, f: F) -> Option<SampleValue>
    where
        F: Fn(f64, f64) -> f64,
    {
        match (self, other) {
            (SampleValue::Numeric(a), SampleValue::Numeric(b)) => Some(SampleValue::Numeric(f(*a, *b))),
            (SampleValue::Vector(a), SampleValue::Vector(b)) if a.len() == b.len() => Some(
                SampleValue::Vector(a.iter().zip(b).map(|(x, y)| f(*x, *y)).collect()),
            ),
            (SampleValue::Matrix(a), SampleValue::Matrix(b))
                if a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.len() == y.len()) =>
            {
                Some(SampleValue::Matrix(
                    a.iter()
                        .zip(b)
                        .map(|(row_a, row_b)| row_a.iter().zip(row_b).map(|(x, y)| f(*x, *y)).collect())
                        .collect(),
                ))
            }
            _ => None,
        }
    }
}

fn default_quality() -> f64 {
    1.0
}

/// One timestamped telemetry reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryDataPoint {
    pub timestamp: i64,
    pub value: SampleValue,
    #[serde(default = "default_quality")]
    pub quality: f64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl TelemetryDataPoint {
    pub fn new(timestamp: i64, value: SampleValue) -> Self {
        Self {
            timestamp,
            value,
            quality: default_quality(),
            metadata: Metadata::new(),
        }
    }

    pub fn numeric(timestamp: i64, value: f64) -> Self {
        Self::new(timestamp, SampleValue::Numeric(value))
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = quality.clamp(0.0, 1.0);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set_meta(key, value);
        self
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

/// Per-invocation metadata handed to every stage.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub stream_id: String,
    /// Processing time, not sample time.
    pub timestamp: i64,
    pub data_type: DataType,
    pub metadata: Metadata,
    pub window_size: Option<usize>,
    /// Hz; used to infer the expected spacing between samples.
    pub sample_rate: Option<f64>,
    pub quality: Option<f64>,
}

impl ProcessingContext {
    pub fn new(stream_id: impl Into<String>, data_type: DataType) -> Self {
        Self {
            stream_id: stream_id.into(),
            timestamp: now_millis(),
            data_type,
            metadata: Metadata::new(),
            window_size: None,
            sample_rate: None,
            quality: None,
        }
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = Some(window_size);
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    /// Composite key used for per-stream state.
    pub fn stream_key(&self) -> String {
        stream_key(&self.stream_id, self.data_type)
    }
}

pub fn stream_key(stream_id: &str, data_type: DataType) -> String {
    format!("{}:{}", stream_id, data_type)
}

/// Data handed from one stage to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Single(TelemetryDataPoint),
    Batch(Vec<TelemetryDataPoint>),
    /// Insertion-ordered stream id to samples.
    Streams(Vec<(String, Vec<TelemetryDataPoint>)>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Single(_) => 1,
            Payload::Batch(points) => points.len(),
            Payload::Streams(streams) => streams.iter().map(|(_, points)| points.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Single(_) => "single",
            Payload::Batch(_) => "batch",
            Payload::Streams(_) => "streams",
        }
    }

    pub fn into_single(self) -> Option<TelemetryDataPoint> {
        match self {
            Payload::Single(point) => Some(point),
            _ => None,
        }
    }

    pub fn into_batch(self) -> Option<Vec<TelemetryDataPoint>> {
        match self {
            Payload::Batch(points) => Some(points),
            _ => None,
        }
    }

    pub fn into_streams(self) -> Option<Vec<(String, Vec<TelemetryDataPoint>)>> {
        match self {
            Payload::Streams(streams) => Some(streams),
            _ => None,
        }
    }

    /// Applies `f` to every sample regardless of the payload shape.
    pub fn map_points<F>(self, mut f: F) -> StageResult<Payload>
    where
        F: FnMut(TelemetryDataPoint) -> StageResult<TelemetryDataPoint>,
    {
        Ok(match self {
            Payload::Single(point) => Payload::Single(f(point)?),
            Payload::Batch(points) => Payload::Batch(points.into_iter().map(&mut f).collect::<StageResult<_>>()?),
            Payload::Streams(streams) => Payload::Streams(
                streams
                    .into_iter()
                    .map(|(id, points)| {
                        let mapped = points.into_iter().map(&mut f).collect::<StageResult<Vec<_>>>()?;
                        Ok((id, mapped))
                    })
                    .collect::<StageResult<_>>()?,
            ),
        })
    }
}

/// Informational tag describing what a stage does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    Transformation,
    Aggregation,
    Filter,
    Interpolation,
    Validation,
    Enrichment,
}

/// Common error type for stage execution.
#[derive(thiserror::Error, Debug)]
pub enum StageError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("internal failure: {0}")]
    Internal(String),
}

pub type StageResult<T> = Result<T, StageError>;

/// Deserializes stage options into a typed struct.
pub fn parse_options<T: DeserializeOwned>(options: &Value) -> StageResult<T> {
    serde_json::from_value(options.clone()).map_err(|err| StageError::InvalidOptions(err.to_string()))
}

/// Pluggable unit of processing.
///
/// Stages are shared between concurrent calls, so mutable state lives behind
/// interior locks and every method takes `&self`.
#[async_trait]
pub trait ProcessingStage: Send + Sync {
    /// Unique registration key.
    fn name(&self) -> &str;
    fn stage_type(&self) -> StageType;
    fn input_types(&self) -> &[DataType];
    fn output_types(&self) -> &[DataType];

    async fn process(&self, input: Payload, context: &ProcessingContext) -> StageResult<Payload>;

    fn configure(&self, options: &Value) -> StageResult<()>;

    /// Clears per-stream state, overrides and metrics.
    fn reset(&self);

    fn recorder(&self) -> &MetricsRecorder;

    fn metrics(&self) -> StageMetrics {
        self.recorder().snapshot()
    }

    fn accepts(&self, data_type: DataType) -> bool {
        self.input_types().contains(&data_type)
    }
}
