use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::math::matrix::MatrixHelper;
use crate::math::stats::StatsHelper;
use crate::prelude::{
    parse_options, stream_key, DataType, Metadata, Payload, ProcessingContext, ProcessingStage,
    SampleValue, StageError, StageResult, StageType, TelemetryDataPoint,
};
use crate::processing::window_store::WindowStore;
use crate::telemetry::log::LogManager;
use crate::telemetry::metrics::MetricsRecorder;

pub const DEFAULT_WINDOW_SIZE: usize = 100;

/// Aggregate computed over a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowOperation {
    MovingAverage,
    Min,
    Max,
    Median,
    StdDev,
    RateOfChange,
}

impl WindowOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowOperation::MovingAverage => "moving_average",
            WindowOperation::Min => "min",
            WindowOperation::Max => "max",
            WindowOperation::Median => "median",
            WindowOperation::StdDev => "std_dev",
            WindowOperation::RateOfChange => "rate_of_change",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct WindowOptions {
    operations: HashMap<String, Vec<WindowOperation>>,
    window_sizes: HashMap<String, usize>,
    default_window_size: Option<usize>,
}

struct WindowState {
    store: WindowStore,
    operations: HashMap<String, Vec<WindowOperation>>,
    window_sizes: HashMap<String, usize>,
    /// Set through `configure`; outranks the size carried by the context.
    configured_window_size: Option<usize>,
    default_window_size: usize,
}

impl WindowState {
    fn new(default_window_size: usize) -> Self {
        Self {
            store: WindowStore::new(),
            operations: HashMap::new(),
            window_sizes: HashMap::new(),
            configured_window_size: None,
            default_window_size,
        }
    }

    fn capacity(&self, key: &str, context: &ProcessingContext) -> usize {
        self.window_sizes
            .get(key)
            .copied()
            .or(self.configured_window_size)
            .or(context.window_size)
            .unwrap_or(self.default_window_size)
    }

    fn operations(&self, key: &str) -> Vec<WindowOperation> {
        self.operations
            .get(key)
            .cloned()
            .unwrap_or_else(|| vec![WindowOperation::MovingAverage])
    }
}

/// Sliding-window statistics per `(stream, type)` key.
pub struct WindowStage {
    name: String,
    state: Mutex<WindowState>,
    metrics: MetricsRecorder,
    logger: LogManager,
}

impl WindowStage {
    pub fn new() -> Self {
        Self::with_default_size(DEFAULT_WINDOW_SIZE)
    }

    pub fn with_default_size(default_window_size: usize) -> Self {
        Self {
            name: "window".to_string(),
            state: Mutex::new(WindowState::new(default_window_size.max(1))),
            metrics: MetricsRecorder::new(),
            logger: LogManager::new("window"),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Current length of the window held for `key` (`stream:type`).
    pub fn window_len(&self, key: &str) -> usize {
        self.state.lock().map_or(0, |state| state.store.len(key))
    }

    fn lock(&self) -> StageResult<std::sync::MutexGuard<'_, WindowState>> {
        self.state
            .lock()
            .map_err(|_| StageError::Internal("window state poisoned".into()))
    }

    fn push_and_compute(
        state: &mut WindowState,
        key: &str,
        point: TelemetryDataPoint,
        context: &ProcessingContext,
    ) -> TelemetryDataPoint {
        let capacity = state.capacity(key, context);
        let operations = state.operations(key);
        let timestamp = point.timestamp;
        let quality = point.quality;
        let mut metadata = point.metadata.clone();

        let window = state.store.push(key, point, capacity);
        let value = compute_window(window, context.data_type, &operations);

        metadata.insert("derived".into(), Value::Bool(true));
        metadata.insert("window_length".into(), Value::from(window.len()));
        metadata.insert(
            "operations".into(),
            Value::from(operations.iter().map(|op| op.as_str()).collect::<Vec<_>>()),
        );

        TelemetryDataPoint {
            timestamp,
            value,
            quality,
            metadata,
        }
    }
}

impl Default for WindowStage {
    fn default() -> Self {
        Self::new()
    }
}

fn window_rows(window: &VecDeque<TelemetryDataPoint>) -> Vec<Vec<f64>> {
    window
        .iter()
        .map(|point| {
            point
                .value
                .as_row()
                .unwrap_or_default()
                .into_iter()
                .map(StatsHelper::sanitize)
                .collect()
        })
        .collect()
}

fn rate_of_change(window: &VecDeque<TelemetryDataPoint>, rows: &[Vec<f64>], width: usize) -> Vec<f64> {
    let (Some(first), Some(last)) = (window.front(), window.back()) else {
        return vec![0.0; width];
    };
    let seconds = (last.timestamp - first.timestamp) as f64 / 1000.0;
    if window.len() < 2 || seconds == 0.0 {
        return vec![0.0; width];
    }
    let (first_row, last_row) = (&rows[0], &rows[rows.len() - 1]);
    (0..width)
        .map(|i| (last_row[i] - first_row[i]) / seconds)
        .collect()
}

fn compute_window(
    window: &VecDeque<TelemetryDataPoint>,
    data_type: DataType,
    operations: &[WindowOperation],
) -> SampleValue {
    let rows = window_rows(window);
    let matrix = MatrixHelper::from_rows(&rows);
    let width = matrix.ncols();

    let shaped = |columns: Vec<f64>| match data_type {
        DataType::Vector => SampleValue::Vector(columns),
        _ => SampleValue::Numeric(columns.first().copied().unwrap_or(0.0)),
    };

    let results: Vec<(WindowOperation, SampleValue)> = operations
        .iter()
        .map(|op| {
            let columns = match op {
                WindowOperation::MovingAverage => MatrixHelper::reduce_columns(&matrix, StatsHelper::mean),
                WindowOperation::Min => MatrixHelper::reduce_columns(&matrix, StatsHelper::min),
                WindowOperation::Max => MatrixHelper::reduce_columns(&matrix, StatsHelper::max),
                WindowOperation::Median => MatrixHelper::reduce_columns(&matrix, StatsHelper::median),
                WindowOperation::StdDev => {
                    MatrixHelper::reduce_columns(&matrix, StatsHelper::population_std_dev)
                }
                WindowOperation::RateOfChange => rate_of_change(window, &rows, width),
            };
            (*op, shaped(columns))
        })
        .collect();

    if results.len() == 1 {
        return results.into_iter().next().map(|(_, v)| v).unwrap_or(SampleValue::Null);
    }

    let mut keyed = Metadata::new();
    for (op, value) in results {
        keyed.insert(
            op.as_str().to_string(),
            serde_json::to_value(value).unwrap_or(Value::Null),
        );
    }
    SampleValue::Object(keyed)
}

#[async_trait]
impl ProcessingStage for WindowStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage_type(&self) -> StageType {
        StageType::Aggregation
    }

    fn input_types(&self) -> &[DataType] {
        &[DataType::Numeric, DataType::Vector]
    }

    fn output_types(&self) -> &[DataType] {
        &[DataType::Numeric, DataType::Vector, DataType::Object]
    }

    async fn process(&self, input: Payload, context: &ProcessingContext) -> StageResult<Payload> {
        let mut state = self.lock()?;
        let output = match input {
            Payload::Single(point) => {
                let key = context.stream_key();
                Payload::Single(Self::push_and_compute(&mut state, &key, point, context))
            }
            Payload::Batch(points) => {
                let key = context.stream_key();
                Payload::Batch(
                    points
                        .into_iter()
                        .map(|point| Self::push_and_compute(&mut state, &key, point, context))
                        .collect(),
                )
            }
            Payload::Streams(streams) => Payload::Streams(
                streams
                    .into_iter()
                    .map(|(stream_id, points)| {
                        let key = stream_key(&stream_id, context.data_type);
                        let derived = points
                            .into_iter()
                            .map(|point| Self::push_and_compute(&mut state, &key, point, context))
                            .collect();
                        (stream_id, derived)
                    })
                    .collect(),
            ),
        };
        Ok(output)
    }

    fn configure(&self, options: &Value) -> StageResult<()> {
        let options: WindowOptions = parse_options(options)?;
        if let Some((key, _)) = options.operations.iter().find(|(_, ops)| ops.is_empty()) {
            return Err(StageError::InvalidOptions(format!("no operations for {}", key)));
        }
        if let Some((key, _)) = options.window_sizes.iter().find(|(_, size)| **size == 0) {
            return Err(StageError::InvalidOptions(format!("zero window size for {}", key)));
        }
        if options.default_window_size == Some(0) {
            return Err(StageError::InvalidOptions("zero default window size".into()));
        }

        let mut state = self.lock()?;
        if let Some(size) = options.default_window_size {
            state.configured_window_size = Some(size);
        }
        state.operations.extend(options.operations);
        state.window_sizes.extend(options.window_sizes);
        self.logger.debug(&format!(
            "{} operation overrides, {} window size overrides",
            state.operations.len(),
            state.window_sizes.len()
        ));
        Ok(())
    }

    fn reset(&self) {
        if let Ok(mut state) = self.state.lock() {
            self.logger
                .debug(&format!("dropping {} windows", state.store.key_count()));
            state.store.reset();
            state.operations.clear();
            state.window_sizes.clear();
            state.configured_window_size = None;
        }
        self.metrics.reset();
    }

    fn recorder(&self) -> &MetricsRecorder {
        &self.metrics
    }
}
