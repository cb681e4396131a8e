//! Pipeline orchestrator.
//!
//! Owns the ordered stage registry and the active-stream set, runs samples
//! through every stage whose input types include the declared [`DataType`],
//! wraps each stage call in a timeout, and reports metrics and lifecycle events
//! through the [`EventBus`].

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::PipelineConfig;
use crate::events::{EventBus, PipelineEvent};
use crate::prelude::{
    DataType, Payload, ProcessingContext, ProcessingStage, StageError, TelemetryDataPoint,
};
use crate::processing::{InterpolationStage, TimeAlignmentStage, TransformationStage, WindowStage};
use crate::telemetry::log::LogManager;
use crate::telemetry::metrics::StageMetrics;

/// Average stage latency above which a stage is flagged.
pub const BOTTLENECK_AVERAGE_MS: f64 = 100.0;
/// Error rate above which a stage is flagged.
pub const BOTTLENECK_ERROR_RATE: f64 = 0.1;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },
    #[error("stage '{stage}' timed out after {timeout_ms} ms")]
    Timeout { stage: String, timeout_ms: u64 },
    #[error("stage '{0}' is already registered")]
    DuplicateStage(String),
    #[error("stage '{0}' not found")]
    StageNotFound(String),
    #[error("stream limit reached ({max} concurrent streams)")]
    StreamLimit { max: usize },
    #[error("stage chain produced a {found} payload where {expected} was expected")]
    UnexpectedPayload {
        expected: &'static str,
        found: &'static str,
    },
    #[error("pipeline has been destroyed")]
    Destroyed,
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Aggregate view returned by [`TelemetryPipeline::metrics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineMetrics {
    pub total_processed: u64,
    pub total_errors: u64,
    /// Samples per second since start or the last reset.
    pub throughput: f64,
    pub active_streams: usize,
    pub memory_usage_mb: Option<f64>,
    pub memory_pressure: bool,
    pub bottlenecks: Vec<String>,
    pub stages: BTreeMap<String, StageMetrics>,
}

/// Outcome of [`TelemetryPipeline::process_batch`]; failed items are skipped.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub processed: Vec<TelemetryDataPoint>,
    pub failed: usize,
}

pub struct TelemetryPipeline {
    config: PipelineConfig,
    stages: RwLock<Vec<Arc<dyn ProcessingStage>>>,
    active_streams: Mutex<HashSet<String>>,
    total_processed: AtomicU64,
    total_errors: AtomicU64,
    counting_since: Mutex<Instant>,
    events: EventBus,
    monitor: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
    logger: LogManager,
}

impl TelemetryPipeline {
    /// Creates an empty pipeline. The performance monitor starts when enabled
    /// and a tokio runtime is available.
    pub fn new(config: PipelineConfig) -> Arc<Self> {
        let pipeline = Arc::new(Self {
            config,
            stages: RwLock::new(Vec::new()),
            active_streams: Mutex::new(HashSet::new()),
            total_processed: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            counting_since: Mutex::new(Instant::now()),
            events: EventBus::default(),
            monitor: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            logger: LogManager::new("pipeline"),
        });
        if pipeline.config.enable_performance_monitoring {
            pipeline.start_monitoring();
        }
        pipeline
    }

    /// Pipeline with transformation, window, interpolation and alignment stages, in that order.
    pub fn with_default_stages(config: PipelineConfig) -> PipelineResult<Arc<Self>> {
        let window = WindowStage::with_default_size(config.default_window_size);
        let interpolation = InterpolationStage::from_config(&config);
        let alignment = TimeAlignmentStage::from_config(&config);
        let pipeline = Self::new(config);
        pipeline.add_stage(Arc::new(TransformationStage::new()), None)?;
        pipeline.add_stage(Arc::new(window), None)?;
        pipeline.add_stage(Arc::new(interpolation), None)?;
        pipeline.add_stage(Arc::new(alignment), None)?;
        Ok(pipeline)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> PipelineResult<()> {
        if self.is_destroyed() {
            Err(PipelineError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Registers `stage` at `position`, or appends it.
    pub fn add_stage(
        &self,
        stage: Arc<dyn ProcessingStage>,
        position: Option<usize>,
    ) -> PipelineResult<()> {
        self.ensure_alive()?;
        let name = stage.name().to_string();
        {
            let mut stages = self.stages.write().unwrap_or_else(|e| e.into_inner());
            if stages.iter().any(|existing| existing.name() == name) {
                return Err(PipelineError::DuplicateStage(name));
            }
            let index = position.map_or(stages.len(), |p| p.min(stages.len()));
            stages.insert(index, stage);
        }
        self.logger.record(&format!("stage '{}' added", name));
        self.events.emit(PipelineEvent::StageAdded { name });
        Ok(())
    }

    pub fn remove_stage(&self, name: &str) -> PipelineResult<Arc<dyn ProcessingStage>> {
        let removed = {
            let mut stages = self.stages.write().unwrap_or_else(|e| e.into_inner());
            let index = stages
                .iter()
                .position(|stage| stage.name() == name)
                .ok_or_else(|| PipelineError::StageNotFound(name.to_string()))?;
            stages.remove(index)
        };
        self.logger.record(&format!("stage '{}' removed", name));
        self.events.emit(PipelineEvent::StageRemoved {
            name: name.to_string(),
        });
        Ok(removed)
    }

    pub fn configure_stage(&self, name: &str, options: &Value) -> PipelineResult<()> {
        let stage = self
            .find_stage(name)
            .ok_or_else(|| PipelineError::StageNotFound(name.to_string()))?;
        stage.configure(options).map_err(|source| PipelineError::Stage {
            stage: name.to_string(),
            source,
        })
    }

    pub fn find_stage(&self, name: &str) -> Option<Arc<dyn ProcessingStage>> {
        self.stages
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|stage| stage.name() == name)
            .cloned()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|stage| stage.name().to_string())
            .collect()
    }

    fn stage_snapshot(&self) -> Vec<Arc<dyn ProcessingStage>> {
        self.stages.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Admits a stream; fails once `max_concurrent_streams` are active.
    pub fn start_stream(&self, stream_id: &str) -> PipelineResult<()> {
        self.ensure_alive()?;
        {
            let mut active = self.active_streams.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains(stream_id) {
                return Ok(());
            }
            if active.len() >= self.config.max_concurrent_streams {
                return Err(PipelineError::StreamLimit {
                    max: self.config.max_concurrent_streams,
                });
            }
            active.insert(stream_id.to_string());
        }
        self.events.emit(PipelineEvent::PipelineStarted {
            stream_id: stream_id.to_string(),
        });
        Ok(())
    }

    /// Returns whether the stream was active.
    pub fn stop_stream(&self, stream_id: &str) -> bool {
        let removed = self
            .active_streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(stream_id);
        if removed {
            self.events.emit(PipelineEvent::PipelineStopped {
                stream_id: stream_id.to_string(),
            });
        }
        removed
    }

    pub fn active_streams(&self) -> Vec<String> {
        let mut streams: Vec<String> = self
            .active_streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        streams.sort();
        streams
    }

    fn mark_active(&self, stream_id: &str) {
        let mut active = self.active_streams.lock().unwrap_or_else(|e| e.into_inner());
        if !active.contains(stream_id) {
            active.insert(stream_id.to_string());
        }
    }

    /// Context for one call, seeded from the pipeline configuration.
    pub fn context(&self, stream_id: &str, data_type: DataType) -> ProcessingContext {
        ProcessingContext::new(stream_id, data_type).with_window_size(self.config.default_window_size)
    }

    pub async fn process_single(
        &self,
        stream_id: &str,
        sample: TelemetryDataPoint,
        data_type: DataType,
    ) -> PipelineResult<TelemetryDataPoint> {
        let output = self
            .process_payload(stream_id, Payload::Single(sample), data_type)
            .await?;
        let found = output.kind();
        output.into_single().ok_or(PipelineError::UnexpectedPayload {
            expected: "single",
            found,
        })
    }

    /// Runs each sample through [`Self::process_single`]; failures are logged and skipped.
    pub async fn process_batch(
        &self,
        stream_id: &str,
        samples: Vec<TelemetryDataPoint>,
        data_type: DataType,
    ) -> BatchResult {
        let mut result = BatchResult {
            processed: Vec::with_capacity(samples.len()),
            failed: 0,
        };
        for sample in samples {
            let timestamp = sample.timestamp;
            match self.process_single(stream_id, sample, data_type).await {
                Ok(point) => result.processed.push(point),
                Err(err) => {
                    result.failed += 1;
                    self.logger.warn(&format!(
                        "{}: skipping sample at {}: {}",
                        stream_id, timestamp, err
                    ));
                }
            }
        }
        result
    }

    pub async fn process_payload(
        &self,
        stream_id: &str,
        input: Payload,
        data_type: DataType,
    ) -> PipelineResult<Payload> {
        let context = self.context(stream_id, data_type);
        self.process_with_context(context, input).await
    }

    /// Runs `input` through every matching stage in registration order.
    pub async fn process_with_context(
        &self,
        context: ProcessingContext,
        input: Payload,
    ) -> PipelineResult<Payload> {
        self.ensure_alive()?;
        self.mark_active(&context.stream_id);

        let sample_count = input.len() as u64;
        let timeout = self.config.processing_timeout();
        let mut current = input;

        for stage in self.stage_snapshot() {
            if !stage.accepts(context.data_type) {
                continue;
            }
            let started = Instant::now();
            match tokio::time::timeout(timeout, stage.process(current, &context)).await {
                Ok(Ok(output)) => {
                    stage.recorder().record_processed(started.elapsed());
                    self.events.emit_with(|| PipelineEvent::DataProcessed {
                        stream_id: context.stream_id.clone(),
                        stage: stage.name().to_string(),
                        output: output.clone(),
                    });
                    current = output;
                }
                Ok(Err(source)) => {
                    stage.recorder().record_error();
                    return Err(self.fail(
                        &context.stream_id,
                        PipelineError::Stage {
                            stage: stage.name().to_string(),
                            source,
                        },
                    ));
                }
                Err(_) => {
                    stage.recorder().record_error();
                    return Err(self.fail(
                        &context.stream_id,
                        PipelineError::Timeout {
                            stage: stage.name().to_string(),
                            timeout_ms: self.config.processing_timeout_ms,
                        },
                    ));
                }
            }
        }

        self.total_processed.fetch_add(sample_count, Ordering::Relaxed);
        Ok(current)
    }

    fn fail(&self, stream_id: &str, error: PipelineError) -> PipelineError {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        let stage = match &error {
            PipelineError::Stage { stage, .. } | PipelineError::Timeout { stage, .. } => {
                Some(stage.clone())
            }
            _ => None,
        };
        self.logger.error(&format!("{}: {}", stream_id, error));
        self.events.emit(PipelineEvent::DataError {
            stream_id: stream_id.to_string(),
            stage,
            error: error.to_string(),
        });
        error
    }

    pub fn metrics(&self) -> PipelineMetrics {
        let stages: BTreeMap<String, StageMetrics> = self
            .stage_snapshot()
            .iter()
            .map(|stage| (stage.name().to_string(), stage.metrics()))
            .collect();

        let total_processed = self.total_processed.load(Ordering::Relaxed);
        let elapsed = self
            .counting_since
            .lock()
            .map(|since| since.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let throughput = if elapsed > 0.0 {
            total_processed as f64 / elapsed
        } else {
            0.0
        };

        let memory_usage_mb = resident_memory_mb();
        let memory_pressure = memory_usage_mb.is_some_and(|usage| usage > self.config.memory_limit_mb);

        PipelineMetrics {
            total_processed,
            total_errors: self.total_errors.load(Ordering::Relaxed),
            throughput,
            active_streams: self.active_streams.lock().map_or(0, |active| active.len()),
            memory_usage_mb,
            memory_pressure,
            bottlenecks: find_bottlenecks(&stages),
            stages,
        }
    }

    /// One monitoring tick: snapshot metrics, flag bottlenecks and memory pressure, emit events.
    pub fn check_performance(&self) -> PipelineMetrics {
        let metrics = self.metrics();
        for bottleneck in &metrics.bottlenecks {
            self.logger.warn(&format!("bottleneck: {}", bottleneck));
        }
        if let (true, Some(usage)) = (metrics.memory_pressure, metrics.memory_usage_mb) {
            self.logger.warn(&format!(
                "memory usage {:.1} MB exceeds limit {:.1} MB",
                usage, self.config.memory_limit_mb
            ));
            self.events.emit(PipelineEvent::MemoryWarning {
                usage_mb: usage,
                limit_mb: self.config.memory_limit_mb,
            });
        }
        self.events
            .emit(PipelineEvent::PerformanceUpdate(metrics.clone()));
        metrics
    }

    /// Zeroes pipeline counters and resets every stage, dropping its per-stream state.
    pub fn reset_metrics(&self) {
        self.total_processed.store(0, Ordering::Relaxed);
        self.total_errors.store(0, Ordering::Relaxed);
        if let Ok(mut since) = self.counting_since.lock() {
            *since = Instant::now();
        }
        for stage in self.stage_snapshot() {
            stage.reset();
        }
        self.logger.debug("metrics reset");
    }

    fn start_monitoring(self: &Arc<Self>) {
        let Ok(handle) = Handle::try_current() else {
            self.logger
                .debug("no tokio runtime available, performance monitor not started");
            return;
        };
        let weak = Arc::downgrade(self);
        let period = self.config.monitor_interval();
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pipeline) = weak.upgrade() else {
                    break;
                };
                if pipeline.is_destroyed() {
                    break;
                }
                pipeline.check_performance();
            }
        });
        if let Ok(mut monitor) = self.monitor.lock() {
            *monitor = Some(task);
        }
    }

    /// Stops monitoring, clears stages and streams, detaches listeners. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.monitor.lock().ok().and_then(|mut m| m.take()) {
            task.abort();
        }
        self.stages.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.active_streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.events.close();
        self.logger.record("pipeline destroyed");
    }
}

impl Drop for TelemetryPipeline {
    fn drop(&mut self) {
        if let Some(task) = self.monitor.get_mut().ok().and_then(Option::take) {
            task.abort();
        }
    }
}

fn find_bottlenecks(stages: &BTreeMap<String, StageMetrics>) -> Vec<String> {
    let mut bottlenecks = Vec::new();
    for (name, metrics) in stages {
        if metrics.average_processing_time_ms > BOTTLENECK_AVERAGE_MS {
            bottlenecks.push(format!(
                "{}: average processing time {:.1} ms",
                name, metrics.average_processing_time_ms
            ));
        }
        if metrics.error_rate() > BOTTLENECK_ERROR_RATE {
            bottlenecks.push(format!(
                "{}: error rate {:.1}%",
                name,
                metrics.error_rate() * 100.0
            ));
        }
    }
    bottlenecks
}

/// Resident set size from the `VmRSS` line of `/proc/self/status`, reported in kB.
#[cfg(target_os = "linux")]
fn resident_memory_mb() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let kb: f64 = status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))?
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kb / 1024.0)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_mb() -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::{SampleValue, StageResult, StageType};
    use crate::telemetry::metrics::MetricsRecorder;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Tags numeric samples; fails on a sentinel value; optionally sleeps.
    struct ProbeStage {
        name: String,
        delay: Option<Duration>,
        metrics: MetricsRecorder,
    }

    impl ProbeStage {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                delay: None,
                metrics: MetricsRecorder::new(),
            }
        }

        fn sleeping(name: &str, delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::new(name)
            }
        }
    }

    #[async_trait]
    impl ProcessingStage for ProbeStage {
        fn name(&self) -> &str {
            &self.name
        }

        fn stage_type(&self) -> StageType {
            StageType::Enrichment
        }

        fn input_types(&self) -> &[DataType] {
            &[DataType::Numeric]
        }

        fn output_types(&self) -> &[DataType] {
            &[DataType::Numeric]
        }

        async fn process(&self, input: Payload, _context: &ProcessingContext) -> StageResult<Payload> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            input.map_points(|mut point| {
                if point.value == SampleValue::Numeric(-999.0) {
                    return Err(StageError::InvalidInput("sentinel value".into()));
                }
                point.set_meta(&self.name, true);
                Ok(point)
            })
        }

        fn configure(&self, _options: &Value) -> StageResult<()> {
            Ok(())
        }

        fn reset(&self) {
            self.metrics.reset();
        }

        fn recorder(&self) -> &MetricsRecorder {
            &self.metrics
        }
    }

    fn quiet_config() -> PipelineConfig {
        PipelineConfig {
            enable_performance_monitoring: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stages_run_in_registration_order() {
        let pipeline = TelemetryPipeline::new(quiet_config());
        pipeline.add_stage(Arc::new(ProbeStage::new("b")), None).unwrap();
        pipeline.add_stage(Arc::new(ProbeStage::new("a")), Some(0)).unwrap();
        assert_eq!(pipeline.stage_names(), vec!["a", "b"]);

        let out = pipeline
            .process_single("s1", TelemetryDataPoint::numeric(0, 1.0), DataType::Numeric)
            .await
            .unwrap();
        assert_eq!(out.meta("a"), Some(&json!(true)));
        assert_eq!(out.meta("b"), Some(&json!(true)));
        assert_eq!(pipeline.metrics().total_processed, 1);
        assert_eq!(pipeline.metrics().stages["a"].processed_count, 1);
    }

    #[tokio::test]
    async fn registration_errors_are_reported() {
        let pipeline = TelemetryPipeline::new(quiet_config());
        pipeline.add_stage(Arc::new(ProbeStage::new("a")), None).unwrap();
        assert!(matches!(
            pipeline.add_stage(Arc::new(ProbeStage::new("a")), None),
            Err(PipelineError::DuplicateStage(_))
        ));
        assert!(matches!(
            pipeline.remove_stage("missing"),
            Err(PipelineError::StageNotFound(_))
        ));
        assert!(matches!(
            pipeline.configure_stage("missing", &json!({})),
            Err(PipelineError::StageNotFound(_))
        ));
        assert!(pipeline.remove_stage("a").is_ok());
        assert!(pipeline.stage_names().is_empty());
    }

    #[tokio::test]
    async fn non_matching_stages_are_skipped() {
        let pipeline = TelemetryPipeline::new(quiet_config());
        pipeline.add_stage(Arc::new(ProbeStage::new("numeric_only")), None).unwrap();
        let sample = TelemetryDataPoint::new(0, SampleValue::Vector(vec![1.0, 2.0]));
        let out = pipeline
            .process_single("imu", sample.clone(), DataType::Vector)
            .await
            .unwrap();
        assert_eq!(out, sample);
        assert_eq!(pipeline.metrics().stages["numeric_only"].processed_count, 0);
    }

    #[tokio::test]
    async fn stage_errors_propagate_and_emit_events() {
        let pipeline = TelemetryPipeline::new(quiet_config());
        pipeline.add_stage(Arc::new(ProbeStage::new("probe")), None).unwrap();
        let mut events = pipeline.subscribe();

        let err = pipeline
            .process_single("s1", TelemetryDataPoint::numeric(0, -999.0), DataType::Numeric)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Stage { ref stage, .. } if stage == "probe"));

        match events.recv().await.unwrap() {
            PipelineEvent::DataError { stream_id, stage, .. } => {
                assert_eq!(stream_id, "s1");
                assert_eq!(stage.as_deref(), Some("probe"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        let metrics = pipeline.metrics();
        assert_eq!(metrics.total_errors, 1);
        assert_eq!(metrics.stages["probe"].error_count, 1);
        assert!(!metrics.bottlenecks.is_empty());
    }

    #[tokio::test]
    async fn batch_skips_failed_items() {
        let pipeline = TelemetryPipeline::new(quiet_config());
        pipeline.add_stage(Arc::new(ProbeStage::new("probe")), None).unwrap();
        let samples = vec![
            TelemetryDataPoint::numeric(0, 1.0),
            TelemetryDataPoint::numeric(1, -999.0),
            TelemetryDataPoint::numeric(2, 3.0),
        ];
        let result = pipeline.process_batch("s1", samples, DataType::Numeric).await;
        assert_eq!(result.failed, 1);
        let timestamps: Vec<i64> = result.processed.iter().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, vec![0, 2]);
    }

    #[tokio::test]
    async fn slow_stage_times_out_with_its_name() {
        let pipeline = TelemetryPipeline::new(PipelineConfig {
            processing_timeout_ms: 20,
            ..quiet_config()
        });
        pipeline
            .add_stage(
                Arc::new(ProbeStage::sleeping("sluggish", Duration::from_millis(500))),
                None,
            )
            .unwrap();
        let err = pipeline
            .process_single("s1", TelemetryDataPoint::numeric(0, 1.0), DataType::Numeric)
            .await
            .unwrap_err();
        match err {
            PipelineError::Timeout { stage, timeout_ms } => {
                assert_eq!(stage, "sluggish");
                assert_eq!(timeout_ms, 20);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn admission_control_caps_active_streams() {
        let pipeline = TelemetryPipeline::new(PipelineConfig {
            max_concurrent_streams: 2,
            ..quiet_config()
        });
        pipeline.start_stream("a").unwrap();
        pipeline.start_stream("b").unwrap();
        pipeline.start_stream("a").unwrap();
        assert!(matches!(
            pipeline.start_stream("c"),
            Err(PipelineError::StreamLimit { max: 2 })
        ));
        assert_eq!(pipeline.active_streams(), vec!["a", "b"]);

        assert!(pipeline.stop_stream("a"));
        assert!(!pipeline.stop_stream("a"));
        pipeline.start_stream("c").unwrap();
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_detaches_listeners() {
        let pipeline = TelemetryPipeline::new(quiet_config());
        pipeline.add_stage(Arc::new(ProbeStage::new("probe")), None).unwrap();
        let mut events = pipeline.subscribe();
        pipeline.destroy();
        pipeline.destroy();

        assert!(pipeline.is_destroyed());
        assert!(pipeline.stage_names().is_empty());
        assert!(matches!(
            pipeline
                .process_single("s1", TelemetryDataPoint::numeric(0, 1.0), DataType::Numeric)
                .await,
            Err(PipelineError::Destroyed)
        ));
        assert!(matches!(
            events.recv().await,
            Err(tokio::sync::broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn monitor_publishes_performance_updates() {
        let pipeline = TelemetryPipeline::new(PipelineConfig {
            monitor_interval_ms: 10,
            ..Default::default()
        });
        let mut events = pipeline.subscribe();
        let update = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(PipelineEvent::PerformanceUpdate(metrics)) = events.recv().await {
                    return metrics;
                }
            }
        })
        .await
        .expect("monitor tick");
        assert_eq!(update.total_processed, 0);
        pipeline.destroy();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn memory_pressure_emits_warning() {
        let pipeline = TelemetryPipeline::new(PipelineConfig {
            memory_limit_mb: 0.0,
            ..quiet_config()
        });
        let mut events = pipeline.subscribe();
        let metrics = pipeline.check_performance();
        assert!(metrics.memory_pressure);
        let usage = metrics.memory_usage_mb.unwrap();
        assert!(usage > 0.0);

        match events.try_recv().unwrap() {
            PipelineEvent::MemoryWarning { usage_mb, limit_mb } => {
                assert!(usage_mb > 0.0);
                assert_eq!(limit_mb, 0.0);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            events.try_recv(),
            Ok(PipelineEvent::PerformanceUpdate(update)) if update.memory_pressure
        ));
    }

    #[test]
    fn monitor_needs_a_runtime() {
        let pipeline = TelemetryPipeline::new(PipelineConfig::default());
        assert!(pipeline.monitor.lock().unwrap().is_none());
    }

    #[test]
    fn bottlenecks_flag_slow_and_failing_stages() {
        let mut stages = BTreeMap::new();
        stages.insert(
            "slow".to_string(),
            StageMetrics {
                processed_count: 10,
                average_processing_time_ms: 150.0,
                ..Default::default()
            },
        );
        stages.insert(
            "flaky".to_string(),
            StageMetrics {
                processed_count: 10,
                error_count: 2,
                ..Default::default()
            },
        );
        stages.insert(
            "fine".to_string(),
            StageMetrics {
                processed_count: 10,
                error_count: 1,
                average_processing_time_ms: 1.0,
                ..Default::default()
            },
        );
        let flagged = find_bottlenecks(&stages);
        assert_eq!(flagged.len(), 2);
        assert!(flagged.iter().any(|b| b.starts_with("slow")));
        assert!(flagged.iter().any(|b| b.starts_with("flaky")));
    }
}
