use std::sync::Arc;

use anyhow::{bail, Context};
use serde::Serialize;
use telemetrycore::processing::{
    InterpolationStage, TimeAlignmentStage, TransformationStage, WindowStage,
};
use telemetrycore::{
    DataType, Payload, PipelineConfig, PipelineMetrics, TelemetryDataPoint, TelemetryPipeline,
};

use crate::generator::profile::build_stream;
use crate::workflow::config::WorkflowConfig;

/// Per-stream outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub stream_id: String,
    pub generated: usize,
    pub processed: usize,
    pub failed: usize,
    pub interpolated: usize,
    pub aligned: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub streams: Vec<StreamSummary>,
    /// Streams refused by the admission limit.
    pub rejected_streams: Vec<String>,
    pub live_metrics: PipelineMetrics,
    pub fusion_metrics: PipelineMetrics,
}

/// Drives generated streams through a live pipeline (normalization and
/// windowing, one sample at a time) and then fuses the live outputs in a
/// second pipeline (gap filling and time alignment).
#[derive(Clone)]
pub struct Runner {
    config: WorkflowConfig,
}

impl Runner {
    pub fn new(config: WorkflowConfig) -> Self {
        Self { config }
    }

    fn build_pipelines(&self) -> anyhow::Result<(Arc<TelemetryPipeline>, Arc<TelemetryPipeline>)> {
        let pipeline_config: &PipelineConfig = &self.config.pipeline;

        let live = TelemetryPipeline::new(pipeline_config.clone());
        live.add_stage(Arc::new(TransformationStage::new()), None)
            .context("registering transformation stage")?;
        live.add_stage(
            Arc::new(WindowStage::with_default_size(pipeline_config.default_window_size)),
            None,
        )
        .context("registering window stage")?;

        let fusion = TelemetryPipeline::new(pipeline_config.clone());
        fusion
            .add_stage(Arc::new(InterpolationStage::from_config(pipeline_config)), None)
            .context("registering interpolation stage")?;
        fusion
            .add_stage(Arc::new(TimeAlignmentStage::from_config(pipeline_config)), None)
            .context("registering alignment stage")?;

        for (name, options) in &self.config.stage_options {
            let target = if live.find_stage(name).is_some() {
                &live
            } else if fusion.find_stage(name).is_some() {
                &fusion
            } else {
                bail!("stage_options names unknown stage '{}'", name);
            };
            target
                .configure_stage(name, options)
                .with_context(|| format!("configuring stage '{}'", name))?;
        }

        Ok((live, fusion))
    }

    pub async fn execute(&self) -> anyhow::Result<WorkflowResult> {
        self.config.validate()?;
        let (live, fusion) = self.build_pipelines()?;
        let data_type = self.config.generator.data_type;

        let mut rejected_streams = Vec::new();
        let mut tasks = Vec::new();
        for (index, stream_id) in self.config.streams.iter().enumerate() {
            if let Err(err) = live.start_stream(stream_id) {
                log::warn!("stream {} not admitted: {}", stream_id, err);
                rejected_streams.push(stream_id.clone());
                continue;
            }
            let samples = build_stream(&self.config.generator, index)
                .with_context(|| format!("generating stream {}", stream_id))?;
            let pipeline = live.clone();
            let stream_id = stream_id.clone();
            tasks.push(tokio::spawn(async move {
                let generated = samples.len();
                let result = pipeline.process_batch(&stream_id, samples, data_type).await;
                pipeline.stop_stream(&stream_id);
                (stream_id, generated, result)
            }));
        }

        let mut summaries = Vec::with_capacity(tasks.len());
        let mut fused_input = Vec::with_capacity(tasks.len());
        for task in tasks {
            let (stream_id, generated, result) = task.await.context("joining stream task")?;
            log::info!(
                "stream {}: {} processed, {} failed",
                stream_id,
                result.processed.len(),
                result.failed
            );
            summaries.push(StreamSummary {
                stream_id: stream_id.clone(),
                generated,
                processed: result.processed.len(),
                failed: result.failed,
                interpolated: 0,
                aligned: 0,
            });
            fused_input.push((stream_id, result.processed));
        }

        let context = fusion
            .context("fusion", data_type)
            .with_sample_rate(self.config.generator.sample_rate_hz);
        let fused = fusion
            .process_with_context(context, Payload::Streams(fused_input))
            .await
            .context("fusing streams")?
            .into_streams()
            .context("fusion returned an unexpected payload")?;

        for (stream_id, points) in &fused {
            if let Some(summary) = summaries.iter_mut().find(|s| &s.stream_id == stream_id) {
                summary.interpolated = count_flag(points, "interpolated");
                summary.aligned = count_flag(points, "aligned");
            }
        }

        let result = WorkflowResult {
            streams: summaries,
            rejected_streams,
            live_metrics: live.metrics(),
            fusion_metrics: fusion.metrics(),
        };
        live.destroy();
        fusion.destroy();
        Ok(result)
    }
}

fn count_flag(points: &[TelemetryDataPoint], key: &str) -> usize {
    points
        .iter()
        .filter(|point| point.meta(key).and_then(|v| v.as_bool()).unwrap_or(false))
        .count()
}
