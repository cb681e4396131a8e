//! Streaming telemetry processing core.
//!
//! Raw, possibly irregular sensor and command samples flow through a pluggable
//! sequence of stages: per-type normalization, sliding-window statistics,
//! gap-filling interpolation and cross-stream time alignment. The
//! [`pipeline::TelemetryPipeline`] orchestrator owns the stage chain, enforces
//! per-stage timeouts and stream admission, and publishes metrics and events.

pub mod config;
pub mod events;
pub mod math;
pub mod pipeline;
pub mod prelude;
pub mod processing;
pub mod telemetry;

pub use config::PipelineConfig;
pub use events::PipelineEvent;
pub use pipeline::{PipelineError, PipelineMetrics, TelemetryPipeline};
pub use prelude::{DataType, Payload, ProcessingContext, ProcessingStage, SampleValue, TelemetryDataPoint};
