use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Read-only snapshot of a stage's accumulated counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub processed_count: u64,
    pub total_processing_time_ms: f64,
    pub average_processing_time_ms: f64,
    pub error_count: u64,
    pub last_processing_time_ms: f64,
    /// Samples per second of busy time.
    pub throughput: f64,
}

impl StageMetrics {
    /// Errors relative to successfully processed samples.
    pub fn error_rate(&self) -> f64 {
        if self.error_count == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.processed_count.max(1) as f64
    }
}

/// Thread-safe accumulator behind [`StageMetrics`].
pub struct MetricsRecorder {
    inner: Mutex<StageMetrics>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StageMetrics::default()),
        }
    }

    pub fn record_processed(&self, elapsed: Duration) {
        if let Ok(mut metrics) = self.inner.lock() {
            let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
            metrics.processed_count += 1;
            metrics.total_processing_time_ms += elapsed_ms;
            metrics.last_processing_time_ms = elapsed_ms;
            metrics.average_processing_time_ms =
                metrics.total_processing_time_ms / metrics.processed_count as f64;
            metrics.throughput = if metrics.total_processing_time_ms > 0.0 {
                metrics.processed_count as f64 / (metrics.total_processing_time_ms / 1000.0)
            } else {
                0.0
            };
        }
    }

    pub fn record_error(&self) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.error_count += 1;
        }
    }

    pub fn snapshot(&self) -> StageMetrics {
        if let Ok(metrics) = self.inner.lock() {
            metrics.clone()
        } else {
            StageMetrics::default()
        }
    }

    pub fn reset(&self) {
        if let Ok(mut metrics) = self.inner.lock() {
            *metrics = StageMetrics::default();
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}
