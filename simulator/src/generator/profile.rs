use anyhow::ensure;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use telemetrycore::{DataType, SampleValue, TelemetryDataPoint};

use crate::generator::template::sine_at;

/// Configuration for generating synthetic, deliberately irregular telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub samples: usize,
    pub sample_rate_hz: f64,
    pub data_type: DataType,
    pub frequency_hz: f64,
    pub amplitude: f64,
    pub noise: f64,
    /// Maximum timestamp jitter, in milliseconds.
    pub jitter_ms: i64,
    /// Chance that a sample starts a dropout.
    pub dropout_probability: f64,
    pub dropout_ms: i64,
    /// Chance that a sample is replaced by a non-finite reading.
    pub spike_probability: f64,
    pub seed: u64,
    pub start_timestamp: i64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            samples: 200,
            sample_rate_hz: 10.0,
            data_type: DataType::Numeric,
            frequency_hz: 0.2,
            amplitude: 1.0,
            noise: 0.05,
            jitter_ms: 5,
            dropout_probability: 0.02,
            dropout_ms: 800,
            spike_probability: 0.01,
            seed: 0,
            start_timestamp: 0,
        }
    }
}

impl GeneratorConfig {
    fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0,
            "sample_rate_hz must be positive"
        );
        ensure!(
            matches!(self.data_type, DataType::Numeric | DataType::Vector),
            "generator only produces numeric or vector samples"
        );
        Ok(())
    }
}

/// Builds one stream; `stream_index` offsets the seed and phase so streams differ.
pub fn build_stream(config: &GeneratorConfig, stream_index: usize) -> anyhow::Result<Vec<TelemetryDataPoint>> {
    config.validate()?;

    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(stream_index as u64));
    let interval_ms = 1000.0 / config.sample_rate_hz;
    let phase = stream_index as f64 * 0.5;
    let mut points = Vec::with_capacity(config.samples);
    let mut offset_ms = 0i64;

    for index in 0..config.samples {
        if config.dropout_probability > 0.0 && rng.gen_bool(config.dropout_probability.min(1.0)) {
            offset_ms += config.dropout_ms;
        }
        let jitter = if config.jitter_ms > 0 {
            rng.gen_range(-config.jitter_ms..=config.jitter_ms)
        } else {
            0
        };
        let timestamp =
            config.start_timestamp + (index as f64 * interval_ms).round() as i64 + offset_ms + jitter;
        let seconds = (timestamp - config.start_timestamp) as f64 / 1000.0;

        let mut reading = |channel: usize| {
            let base = config.amplitude * sine_at(seconds, config.frequency_hz, phase + channel as f64);
            let noise = if config.noise > 0.0 {
                rng.gen_range(-config.noise..config.noise)
            } else {
                0.0
            };
            base + noise
        };
        let mut value = match config.data_type {
            DataType::Vector => SampleValue::Vector((0..3).map(&mut reading).collect()),
            _ => SampleValue::Numeric(reading(0)),
        };
        if config.spike_probability > 0.0 && rng.gen_bool(config.spike_probability.min(1.0)) {
            value = SampleValue::Numeric(f64::NAN);
        }

        let quality = rng.gen_range(0.85..=1.0);
        points.push(
            TelemetryDataPoint::new(timestamp, value)
                .with_quality(quality)
                .with_metadata("sequence", index as u64),
        );
    }

    Ok(points)
}
