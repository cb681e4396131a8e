use std::f64::consts::PI;

/// Sine waveform value at `seconds` for the given frequency and phase.
pub fn sine_at(seconds: f64, frequency_hz: f64, phase: f64) -> f64 {
    (2.0 * PI * frequency_hz * seconds + phase).sin()
}
