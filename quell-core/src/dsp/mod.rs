//! Small signal helpers shared by the frame path, metrics and chunk finalization.

pub mod agc;

pub use agc::{AgcMetrics, AutomaticGainControl};

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq = samples.iter().map(|s| s * s).sum::<f32>();
    (sum_sq / samples.len() as f32).sqrt()
}

pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}

/// `max(0, (1 - out/in) * 100)`; zero when the input is silent.
pub fn reduction_percent(input_rms: f32, output_rms: f32) -> f32 {
    if input_rms <= f32::EPSILON {
        return 0.0;
    }
    ((1.0 - output_rms / input_rms) * 100.0).max(0.0)
}
