use super::validate_frame;
use crate::buffering::FRAME_SIZE;
use crate::error::{QuellError, Result};

/// Degraded-mode denoiser: attenuates samples below a fixed amplitude.
///
/// `|x| < threshold` becomes `x * attenuation`; everything else passes.
/// The VAD estimate is `clamp(mean(|x|) * 10, 0, 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmplitudeGate {
    pub threshold: f32,
    pub attenuation: f32,
}

impl Default for AmplitudeGate {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            attenuation: 0.1,
        }
    }
}

impl AmplitudeGate {
    pub fn process_into(&self, frame: &[f32], out: &mut [f32]) -> Result<f32> {
        validate_frame(frame)?;
        if out.len() < FRAME_SIZE {
            return Err(QuellError::AudioProcessing(format!(
                "output buffer too small: {} < {FRAME_SIZE}",
                out.len()
            )));
        }
        let mut sum = 0.0f32;
        for (o, &s) in out.iter_mut().zip(frame) {
            let mag = s.abs();
            sum += mag;
            *o = if mag < self.threshold {
                s * self.attenuation
            } else {
                s
            };
        }
        Ok((sum / FRAME_SIZE as f32 * 10.0).clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn quiet_samples_are_attenuated_loud_pass() {
        let mut frame = [0.005f32; FRAME_SIZE];
        frame[0] = 0.5;
        frame[1] = -0.02;
        let mut out = [0.0f32; FRAME_SIZE];
        AmplitudeGate::default().process_into(&frame, &mut out).unwrap();
        assert_relative_eq!(out[0], 0.5);
        assert_relative_eq!(out[1], -0.02);
        assert_relative_eq!(out[2], 0.0005, epsilon = 1e-9);
    }

    #[test]
    fn vad_tracks_mean_magnitude() {
        let gate = AmplitudeGate::default();
        let mut out = [0.0f32; FRAME_SIZE];
        let vad = gate.process_into(&[0.05; FRAME_SIZE], &mut out).unwrap();
        assert_relative_eq!(vad, 0.5, epsilon = 1e-5);
        let vad = gate.process_into(&[0.5; FRAME_SIZE], &mut out).unwrap();
        assert_eq!(vad, 1.0);
        let vad = gate.process_into(&[0.0; FRAME_SIZE], &mut out).unwrap();
        assert_eq!(vad, 0.0);
    }

    #[test]
    fn gate_validates_frames() {
        let mut out = [0.0f32; FRAME_SIZE];
        assert!(AmplitudeGate::default().process_into(&[0.0; 479], &mut out).is_err());
    }
}
