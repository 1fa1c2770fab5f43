//! Sample-rate conversion to the 48 kHz pipeline rate.
//!
//! ## Design
//!
//! Two paths exist:
//!
//! - [`RateConverter`]: streaming rubato `FastFixedIn` converter for live
//!   capture, where the device rate (commonly 44.1 kHz) differs from 48 kHz.
//!   When capture rate == 48 kHz no rubato session is created at all.
//! - [`resample`]: whole-buffer linear interpolation for file ingestion and
//!   chunk reprocessing. Output length is `round(len * to / from)`.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{info, warn};

use crate::error::{QuellError, Result};

/// Streaming mono converter from a capture rate to the pipeline rate.
pub struct RateConverter {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
    block: usize,
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// `block` is the number of input samples handed to rubato per call.
    ///
    /// # Errors
    /// `QuellError::Validation` for a zero rate, `QuellError::AudioContext`
    /// when rubato rejects the ratio.
    pub fn new(from_rate: u32, to_rate: u32, block: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                inner: None,
                pending: Vec::new(),
                block,
                scratch: Vec::new(),
            });
        }
        if from_rate == 0 || to_rate == 0 {
            return Err(QuellError::Validation(format!(
                "cannot resample {from_rate} Hz -> {to_rate} Hz"
            )));
        }

        let inner = FastFixedIn::<f32>::new(
            f64::from(to_rate) / f64::from(from_rate),
            1.0,
            PolynomialDegree::Cubic,
            block,
            1,
        )
        .map_err(|e| QuellError::AudioContext(format!("resampler init: {e}")))?;
        let scratch = vec![vec![0.0; inner.output_frames_max()]];
        info!(from_rate, to_rate, block, "capture resampling enabled");

        Ok(Self {
            inner: Some(inner),
            pending: Vec::with_capacity(block * 2),
            block,
            scratch,
        })
    }

    /// Append converted samples to `out`.
    ///
    /// Input is buffered until a whole block is available; a passthrough
    /// converter copies straight through.
    pub fn process_into(&mut self, samples: &[f32], out: &mut Vec<f32>) {
        let Some(inner) = self.inner.as_mut() else {
            out.extend_from_slice(samples);
            return;
        };

        self.pending.extend_from_slice(samples);
        let mut consumed = 0;
        while self.pending.len() - consumed >= self.block {
            let block = &self.pending[consumed..consumed + self.block];
            match inner.process_into_buffer(&[block], &mut self.scratch, None) {
                Ok((_, produced)) => out.extend_from_slice(&self.scratch[0][..produced]),
                Err(e) => warn!(error = %e, "resampler dropped a block"),
            }
            consumed += self.block;
        }
        self.pending.drain(..consumed);
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }
}

/// Linear-interpolation resample of a whole buffer.
///
/// # Errors
/// `QuellError::Validation` when either rate is zero.
pub fn resample(pcm: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == 0 || to_rate == 0 {
        return Err(QuellError::Validation(format!(
            "invalid sample rate: {from_rate} Hz -> {to_rate} Hz"
        )));
    }
    if from_rate == to_rate || pcm.is_empty() {
        return Ok(pcm.to_vec());
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (pcm.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;
    let last = pcm.len() - 1;

    let out = (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let a = pcm[idx];
            let b = pcm[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_rates_copy_through() {
        let mut rc = RateConverter::new(48_000, 48_000, 960).unwrap();
        assert!(rc.is_passthrough());
        let block = [0.25f32, -0.5, 0.75];
        let mut out = Vec::new();
        rc.process_into(&block, &mut out);
        assert_eq!(out, block);
    }

    #[test]
    fn block_of_44k1_yields_about_one_block_of_48k() {
        let mut rc = RateConverter::new(44_100, 48_000, 882).unwrap();
        assert!(!rc.is_passthrough());
        let mut out = Vec::new();
        rc.process_into(&[0.0f32; 882], &mut out);
        assert!(out.len().abs_diff(960) <= 10, "got {}", out.len());
    }

    #[test]
    fn short_input_waits_for_a_full_block() {
        let mut rc = RateConverter::new(44_100, 48_000, 882).unwrap();
        let mut out = Vec::new();
        rc.process_into(&[0.0f32; 500], &mut out);
        assert!(out.is_empty());
        rc.process_into(&[0.0f32; 500], &mut out);
        assert!(!out.is_empty());
    }

    #[test]
    fn linear_output_length_is_rounded_ratio() {
        let pcm = vec![0.1f32; 1_000];
        assert_eq!(resample(&pcm, 16_000, 48_000).unwrap().len(), 3_000);
        assert_eq!(resample(&pcm, 44_100, 48_000).unwrap().len(), 1_088);
        assert_eq!(resample(&pcm, 22_050, 48_000).unwrap().len(), 2_177);
    }

    #[test]
    fn linear_interpolates_between_neighbours() {
        let out = resample(&[0.0, 1.0], 24_000, 48_000).unwrap();
        assert_eq!(out.len(), 4);
        assert!((out[0] - 0.0).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert!((out[2] - 1.0).abs() < 1e-6);
        assert!((out[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(resample(&[0.0], 0, 48_000).is_err());
    }
}
