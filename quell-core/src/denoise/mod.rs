//! Denoiser backends.
//!
//! `Denoiser` is a tagged variant chosen once at initialization: the RNNoise
//! [`NeuralAdapter`] or the degraded [`AmplitudeGate`]. Both expose the same
//! `process(frame) -> {output, vad}` contract, so callers never branch on the
//! backend inside the frame path.

pub mod adapter;
pub mod gate;
pub mod loader;
pub mod rnnoise;

pub use adapter::{NeuralAdapter, PCM_SCALE, WARMUP_FRAMES};
pub use gate::AmplitudeGate;
pub use loader::{
    default_loaders, load_first, BundledLoader, EmbeddedLoader, LoadedModule, ModuleLoader,
    RemoteLoader,
};
pub use rnnoise::RnnoiseModule;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::buffering::FRAME_SIZE;
use crate::error::{QuellError, Result};

/// Contract for neural inference modules operating on PCM16-scaled frames.
///
/// `&mut self` expresses that recurrent models carry hidden state between
/// frames. A module is owned by exactly one adapter.
pub trait NeuralModule: Send + 'static {
    fn name(&self) -> &str;

    /// Denoise `input` into `output` (both `FRAME_SIZE` long, PCM16 scale).
    /// Returns the voice probability of the frame.
    fn infer(&mut self, output: &mut [f32], input: &[f32]) -> Result<f32>;
}

/// Result of processing one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedFrame {
    pub output: Vec<f32>,
    pub vad: f32,
}

/// Reject frames of the wrong length or containing NaN.
pub fn validate_frame(frame: &[f32]) -> Result<()> {
    if frame.len() != FRAME_SIZE {
        return Err(QuellError::AudioProcessing(format!(
            "invalid frame size: expected {FRAME_SIZE}, got {}",
            frame.len()
        )));
    }
    if let Some(idx) = frame.iter().position(|s| s.is_nan()) {
        return Err(QuellError::Validation(format!(
            "frame contains NaN at index {idx}"
        )));
    }
    Ok(())
}

pub enum Denoiser {
    Neural(NeuralAdapter),
    Degraded(AmplitudeGate),
}

impl Denoiser {
    /// Process one frame into `out` without allocating. Returns the VAD score.
    pub fn process_into(&mut self, frame: &[f32], out: &mut [f32]) -> Result<f32> {
        match self {
            Self::Neural(adapter) => adapter.process_into(frame, out),
            Self::Degraded(gate) => gate.process_into(frame, out),
        }
    }

    pub fn process(&mut self, frame: &[f32]) -> Result<ProcessedFrame> {
        let mut output = vec![0.0f32; FRAME_SIZE];
        let vad = self.process_into(frame, &mut output)?;
        Ok(ProcessedFrame { output, vad })
    }

    /// Run `WARMUP_FRAMES` silent frames. Failures are logged, never fatal.
    ///
    /// Returns the number of failed warmup frames.
    pub fn warm_up(&mut self) -> usize {
        let silence = [0.0f32; FRAME_SIZE];
        let mut out = [0.0f32; FRAME_SIZE];
        let mut failures = 0;
        for i in 0..WARMUP_FRAMES {
            if let Err(e) = self.process_into(&silence, &mut out) {
                failures += 1;
                warn!(frame = i, backend = self.backend_name(), error = %e, "warmup frame failed");
            }
        }
        debug!(backend = self.backend_name(), failures, "denoiser warmup complete");
        failures
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }

    pub fn backend_name(&self) -> &str {
        match self {
            Self::Neural(adapter) => adapter.module_name(),
            Self::Degraded(_) => "amplitude-gate",
        }
    }

    /// Release backend resources. Repeated calls are no-ops.
    pub fn destroy(&mut self) {
        if let Self::Neural(adapter) = self {
            adapter.destroy();
        }
    }
}

impl std::fmt::Debug for Denoiser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Denoiser")
            .field("backend", &self.backend_name())
            .finish_non_exhaustive()
    }
}

/// Produces fresh, warmed-up denoisers from the module chosen at initialization.
///
/// Each frame path and each chunk finalizer owns its own `Denoiser`, so no
/// lock is ever taken while a frame is processed.
#[derive(Clone, Debug)]
pub enum DenoiserFactory {
    Neural(LoadedModule),
    Degraded,
}

impl DenoiserFactory {
    pub fn create(&self) -> Result<Denoiser> {
        let mut denoiser = match self {
            Self::Neural(module) => {
                Denoiser::Neural(NeuralAdapter::new(module.instantiate()?, module.strategy()))
            }
            Self::Degraded => Denoiser::Degraded(AmplitudeGate::default()),
        };
        denoiser.warm_up();
        Ok(denoiser)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded)
    }
}
