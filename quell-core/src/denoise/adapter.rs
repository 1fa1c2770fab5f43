use tracing::{debug, info};

use super::{validate_frame, NeuralModule};
use crate::buffering::{FRAME_BYTES, FRAME_SIZE};
use crate::error::{QuellError, Result};

/// PCM16 full-scale factor; the network operates on `[-32768, 32767]`.
pub const PCM_SCALE: f32 = 32_768.0;

/// Silent frames pushed through a fresh denoiser to settle recurrent state.
pub const WARMUP_FRAMES: usize = 10;

/// Exactly one input and one output frame buffer, allocated once.
struct FrameMemory {
    input: Box<[f32; FRAME_SIZE]>,
    output: Box<[f32; FRAME_SIZE]>,
}

/// Owns a neural module plus its frame memory.
///
/// Per frame: scale to PCM16 range into `input`, infer into `output`, copy
/// the result back over `input`, then read back normalized. Memory is freed
/// exactly once by [`NeuralAdapter::destroy`].
pub struct NeuralAdapter {
    module: Option<Box<dyn NeuralModule>>,
    memory: Option<FrameMemory>,
    name: String,
    strategy: &'static str,
}

impl NeuralAdapter {
    pub fn new(module: Box<dyn NeuralModule>, strategy: &'static str) -> Self {
        let name = module.name().to_string();
        debug!(module = %name, strategy, bytes = FRAME_BYTES * 2, "allocated adapter frame memory");
        Self {
            module: Some(module),
            memory: Some(FrameMemory {
                input: Box::new([0.0; FRAME_SIZE]),
                output: Box::new([0.0; FRAME_SIZE]),
            }),
            name,
            strategy,
        }
    }

    pub fn process_into(&mut self, frame: &[f32], out: &mut [f32]) -> Result<f32> {
        validate_frame(frame)?;
        if out.len() < FRAME_SIZE {
            return Err(QuellError::AudioProcessing(format!(
                "output buffer too small: {} < {FRAME_SIZE}",
                out.len()
            )));
        }
        let (Some(module), Some(mem)) = (self.module.as_mut(), self.memory.as_mut()) else {
            return Err(QuellError::ModuleProcess("denoiser has been destroyed".into()));
        };

        for (dst, &s) in mem.input.iter_mut().zip(frame) {
            *dst = s * PCM_SCALE;
        }
        let vad = module.infer(&mut mem.output[..], &mem.input[..])?;
        mem.input.copy_from_slice(&mem.output[..]);
        for (dst, &s) in out.iter_mut().zip(mem.input.iter()) {
            *dst = s / PCM_SCALE;
        }

        Ok(if vad.is_finite() { vad.clamp(0.0, 1.0) } else { 0.0 })
    }

    pub fn module_name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> &'static str {
        self.strategy
    }

    /// Bytes of frame memory currently held (0 once destroyed).
    pub fn buffer_bytes(&self) -> usize {
        if self.memory.is_some() {
            FRAME_BYTES * 2
        } else {
            0
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.module.is_none()
    }

    pub fn destroy(&mut self) {
        let freed_module = self.module.take().is_some();
        let freed_memory = self.memory.take().is_some();
        if freed_module || freed_memory {
            info!(module = %self.name, "denoiser resources released");
        }
    }
}

impl Drop for NeuralAdapter {
    fn drop(&mut self) {
        self.destroy();
    }
}
