//! RNNoise via `nnnoiseless`.

use nnnoiseless::{DenoiseState, RnnModel};

use super::NeuralModule;
use crate::buffering::FRAME_SIZE;
use crate::error::{QuellError, Result};

/// One RNNoise instance. Recurrent state lives inside `DenoiseState`, so an
/// instance must only ever see a single contiguous stream of frames.
pub struct RnnoiseModule {
    state: Box<DenoiseState<'static>>,
    name: &'static str,
}

impl RnnoiseModule {
    /// Instance backed by the weights compiled into `nnnoiseless`.
    pub fn new() -> Self {
        Self {
            state: DenoiseState::new(),
            name: "rnnoise",
        }
    }

    /// Instance backed by an RNNoise weights file.
    pub fn from_weights(bytes: &[u8]) -> Result<Self> {
        let model = RnnModel::from_bytes(bytes)
            .ok_or_else(|| QuellError::ModuleLoad("unrecognized RNNoise weights format".into()))?;
        Ok(Self {
            state: DenoiseState::from_model(model),
            name: "rnnoise-custom",
        })
    }
}

impl Default for RnnoiseModule {
    fn default() -> Self {
        Self::new()
    }
}

impl NeuralModule for RnnoiseModule {
    fn name(&self) -> &str {
        self.name
    }

    fn infer(&mut self, output: &mut [f32], input: &[f32]) -> Result<f32> {
        if input.len() != FRAME_SIZE || output.len() != FRAME_SIZE {
            return Err(QuellError::ModuleProcess(format!(
                "rnnoise expects {FRAME_SIZE}-sample buffers, got in={} out={}",
                input.len(),
                output.len()
            )));
        }
        Ok(self.state.process_frame(output, input))
    }
}
