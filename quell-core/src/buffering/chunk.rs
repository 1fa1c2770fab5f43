//! Decoded PCM handed from a container decoder to the framing stages.

/// Interleaved PCM as produced by a segment decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved f32 samples in [-1.0, 1.0].
    pub pcm: Vec<f32>,
}

impl DecodedAudio {
    pub fn new(sample_rate: u32, channels: u16, pcm: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            pcm,
        }
    }

    /// Sample frames (one sample per channel).
    pub fn frames(&self) -> usize {
        self.pcm.len() / usize::from(self.channels.max(1))
    }

    /// True duration derived from the decoded sample count.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Average channels down to mono.
    pub fn to_mono(&self) -> Vec<f32> {
        let channels = usize::from(self.channels.max(1));
        if channels == 1 {
            return self.pcm.clone();
        }
        self.pcm
            .chunks_exact(channels)
            .map(|f| f.iter().sum::<f32>() / channels as f32)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }
}
