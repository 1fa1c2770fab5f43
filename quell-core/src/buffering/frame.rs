//! Fixed-frame accumulation: arbitrary-length pushes in, exact 480-sample frames out.

/// Samples per frame: 10 ms at 48 kHz.
pub const FRAME_SIZE: usize = 480;

/// Bytes occupied by one frame of f32 samples.
pub const FRAME_BYTES: usize = FRAME_SIZE * std::mem::size_of::<f32>();

/// The only native pipeline rate.
pub const SAMPLE_RATE: u32 = 48_000;

/// Accumulates pushes and emits complete frames.
///
/// Leftover `total % FRAME_SIZE` samples stay in the residual until the next
/// push. The residual is allocated once; `push` never allocates.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    residual: Vec<f32>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            residual: Vec::with_capacity(FRAME_SIZE),
        }
    }

    /// Append `samples`, calling `on_frame` once per completed frame.
    ///
    /// Returns the number of frames emitted.
    pub fn push<F>(&mut self, mut samples: &[f32], mut on_frame: F) -> usize
    where
        F: FnMut(&[f32]),
    {
        let mut emitted = 0;

        if !self.residual.is_empty() {
            let need = FRAME_SIZE - self.residual.len();
            let take = need.min(samples.len());
            self.residual.extend_from_slice(&samples[..take]);
            samples = &samples[take..];
            if self.residual.len() < FRAME_SIZE {
                return 0;
            }
            on_frame(&self.residual);
            self.residual.clear();
            emitted += 1;
        }

        let mut frames = samples.chunks_exact(FRAME_SIZE);
        for frame in frames.by_ref() {
            on_frame(frame);
            emitted += 1;
        }
        self.residual.extend_from_slice(frames.remainder());
        emitted
    }

    /// Allocating convenience wrapper around [`FrameBuffer::push`].
    pub fn push_frames(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut out = Vec::new();
        self.push(samples, |frame| out.push(frame.to_vec()));
        out
    }

    /// Samples waiting for the next push.
    pub fn residual_len(&self) -> usize {
        self.residual.len()
    }

    pub fn clear(&mut self) {
        self.residual.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_1920_bytes() {
        assert_eq!(FRAME_BYTES, 1920);
    }

    #[test]
    fn bursts_of_480_yield_two_frames_and_residual_40() {
        let mut fb = FrameBuffer::new();
        let samples: Vec<f32> = (0..1000).map(|i| i as f32).collect();
        let mut frames = Vec::new();
        for burst in samples.chunks(480) {
            frames.extend(fb.push_frames(burst));
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(fb.residual_len(), 40);
        assert_eq!(frames[1][0], 480.0);
    }

    #[test]
    fn frame_count_and_residual_hold_for_many_push_patterns() {
        for total in [0usize, 1, 479, 480, 481, 959, 960, 4_321, 48_000] {
            for burst in [1usize, 7, 128, 480, 512, 1_000] {
                let mut fb = FrameBuffer::new();
                let samples = vec![0.25f32; total];
                let mut count = 0;
                for part in samples.chunks(burst) {
                    count += fb.push(part, |f| assert_eq!(f.len(), FRAME_SIZE));
                }
                assert_eq!(count, total / FRAME_SIZE, "total={total} burst={burst}");
                assert_eq!(fb.residual_len(), total % FRAME_SIZE);
            }
        }
    }

    #[test]
    fn frames_preserve_sample_order_across_pushes() {
        let mut fb = FrameBuffer::new();
        let samples: Vec<f32> = (0..960).map(|i| i as f32).collect();
        let mut seen = Vec::new();
        for part in samples.chunks(100) {
            fb.push(part, |f| seen.extend_from_slice(f));
        }
        assert_eq!(seen, samples);
    }

    #[test]
    fn clear_drops_residual() {
        let mut fb = FrameBuffer::new();
        fb.push(&[0.0; 100], |_| {});
        fb.clear();
        assert_eq!(fb.residual_len(), 0);
    }
}
