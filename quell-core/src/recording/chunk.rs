//! Cycle recordings and their finalization into [`ProcessedChunk`]s.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::handles::{AudioHandle, AudioHandleRegistry};
use crate::audio::resample::resample;
use crate::audio::wav::{encode_pcm16_wav, SegmentDecoder};
use crate::buffering::{FRAME_SIZE, SAMPLE_RATE};
use crate::denoise::Denoiser;
use crate::dsp::{reduction_percent, rms};
use crate::error::Result;

/// Encoded segments smaller than this carry no usable audio.
pub const MIN_SEGMENT_BYTES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VadPoint {
    /// Seconds from the start of the chunk.
    pub time: f64,
    pub vad: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetrics {
    pub input_rms: f32,
    pub output_rms: Option<f32>,
    /// `(1 - output_rms / input_rms) * 100`, floored at 0. Independent of
    /// the VAD-derived `noise_removed`.
    pub rms_reduction: Option<f32>,
    pub frame_count: usize,
    pub sample_rate: u32,
    pub channels: u16,
    pub processing_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedChunk {
    pub id: String,
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Seconds, from the decoded sample count rather than wall-clock time.
    pub duration: f64,
    pub processed_audio: Option<AudioHandle>,
    pub original_audio: Option<AudioHandle>,
    pub vad_timeline: Vec<VadPoint>,
    pub average_vad: f32,
    /// `(1 - average_vad) * 100`.
    pub noise_removed: f32,
    pub is_valid: bool,
    pub error: Option<String>,
    pub metrics: ChunkMetrics,
}

impl ProcessedChunk {
    fn handles(&self) -> impl Iterator<Item = AudioHandle> {
        self.processed_audio.into_iter().chain(self.original_audio)
    }
}

/// Samples captured for one cycle, at the pipeline rate.
#[derive(Debug)]
pub struct ChunkRecording {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    original: Vec<f32>,
    processed: Vec<f32>,
}

impl ChunkRecording {
    pub fn new(cycle: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle,
            started_at,
            original: Vec::new(),
            processed: Vec::new(),
        }
    }

    pub fn push_original(&mut self, samples: &[f32]) {
        self.original.extend_from_slice(samples);
    }

    pub fn push_processed(&mut self, samples: &[f32]) {
        self.processed.extend_from_slice(samples);
    }

    pub fn original_len(&self) -> usize {
        self.original.len()
    }

    /// Encode both streams. `None` when the original segment is too small.
    pub fn into_segments(self, ended_at: DateTime<Utc>) -> Result<Option<CycleSegments>> {
        let original = encode_pcm16_wav(&self.original, SAMPLE_RATE)?;
        if original.len() < MIN_SEGMENT_BYTES {
            debug!(
                cycle = self.cycle,
                bytes = original.len(),
                "discarding undersized cycle recording"
            );
            return Ok(None);
        }
        let processed = encode_pcm16_wav(&self.processed, SAMPLE_RATE)?;
        let processed = if processed.len() < MIN_SEGMENT_BYTES {
            debug!(cycle = self.cycle, bytes = processed.len(), "processed segment undersized");
            None
        } else {
            Some(processed)
        };
        Ok(Some(CycleSegments {
            cycle: self.cycle,
            started_at: self.started_at,
            ended_at,
            original,
            processed,
        }))
    }
}

/// Encoded media for one stopped cycle.
#[derive(Debug, Clone)]
pub struct CycleSegments {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub original: Vec<u8>,
    pub processed: Option<Vec<u8>>,
}

/// Turns stopped cycles into chunks. Blocking; runs on the blocking pool.
#[derive(Clone)]
pub struct ChunkProcessor {
    decoder: Arc<dyn SegmentDecoder>,
    denoiser: Arc<Mutex<Denoiser>>,
    handles: Arc<AudioHandleRegistry>,
}

impl ChunkProcessor {
    pub fn new(
        decoder: Arc<dyn SegmentDecoder>,
        denoiser: Denoiser,
        handles: Arc<AudioHandleRegistry>,
    ) -> Self {
        Self {
            decoder,
            denoiser: Arc::new(Mutex::new(denoiser)),
            handles,
        }
    }

    /// Finalize a stopped cycle. `None` if it collected no usable audio.
    pub fn finalize(&self, recording: ChunkRecording, ended_at: DateTime<Utc>) -> Option<ProcessedChunk> {
        let cycle = recording.cycle;
        match recording.into_segments(ended_at) {
            Ok(Some(segments)) => Some(self.process(segments)),
            Ok(None) => None,
            Err(e) => {
                warn!(cycle, error = %e, "failed to encode cycle recording");
                None
            }
        }
    }

    pub fn process(&self, segments: CycleSegments) -> ProcessedChunk {
        let started = Instant::now();
        let CycleSegments {
            cycle,
            started_at,
            ended_at,
            original,
            processed,
        } = segments;

        let processed_pcm = processed.as_deref().and_then(|bytes| {
            self.decoder
                .decode(bytes)
                .map_err(|e| warn!(cycle, error = %e, "processed segment failed to decode"))
                .ok()
                .map(|d| d.to_mono())
        });
        let decoded = self.decoder.decode(&original);

        let mut chunk = ProcessedChunk {
            id: format!("chunk-{cycle:04}-{}", started_at.timestamp_millis()),
            cycle,
            started_at,
            ended_at,
            duration: 0.0,
            original_audio: Some(self.handles.register(original)),
            processed_audio: processed.map(|bytes| self.handles.register(bytes)),
            vad_timeline: Vec::new(),
            average_vad: 0.0,
            noise_removed: 0.0,
            is_valid: true,
            error: None,
            metrics: ChunkMetrics::default(),
        };

        let audio = match decoded {
            Ok(audio) => audio,
            Err(e) => {
                warn!(cycle, error = %e, "original segment failed to decode");
                chunk.is_valid = false;
                chunk.error = Some(e.to_string());
                chunk.metrics.processing_ms = started.elapsed().as_secs_f64() * 1e3;
                return chunk;
            }
        };

        chunk.duration = audio.duration_secs();
        chunk.metrics.sample_rate = audio.sample_rate;
        chunk.metrics.channels = audio.channels;

        let mono = audio.to_mono();
        let pcm = match resample(&mono, audio.sample_rate, SAMPLE_RATE) {
            Ok(pcm) => pcm,
            Err(e) => {
                warn!(cycle, error = %e, "segment could not be resampled");
                chunk.is_valid = false;
                chunk.error = Some(e.to_string());
                chunk.metrics.processing_ms = started.elapsed().as_secs_f64() * 1e3;
                return chunk;
            }
        };

        chunk.vad_timeline = self.vad_timeline(cycle, &pcm);
        chunk.metrics.frame_count = chunk.vad_timeline.len();
        if !chunk.vad_timeline.is_empty() {
            chunk.average_vad = chunk.vad_timeline.iter().map(|p| p.vad).sum::<f32>()
                / chunk.vad_timeline.len() as f32;
        }
        chunk.noise_removed = ((1.0 - chunk.average_vad) * 100.0).clamp(0.0, 100.0);

        let input_rms = rms(&mono);
        chunk.metrics.input_rms = input_rms;
        if let Some(out) = processed_pcm {
            let output_rms = rms(&out);
            chunk.metrics.output_rms = Some(output_rms);
            chunk.metrics.rms_reduction = Some(reduction_percent(input_rms, output_rms));
        }
        chunk.metrics.processing_ms = started.elapsed().as_secs_f64() * 1e3;

        debug!(
            cycle,
            duration = chunk.duration,
            frames = chunk.metrics.frame_count,
            average_vad = chunk.average_vad,
            "chunk finalized"
        );
        chunk
    }

    /// Run every frame (last one zero-padded) through the metrics denoiser.
    fn vad_timeline(&self, cycle: u64, pcm: &[f32]) -> Vec<VadPoint> {
        let mut denoiser = self.denoiser.lock();
        let mut frame = [0.0f32; FRAME_SIZE];
        let mut out = [0.0f32; FRAME_SIZE];
        let mut timeline = Vec::with_capacity(pcm.len().div_ceil(FRAME_SIZE));
        for (i, chunk) in pcm.chunks(FRAME_SIZE).enumerate() {
            frame[..chunk.len()].copy_from_slice(chunk);
            frame[chunk.len()..].fill(0.0);
            match denoiser.process_into(&frame, &mut out) {
                Ok(vad) => timeline.push(VadPoint {
                    time: (i * FRAME_SIZE) as f64 / SAMPLE_RATE as f64,
                    vad,
                }),
                Err(e) => warn!(cycle, frame = i, error = %e, "metrics frame skipped"),
            }
        }
        timeline
    }

    pub fn handles(&self) -> &Arc<AudioHandleRegistry> {
        &self.handles
    }
}

/// Finalized chunks, newest last.
#[derive(Debug)]
pub struct ChunkStore {
    chunks: Mutex<Vec<ProcessedChunk>>,
    cycles: Mutex<HashSet<(u64, i64)>>,
    handles: Arc<AudioHandleRegistry>,
}

impl ChunkStore {
    pub fn new(handles: Arc<AudioHandleRegistry>) -> Self {
        Self {
            chunks: Mutex::new(Vec::new()),
            cycles: Mutex::new(HashSet::new()),
            handles,
        }
    }

    /// Store `chunk` unless its cycle was already finalized.
    pub fn push(&self, chunk: ProcessedChunk) -> bool {
        let key = (chunk.cycle, chunk.started_at.timestamp_millis());
        if !self.cycles.lock().insert(key) {
            warn!(cycle = chunk.cycle, "cycle already finalized, dropping duplicate");
            for h in chunk.handles() {
                self.handles.revoke(h);
            }
            return false;
        }
        self.chunks.lock().push(chunk);
        true
    }

    pub fn list(&self) -> Vec<ProcessedChunk> {
        self.chunks.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn audio(&self, handle: AudioHandle) -> Option<Arc<[u8]>> {
        self.handles.get(handle)
    }

    /// Drop every chunk and revoke its audio handles.
    pub fn clear(&self) -> usize {
        let drained: Vec<ProcessedChunk> = std::mem::take(&mut *self.chunks.lock());
        self.cycles.lock().clear();
        for chunk in &drained {
            for h in chunk.handles() {
                self.handles.revoke(h);
            }
        }
        drained.len()
    }

    pub fn handles(&self) -> &Arc<AudioHandleRegistry> {
        &self.handles
    }
}
