//! Real-time frame path.
//!
//! ## Stages (per capture callback)
//!
//! ```text
//! 1. Drain inbound control messages (pause, resume, level, gain)
//! 2. Resample to 48 kHz (passthrough when the device already runs at 48 kHz)
//! 3. Frame buffer: arbitrary block -> exact 480-sample frames
//! 4. Per frame: AGC update + apply -> input gain -> denoiser -> level scalar
//! 5. Output queue -> callback output slots (zero-filled on underrun)
//! 6. Reduction EMA, recorder taps, frame report
//! ```
//!
//! [`FrameProcessor`] owns its denoiser outright, so nothing on this path
//! takes a lock. Outbound traffic uses `try_send`/`push_slice` and is dropped
//! rather than blocking when a consumer falls behind.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{info, warn};

use crate::audio::resample::RateConverter;
use crate::buffering::{
    create_audio_ring, AudioConsumer, AudioProducer, Consumer, FrameBuffer, Producer, FRAME_SIZE,
    SAMPLE_RATE,
};
use crate::config::{EngineConfig, NoiseReductionLevel};
use crate::denoise::{AmplitudeGate, Denoiser};
use crate::dsp::{peak, reduction_percent, rms, AutomaticGainControl};
use crate::error::Result;
use crate::metrics::FrameReport;
use crate::recording::RecorderTap;

/// Smoothing factor of the rolling reduction percentage.
pub const REDUCTION_EMA_ALPHA: f32 = 0.1;

/// Samples drained from the capture ring per worker iteration (20 ms at 48 kHz).
const DRAIN_CHUNK: usize = 960;

/// Input block handed to rubato when the device rate differs from 48 kHz.
const RESAMPLE_CHUNK: usize = 960;

/// Processed samples buffered between frame completion and callback output.
const OUTPUT_QUEUE_CAP: usize = FRAME_SIZE * 16;

const DEFAULT_SLEEP_EMPTY_MS: u64 = 2;

/// Messages from the control context to a running processor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlMessage {
    Pause,
    Resume,
    SetReductionLevel(NoiseReductionLevel),
    SetInputGain(f32),
    SetAgcTarget(f32),
}

#[derive(Debug, Default)]
pub struct PipelineDiagnostics {
    pub samples_in: AtomicUsize,
    pub frames_processed: AtomicUsize,
    pub fallback_frames: AtomicUsize,
    pub dropped_frames: AtomicUsize,
    pub underruns: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            fallback_frames: self.fallback_frames.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub samples_in: usize,
    pub frames_processed: usize,
    pub fallback_frames: usize,
    pub dropped_frames: usize,
    pub underruns: usize,
}

/// Per-stream processing parameters taken from the engine config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessorSettings {
    pub level: NoiseReductionLevel,
    pub input_gain: f32,
    pub allow_degraded: bool,
    pub agc_target_level: f32,
    pub agc_max_gain: f32,
}

impl From<&EngineConfig> for ProcessorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            level: config.noise_reduction_level,
            input_gain: config.input_gain,
            allow_degraded: config.allow_degraded,
            agc_target_level: config.agc_target_level,
            agc_max_gain: config.agc_max_gain,
        }
    }
}

/// All state one real-time callback needs.
pub struct FrameProcessor {
    denoiser: Denoiser,
    fallback: Option<AmplitudeGate>,
    agc: AutomaticGainControl,
    frames: FrameBuffer,
    queue_tx: AudioProducer,
    queue_rx: AudioConsumer,
    scratch: Box<[f32; FRAME_SIZE]>,
    denoised: Box<[f32; FRAME_SIZE]>,
    level: NoiseReductionLevel,
    input_gain: f32,
    reduction: Option<f32>,
    paused: bool,
    error_logged: bool,
    control: Receiver<ControlMessage>,
    reports: Option<Sender<FrameReport>>,
    tap: Option<RecorderTap>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl FrameProcessor {
    pub fn new(
        denoiser: Denoiser,
        settings: ProcessorSettings,
        control: Receiver<ControlMessage>,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Self {
        let (queue_tx, queue_rx) = create_audio_ring(OUTPUT_QUEUE_CAP);
        Self {
            denoiser,
            fallback: settings.allow_degraded.then(AmplitudeGate::default),
            agc: AutomaticGainControl::new(settings.agc_target_level, settings.agc_max_gain),
            frames: FrameBuffer::new(),
            queue_tx,
            queue_rx,
            scratch: Box::new([0.0; FRAME_SIZE]),
            denoised: Box::new([0.0; FRAME_SIZE]),
            level: settings.level,
            input_gain: settings.input_gain.clamp(0.5, 3.0),
            reduction: None,
            paused: false,
            error_logged: false,
            control,
            reports: None,
            tap: None,
            diagnostics,
        }
    }

    pub fn with_reports(mut self, reports: Sender<FrameReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn with_tap(mut self, tap: RecorderTap) -> Self {
        self.tap = Some(tap);
        self
    }

    /// Process one callback block of 48 kHz samples.
    ///
    /// `output` receives `input.len()` samples (or fewer if shorter), zero
    /// filled where the output queue runs dry. Returns frames completed.
    pub fn process_block(&mut self, input: &[f32], output: &mut [f32]) -> usize {
        let started = Instant::now();
        self.drain_control();

        if self.paused {
            output.fill(0.0);
            return 0;
        }

        let Self {
            denoiser,
            fallback,
            agc,
            frames,
            queue_tx,
            scratch,
            denoised,
            level,
            input_gain,
            error_logged,
            diagnostics,
            ..
        } = self;
        let scale = level.output_scale();
        let gain = *input_gain;
        let mut completed = 0u32;
        let mut dropped = 0u32;
        let mut vad_sum = 0.0f32;

        diagnostics.samples_in.fetch_add(input.len(), Ordering::Relaxed);

        frames.push(input, |frame| {
            scratch.copy_from_slice(frame);
            agc.update_gain(rms(frame));
            agc.apply(&mut scratch[..]);
            for s in scratch.iter_mut() {
                *s = (*s * gain).clamp(-1.0, 1.0);
            }

            let vad = match denoiser.process_into(&scratch[..], &mut denoised[..]) {
                Ok(vad) => vad,
                Err(e) => {
                    if !*error_logged {
                        warn!(error = %e, degraded = fallback.is_some(), "frame processing failed");
                        *error_logged = true;
                    }
                    let rescued = fallback
                        .as_ref()
                        .and_then(|gate| gate.process_into(&scratch[..], &mut denoised[..]).ok());
                    match rescued {
                        Some(vad) => {
                            diagnostics.fallback_frames.fetch_add(1, Ordering::Relaxed);
                            vad
                        }
                        None => {
                            diagnostics.dropped_frames.fetch_add(1, Ordering::Relaxed);
                            dropped += 1;
                            denoised.fill(0.0);
                            0.0
                        }
                    }
                }
            };

            for s in denoised.iter_mut() {
                *s *= scale;
            }
            queue_tx.push_slice(&denoised[..]);
            completed += 1;
            vad_sum += vad;
        });
        diagnostics
            .frames_processed
            .fetch_add(completed as usize, Ordering::Relaxed);

        let out_len = output.len().min(input.len());
        let written = self.queue_rx.pop_slice(&mut output[..out_len]);
        output[written..].fill(0.0);
        if written < out_len {
            self.diagnostics.underruns.fetch_add(1, Ordering::Relaxed);
        }

        let input_rms = rms(input);
        let output_rms = rms(&output[..out_len]);
        if input_rms > f32::EPSILON {
            let instant = reduction_percent(input_rms, output_rms);
            self.reduction = Some(match self.reduction {
                Some(prev) => prev + REDUCTION_EMA_ALPHA * (instant - prev),
                None => instant,
            });
        }

        if let Some(tap) = self.tap.as_mut() {
            tap.original.push_slice(input);
            tap.processed.push_slice(&output[..out_len]);
        }

        if let Some(reports) = &self.reports {
            let _ = reports.try_send(FrameReport {
                input_rms,
                output_rms,
                input_peak: peak(input),
                vad: if completed > 0 { vad_sum / completed as f32 } else { 0.0 },
                frames: completed,
                dropped,
                reduction_percent: self.reduction.unwrap_or(0.0),
                latency_ms: started.elapsed().as_secs_f32() * 1e3,
            });
        }

        completed as usize
    }

    fn drain_control(&mut self) {
        for msg in self.control.try_iter() {
            match msg {
                ControlMessage::Pause => {
                    self.paused = true;
                    self.frames.clear();
                }
                ControlMessage::Resume => self.paused = false,
                ControlMessage::SetReductionLevel(level) => self.level = level,
                ControlMessage::SetInputGain(gain) if gain.is_finite() => {
                    self.input_gain = gain.clamp(0.5, 3.0)
                }
                ControlMessage::SetInputGain(_) => {}
                ControlMessage::SetAgcTarget(level) => self.agc.set_target_level(level),
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Rolling reduction percentage (0 until audio has been seen).
    pub fn reduction_percent(&self) -> f32 {
        self.reduction.unwrap_or(0.0)
    }

    pub fn agc_gain(&self) -> f32 {
        self.agc.gain()
    }

    pub fn backend_name(&self) -> &str {
        self.denoiser.backend_name()
    }
}

impl Drop for FrameProcessor {
    fn drop(&mut self) {
        self.denoiser.destroy();
    }
}

/// Capture-rate samples in, processed 48 kHz samples out to the host sink.
pub struct RealtimePath {
    resampler: RateConverter,
    processor: FrameProcessor,
    resampled: Vec<f32>,
    block_out: Vec<f32>,
    sink: AudioProducer,
}

impl RealtimePath {
    pub fn new(capture_rate: u32, processor: FrameProcessor, sink: AudioProducer) -> Result<Self> {
        Ok(Self {
            resampler: RateConverter::new(capture_rate, SAMPLE_RATE, RESAMPLE_CHUNK)?,
            processor,
            resampled: Vec::with_capacity(DRAIN_CHUNK * 2),
            block_out: Vec::with_capacity(DRAIN_CHUNK * 2),
            sink,
        })
    }

    pub fn process(&mut self, captured: &[f32]) {
        self.resampled.clear();
        self.resampler.process_into(captured, &mut self.resampled);
        if self.resampled.is_empty() {
            return;
        }
        self.block_out.resize(self.resampled.len(), 0.0);
        self.processor
            .process_block(&self.resampled, &mut self.block_out);
        self.sink.push_slice(&self.block_out);
    }
}

fn empty_sleep_ms() -> u64 {
    static EMPTY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *EMPTY_SLEEP_MS.get_or_init(|| {
        std::env::var("QUELL_PIPELINE_EMPTY_SLEEP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_SLEEP_EMPTY_MS)
    })
}

/// Spawn the dedicated processing thread of the worker pipeline.
///
/// Runs until `running` is cleared, then processes whatever is left in the
/// capture ring and exits.
pub fn spawn_worker(
    mut consumer: AudioConsumer,
    mut path: RealtimePath,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("quell-worker".into())
        .spawn(move || {
            info!(backend = path.processor.backend_name(), "worker pipeline started");
            let mut raw = vec![0f32; DRAIN_CHUNK];
            loop {
                let n = consumer.pop_slice(&mut raw);
                if n > 0 {
                    path.process(&raw[..n]);
                    continue;
                }
                if !running.load(Ordering::Acquire) {
                    // Samples pushed before the flag was cleared are still owed.
                    loop {
                        let n = consumer.pop_slice(&mut raw);
                        if n == 0 {
                            break;
                        }
                        path.process(&raw[..n]);
                    }
                    break;
                }
                std::thread::sleep(Duration::from_millis(empty_sleep_ms()));
            }
            info!("worker pipeline stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::Observer;
    use crate::denoise::{DenoiserFactory, NeuralAdapter, NeuralModule};
    use crate::error::QuellError;
    use crate::recording::recorder_taps;
    use approx::assert_relative_eq;
    use crossbeam_channel::{bounded, unbounded};

    struct Broken;

    impl NeuralModule for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn infer(&mut self, _output: &mut [f32], _input: &[f32]) -> Result<f32> {
            Err(QuellError::ModuleProcess("inference exploded".into()))
        }
    }

    fn settings(level: NoiseReductionLevel, allow_degraded: bool) -> ProcessorSettings {
        ProcessorSettings {
            level,
            input_gain: 1.0,
            allow_degraded,
            agc_target_level: 0.1,
            agc_max_gain: 10.0,
        }
    }

    fn gate_processor(level: NoiseReductionLevel) -> (FrameProcessor, Sender<ControlMessage>) {
        let (tx, rx) = unbounded();
        let denoiser = DenoiserFactory::Degraded.create().unwrap();
        let proc = FrameProcessor::new(
            denoiser,
            settings(level, true),
            rx,
            Arc::new(PipelineDiagnostics::default()),
        );
        (proc, tx)
    }

    #[test]
    fn frames_flow_through_agc_gate_and_level() {
        let (mut proc, control) = gate_processor(NoiseReductionLevel::Low);
        let input = [0.5f32; FRAME_SIZE];
        let mut output = [0.0f32; FRAME_SIZE];

        // AGC: target 0.1 / 0.5 = 0.2, gain falls 1.0 -> 0.6.
        assert_eq!(proc.process_block(&input, &mut output), 1);
        assert_relative_eq!(output[0], 0.3, epsilon = 1e-5);

        // Next frame: gain 0.6 -> 0.4, then the high level scales by 0.8.
        control.send(ControlMessage::SetReductionLevel(NoiseReductionLevel::High)).unwrap();
        proc.process_block(&input, &mut output);
        assert_relative_eq!(output[0], 0.16, epsilon = 1e-5);
    }

    #[test]
    fn agc_target_can_be_retargeted() {
        let (mut proc, control) = gate_processor(NoiseReductionLevel::Low);
        let input = [0.5f32; FRAME_SIZE];
        let mut output = [0.0f32; FRAME_SIZE];

        // Target 0.25 / 0.5 = 0.5, gain falls 1.0 -> 0.75.
        control.send(ControlMessage::SetAgcTarget(0.25)).unwrap();
        proc.process_block(&input, &mut output);
        assert_relative_eq!(proc.agc_gain(), 0.75, epsilon = 1e-5);
        assert_relative_eq!(output[0], 0.375, epsilon = 1e-5);
    }

    #[test]
    fn pause_discards_partial_frame() {
        let (mut proc, control) = gate_processor(NoiseReductionLevel::Low);
        let mut output = [0.0f32; FRAME_SIZE];
        proc.process_block(&[0.5; 256], &mut output[..256]);
        assert_eq!(proc.frames.residual_len(), 256);

        control.send(ControlMessage::Pause).unwrap();
        proc.process_block(&[0.5; 16], &mut output[..16]);
        assert_eq!(proc.frames.residual_len(), 0);

        control.send(ControlMessage::Resume).unwrap();
        assert_eq!(proc.process_block(&[0.5; FRAME_SIZE], &mut output), 1);
        assert_eq!(proc.frames.residual_len(), 0);
    }

    #[test]
    fn partial_frames_underrun_to_silence() {
        let (mut proc, _control) = gate_processor(NoiseReductionLevel::Low);
        let mut output = [1.0f32; 256];
        assert_eq!(proc.process_block(&[0.5; 256], &mut output), 0);
        assert!(output.iter().all(|&s| s == 0.0));
        assert_eq!(proc.diagnostics.snapshot().underruns, 1);
    }

    #[test]
    fn paused_processor_outputs_silence_and_records_nothing() {
        let (mut proc, control) = gate_processor(NoiseReductionLevel::Medium);
        let (tap, mut feed) = recorder_taps();
        let (reports_tx, reports_rx) = bounded(8);
        proc = proc.with_tap(tap).with_reports(reports_tx);

        control.send(ControlMessage::Pause).unwrap();
        let mut output = [1.0f32; FRAME_SIZE];
        assert_eq!(proc.process_block(&[0.5; FRAME_SIZE], &mut output), 0);
        assert!(proc.is_paused());
        assert!(output.iter().all(|&s| s == 0.0));
        assert_eq!(feed.original.occupied_len(), 0);
        assert!(reports_rx.try_recv().is_err());

        control.send(ControlMessage::Resume).unwrap();
        assert_eq!(proc.process_block(&[0.5; FRAME_SIZE], &mut output), 1);
        assert_eq!(feed.original.occupied_len(), FRAME_SIZE);
        assert_eq!(feed.processed.occupied_len(), FRAME_SIZE);
        let report = reports_rx.try_recv().unwrap();
        assert_eq!(report.frames, 1);
        assert!((0.0..=1.0).contains(&report.vad));

        let mut drained = [0.0f32; FRAME_SIZE];
        assert_eq!(feed.original.pop_slice(&mut drained), FRAME_SIZE);
    }

    #[test]
    fn neural_failure_falls_back_to_gate_when_degraded_allowed() {
        let (_tx, rx) = unbounded();
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let denoiser = Denoiser::Neural(NeuralAdapter::new(Box::new(Broken), "test"));
        let mut proc = FrameProcessor::new(
            denoiser,
            settings(NoiseReductionLevel::Low, true),
            rx,
            Arc::clone(&diagnostics),
        );
        let mut output = [0.0f32; FRAME_SIZE];
        proc.process_block(&[0.5; FRAME_SIZE], &mut output);
        assert!(output[0] > 0.0);
        assert_eq!(diagnostics.snapshot().fallback_frames, 1);
        assert_eq!(diagnostics.snapshot().dropped_frames, 0);
    }

    #[test]
    fn neural_failure_drops_frame_without_fallback() {
        let (_tx, rx) = unbounded();
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let denoiser = Denoiser::Neural(NeuralAdapter::new(Box::new(Broken), "test"));
        let (reports_tx, reports_rx) = bounded(8);
        let mut proc = FrameProcessor::new(
            denoiser,
            settings(NoiseReductionLevel::Low, false),
            rx,
            Arc::clone(&diagnostics),
        )
        .with_reports(reports_tx);
        let mut output = [1.0f32; FRAME_SIZE];
        proc.process_block(&[0.5; FRAME_SIZE], &mut output);
        assert!(output.iter().all(|&s| s == 0.0));
        assert_eq!(diagnostics.snapshot().dropped_frames, 1);
        assert_eq!(reports_rx.try_recv().unwrap().dropped, 1);
    }

    #[test]
    fn reduction_is_smoothed() {
        let (mut proc, _control) = gate_processor(NoiseReductionLevel::Low);
        let mut output = [0.0f32; FRAME_SIZE];
        // AGC halves the gap to 0.2 each frame: out 0.3 then 0.2.
        proc.process_block(&[0.5; FRAME_SIZE], &mut output);
        let first = proc.reduction_percent();
        assert_relative_eq!(first, 40.0, epsilon = 1e-3);
        proc.process_block(&[0.5; FRAME_SIZE], &mut output);
        // instant = 60 %, EMA = 40 + 0.1 * (60 - 40)
        assert_relative_eq!(proc.reduction_percent(), 42.0, epsilon = 1e-3);
    }

    #[test]
    fn worker_processes_ring_until_stopped() {
        let (mut capture_tx, capture_rx) = create_audio_ring(48_000);
        let (sink_tx, mut sink_rx) = create_audio_ring(48_000);
        let (proc, _control) = gate_processor(NoiseReductionLevel::Low);
        let path = RealtimePath::new(48_000, proc, sink_tx).unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let worker = spawn_worker(capture_rx, path, Arc::clone(&running)).unwrap();

        capture_tx.push_slice(&[0.25; 4_800]);
        running.store(false, Ordering::Release);
        worker.join().unwrap();

        assert_eq!(sink_rx.occupied_len(), 4_800);
    }
}
