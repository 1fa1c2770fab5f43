//! Per-stream pipeline construction and control.
//!
//! Two pipelines share one external contract:
//!
//! - **worker** (preferred): the capture callback only copies into an SPSC
//!   ring; a dedicated thread frames, denoises and writes the output ring.
//!   Requests a fixed device buffer of `buffer_size` frames.
//! - **inline** (fallback): the frame processor runs inside the capture
//!   callback with the device's default buffer.
//!
//! Any failure while building the worker pipeline falls through to the inline
//! one; the caller only sees an error when both fail.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::pipeline::{
    spawn_worker, ControlMessage, DiagnosticsSnapshot, FrameProcessor, PipelineDiagnostics,
    ProcessorSettings, RealtimePath,
};
use crate::audio::{CaptureHandle, CaptureRequest, CaptureSource, SampleSink};
use crate::bridge::{BridgeEvent, BridgeHandle, StreamEvent};
use crate::buffering::{
    create_audio_ring, AudioConsumer, Producer, CAPTURE_RING_CAPACITY, TAP_RING_CAPACITY,
};
use crate::config::NoiseReductionLevel;
use crate::denoise::DenoiserFactory;
use crate::error::{QuellError, Result};
use crate::metrics::FrameReport;
use crate::recording::{recorder_taps, ChunkSink, RecorderFeed, RecordingCycleManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    Worker,
    Inline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Running,
    Paused,
    Stopping,
    Stopped,
}

/// Chunked recording attached to a stream.
#[derive(Clone)]
pub struct RecordingSpec {
    pub chunk_duration: Duration,
    pub sink: ChunkSink,
}

/// Everything needed to build a stream's processing graph.
#[derive(Clone)]
pub struct StreamSpec {
    pub id: u64,
    pub factory: DenoiserFactory,
    pub settings: ProcessorSettings,
    pub buffer_size: u32,
    pub preferred_device: Option<String>,
    pub reports: Option<Sender<FrameReport>>,
    pub recording: Option<RecordingSpec>,
    pub bridge: Option<BridgeHandle>,
}

type StopCallback = Box<dyn FnOnce(u64) + Send>;

struct Worker {
    thread: JoinHandle<()>,
    running: Arc<AtomicBool>,
}

/// One successfully built pipeline.
struct Built {
    kind: PipelineKind,
    capture: Box<dyn CaptureHandle>,
    worker: Option<Worker>,
    output: AudioConsumer,
    feed: Option<RecorderFeed>,
    control: Sender<ControlMessage>,
}

fn processor_for(
    spec: &StreamSpec,
    control: Receiver<ControlMessage>,
    diagnostics: &Arc<PipelineDiagnostics>,
    feed: &mut Option<RecorderFeed>,
) -> Result<FrameProcessor> {
    let mut processor = FrameProcessor::new(
        spec.factory.create()?,
        spec.settings,
        control,
        Arc::clone(diagnostics),
    );
    if let Some(reports) = &spec.reports {
        processor = processor.with_reports(reports.clone());
    }
    if spec.recording.is_some() {
        let (tap, new_feed) = recorder_taps();
        processor = processor.with_tap(tap);
        *feed = Some(new_feed);
    }
    Ok(processor)
}

fn build_worker(
    source: &dyn CaptureSource,
    spec: &StreamSpec,
    diagnostics: &Arc<PipelineDiagnostics>,
) -> Result<Built> {
    let (control, control_rx) = unbounded();
    let mut feed = None;
    let processor = processor_for(spec, control_rx, diagnostics, &mut feed)?;

    let (mut capture_tx, capture_rx) = create_audio_ring(CAPTURE_RING_CAPACITY);
    let sink: SampleSink = Box::new(move |samples, _rate| {
        let written = capture_tx.push_slice(samples);
        if written < samples.len() {
            warn!(dropped = samples.len() - written, "capture ring full");
        }
    });
    let request = CaptureRequest {
        buffer_size: Some(spec.buffer_size),
        preferred_device: spec.preferred_device.clone(),
    };
    let mut capture = source.open(&request, sink)?;

    let (out_tx, output) = create_audio_ring(TAP_RING_CAPACITY);
    let path = match RealtimePath::new(capture.sample_rate(), processor, out_tx) {
        Ok(path) => path,
        Err(e) => {
            capture.release();
            return Err(e);
        }
    };
    let running = Arc::new(AtomicBool::new(true));
    let thread = match spawn_worker(capture_rx, path, Arc::clone(&running)) {
        Ok(thread) => thread,
        Err(e) => {
            capture.release();
            return Err(QuellError::AudioContext(format!("spawn worker thread: {e}")));
        }
    };

    Ok(Built {
        kind: PipelineKind::Worker,
        capture,
        worker: Some(Worker { thread, running }),
        output,
        feed,
        control,
    })
}

fn build_inline(
    source: &dyn CaptureSource,
    spec: &StreamSpec,
    diagnostics: &Arc<PipelineDiagnostics>,
) -> Result<Built> {
    let (control, control_rx) = unbounded();
    let mut feed = None;
    let processor = processor_for(spec, control_rx, diagnostics, &mut feed)?;
    let (out_tx, output) = create_audio_ring(TAP_RING_CAPACITY);

    // The path needs the capture rate, which only the first callback knows.
    let mut pending = Some((processor, out_tx));
    let mut path: Option<RealtimePath> = None;
    let sink: SampleSink = Box::new(move |samples, rate| {
        if path.is_none() {
            if let Some((processor, out_tx)) = pending.take() {
                match RealtimePath::new(rate, processor, out_tx) {
                    Ok(p) => path = Some(p),
                    Err(e) => error!(rate, error = %e, "inline pipeline could not start"),
                }
            }
        }
        if let Some(path) = path.as_mut() {
            path.process(samples);
        }
    });
    let request = CaptureRequest {
        buffer_size: None,
        preferred_device: spec.preferred_device.clone(),
    };
    let capture = source.open(&request, sink)?;

    Ok(Built {
        kind: PipelineKind::Inline,
        capture,
        worker: None,
        output,
        feed,
        control,
    })
}

fn build(
    source: &dyn CaptureSource,
    spec: &StreamSpec,
    diagnostics: &Arc<PipelineDiagnostics>,
) -> Result<Built> {
    match build_worker(source, spec, diagnostics) {
        Ok(built) => Ok(built),
        Err(worker_err) => {
            warn!(stream = spec.id, error = %worker_err, "worker pipeline unavailable, using inline");
            build_inline(source, spec, diagnostics).map_err(|inline_err| {
                QuellError::AudioContext(format!(
                    "no pipeline could be built (worker: {worker_err}; inline: {inline_err})"
                ))
            })
        }
    }
}

/// Owns the live capture handle and processing graph of one stream.
pub struct StreamController {
    id: u64,
    kind: PipelineKind,
    state: Mutex<StreamState>,
    stopped: AtomicBool,
    capture: Mutex<Option<Box<dyn CaptureHandle>>>,
    worker: Mutex<Option<Worker>>,
    control: Sender<ControlMessage>,
    output: Mutex<Option<AudioConsumer>>,
    recording: Option<RecordingCycleManager>,
    diagnostics: Arc<PipelineDiagnostics>,
    bridge: Option<BridgeHandle>,
    on_stopped: Mutex<Option<StopCallback>>,
}

impl StreamController {
    /// Build the preferred pipeline, falling back to the inline one.
    pub async fn start(source: Arc<dyn CaptureSource>, spec: StreamSpec) -> Result<Self> {
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let built = {
            let spec = spec.clone();
            let diagnostics = Arc::clone(&diagnostics);
            tokio::task::spawn_blocking(move || build(source.as_ref(), &spec, &diagnostics))
                .await
                .map_err(|e| QuellError::AudioContext(format!("pipeline build task failed: {e}")))??
        };

        let recording = match (spec.recording, built.feed) {
            (Some(rec), Some(feed)) => Some(RecordingCycleManager::start(
                rec.chunk_duration,
                feed,
                rec.sink,
            )),
            _ => None,
        };

        info!(stream = spec.id, pipeline = ?built.kind, recording = recording.is_some(), "stream started");
        let controller = Self {
            id: spec.id,
            kind: built.kind,
            state: Mutex::new(StreamState::Running),
            stopped: AtomicBool::new(false),
            capture: Mutex::new(Some(built.capture)),
            worker: Mutex::new(built.worker),
            control: built.control,
            output: Mutex::new(Some(built.output)),
            recording,
            diagnostics,
            bridge: spec.bridge,
            on_stopped: Mutex::new(None),
        };
        controller.announce(StreamState::Running);
        Ok(controller)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.as_ref().is_some_and(|r| r.is_running())
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Processed 48 kHz output for the host sink. Available once.
    pub fn take_output(&self) -> Option<AudioConsumer> {
        self.output.lock().take()
    }

    /// Called with the stream id after the stream reaches `Stopped`.
    pub fn set_on_stopped(&self, callback: impl FnOnce(u64) + Send + 'static) {
        *self.on_stopped.lock() = Some(Box::new(callback));
    }

    pub fn pause(&self) -> Result<()> {
        self.send_control(ControlMessage::Pause, StreamState::Running, StreamState::Paused)
    }

    pub fn resume(&self) -> Result<()> {
        self.send_control(ControlMessage::Resume, StreamState::Paused, StreamState::Running)
    }

    pub fn set_reduction_level(&self, level: NoiseReductionLevel) -> Result<()> {
        self.ensure_live()?;
        self.control
            .send(ControlMessage::SetReductionLevel(level))
            .map_err(|_| self.closed())
    }

    pub fn set_input_gain(&self, gain: f32) -> Result<()> {
        if !gain.is_finite() {
            return Err(QuellError::Validation("input gain must be finite".into()));
        }
        self.ensure_live()?;
        self.control
            .send(ControlMessage::SetInputGain(gain))
            .map_err(|_| self.closed())
    }

    /// Retarget the stream's AGC. Clamped to 0.001–1.0 like the config value.
    pub fn set_agc_target(&self, level: f32) -> Result<()> {
        if !level.is_finite() {
            return Err(QuellError::Validation("agc target level must be finite".into()));
        }
        self.ensure_live()?;
        self.control
            .send(ControlMessage::SetAgcTarget(level.clamp(0.001, 1.0)))
            .map_err(|_| self.closed())
    }

    fn send_control(&self, msg: ControlMessage, from: StreamState, to: StreamState) -> Result<()> {
        self.ensure_live()?;
        {
            let mut state = self.state.lock();
            if *state == to {
                return Ok(());
            }
            if *state != from {
                return Err(QuellError::Validation(format!(
                    "stream {} cannot go from {:?} to {:?}",
                    self.id, *state, to
                )));
            }
            self.control.send(msg).map_err(|_| self.closed())?;
            *state = to;
        }
        self.announce(to);
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(self.closed());
        }
        Ok(())
    }

    fn closed(&self) -> QuellError {
        QuellError::Validation(format!("stream {} is stopped", self.id))
    }

    /// Release the capture, drain the graph, then flush recording.
    ///
    /// Idempotent: the capture handle is released exactly once. Samples
    /// captured before the release still reach the final chunk.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *self.state.lock() = StreamState::Stopping;
        self.announce(StreamState::Stopping);

        let capture = self.capture.lock().take();
        let worker = self.worker.lock().take();
        let detached = tokio::task::spawn_blocking(move || {
            if let Some(mut capture) = capture {
                capture.release();
            }
            if let Some(worker) = worker {
                worker.running.store(false, Ordering::Release);
                if worker.thread.join().is_err() {
                    error!("worker thread panicked");
                }
            }
        })
        .await;

        if let Some(recording) = &self.recording {
            recording.stop().await;
        }

        *self.state.lock() = StreamState::Stopped;
        self.announce(StreamState::Stopped);
        info!(stream = self.id, "stream stopped");

        let callback = self.on_stopped.lock().take();
        if let Some(callback) = callback {
            callback(self.id);
        }

        detached.map_err(|e| QuellError::Cleanup(format!("stream {} teardown failed: {e}", self.id)))
    }

    fn announce(&self, state: StreamState) {
        if let Some(bridge) = &self.bridge {
            bridge.emit(BridgeEvent::Stream(StreamEvent {
                stream_id: self.id,
                pipeline: self.kind,
                state,
            }));
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.running.store(false, Ordering::Release);
        }
        if let Some(mut capture) = self.capture.get_mut().take() {
            warn!(stream = self.id, "stream dropped without stop, releasing capture");
            capture.release();
        }
    }
}

impl std::fmt::Debug for StreamController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamController")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
