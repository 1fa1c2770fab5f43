//! `NoiseEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! NoiseEngine::builder(config).build()
//!     └─► initialize()       → context probed, module loaded, state = ready
//!         │                    (or degraded when loading fails and allowed)
//!         └─► start_stream() → pipeline built, state = processing
//!             └─► stop()     → last stream ends, state = ready | degraded
//!                 └─► destroy() → streams stopped, memory released, destroyed
//! ```
//!
//! `initialize()` is shared: concurrent callers await the same attempt.
//! `destroy()` on a destroyed engine is a no-op.
//!
//! ## Threading
//!
//! `NoiseEngine` is `Clone + Send + Sync`; every field of the shared inner
//! state uses interior mutability. No lock is held across an `.await`.

pub mod pipeline;
pub mod state;
pub mod stream;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::wav::{decode_pcm16_wav, encode_pcm16_wav, SegmentDecoder, WavDecoder};
use crate::audio::{default_host, resample::resample, AudioHost, CaptureSource, HostInfo};
use crate::bridge::{AccessToken, BridgeEvent, BridgeHandle, EngineStatusEvent, EventBridge};
use crate::buffering::{FRAME_SIZE, SAMPLE_RATE};
use crate::config::{Algorithm, EngineConfig, NoiseReductionLevel};
use crate::denoise::{
    default_loaders, load_first, AmplitudeGate, Denoiser, DenoiserFactory, ModuleLoader,
    ProcessedFrame,
};
use crate::error::{ErrorRecord, QuellError, Result};
use crate::metrics::{MetricsManager, ProcessingMetrics};
use crate::recording::{
    AudioHandle, AudioHandleRegistry, ChunkConfig, ChunkProcessor, ChunkSink, ChunkStore,
    ProcessedChunk,
};

use pipeline::{ControlMessage, FrameProcessor, PipelineDiagnostics, ProcessorSettings};
use state::{EngineState, StateMachine};
use stream::{RecordingSpec, StreamController, StreamSpec};

/// Failures kept in the rolling error history.
pub const ERROR_HISTORY_CAP: usize = 20;

/// Summary of a file run through [`NoiseEngine::process_wav`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WavReport {
    /// 48 kHz mono PCM16 WAV.
    #[serde(skip)]
    pub output: Vec<u8>,
    pub input_sample_rate: u32,
    pub duration_secs: f64,
    pub frames: usize,
    pub average_vad: f32,
    pub reduction_percent: f32,
    pub backend: String,
}

pub struct EngineBuilder {
    config: EngineConfig,
    host: Option<Arc<dyn AudioHost>>,
    loaders: Option<Vec<Box<dyn ModuleLoader>>>,
    bridge: Option<BridgeHandle>,
    decoder: Option<Arc<dyn SegmentDecoder>>,
}

impl EngineBuilder {
    pub fn host(mut self, host: Arc<dyn AudioHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Replace the loader chain derived from the config.
    pub fn loaders(mut self, loaders: Vec<Box<dyn ModuleLoader>>) -> Self {
        self.loaders = Some(loaders);
        self
    }

    pub fn bridge(mut self, bridge: Arc<EventBridge>, token: AccessToken) -> Self {
        self.bridge = Some(BridgeHandle::new(bridge, token));
        self
    }

    /// Decoder used for chunk finalization when a stream does not name one.
    pub fn decoder(mut self, decoder: Arc<dyn SegmentDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn build(self) -> NoiseEngine {
        let mut config = self.config;
        config.normalize();
        let loaders = self.loaders.unwrap_or_else(|| default_loaders(&config));
        let handles = Arc::new(AudioHandleRegistry::new());
        NoiseEngine {
            inner: Arc::new(EngineInner {
                level: Mutex::new(config.noise_reduction_level),
                host: self.host.unwrap_or_else(default_host),
                loaders: Arc::new(loaders),
                state: Mutex::new(StateMachine::new()),
                base_state: Mutex::new(EngineState::Ready),
                init: OnceCell::new(),
                factory: Mutex::new(None),
                denoiser: Mutex::new(None),
                host_info: Mutex::new(None),
                streams: Mutex::new(HashMap::new()),
                next_stream: AtomicU64::new(0),
                idle_timer: Mutex::new(None),
                destroying: AtomicBool::new(false),
                errors: Mutex::new(VecDeque::with_capacity(ERROR_HISTORY_CAP)),
                metrics: MetricsManager::new(),
                chunks: Arc::new(ChunkStore::new(Arc::clone(&handles))),
                handles,
                bridge: self.bridge,
                decoder: self.decoder.unwrap_or_else(|| Arc::new(WavDecoder)),
                config,
            }),
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    level: Mutex<NoiseReductionLevel>,
    host: Arc<dyn AudioHost>,
    loaders: Arc<Vec<Box<dyn ModuleLoader>>>,
    state: Mutex<StateMachine>,
    /// Where the engine returns when its last stream ends.
    base_state: Mutex<EngineState>,
    init: OnceCell<Result<()>>,
    factory: Mutex<Option<DenoiserFactory>>,
    denoiser: Mutex<Option<Denoiser>>,
    host_info: Mutex<Option<HostInfo>>,
    streams: Mutex<HashMap<u64, Arc<StreamController>>>,
    next_stream: AtomicU64,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    destroying: AtomicBool,
    errors: Mutex<VecDeque<ErrorRecord>>,
    metrics: MetricsManager,
    handles: Arc<AudioHandleRegistry>,
    chunks: Arc<ChunkStore>,
    bridge: Option<BridgeHandle>,
    decoder: Arc<dyn SegmentDecoder>,
}

/// The top-level engine handle. Cheap to clone.
#[derive(Clone)]
pub struct NoiseEngine {
    inner: Arc<EngineInner>,
}

impl NoiseEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            host: None,
            loaders: None,
            bridge: None,
            decoder: None,
        }
    }

    pub fn new(config: EngineConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The amplitude gate is serving frames instead of the neural module.
    pub fn is_degraded(&self) -> bool {
        self.inner
            .factory
            .lock()
            .as_ref()
            .is_some_and(DenoiserFactory::is_degraded)
    }

    pub fn host_info(&self) -> Option<HostInfo> {
        self.inner.host_info.lock().clone()
    }

    pub fn error_history(&self) -> Vec<ErrorRecord> {
        self.inner.errors.lock().iter().cloned().collect()
    }

    /// Load the denoiser and move to `ready` (or `degraded`).
    ///
    /// Returns immediately when already operational. Concurrent callers share
    /// one attempt and receive the same result.
    pub async fn initialize(&self) -> Result<()> {
        let state = self.state();
        if state.is_operational() {
            return Ok(());
        }
        if matches!(state, EngineState::Destroying | EngineState::Destroyed) {
            return Err(QuellError::Initialization(format!("engine is {state}")));
        }
        let inner = Arc::clone(&self.inner);
        self.inner
            .init
            .get_or_init(|| async move { inner.run_initialize().await })
            .await
            .clone()
    }

    /// Denoise one frame with the engine-owned backend.
    pub fn process(&self, frame: &[f32]) -> Result<ProcessedFrame> {
        let state = self.state();
        if !state.is_operational() {
            return Err(QuellError::Initialization(format!(
                "engine is {state}, not ready to process"
            )));
        }
        let mut guard = self.inner.denoiser.lock();
        let denoiser = guard
            .as_mut()
            .ok_or_else(|| QuellError::Initialization("no denoiser loaded".into()))?;

        let mut result = denoiser.process(frame);
        if matches!(result, Err(QuellError::ModuleProcess(_))) && self.inner.config.allow_degraded {
            let mut output = vec![0.0f32; FRAME_SIZE];
            result = AmplitudeGate::default()
                .process_into(frame, &mut output)
                .map(|vad| ProcessedFrame { output, vad });
        }
        let mut frame = result?;
        let scale = self.inner.level.lock().output_scale();
        for s in frame.output.iter_mut() {
            *s *= scale;
        }
        Ok(frame)
    }

    /// Start a stream on `source` (the host's default when `None`).
    pub async fn start_stream(
        &self,
        source: Option<Arc<dyn CaptureSource>>,
        chunking: Option<ChunkConfig>,
    ) -> Result<Arc<StreamController>> {
        let inner = &self.inner;
        let state = inner.state();
        if !state.is_operational() {
            return Err(QuellError::Initialization(format!(
                "engine is {state}, cannot start a stream"
            )));
        }
        let factory = inner
            .factory
            .lock()
            .clone()
            .ok_or_else(|| QuellError::Initialization("no denoiser loaded".into()))?;

        let recording = match chunking {
            Some(chunking) => Some(RecordingSpec {
                chunk_duration: resolve_chunk_duration(&chunking, &inner.config)?,
                sink: ChunkSink {
                    processor: ChunkProcessor::new(
                        chunking.decoder,
                        factory.create()?,
                        Arc::clone(&inner.handles),
                    ),
                    store: Arc::clone(&inner.chunks),
                    bridge: inner.bridge.clone(),
                },
            }),
            None => None,
        };

        let mut settings = ProcessorSettings::from(&inner.config);
        settings.level = *inner.level.lock();
        let id = inner.next_stream.fetch_add(1, Ordering::Relaxed) + 1;
        let spec = StreamSpec {
            id,
            factory,
            settings,
            buffer_size: inner.config.buffer_size,
            preferred_device: inner.config.preferred_input_device.clone(),
            reports: Some(inner.metrics.sender()),
            recording,
            bridge: inner.bridge.clone(),
        };

        let source = source.unwrap_or_else(|| inner.host.default_source());
        inner.cancel_idle_timer();
        let stream = match StreamController::start(source, spec).await {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                inner.record_error(&e);
                if inner.streams.lock().is_empty() {
                    inner.arm_idle_timer();
                }
                return Err(e);
            }
        };

        let weak: Weak<EngineInner> = Arc::downgrade(inner);
        stream.set_on_stopped(move |id| {
            if let Some(inner) = weak.upgrade() {
                inner.stream_ended(id);
            }
        });

        if let Err(e) = inner.register_stream(&stream) {
            inner.streams.lock().remove(&id);
            if let Err(stop_err) = stream.stop().await {
                warn!(stream = id, error = %stop_err, "orphaned stream failed to stop");
            }
            return Err(e);
        }
        Ok(stream)
    }

    pub fn streams(&self) -> Vec<Arc<StreamController>> {
        self.inner.streams.lock().values().cloned().collect()
    }

    /// Change the reduction level for the engine and every live stream.
    pub fn set_noise_reduction_level(&self, level: NoiseReductionLevel) {
        *self.inner.level.lock() = level;
        for stream in self.streams() {
            if let Err(e) = stream.set_reduction_level(level) {
                debug!(stream = stream.id(), error = %e, "level not forwarded");
            }
        }
    }

    pub fn metrics(&self) -> ProcessingMetrics {
        self.inner.metrics.latest()
    }

    pub fn subscribe_metrics(&self) -> watch::Receiver<ProcessingMetrics> {
        self.inner.metrics.subscribe()
    }

    pub fn chunks(&self) -> Vec<ProcessedChunk> {
        self.inner.chunks.list()
    }

    pub fn chunk_audio(&self, handle: AudioHandle) -> Option<Arc<[u8]>> {
        self.inner.chunks.audio(handle)
    }

    /// Drop every finalized chunk and revoke its audio handles.
    pub fn clear_chunks(&self) -> usize {
        self.inner.chunks.clear()
    }

    /// Stop every stream and release all resources.
    ///
    /// Non-forced destroy from a state that cannot reach `destroying` fails
    /// with a cleanup error; `force` proceeds regardless.
    pub async fn destroy(&self, force: bool) -> Result<()> {
        self.inner.destroy(force).await
    }

    /// Denoise a PCM16 WAV at any rate into a 48 kHz mono PCM16 WAV.
    pub async fn process_wav(&self, bytes: Vec<u8>) -> Result<WavReport> {
        let state = self.state();
        if !state.is_operational() {
            return Err(QuellError::Initialization(format!(
                "engine is {state}, cannot process files"
            )));
        }
        let factory = self
            .inner
            .factory
            .lock()
            .clone()
            .ok_or_else(|| QuellError::Initialization("no denoiser loaded".into()))?;
        let mut settings = ProcessorSettings::from(&self.inner.config);
        settings.level = *self.inner.level.lock();

        tokio::task::spawn_blocking(move || denoise_wav(&bytes, &factory, settings))
            .await
            .map_err(|e| QuellError::AudioProcessing(format!("file processing task failed: {e}")))?
    }
}

fn denoise_wav(
    bytes: &[u8],
    factory: &DenoiserFactory,
    settings: ProcessorSettings,
) -> Result<WavReport> {
    let decoded = decode_pcm16_wav(bytes)?;
    let duration_secs = decoded.duration_secs();
    let pcm = resample(&decoded.to_mono(), decoded.sample_rate, SAMPLE_RATE)?;

    let denoiser = factory.create()?;
    let backend = denoiser.backend_name().to_string();
    let (_control, control_rx) = unbounded::<ControlMessage>();
    let (reports_tx, reports_rx) = unbounded();
    let mut processor = FrameProcessor::new(
        denoiser,
        settings,
        control_rx,
        Arc::new(PipelineDiagnostics::default()),
    )
    .with_reports(reports_tx);

    let mut output = Vec::with_capacity(pcm.len().div_ceil(FRAME_SIZE) * FRAME_SIZE);
    let mut frame = [0.0f32; FRAME_SIZE];
    let mut out = [0.0f32; FRAME_SIZE];
    let mut frames = 0;
    for chunk in pcm.chunks(FRAME_SIZE) {
        frame[..chunk.len()].copy_from_slice(chunk);
        frame[chunk.len()..].fill(0.0);
        frames += processor.process_block(&frame, &mut out);
        output.extend_from_slice(&out);
    }
    output.truncate(pcm.len());

    let vads: Vec<f32> = reports_rx
        .try_iter()
        .filter(|r| r.frames > 0)
        .map(|r| r.vad)
        .collect();
    let average_vad = if vads.is_empty() {
        0.0
    } else {
        vads.iter().sum::<f32>() / vads.len() as f32
    };

    Ok(WavReport {
        output: encode_pcm16_wav(&output, SAMPLE_RATE)?,
        input_sample_rate: decoded.sample_rate,
        duration_secs,
        frames,
        average_vad,
        reduction_percent: processor.reduction_percent(),
        backend,
    })
}

impl EngineInner {
    fn state(&self) -> EngineState {
        self.state.lock().current()
    }

    fn transition(&self, next: EngineState, detail: Option<String>) -> Result<EngineState> {
        let previous = self.state.lock().transition(next)?;
        self.announce(previous, next, detail);
        Ok(previous)
    }

    fn force_state(&self, next: EngineState) {
        let previous = self.state.lock().force(next);
        self.announce(previous, next, Some("forced".into()));
    }

    fn announce(&self, previous: EngineState, state: EngineState, detail: Option<String>) {
        info!(from = %previous, to = %state, "engine state changed");
        if let Some(bridge) = &self.bridge {
            let degraded = self
                .factory
                .lock()
                .as_ref()
                .is_some_and(DenoiserFactory::is_degraded);
            bridge.emit(BridgeEvent::Status(EngineStatusEvent {
                state,
                previous,
                degraded,
                detail,
            }));
        }
    }

    fn record_error(&self, err: &QuellError) {
        let record = err.record();
        {
            let mut errors = self.errors.lock();
            if errors.len() == ERROR_HISTORY_CAP {
                errors.pop_front();
            }
            errors.push_back(record.clone());
        }
        error!(code = ?record.code, error = %err, "engine error");
        if let Some(bridge) = &self.bridge {
            bridge.emit(BridgeEvent::Error(record));
        }
    }

    async fn run_initialize(self: Arc<Self>) -> Result<()> {
        let outcome = match self.try_initialize().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.record_error(&e);
                if self.state() != EngineState::Error {
                    self.transition(EngineState::Error, Some(e.to_string()))?;
                }
                if self.config.allow_degraded {
                    self.enter_degraded(&e)
                } else {
                    Err(e)
                }
            }
        };
        if outcome.is_ok() {
            self.metrics
                .start(self.config.metrics_interval(), self.bridge.clone());
        }
        outcome
    }

    async fn try_initialize(&self) -> Result<()> {
        self.transition(EngineState::Initializing, None)?;
        self.config.validate()?;

        self.transition(EngineState::CreatingContext, None)?;
        let info = self.host.probe()?;
        debug!(host = %info.name, inputs = info.input_devices.len(), "audio context ready");
        *self.host_info.lock() = Some(info);

        self.transition(EngineState::LoadingModule, None)?;
        let factory = match self.config.algorithm {
            Algorithm::Gate => {
                info!("amplitude gate requested, skipping module load");
                DenoiserFactory::Degraded
            }
            Algorithm::Rnnoise => DenoiserFactory::Neural(self.load_module().await?),
        };
        let denoiser = factory.create()?;
        info!(backend = denoiser.backend_name(), "denoiser ready");

        *self.factory.lock() = Some(factory);
        *self.denoiser.lock() = Some(denoiser);
        *self.base_state.lock() = EngineState::Ready;
        self.transition(EngineState::Ready, None)?;
        Ok(())
    }

    async fn load_module(&self) -> Result<crate::denoise::LoadedModule> {
        let loaders = Arc::clone(&self.loaders);
        let limit = self.config.load_timeout();
        let task = tokio::task::spawn_blocking(move || load_first(&loaders));
        match tokio::time::timeout(limit, task).await {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(e)) => Err(QuellError::ModuleLoad(format!("loader task failed: {e}"))),
            Err(_) => Err(QuellError::ModuleLoad(format!(
                "module loading timed out after {} ms",
                limit.as_millis()
            ))),
        }
    }

    fn enter_degraded(&self, cause: &QuellError) -> Result<()> {
        warn!(error = %cause, "falling back to amplitude gate");
        let factory = DenoiserFactory::Degraded;
        let denoiser = factory.create()?;
        *self.factory.lock() = Some(factory);
        *self.denoiser.lock() = Some(denoiser);
        *self.base_state.lock() = EngineState::Degraded;
        self.transition(EngineState::Degraded, Some(cause.to_string()))?;
        Ok(())
    }

    /// Track a started stream; the first one moves the engine to `Processing`.
    fn register_stream(&self, stream: &Arc<StreamController>) -> Result<()> {
        let first = {
            let mut streams = self.streams.lock();
            if self.destroying.load(Ordering::Acquire) {
                return Err(QuellError::Initialization(
                    "engine is being destroyed, cannot start a stream".into(),
                ));
            }
            streams.insert(stream.id(), Arc::clone(stream));
            streams.len() == 1
        };
        if first && self.state() != EngineState::Processing {
            self.transition(EngineState::Processing, None)?;
        }
        Ok(())
    }

    fn stream_ended(self: &Arc<Self>, id: u64) {
        let remaining = {
            let mut streams = self.streams.lock();
            streams.remove(&id);
            streams.len()
        };
        debug!(stream = id, remaining, "stream ended");
        if remaining > 0 || self.destroying.load(Ordering::Acquire) {
            return;
        }
        if self.state() == EngineState::Processing {
            let base = *self.base_state.lock();
            if let Err(e) = self.transition(base, None) {
                warn!(error = %e, "could not leave processing state");
            }
        }
        self.arm_idle_timer();
    }

    fn arm_idle_timer(self: &Arc<Self>) {
        if !self.config.auto_cleanup || self.destroying.load(Ordering::Acquire) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime available for the idle timer");
            return;
        };
        let weak = Arc::downgrade(self);
        let delay = self.config.cleanup_delay();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Detach ourselves so destroy does not abort this task.
            inner.idle_timer.lock().take();
            info!(idle_ms = delay.as_millis() as u64, "idle timeout, destroying engine");
            if let Err(e) = inner.destroy(false).await {
                warn!(error = %e, "idle cleanup failed");
            }
        });
        if let Some(previous) = self.idle_timer.lock().replace(task) {
            previous.abort();
        }
        debug!(delay_ms = delay.as_millis() as u64, "idle timer armed");
    }

    fn cancel_idle_timer(&self) {
        if let Some(timer) = self.idle_timer.lock().take() {
            timer.abort();
            debug!("idle timer cancelled");
        }
    }

    async fn destroy(&self, force: bool) -> Result<()> {
        let current = self.state();
        if matches!(current, EngineState::Destroyed | EngineState::Destroying) {
            return Ok(());
        }
        if !force && !current.can_transition_to(EngineState::Destroying) {
            return Err(QuellError::Cleanup(format!(
                "cannot destroy engine while {current}"
            )));
        }
        if self.destroying.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if force {
            self.force_state(EngineState::Destroying);
        } else {
            self.transition(EngineState::Destroying, None)?;
        }

        self.cancel_idle_timer();

        let streams: Vec<Arc<StreamController>> =
            self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            if let Err(e) = stream.stop().await {
                warn!(stream = stream.id(), error = %e, "stream failed to stop during destroy");
            }
        }

        let denoiser = self.denoiser.lock().take();
        if let Some(mut denoiser) = denoiser {
            denoiser.destroy();
        }
        self.factory.lock().take();
        self.host_info.lock().take();
        self.metrics.shutdown();
        let released = self.chunks.clear();

        self.transition(EngineState::Destroyed, None)?;
        info!(
            chunks_released = released,
            handles_live = self.handles.live_count(),
            "engine destroyed"
        );
        Ok(())
    }
}

fn resolve_chunk_duration(chunking: &ChunkConfig, config: &EngineConfig) -> Result<Duration> {
    match chunking.chunk_duration {
        Some(d) if d.is_zero() => Err(QuellError::Validation(
            "chunk duration must be positive".into(),
        )),
        Some(d) => Ok(d),
        None => Ok(config.chunk_duration()),
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(timer) = self.idle_timer.get_mut().take() {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for NoiseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseEngine")
            .field("state", &self.state())
            .field("streams", &self.inner.streams.lock().len())
            .finish_non_exhaustive()
    }
}
