#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use quell_core::audio::{CaptureHandle, CaptureRequest, CaptureSource, NullHost, SampleSink};
use quell_core::buffering::{AudioConsumer, Observer};
use quell_core::denoise::{EmbeddedLoader, LoadedModule, ModuleLoader};
use quell_core::error::{QuellError, Result};
use quell_core::{EngineConfig, NoiseEngine};

/// Capture source driven by the test instead of a device callback.
pub struct ScriptedSource {
    rate: u32,
    reject_fixed_buffer: bool,
    fail_all: bool,
    sink: Arc<Mutex<Option<SampleSink>>>,
    requests: Mutex<Vec<CaptureRequest>>,
    releases: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(rate: u32) -> Arc<Self> {
        Arc::new(Self::build(rate, false, false))
    }

    /// Refuses fixed device buffers, forcing the inline pipeline.
    pub fn rejecting_fixed_buffer() -> Arc<Self> {
        Arc::new(Self::build(48_000, true, false))
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self::build(48_000, false, true))
    }

    fn build(rate: u32, reject_fixed_buffer: bool, fail_all: bool) -> Self {
        Self {
            rate,
            reject_fixed_buffer,
            fail_all,
            sink: Arc::new(Mutex::new(None)),
            requests: Mutex::new(Vec::new()),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Deliver one callback block. Returns false when no capture is open.
    pub fn feed(&self, samples: &[f32]) -> bool {
        match self.sink.lock().as_mut() {
            Some(sink) => {
                sink(samples, self.rate);
                true
            }
            None => false,
        }
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CaptureRequest> {
        self.requests.lock().clone()
    }
}

impl CaptureSource for ScriptedSource {
    fn open(&self, request: &CaptureRequest, sink: SampleSink) -> Result<Box<dyn CaptureHandle>> {
        self.requests.lock().push(request.clone());
        if self.fail_all {
            return Err(QuellError::AudioContext("device unplugged".into()));
        }
        if self.reject_fixed_buffer && request.buffer_size.is_some() {
            return Err(QuellError::Unsupported("fixed buffer sizes".into()));
        }
        *self.sink.lock() = Some(sink);
        Ok(Box::new(ScriptedCapture {
            rate: self.rate,
            sink: Arc::clone(&self.sink),
            releases: Arc::clone(&self.releases),
            released: false,
        }))
    }
}

struct ScriptedCapture {
    rate: u32,
    sink: Arc<Mutex<Option<SampleSink>>>,
    releases: Arc<AtomicUsize>,
    released: bool,
}

impl CaptureHandle for ScriptedCapture {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.sink.lock().take();
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Loader that always fails with the given error.
pub struct FailingLoader(pub QuellError);

impl ModuleLoader for FailingLoader {
    fn strategy(&self) -> &'static str {
        "failing"
    }

    fn load(&self) -> Result<LoadedModule> {
        Err(self.0.clone())
    }
}

/// Embedded weights, counting how often loading runs.
pub struct CountingLoader(pub Arc<AtomicUsize>);

impl ModuleLoader for CountingLoader {
    fn strategy(&self) -> &'static str {
        "counting"
    }

    fn load(&self) -> Result<LoadedModule> {
        self.0.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        EmbeddedLoader.load()
    }
}

/// Loader that blocks far past any sane load timeout.
pub struct HangingLoader(pub Duration);

impl ModuleLoader for HangingLoader {
    fn strategy(&self) -> &'static str {
        "hanging"
    }

    fn load(&self) -> Result<LoadedModule> {
        std::thread::sleep(self.0);
        EmbeddedLoader.load()
    }
}

pub fn engine_with(config: EngineConfig, loaders: Vec<Box<dyn ModuleLoader>>) -> NoiseEngine {
    NoiseEngine::builder(config)
        .host(Arc::new(NullHost))
        .loaders(loaders)
        .build()
}

pub fn neural_engine() -> NoiseEngine {
    engine_with(EngineConfig::default(), vec![Box::new(EmbeddedLoader)])
}

pub fn tone(len: usize, amplitude: f32) -> Vec<f32> {
    (0..len)
        .map(|i| (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / 48_000.0).sin() * amplitude)
        .collect()
}

/// Poll until the output ring holds at least `len` samples.
pub async fn wait_for_output(output: &AudioConsumer, len: usize, limit: Duration) -> bool {
    let start = Instant::now();
    while output.occupied_len() < len {
        if start.elapsed() > limit {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    true
}
