//! Cyclic chunked recording.
//!
//! The frame processor copies original and processed samples into a pair of
//! SPSC taps. A [`RecordingCycleManager`] task drains the taps into the
//! current [`ChunkRecording`] and, every `chunk_duration`, swaps in a fresh
//! recording and finalizes the stopped one on the blocking pool. Finalization
//! never delays the next cycle.
//!
//! ```text
//!  processor ──► tap (original)  ──┐
//!            └─► tap (processed) ──┴─► manager ──► ChunkProcessor ──► ChunkStore + bridge
//! ```

pub mod chunk;
pub mod handles;

pub use chunk::{
    ChunkMetrics, ChunkProcessor, ChunkRecording, ChunkStore, CycleSegments, ProcessedChunk,
    VadPoint, MIN_SEGMENT_BYTES,
};
pub use handles::{AudioHandle, AudioHandleRegistry};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::audio::wav::{SegmentDecoder, WavDecoder};
use crate::bridge::{BridgeEvent, BridgeHandle};
use crate::buffering::{create_audio_ring, AudioConsumer, AudioProducer, Consumer, TAP_RING_CAPACITY};

/// How often the taps are drained into the current recording.
const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

const DRAIN_SCRATCH: usize = 4_800;

/// Per-stream chunking options.
#[derive(Clone)]
pub struct ChunkConfig {
    /// Cycle length; `None` uses the engine's `chunkDurationMs`.
    pub chunk_duration: Option<Duration>,
    pub decoder: Arc<dyn SegmentDecoder>,
}

impl ChunkConfig {
    pub fn new(chunk_duration: Duration) -> Self {
        Self {
            chunk_duration: Some(chunk_duration),
            ..Self::default()
        }
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn SegmentDecoder>) -> Self {
        self.decoder = decoder;
        self
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_duration: None,
            decoder: Arc::new(WavDecoder),
        }
    }
}

impl std::fmt::Debug for ChunkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkConfig")
            .field("chunk_duration", &self.chunk_duration)
            .finish_non_exhaustive()
    }
}

/// Producer side of the recording taps, owned by the frame processor.
pub struct RecorderTap {
    pub original: AudioProducer,
    pub processed: AudioProducer,
}

/// Consumer side of the recording taps, owned by the cycle manager.
pub struct RecorderFeed {
    pub original: AudioConsumer,
    pub processed: AudioConsumer,
}

pub fn recorder_taps() -> (RecorderTap, RecorderFeed) {
    let (orig_tx, orig_rx) = create_audio_ring(TAP_RING_CAPACITY);
    let (proc_tx, proc_rx) = create_audio_ring(TAP_RING_CAPACITY);
    (
        RecorderTap {
            original: orig_tx,
            processed: proc_tx,
        },
        RecorderFeed {
            original: orig_rx,
            processed: proc_rx,
        },
    )
}

/// Where finalized chunks go.
#[derive(Clone)]
pub struct ChunkSink {
    pub processor: ChunkProcessor,
    pub store: Arc<ChunkStore>,
    pub bridge: Option<BridgeHandle>,
}

pub struct RecordingCycleManager {
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RecordingCycleManager {
    /// Start cycle 1 immediately. Must be called inside a tokio runtime.
    pub fn start(chunk_duration: Duration, feed: RecorderFeed, sink: ChunkSink) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_cycles(chunk_duration, feed, sink, stop_rx));
        info!(chunk_ms = chunk_duration.as_millis() as u64, "chunk recording started");
        Self {
            stop_tx: Mutex::new(Some(stop_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    /// Finalize the current cycle and wait for every in-flight finalization.
    /// Later calls return immediately.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "chunk recording task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for RecordingCycleManager {
    fn drop(&mut self) {
        // Dropping the sender ends the loop; in-flight work still completes.
        self.stop_tx.get_mut().take();
    }
}

async fn run_cycles(
    chunk_duration: Duration,
    mut feed: RecorderFeed,
    sink: ChunkSink,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut drain = interval(DRAIN_INTERVAL);
    drain.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut rotate = interval_at(Instant::now() + chunk_duration, chunk_duration);
    rotate.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut scratch = vec![0.0f32; DRAIN_SCRATCH];
    let mut current = ChunkRecording::new(1, Utc::now());
    let mut inflight: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            _ = rotate.tick() => {
                drain_feed(&mut feed, &mut current, &mut scratch);
                let next = ChunkRecording::new(current.cycle + 1, Utc::now());
                let stopped = std::mem::replace(&mut current, next);
                debug!(cycle = stopped.cycle, samples = stopped.original_len(), "cycle rotated");
                inflight.spawn(finalize(stopped, sink.clone()));
            }
            _ = drain.tick() => drain_feed(&mut feed, &mut current, &mut scratch),
            Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "chunk finalization task failed");
                }
            }
        }
    }

    // Stop: the current cycle is the last one; nothing new starts.
    drain_feed(&mut feed, &mut current, &mut scratch);
    inflight.spawn(finalize(current, sink.clone()));
    while let Some(joined) = inflight.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "chunk finalization task failed");
        }
    }
    info!(chunks = sink.store.len(), "chunk recording stopped");
}

fn drain_feed(feed: &mut RecorderFeed, current: &mut ChunkRecording, scratch: &mut [f32]) {
    loop {
        let n = feed.original.pop_slice(scratch);
        if n == 0 {
            break;
        }
        current.push_original(&scratch[..n]);
    }
    loop {
        let n = feed.processed.pop_slice(scratch);
        if n == 0 {
            break;
        }
        current.push_processed(&scratch[..n]);
    }
}

async fn finalize(recording: ChunkRecording, sink: ChunkSink) {
    let ended_at = Utc::now();
    let cycle = recording.cycle;
    let processor = sink.processor.clone();
    let result =
        tokio::task::spawn_blocking(move || processor.finalize(recording, ended_at)).await;
    match result {
        Ok(Some(chunk)) => {
            if sink.store.push(chunk.clone()) {
                info!(cycle, valid = chunk.is_valid, duration = chunk.duration, "chunk ready");
                if let Some(bridge) = &sink.bridge {
                    bridge.emit(BridgeEvent::Chunk(Box::new(chunk)));
                }
            }
        }
        Ok(None) => debug!(cycle, "cycle produced no chunk"),
        Err(e) => error!(cycle, error = %e, "chunk finalization panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::Producer;
    use crate::denoise::DenoiserFactory;

    fn sink() -> ChunkSink {
        let registry = Arc::new(AudioHandleRegistry::new());
        ChunkSink {
            processor: ChunkProcessor::new(
                Arc::new(WavDecoder),
                DenoiserFactory::Degraded.create().unwrap(),
                Arc::clone(&registry),
            ),
            store: Arc::new(ChunkStore::new(registry)),
            bridge: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_finalizes_current_cycle_once() {
        let sink = sink();
        let store = Arc::clone(&sink.store);
        let (mut tap, feed) = recorder_taps();
        let manager = RecordingCycleManager::start(Duration::from_secs(5), feed, sink);

        tap.original.push_slice(&[0.2; 4_800]);
        tap.processed.push_slice(&[0.1; 4_800]);
        tokio::time::sleep(Duration::from_millis(200)).await;

        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_running());

        let chunks = store.list();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].cycle, 1);
        assert!((chunks[0].duration - 0.1).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_run_produces_nothing() {
        let sink = sink();
        let store = Arc::clone(&sink.store);
        let (_tap, feed) = recorder_taps();
        let manager = RecordingCycleManager::start(Duration::from_secs(1), feed, sink);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        manager.stop().await;
        assert!(store.is_empty());
    }
}
