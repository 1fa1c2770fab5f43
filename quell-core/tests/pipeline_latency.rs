use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use quell_core::buffering::{create_audio_ring, Observer, Producer, CAPTURE_RING_CAPACITY};
use quell_core::config::EngineConfig;
use quell_core::denoise::{load_first, DenoiserFactory, EmbeddedLoader, ModuleLoader};
use quell_core::engine::pipeline::{
    spawn_worker, FrameProcessor, PipelineDiagnostics, ProcessorSettings, RealtimePath,
};

fn neural_processor(diagnostics: Arc<PipelineDiagnostics>) -> FrameProcessor {
    let loaders: Vec<Box<dyn ModuleLoader>> = vec![Box::new(EmbeddedLoader)];
    let factory = DenoiserFactory::Neural(load_first(&loaders).expect("embedded weights"));
    let (_control, control_rx) = unbounded();
    FrameProcessor::new(
        factory.create().expect("denoiser"),
        ProcessorSettings::from(&EngineConfig::default()),
        control_rx,
        diagnostics,
    )
}

fn wait_for(len: usize, occupied: impl Fn() -> usize, timeout: Duration) -> Duration {
    let start = Instant::now();
    while occupied() < len {
        if start.elapsed() >= timeout {
            panic!("timed out waiting for {len} output samples");
        }
        thread::sleep(Duration::from_millis(1));
    }
    start.elapsed()
}

#[test]
fn first_frame_latency_under_50ms() {
    let diagnostics = Arc::new(PipelineDiagnostics::default());
    let (mut capture_tx, capture_rx) = create_audio_ring(CAPTURE_RING_CAPACITY);
    let (out_tx, output) = create_audio_ring(48_000);
    let path = RealtimePath::new(48_000, neural_processor(Arc::clone(&diagnostics)), out_tx)
        .expect("realtime path");

    let running = Arc::new(AtomicBool::new(true));
    let handle = spawn_worker(capture_rx, path, Arc::clone(&running)).expect("worker");

    let start = Instant::now();
    capture_tx.push_slice(&vec![0.2; 480]);
    wait_for(480, || output.occupied_len(), Duration::from_secs(2));
    let elapsed = start.elapsed();

    running.store(false, Ordering::SeqCst);
    handle.join().expect("worker thread panicked");

    assert_eq!(diagnostics.snapshot().frames_processed, 1);
    assert!(
        elapsed < Duration::from_millis(50),
        "first frame too slow: {:?} (target < 50ms)",
        elapsed
    );
}

#[test]
fn one_second_of_audio_processes_faster_than_realtime() {
    let diagnostics = Arc::new(PipelineDiagnostics::default());
    let (mut capture_tx, capture_rx) = create_audio_ring(CAPTURE_RING_CAPACITY);
    let (out_tx, output) = create_audio_ring(96_000);
    let path = RealtimePath::new(44_100, neural_processor(Arc::clone(&diagnostics)), out_tx)
        .expect("realtime path");

    let running = Arc::new(AtomicBool::new(true));
    let handle = spawn_worker(capture_rx, path, Arc::clone(&running)).expect("worker");

    let input: Vec<f32> = (0..44_100)
        .map(|i| (i as f32 * 0.05).sin() * 0.25)
        .collect();
    capture_tx.push_slice(&input);
    // 44.1k -> 48k with 960-sample resampler chunks leaves a partial tail.
    let elapsed = wait_for(46_000, || output.occupied_len(), Duration::from_secs(5));

    running.store(false, Ordering::SeqCst);
    handle.join().expect("worker thread panicked");

    assert!(diagnostics.snapshot().frames_processed >= 95);
    assert!(
        elapsed < Duration::from_secs(1),
        "processing slower than realtime: {:?}",
        elapsed
    );
}
