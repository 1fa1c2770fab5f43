//! Processing metrics.
//!
//! Frame processors send one [`FrameReport`] per callback over a bounded
//! crossbeam channel with `try_send`, so the real-time path never waits. The
//! [`MetricsManager`] task drains reports on its own cadence and publishes a
//! [`ProcessingMetrics`] snapshot through a `watch` channel and the bridge.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bridge::{BridgeEvent, BridgeHandle};

/// Frame reports buffered before processors start dropping them.
pub const REPORT_QUEUE_CAP: usize = 1_024;

/// Reports kept in the rolling window.
const WINDOW: usize = 32;

/// `vad_level` above this counts as voice.
pub const VOICE_ACTIVE_THRESHOLD: f32 = 0.3;

/// Summary of one capture callback.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameReport {
    pub input_rms: f32,
    pub output_rms: f32,
    pub input_peak: f32,
    /// Mean VAD over the frames completed in this callback.
    pub vad: f32,
    pub frames: u32,
    pub dropped: u32,
    /// Smoothed reduction percentage held by the processor.
    pub reduction_percent: f32,
    pub latency_ms: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetrics {
    pub input_level: f32,
    pub output_level: f32,
    pub peak_level: f32,
    /// 0-100.
    pub noise_reduction_level: f32,
    pub vad_level: f32,
    pub is_voice_active: bool,
    pub frame_count: u64,
    pub dropped_frames: u64,
    /// Milliseconds spent per callback, averaged over the window.
    pub processing_latency: f32,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Rolling aggregation over the most recent reports.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    window: VecDeque<FrameReport>,
    frame_count: u64,
    dropped_frames: u64,
    reduction: f32,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(WINDOW),
            ..Self::default()
        }
    }

    pub fn record(&mut self, report: FrameReport) {
        if self.window.len() == WINDOW {
            self.window.pop_front();
        }
        self.frame_count += report.frames as u64;
        self.dropped_frames += report.dropped as u64;
        self.reduction = report.reduction_percent;
        self.window.push_back(report);
    }

    pub fn snapshot(&self) -> ProcessingMetrics {
        let n = self.window.len().max(1) as f32;
        let mean = |f: fn(&FrameReport) -> f32| self.window.iter().map(f).sum::<f32>() / n;
        let vad_level = mean(|r| r.vad).clamp(0.0, 1.0);
        ProcessingMetrics {
            input_level: mean(|r| r.input_rms).clamp(0.0, 1.0),
            output_level: mean(|r| r.output_rms).clamp(0.0, 1.0),
            peak_level: self
                .window
                .iter()
                .map(|r| r.input_peak)
                .fold(0.0, f32::max)
                .clamp(0.0, 1.0),
            noise_reduction_level: self.reduction.clamp(0.0, 100.0),
            vad_level,
            is_voice_active: vad_level > VOICE_ACTIVE_THRESHOLD,
            frame_count: self.frame_count,
            dropped_frames: self.dropped_frames,
            processing_latency: mean(|r| r.latency_ms),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

pub struct MetricsManager {
    tx: Sender<FrameReport>,
    rx: Receiver<FrameReport>,
    latest: Arc<watch::Sender<ProcessingMetrics>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsManager {
    pub fn new() -> Self {
        let (tx, rx) = bounded(REPORT_QUEUE_CAP);
        let (latest, _) = watch::channel(ProcessingMetrics::default());
        Self {
            tx,
            rx,
            latest: Arc::new(latest),
            task: Mutex::new(None),
        }
    }

    /// Handed to every frame processor.
    pub fn sender(&self) -> Sender<FrameReport> {
        self.tx.clone()
    }

    /// Spawn the aggregation task on the current runtime. No-op if running.
    pub fn start(&self, interval: Duration, bridge: Option<BridgeHandle>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let rx = self.rx.clone();
        let latest = Arc::clone(&self.latest);
        info!(interval_ms = interval.as_millis() as u64, "metrics manager started");
        *task = Some(tokio::spawn(async move {
            let mut aggregator = MetricsAggregator::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for report in rx.try_iter() {
                    aggregator.record(report);
                }
                let snapshot = aggregator.snapshot();
                latest.send_replace(snapshot.clone());
                if let Some(bridge) = &bridge {
                    bridge.emit(BridgeEvent::Metrics(snapshot));
                }
            }
        }));
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn latest(&self) -> ProcessingMetrics {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessingMetrics> {
        self.latest.subscribe()
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("metrics manager stopped");
        }
        // Drop anything queued after the last tick.
        for _ in self.rx.try_iter() {}
    }
}

impl Default for MetricsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MetricsManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn report(input: f32, output: f32, vad: f32) -> FrameReport {
        FrameReport {
            input_rms: input,
            output_rms: output,
            input_peak: input * 2.0,
            vad,
            frames: 2,
            dropped: 0,
            reduction_percent: 25.0,
            latency_ms: 0.5,
        }
    }

    #[test]
    fn snapshot_averages_window_and_accumulates_counts() {
        let mut agg = MetricsAggregator::new();
        agg.record(report(0.2, 0.1, 0.2));
        agg.record(report(0.4, 0.3, 0.6));
        let m = agg.snapshot();
        assert_relative_eq!(m.input_level, 0.3, epsilon = 1e-6);
        assert_relative_eq!(m.output_level, 0.2, epsilon = 1e-6);
        assert_relative_eq!(m.peak_level, 0.8, epsilon = 1e-6);
        assert_relative_eq!(m.vad_level, 0.4, epsilon = 1e-6);
        assert!(m.is_voice_active);
        assert_eq!(m.frame_count, 4);
        assert_relative_eq!(m.noise_reduction_level, 25.0);
    }

    #[test]
    fn voice_threshold_is_exclusive() {
        let mut agg = MetricsAggregator::new();
        agg.record(report(0.1, 0.1, 0.3));
        assert!(!agg.snapshot().is_voice_active);
    }

    #[test]
    fn window_is_bounded() {
        let mut agg = MetricsAggregator::new();
        for _ in 0..WINDOW {
            agg.record(report(1.0, 1.0, 1.0));
        }
        for _ in 0..WINDOW {
            agg.record(report(0.0, 0.0, 0.0));
        }
        assert_eq!(agg.snapshot().input_level, 0.0);
        assert_eq!(agg.snapshot().frame_count, 2 * WINDOW as u64 * 2);
    }

    #[test]
    fn metrics_serialize_camel_case() {
        let json = serde_json::to_value(ProcessingMetrics::default()).unwrap();
        assert!(json.get("isVoiceActive").is_some());
        assert!(json.get("droppedFrames").is_some());
        assert!(json.get("noiseReductionLevel").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn manager_publishes_on_its_own_cadence() {
        let manager = MetricsManager::new();
        let mut rx = manager.subscribe();
        manager.start(Duration::from_millis(100), None);
        manager.sender().try_send(report(0.5, 0.25, 0.9)).unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        rx.changed().await.unwrap();
        let m = manager.latest();
        assert_eq!(m.frame_count, 2);
        assert!(m.is_voice_active);

        manager.shutdown();
        assert!(!manager.is_running());
    }
}
