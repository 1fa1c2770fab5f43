//! # quell-core
//!
//! Real-time voice noise suppression engine SDK.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → CaptureSource → SPSC RingBuffer → worker thread
//!                                                    │
//!                                  FrameBuffer (480 samples @ 48 kHz)
//!                                                    │
//!                                     AGC → input gain → Denoiser
//!                                                    │
//!                              output ring ─► host sink
//!                              recorder tap ─► RecordingCycleManager ─► ChunkStore
//!                              FrameReport  ─► MetricsManager ─► EventBridge
//! ```
//!
//! The capture callback is zero-alloc on the worker pipeline. All heap work
//! happens on the worker thread or in `spawn_blocking`.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod bridge;
pub mod buffering;
pub mod config;
pub mod denoise;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod recording;

// Convenience re-exports for downstream crates
pub use audio::{AudioHost, CaptureSource, InputDevice};
pub use bridge::{AccessToken, BridgeEvent, EngineStatusEvent, EventBridge, StreamEvent};
pub use config::{Algorithm, EngineConfig, NoiseReductionLevel};
pub use denoise::{Denoiser, DenoiserFactory, ModuleLoader, NeuralModule, ProcessedFrame};
pub use engine::state::EngineState;
pub use engine::stream::{PipelineKind, StreamController, StreamState};
pub use engine::{NoiseEngine, WavReport};
pub use error::{ErrorCode, ErrorRecord, QuellError};
pub use metrics::ProcessingMetrics;
pub use recording::{AudioHandle, ChunkConfig, ProcessedChunk};
