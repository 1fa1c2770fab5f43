//! Capture abstraction and the cpal backend.
//!
//! # Design constraints
//!
//! The capture callback runs on an OS audio thread at elevated priority. The
//! [`SampleSink`] it calls must not block or perform I/O; the worker pipeline
//! only copies into an SPSC ring there, the inline pipeline runs the
//! allocation-free frame processor.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). [`CpalSource`] therefore builds the stream on a dedicated capture
//! thread, reports the open result back over a sync channel, and drops the
//! stream on that same thread when the handle is released.

pub mod device;
pub mod resample;
pub mod wav;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{QuellError, Result};

pub use device::{list_input_devices, InputDevice};

/// Receives mono f32 samples plus the rate they were captured at.
pub type SampleSink = Box<dyn FnMut(&[f32], u32) + Send + 'static>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Fixed device buffer in frames; `None` accepts the device default.
    pub buffer_size: Option<u32>,
    pub preferred_device: Option<String>,
}

/// Something that can open a capture stream delivering samples to a sink.
pub trait CaptureSource: Send + Sync {
    fn open(&self, request: &CaptureRequest, sink: SampleSink) -> Result<Box<dyn CaptureHandle>>;
}

/// A live capture. `release` stops the hardware; later calls are no-ops.
pub trait CaptureHandle: Send {
    fn sample_rate(&self) -> u32;
    fn release(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub name: String,
    pub input_devices: Vec<InputDevice>,
}

/// The audio context: resolved once during initialization.
pub trait AudioHost: Send + Sync {
    fn probe(&self) -> Result<HostInfo>;
    fn default_source(&self) -> Arc<dyn CaptureSource>;
}

/// Host with no capture hardware. File ingestion and explicit sources work.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHost;

impl AudioHost for NullHost {
    fn probe(&self) -> Result<HostInfo> {
        Ok(HostInfo {
            name: "null".into(),
            input_devices: Vec::new(),
        })
    }

    fn default_source(&self) -> Arc<dyn CaptureSource> {
        Arc::new(NullSource)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullSource;

impl CaptureSource for NullSource {
    fn open(&self, _request: &CaptureRequest, _sink: SampleSink) -> Result<Box<dyn CaptureHandle>> {
        Err(QuellError::Unsupported(
            "no capture backend available".into(),
        ))
    }
}

/// Host for the current build: cpal when compiled in, otherwise [`NullHost`].
pub fn default_host() -> Arc<dyn AudioHost> {
    #[cfg(feature = "audio-cpal")]
    {
        Arc::new(CpalHost)
    }
    #[cfg(not(feature = "audio-cpal"))]
    {
        Arc::new(NullHost)
    }
}

#[cfg(feature = "audio-cpal")]
pub use cpal_backend::{CpalHost, CpalSource};

#[cfg(feature = "audio-cpal")]
mod cpal_backend {
    use std::sync::{mpsc, Arc};
    use std::thread::JoinHandle;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{BufferSize, SampleFormat, SizedSample, Stream, StreamConfig, SupportedBufferSize};
    use crossbeam_channel::{bounded, Receiver, Sender};
    use tracing::{error, info, warn};

    use super::device::is_loopback_name;
    use super::{AudioHost, CaptureHandle, CaptureRequest, CaptureSource, HostInfo, SampleSink};
    use crate::error::{QuellError, Result};

    #[derive(Debug, Clone, Copy, Default)]
    pub struct CpalHost;

    impl AudioHost for CpalHost {
        fn probe(&self) -> Result<HostInfo> {
            let host = cpal::default_host();
            let name = host.id().name().to_string();
            let input_devices = super::list_input_devices();
            if input_devices.is_empty() && host.default_input_device().is_none() {
                warn!(host = %name, "audio host reports no input devices");
            }
            Ok(HostInfo {
                name,
                input_devices,
            })
        }

        fn default_source(&self) -> Arc<dyn CaptureSource> {
            Arc::new(CpalSource)
        }
    }

    /// Raw device input. cpal requests no host-side processing, so no
    /// platform echo cancellation or noise suppression is stacked in front.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct CpalSource;

    impl CaptureSource for CpalSource {
        fn open(
            &self,
            request: &CaptureRequest,
            sink: SampleSink,
        ) -> Result<Box<dyn CaptureHandle>> {
            let (open_tx, open_rx) = mpsc::channel::<Result<u32>>();
            let (release_tx, release_rx) = bounded::<()>(1);
            let request = request.clone();

            let thread = std::thread::Builder::new()
                .name("quell-capture".into())
                .spawn(move || capture_thread(request, sink, open_tx, release_rx))
                .map_err(|e| QuellError::AudioContext(format!("spawn capture thread: {e}")))?;

            match open_rx.recv() {
                Ok(Ok(sample_rate)) => Ok(Box::new(CpalCapture {
                    sample_rate,
                    release_tx: Some(release_tx),
                    thread: Some(thread),
                })),
                Ok(Err(e)) => {
                    let _ = thread.join();
                    Err(e)
                }
                Err(_) => {
                    let _ = thread.join();
                    Err(QuellError::AudioContext(
                        "capture thread exited before reporting".into(),
                    ))
                }
            }
        }
    }

    /// Owns the stream for its whole life; exits once released.
    fn capture_thread(
        request: CaptureRequest,
        sink: SampleSink,
        open_tx: mpsc::Sender<Result<u32>>,
        release_rx: Receiver<()>,
    ) {
        let (stream, sample_rate) = match open_stream(&request, sink) {
            Ok(opened) => opened,
            Err(e) => {
                let _ = open_tx.send(Err(e));
                return;
            }
        };
        if open_tx.send(Ok(sample_rate)).is_err() {
            return;
        }
        // Either an explicit release or the handle being dropped ends capture.
        let _ = release_rx.recv();
        drop(stream);
        info!("capture stream closed");
    }

    fn open_stream(request: &CaptureRequest, sink: SampleSink) -> Result<(Stream, u32)> {
        let host = cpal::default_host();
        let device = resolve_device(&host, request.preferred_device.as_deref())?;
        let name = device.name().unwrap_or_default();
        if is_loopback_name(&name) {
            warn!(device = %name, "input looks like a loopback device; output may echo");
        }

        let supported = device
            .default_input_config()
            .map_err(|e| QuellError::AudioContext(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();

        let buffer_size = match (request.buffer_size, supported.buffer_size()) {
            (None, _) => BufferSize::Default,
            (Some(frames), SupportedBufferSize::Range { min, max })
                if frames < *min || frames > *max =>
            {
                return Err(QuellError::Unsupported(format!(
                    "buffer of {frames} frames outside device range {min}..={max}"
                )));
            }
            (Some(frames), _) => BufferSize::Fixed(frames),
        };

        info!(device = %name, sample_rate, channels, ?buffer_size, "opening input device");

        let config = StreamConfig {
            channels,
            sample_rate: supported.sample_rate(),
            buffer_size,
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build::<f32, _>(&device, &config, sink, |s| s),
            SampleFormat::I16 => build::<i16, _>(&device, &config, sink, |s| s as f32 / 32768.0),
            SampleFormat::U8 => {
                build::<u8, _>(&device, &config, sink, |s| (s as f32 - 128.0) / 128.0)
            }
            fmt => {
                return Err(QuellError::Unsupported(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| QuellError::AudioContext(e.to_string()))?;
        Ok((stream, sample_rate))
    }

    fn resolve_device(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
        if let Some(want) = preferred {
            match host.input_devices() {
                Ok(mut devices) => {
                    if let Some(d) = devices.find(|d| d.name().map(|n| n == want).unwrap_or(false))
                    {
                        return Ok(d);
                    }
                    warn!(device = want, "preferred input device not found, falling back");
                }
                Err(e) => warn!(error = %e, "failed to list input devices"),
            }
        }
        if let Some(d) = host.default_input_device() {
            return Ok(d);
        }
        host.input_devices()
            .map_err(|e| QuellError::AudioContext(e.to_string()))?
            .next()
            .ok_or_else(|| QuellError::AudioContext("no input device available".into()))
    }

    /// Build an input stream that downmixes to mono before calling `sink`.
    fn build<T, F>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut sink: SampleSink,
        to_f32: F,
    ) -> Result<Stream>
    where
        T: SizedSample,
        F: Fn(T) -> f32 + Send + 'static,
    {
        let ch = config.channels.max(1) as usize;
        let rate = config.sample_rate.0;
        let mut mono: Vec<f32> = Vec::with_capacity(8_192);
        device
            .build_input_stream(
                config,
                move |data: &[T], _info| {
                    mono.clear();
                    mono.extend(
                        data.chunks_exact(ch)
                            .map(|f| f.iter().map(|&s| to_f32(s)).sum::<f32>() / ch as f32),
                    );
                    sink(&mono, rate);
                },
                |err| error!("audio stream error: {err}"),
                None,
            )
            .map_err(|e| QuellError::AudioContext(e.to_string()))
    }

    struct CpalCapture {
        sample_rate: u32,
        release_tx: Option<Sender<()>>,
        thread: Option<JoinHandle<()>>,
    }

    impl CaptureHandle for CpalCapture {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn release(&mut self) {
            if let Some(tx) = self.release_tx.take() {
                let _ = tx.send(());
            }
            if let Some(thread) = self.thread.take() {
                if thread.join().is_err() {
                    error!("capture thread panicked");
                }
            }
        }
    }

    impl Drop for CpalCapture {
        fn drop(&mut self) {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_host_probes_and_refuses_capture() {
        let host = NullHost;
        assert_eq!(host.probe().unwrap().name, "null");
        let err = match host
            .default_source()
            .open(&CaptureRequest::default(), Box::new(|_, _| {}))
        {
            Ok(_) => panic!("null source must not open"),
            Err(e) => e,
        };
        assert_eq!(err.code(), crate::error::ErrorCode::Unsupported);
    }
}
