//! PCM16 WAV encoding and the default segment decoder.
//!
//! Recorded segments and file-ingestion output are mono PCM16 WAV. Decoding
//! sits behind [`SegmentDecoder`] so hosts can plug in another container.

use std::io::Cursor;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::buffering::chunk::DecodedAudio;
use crate::error::{QuellError, Result};

/// Size of the canonical RIFF header hound writes for PCM.
pub const WAV_HEADER_BYTES: usize = 44;

/// Opaque `decode(bytes) -> {sample_rate, channels, pcm}` collaborator.
pub trait SegmentDecoder: Send + Sync + 'static {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio>;
}

/// Decoder for RIFF/WAVE containers (integer or float PCM).
#[derive(Debug, Clone, Copy, Default)]
pub struct WavDecoder;

impl SegmentDecoder for WavDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio> {
        let mut reader = WavReader::new(Cursor::new(bytes))?;
        let spec = reader.spec();

        let pcm: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>()?,
            SampleFormat::Int => {
                // hound re-centres unsigned 8-bit samples around zero.
                let bits = spec.bits_per_sample.clamp(1, 32);
                let full_scale = (1_i64 << (bits - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / full_scale))
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };

        Ok(DecodedAudio::new(spec.sample_rate, spec.channels, pcm))
    }
}

#[inline]
pub fn f32_to_pcm16(s: f32) -> i16 {
    (s * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

/// Encode mono f32 samples as a PCM16 WAV byte buffer.
pub fn encode_pcm16_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    if sample_rate == 0 {
        return Err(QuellError::Validation("sample rate must be positive".into()));
    }
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(WAV_HEADER_BYTES + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            writer.write_sample(f32_to_pcm16(s))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Decode a WAV file that must be PCM16; other sample formats are rejected.
pub fn decode_pcm16_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    let reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(QuellError::Unsupported(format!(
            "expected 16-bit PCM, got {}-bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }
    drop(reader);
    WavDecoder.decode(bytes)
}
