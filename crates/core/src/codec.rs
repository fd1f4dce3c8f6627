//! PCM16 audio codec.
//!
//! Converts between float samples, linear PCM16, and the base64 text encoding
//! that the realtime wire protocol carries. Everything here is pure.

use crate::error::CodecError;
use base64::Engine;

/// Sample rate of microphone audio sent to the remote service.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of synthesized audio received from the remote service.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Number of samples per captured chunk.
pub const CAPTURE_FRAME_SIZE: usize = 4096;

const BYTES_PER_SAMPLE: usize = 2;

/// Format tag attached to every audio chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    /// The mime type the remote endpoint expects for raw PCM16.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// An encoded, immutable piece of audio handed between pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Base64 of little-endian PCM16 bytes.
    pub data: String,
    pub format: AudioFormat,
}

/// Decoded audio ready for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    /// Interleaved samples in [-1.0, 1.0).
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PlayableBuffer {
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frames() as f64 / f64::from(self.sample_rate)
    }
}

/// Converts float samples to PCM16 by scaling with 32768 and truncating.
///
/// No clamping is applied beyond the saturation of the float-to-int cast, so
/// `1.0` lands on `i16::MAX` and anything outside [-1.0, 1.0] pins to the
/// integer bounds. Callers that care about out-of-range input clamp first.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| (s * 32768.0) as i16).collect()
}

/// Inverse of [`float_to_pcm16`]: divides by 32768.0.
pub fn pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| f32::from(s) / 32768.0).collect()
}

/// Encodes PCM16 samples as base64 of their little-endian bytes.
pub fn encode(pcm16: &[i16]) -> String {
    let bytes: Vec<u8> = pcm16.iter().flat_map(|s| s.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decodes transport text back into PCM16 samples.
///
/// Fails if the text is not base64 or the byte count is odd.
pub fn decode_pcm16(data: &str) -> Result<Vec<i16>, CodecError> {
    decode_frames(data, 1)
}

/// Decodes transport text into a playable buffer for the given format.
///
/// The byte length must be a whole multiple of `2 * channels`.
pub fn decode(data: &str, sample_rate: u32, channels: u16) -> Result<PlayableBuffer, CodecError> {
    let pcm = decode_frames(data, channels)?;
    Ok(PlayableBuffer {
        samples: pcm16_to_float(&pcm),
        sample_rate,
        channels,
    })
}

/// Converts float capture samples straight into an encoded chunk.
pub fn encode_chunk(samples: &[f32], format: AudioFormat) -> AudioChunk {
    AudioChunk {
        data: encode(&float_to_pcm16(samples)),
        format,
    }
}

fn decode_frames(data: &str, channels: u16) -> Result<Vec<i16>, CodecError> {
    if channels == 0 {
        return Err(CodecError::Malformed("channel count must be non-zero".into()));
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| CodecError::Malformed(format!("invalid base64: {e}")))?;
    let frame_size = BYTES_PER_SAMPLE * usize::from(channels);
    if bytes.len() % frame_size != 0 {
        return Err(CodecError::Malformed(format!(
            "{} bytes is not a multiple of the {frame_size}-byte frame",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}
