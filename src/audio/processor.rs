//! # Audio Decoding and Validation
//!
//! Turns `input_audio_buffer.append` payloads into PCM bytes and checks that
//! the session's declared format is one we can feed to VAD and ASR.
//!
//! ## Format Requirements:
//! - **Sample Rate**: 16kHz
//! - **Encoding**: PCM16 little-endian (`pcm` or `pcm16` on the wire)
//! - **Channels**: mono

use crate::error::SessionError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{ByteOrder, LittleEndian};

pub const SAMPLE_RATE: u32 = 16_000;
pub const CHANNELS: u16 = 1;
pub const BYTES_PER_SAMPLE: u64 = 2;

/// Bytes of audio per millisecond at the fixed session format.
const BYTES_PER_MS: u64 = SAMPLE_RATE as u64 * BYTES_PER_SAMPLE / 1000;

/// Validated audio format of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    /// Format name exactly as the client sent it, echoed back in `session.updated`.
    pub name: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            name: "pcm16".to_string(),
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
        }
    }
}

impl AudioFormat {
    /// Validate a client-declared format.
    ///
    /// Anything other than 16kHz PCM16 is rejected as `InvalidConfig`; VAD
    /// frame sizes and backend expectations are tied to that format.
    pub fn parse(name: &str, sample_rate: u32) -> Result<Self, SessionError> {
        match name {
            "pcm" | "pcm16" => {}
            other => {
                return Err(SessionError::InvalidConfig(format!(
                    "Unsupported input_audio_format '{}', expected pcm16",
                    other
                )))
            }
        }

        if sample_rate != SAMPLE_RATE {
            return Err(SessionError::InvalidConfig(format!(
                "Unsupported sample_rate {}, expected {}",
                sample_rate, SAMPLE_RATE
            )));
        }

        Ok(Self {
            name: name.to_string(),
            sample_rate,
            channels: CHANNELS,
        })
    }
}

/// Decode the base64 `audio` field of an append event.
pub fn decode_base64_audio(audio_b64: &str) -> Result<Vec<u8>, SessionError> {
    STANDARD
        .decode(audio_b64.trim())
        .map_err(|e| SessionError::InvalidAudioFrame(format!("Failed to decode base64 audio: {}", e)))
}

/// PCM16 payloads must contain a whole number of samples.
pub fn validate_alignment(data: &[u8]) -> Result<(), SessionError> {
    if data.len() as u64 % BYTES_PER_SAMPLE != 0 {
        return Err(SessionError::InvalidAudioFrame(format!(
            "Audio payload of {} bytes is not aligned to 16-bit samples",
            data.len()
        )));
    }
    Ok(())
}

/// Reinterpret aligned little-endian bytes as samples.
pub fn pcm16_samples(data: &[u8]) -> Vec<i16> {
    let mut samples = vec![0i16; data.len() / BYTES_PER_SAMPLE as usize];
    LittleEndian::read_i16_into(&data[..samples.len() * 2], &mut samples);
    samples
}

pub fn bytes_to_ms(bytes: u64) -> u64 {
    bytes / BYTES_PER_MS
}

pub fn sample_to_byte(sample: u64) -> u64 {
    sample * BYTES_PER_SAMPLE
}

pub fn byte_to_sample(byte: u64) -> u64 {
    byte / BYTES_PER_SAMPLE
}

/// Sample-aligned byte count for a duration in seconds.
pub fn seconds_to_bytes(seconds: f64) -> u64 {
    let samples = (seconds * SAMPLE_RATE as f64).round().max(0.0) as u64;
    sample_to_byte(samples)
}
