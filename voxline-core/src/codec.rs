//! Sample-domain conversion between float capture audio, 16-bit PCM bytes and
//! the base64 text form used on the wire.
//!
//! Everything here is stateless. Resampling is never done here: capture must
//! already be at 16 kHz, and inbound audio is played at its native 24 kHz.
//!
//! ## Out-of-range samples
//!
//! Capture samples are expected in [-1.0, 1.0]. Values outside that range are
//! not rejected: Rust's float → integer cast saturates, so anything beyond
//! full scale lands on `i16::MIN`/`i16::MAX`, and NaN becomes 0.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::buffering::AudioBuffer;
use crate::error::{Result, VoxlineError};

/// Full-scale divisor shared by both directions.
pub const PCM_SCALE: f32 = 32_768.0;

/// Quantise float samples to little-endian `i16` bytes (truncating).
pub fn samples_to_pcm(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample * PCM_SCALE) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn pcm_to_base64(pcm: &[u8]) -> String {
    STANDARD.encode(pcm)
}

/// Encode a block of 16 kHz mono capture samples for transmission.
pub fn encode_outbound(samples: &[f32]) -> String {
    pcm_to_base64(&samples_to_pcm(samples))
}

/// Undo the text-safe encoding. Interpretation of the bytes is left to
/// [`bytes_to_audio_buffer`].
pub fn decode_inbound(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| VoxlineError::Decode(format!("invalid base64 audio payload: {e}")))
}

/// Reinterpret interleaved 16-bit PCM bytes as a playable float buffer.
///
/// # Errors
/// `MisalignedPcm` when the byte count is not a whole number of frames;
/// `Decode` when `channels` is zero.
pub fn bytes_to_audio_buffer(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<AudioBuffer> {
    if channels == 0 {
        return Err(VoxlineError::Decode("channel count must be non-zero".into()));
    }
    let ch = channels as usize;
    if bytes.len() % (2 * ch) != 0 {
        return Err(VoxlineError::MisalignedPcm {
            len: bytes.len(),
            channels,
        });
    }

    let frames = bytes.len() / (2 * ch);
    let mut out = vec![Vec::with_capacity(frames); ch];
    for (idx, pair) in bytes.chunks_exact(2).enumerate() {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        out[idx % ch].push(value as f32 / PCM_SCALE);
    }

    Ok(AudioBuffer::new(out, sample_rate))
}
