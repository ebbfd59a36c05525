//! Typed audio containers passed between devices, the codec and the session.

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::Result;

/// Sample rate of microphone audio sent to the remote model (Hz).
pub const OUTBOUND_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of model audio received from the remote (Hz).
pub const INBOUND_SAMPLE_RATE: u32 = 24_000;

/// Fixed PCM format descriptor: 16-bit signed little-endian samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// 16 kHz mono, produced from live capture.
    pub const OUTBOUND: AudioFormat = AudioFormat {
        sample_rate: OUTBOUND_SAMPLE_RATE,
        channels: 1,
    };

    /// 24 kHz mono, produced by the remote model.
    pub const INBOUND: AudioFormat = AudioFormat {
        sample_rate: INBOUND_SAMPLE_RATE,
        channels: 1,
    };

    /// MIME descriptor sent alongside each outbound payload.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Which way a chunk travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn format(self) -> AudioFormat {
        match self {
            Direction::Outbound => AudioFormat::OUTBOUND,
            Direction::Inbound => AudioFormat::INBOUND,
        }
    }
}

/// An immutable block of raw 16-bit PCM bytes with its format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pcm: Vec<u8>,
    direction: Direction,
}

impl AudioChunk {
    /// Decode a base64 payload received in `direction`.
    pub fn from_base64(text: &str, direction: Direction) -> Result<Self> {
        Ok(Self {
            pcm: codec::decode_inbound(text)?,
            direction,
        })
    }

    /// Quantise float capture samples into an outbound chunk.
    pub fn from_samples(samples: &[f32], direction: Direction) -> Self {
        Self {
            pcm: codec::samples_to_pcm(samples),
            direction,
        }
    }

    pub fn pcm(&self) -> &[u8] {
        &self.pcm
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn format(&self) -> AudioFormat {
        self.direction.format()
    }

    /// Text-safe transmissible form.
    pub fn to_base64(&self) -> String {
        codec::pcm_to_base64(&self.pcm)
    }

    /// Interpret the bytes as playable float audio.
    pub fn to_buffer(&self) -> Result<AudioBuffer> {
        let format = self.format();
        codec::bytes_to_audio_buffer(&self.pcm, format.sample_rate, format.channels)
    }
}

/// De-interleaved f32 samples in [-1.0, 1.0] at a known sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl AudioBuffer {
    /// Build from per-channel sample vectors. All channels must be the same length.
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        debug_assert!(
            channels.windows(2).all(|w| w[0].len() == w[1].len()),
            "channel lengths differ"
        );
        Self {
            channels,
            sample_rate,
        }
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(vec![samples], sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, idx: usize) -> Option<&[f32]> {
        self.channels.get(idx).map(Vec::as_slice)
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Returns the duration of this buffer in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Average all channels into one. Mono buffers are returned as-is.
    pub fn into_mono(mut self) -> Vec<f32> {
        if self.channels.len() <= 1 {
            return self.channels.pop().unwrap_or_default();
        }
        let count = self.channels.len() as f32;
        (0..self.frames())
            .map(|f| self.channels.iter().map(|c| c[f]).sum::<f32>() / count)
            .collect()
    }
}

/// One block of mono capture audio at the outbound rate.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    /// Monotonically increasing per capture stream.
    pub seq: u64,
    pub samples: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn mime_type_carries_rate() {
        assert_eq!(AudioFormat::OUTBOUND.mime_type(), "audio/pcm;rate=16000");
        assert_eq!(AudioFormat::INBOUND.mime_type(), "audio/pcm;rate=24000");
    }

    #[test]
    fn duration_uses_frames_not_total_samples() {
        let buffer = AudioBuffer::new(vec![vec![0.0; 12_000], vec![0.0; 12_000]], 24_000);
        assert_eq!(buffer.frames(), 12_000);
        assert_relative_eq!(buffer.duration_secs(), 0.5);
    }

    #[test]
    fn into_mono_averages_channels() {
        let buffer = AudioBuffer::new(vec![vec![0.5, 1.0], vec![-0.5, 0.0]], 24_000);
        assert_eq!(buffer.into_mono(), vec![0.0, 0.5]);
    }

    #[test]
    fn chunk_direction_selects_format() {
        let chunk = AudioChunk::from_samples(&[0.0; 4], Direction::Outbound);
        assert_eq!(chunk.format(), AudioFormat::OUTBOUND);
        assert_eq!(chunk.pcm().len(), 8);
    }
}
