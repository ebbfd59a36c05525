use thiserror::Error;

use crate::events::CallState;

/// All errors produced by voxline-core.
#[derive(Debug, Error)]
pub enum VoxlineError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("output device is closed")]
    DeviceClosed,

    #[error("microphone unavailable: {0}")]
    MicrophoneDenied(String),

    #[error("session handshake failed: {0}")]
    Handshake(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("call setup cancelled")]
    Cancelled,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("PCM payload of {len} bytes is not a whole number of {channels}-channel 16-bit frames")]
    MisalignedPcm { len: usize, channels: u16 },

    #[error("sample rate mismatch: expected {expected} Hz, got {actual} Hz")]
    FormatMismatch { expected: u32, actual: u32 },

    #[error("cannot {action} while call is {from:?}")]
    InvalidTransition { from: CallState, action: &'static str },

    #[error("a response is already streaming in session {0}")]
    ResponseInFlight(String),

    #[error("unknown chat session: {0}")]
    UnknownSession(String),

    #[error("no streaming response {message_id} in session {session_id}")]
    UnknownResponse {
        session_id: String,
        message_id: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoxlineError>;
