//! # voxline-core
//!
//! Realtime duplex voice call engine plus the streaming chat state it shares
//! update semantics with.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → cpal callback → SPSC RingBuffer → capture worker (spawn_blocking)
//!                                                     │ 16 kHz frames (mpsc)
//!                                               call::capture task
//!                                                     │ base64 PCM
//!                                             LiveSession::send_audio
//!
//! LiveConnector events (mpsc) ─► CallSession::step ─► PlaybackScheduler
//!                                      ▲                     │ schedule(start_at)
//!                                      └── finished ids ── OutputDevice (speaker mixer)
//! ```
//!
//! The audio callbacks never allocate after warm-up and never wait on the
//! network. All scheduling decisions happen on the task that owns the
//! `CallSession`.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod call;
pub mod chat;
pub mod codec;
pub mod error;
pub mod events;
pub mod remote;

// Convenience re-exports for downstream crates
pub use audio::{AudioBackend, CpalBackend, OutputDevice};
pub use buffering::{AudioBuffer, AudioChunk, AudioFormat};
pub use call::{CallConfig, CallEvent, CallSession, CancelHandle};
pub use chat::{drive_response, ChatAttachment, ChatMode, Conversations, TextEvent};
pub use error::{Result, VoxlineError};
pub use events::{CallState, CallStatusEvent, MessageUpdateEvent, SpeakingEvent, UpdateKind};
pub use remote::{LiveConnector, LiveSession, LoopbackConnector, Voice};
