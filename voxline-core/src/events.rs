//! Event types broadcast to hosts (UI layer, logging, tests).
//!
//! | Event | Source |
//! |-------|--------|
//! | `CallStatusEvent` | `CallSession::subscribe_status` |
//! | `SpeakingEvent` | `CallSession::subscribe_speaking` |
//! | `MessageUpdateEvent` | `Conversations::subscribe` |
//!
//! All types serialise with camelCase fields so a web front end can consume
//! them unchanged.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Call lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a voice call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// No call UI open.
    Idle,
    /// The user is choosing a voice.
    Selecting,
    /// Microphone and remote handshake in flight.
    Connecting,
    /// Duplex audio flowing.
    Active,
    /// Terminal. Every resource has been released.
    Closed,
}

/// Emitted whenever the call changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatusEvent {
    pub status: CallState,
    /// Optional human-readable detail (e.g. setup error message).
    pub detail: Option<String>,
}

/// Emitted when the model starts or stops producing audible output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakingEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub speaking: bool,
}

// ---------------------------------------------------------------------------
// Chat message updates
// ---------------------------------------------------------------------------

/// Distinguishes a still-growing response from a frozen one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    /// Text may grow on the next event with the same `message_id`.
    Streaming,
    /// The response completed; text will not change.
    Final,
    /// The stream failed; text holds the failure notice and will not change.
    Failed,
}

/// Emitted whenever a model message's displayed text changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdateEvent {
    pub seq: u64,
    pub session_id: String,
    /// Stable for the whole life of one response.
    pub message_id: String,
    /// Full text as it should now be displayed (not a delta).
    pub text: String,
    pub kind: UpdateKind,
}
