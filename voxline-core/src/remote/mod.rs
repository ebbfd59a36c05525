//! Remote live model session abstraction.
//!
//! `LiveConnector` opens a session; the resulting [`SessionHandle`] splits into
//! an outbound half ([`LiveSession`], shared) and an inbound event stream
//! owned by the call loop. Transport details stay behind these traits so the
//! call pipeline can run against the real endpoint, the loopback endpoint or a
//! test double.

pub mod loopback;
pub mod wire;

pub use loopback::LoopbackConnector;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::buffering::AudioFormat;
use crate::error::Result;

/// Model used by the live voice endpoint.
pub const LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

/// Default persona prompt for calls.
pub const DEFAULT_CALL_PROMPT: &str = "You are speaking with the user over a phone call. \
Your name is FahzGPT. Be a responsive and concise voice assistant.";

/// Prebuilt voices the live endpoint can speak with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Voice {
    /// Male voice, shown to users as "Adam".
    #[default]
    Charon,
    /// Female voice.
    Kore,
}

impl Voice {
    pub const ALL: [Voice; 2] = [Voice::Charon, Voice::Kore];

    /// Name the endpoint expects in the speech config.
    pub fn api_name(self) -> &'static str {
        match self {
            Voice::Charon => "Charon",
            Voice::Kore => "Kore",
        }
    }

    /// Name shown in the voice picker.
    pub fn display_name(self) -> &'static str {
        match self {
            Voice::Charon => "Adam",
            Voice::Kore => "Kore",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Voice::Charon => "Male voice",
            Voice::Kore => "Female voice",
        }
    }

    /// Parse either the API name or the display name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Voice::ALL.into_iter().find(|v| {
            v.api_name().eq_ignore_ascii_case(name) || v.display_name().eq_ignore_ascii_case(name)
        })
    }
}

impl fmt::Display for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Parameters of one session handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    pub voice: Voice,
    pub system_prompt: String,
    /// Format of audio this client will send.
    pub input_format: AudioFormat,
    /// Format of audio the client expects back.
    pub output_format: AudioFormat,
}

/// Server-to-client events, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Base64 16-bit PCM at the session's output format.
    Audio { data: String },
    /// The model stopped speaking because the user spoke over it.
    Interrupted,
    /// The model finished its turn.
    TurnComplete,
    /// The remote closed the session. No further events follow.
    Closed { reason: Option<String> },
}

/// Outbound half of an open session.
pub trait LiveSession: Send + Sync + 'static {
    /// Submit one encoded capture frame.
    ///
    /// Never blocks on the network: implementations queue or drop. Errors mean
    /// the submission was refused, not that delivery failed later.
    fn send_audio(&self, data: String, format: AudioFormat) -> Result<()>;

    /// End the session. Closing twice is a no-op.
    fn close(&self);
}

/// An open session: shared outbound half plus the inbound event stream.
pub struct SessionHandle {
    pub session: Arc<dyn LiveSession>,
    pub events: mpsc::Receiver<InboundEvent>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle").finish_non_exhaustive()
    }
}

/// Opens live sessions.
pub trait LiveConnector: Send + Sync + 'static {
    /// Perform the handshake. Resolves once the session is ready for audio.
    ///
    /// # Errors
    /// `Handshake` when the remote refuses or cannot be reached.
    fn connect(&self, request: SessionRequest) -> impl Future<Output = Result<SessionHandle>> + Send;
}
