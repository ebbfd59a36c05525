//! `LoopbackConnector`: a live endpoint that speaks back what it hears.
//!
//! Each outbound frame is decoded, converted from the input rate to the output
//! rate and returned as one inbound audio chunk. No network is involved, so the
//! whole call pipeline can be exercised end-to-end on a laptop or in tests.
//!
//! Traffic in both directions goes through the JSON frames of [`wire`]: the
//! handshake is a serialized setup answered by `setupComplete`, each frame is
//! a `realtimeInput` message and each reply a `serverContent` message parsed
//! with [`wire::parse_server_message`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::audio::resample::RateConverter;
use crate::buffering::AudioFormat;
use crate::codec;
use crate::error::{Result, VoxlineError};
use crate::remote::wire::{self, ClientMessage, ServerMessage};
use crate::remote::{InboundEvent, LiveConnector, LiveSession, SessionHandle, SessionRequest};

/// Input frames converted per resampler pass.
const CONVERT_BLOCK: usize = 1_024;

/// Echo endpoint. See module docs.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    handshake_delay: Duration,
    refuse: Option<String>,
    queue: usize,
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self {
            handshake_delay: Duration::ZERO,
            refuse: None,
            queue: 64,
        }
    }

    /// Wait this long before the handshake resolves.
    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    /// Refuse every handshake with `reason`.
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self {
            refuse: Some(reason.into()),
            ..Self::new()
        }
    }
}

impl LiveConnector for LoopbackConnector {
    async fn connect(&self, request: SessionRequest) -> Result<SessionHandle> {
        if !self.handshake_delay.is_zero() {
            tokio::time::sleep(self.handshake_delay).await;
        }
        if let Some(reason) = &self.refuse {
            return Err(VoxlineError::Handshake(reason.clone()));
        }
        accept_setup(&ClientMessage::setup(&request).to_json()?)?;

        let converter = RateConverter::new(
            request.input_format.sample_rate,
            request.output_format.sample_rate,
            CONVERT_BLOCK,
        )?;
        let (tx, rx) = mpsc::channel(self.queue);

        info!(voice = %request.voice, "loopback session open");

        let session = LoopbackSession {
            output_format: request.output_format,
            inner: Mutex::new(Some(Echo {
                input_format: request.input_format,
                output_format: request.output_format,
                converter,
                tx,
            })),
            closed: AtomicBool::new(false),
        };
        Ok(SessionHandle {
            session: Arc::new(session),
            events: rx,
        })
    }
}

/// Endpoint side of the handshake: read the setup frame, acknowledge it.
fn accept_setup(frame: &str) -> Result<()> {
    let ClientMessage::Setup(setup) = serde_json::from_str::<ClientMessage>(frame)? else {
        return Err(VoxlineError::Handshake("first frame was not a setup".into()));
    };
    debug!(
        model = %setup.model,
        voice = %setup.generation_config.speech_config.voice_config.prebuilt_voice_config.voice_name,
        "loopback setup received"
    );
    let ack = ServerMessage::setup_complete().to_json()?;
    let ack: ServerMessage = serde_json::from_str(&ack)?;
    if !ack.is_setup_complete() {
        return Err(VoxlineError::Handshake("setup not acknowledged".into()));
    }
    Ok(())
}

struct Echo {
    input_format: AudioFormat,
    output_format: AudioFormat,
    converter: RateConverter,
    tx: mpsc::Sender<InboundEvent>,
}

impl Echo {
    /// Endpoint side of one client frame. Returns the serialized reply, or
    /// `None` while the converter is still filling its first block.
    fn answer(&mut self, frame: &str) -> Result<Option<String>> {
        let ClientMessage::RealtimeInput(input) = serde_json::from_str::<ClientMessage>(frame)? else {
            return Ok(None);
        };

        let mut samples = Vec::new();
        for blob in input.media_chunks {
            let rate = blob.sample_rate().unwrap_or(self.input_format.sample_rate);
            if rate != self.input_format.sample_rate {
                return Err(VoxlineError::FormatMismatch {
                    expected: self.input_format.sample_rate,
                    actual: rate,
                });
            }
            let bytes = codec::decode_inbound(&blob.data)?;
            samples.extend(
                codec::bytes_to_audio_buffer(&bytes, rate, self.input_format.channels)?.into_mono(),
            );
        }

        let converted = self.converter.process(&samples)?;
        if converted.is_empty() {
            return Ok(None);
        }
        let reply = ServerMessage::audio(codec::encode_outbound(&converted), self.output_format);
        Ok(Some(reply.to_json()?))
    }
}

struct LoopbackSession {
    output_format: AudioFormat,
    inner: Mutex<Option<Echo>>,
    closed: AtomicBool,
}

impl LiveSession for LoopbackSession {
    fn send_audio(&self, data: String, format: AudioFormat) -> Result<()> {
        let mut guard = self.inner.lock();
        let Some(echo) = guard.as_mut() else {
            return Err(VoxlineError::Session("session closed".into()));
        };

        let frame = ClientMessage::audio(data, format).to_json()?;
        let Some(reply) = echo.answer(&frame)? else {
            return Ok(());
        };

        for event in wire::parse_server_message(&reply)? {
            match echo.tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(rate = self.output_format.sample_rate, "loopback queue full: dropped reply");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(VoxlineError::Session("inbound stream closed".into()));
                }
            }
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender ends the inbound stream.
        self.inner.lock().take();
        info!("loopback session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Voice;

    fn request() -> SessionRequest {
        SessionRequest {
            voice: Voice::Charon,
            system_prompt: String::new(),
            input_format: AudioFormat::OUTBOUND,
            output_format: AudioFormat::INBOUND,
        }
    }

    #[tokio::test]
    async fn echoes_frames_at_output_rate() {
        let mut handle = LoopbackConnector::new().connect(request()).await.unwrap();
        let frame = codec::encode_outbound(&vec![0.1; 4_096]);
        handle
            .session
            .send_audio(frame, AudioFormat::OUTBOUND)
            .unwrap();

        let Some(InboundEvent::Audio { data }) = handle.events.recv().await else {
            panic!("expected echoed audio");
        };
        let bytes = codec::decode_inbound(&data).unwrap();
        let samples = bytes.len() / 2;
        assert!(
            (samples as isize - 6_144).unsigned_abs() <= 40,
            "echo len={samples} expected≈6144"
        );
    }

    #[tokio::test]
    async fn close_ends_stream_and_rejects_audio() {
        let mut handle = LoopbackConnector::new().connect(request()).await.unwrap();
        handle.session.close();
        handle.session.close();
        assert!(handle.events.recv().await.is_none());
        assert!(matches!(
            handle.session.send_audio(String::new(), AudioFormat::OUTBOUND),
            Err(VoxlineError::Session(_))
        ));
    }

    #[tokio::test]
    async fn frame_at_wrong_rate_is_refused() {
        let handle = LoopbackConnector::new().connect(request()).await.unwrap();
        let frame = codec::encode_outbound(&[0.1; 1_024]);
        let err = handle
            .session
            .send_audio(frame, AudioFormat::INBOUND)
            .unwrap_err();
        assert!(matches!(
            err,
            VoxlineError::FormatMismatch {
                expected: 16_000,
                actual: 24_000
            }
        ));
    }

    #[test]
    fn endpoint_answers_realtime_input_with_server_content() {
        let (tx, _rx) = mpsc::channel(1);
        let mut echo = Echo {
            input_format: AudioFormat::OUTBOUND,
            output_format: AudioFormat::INBOUND,
            converter: RateConverter::new(16_000, 24_000, CONVERT_BLOCK).unwrap(),
            tx,
        };
        let frame = ClientMessage::audio(codec::encode_outbound(&[0.2; 1_024]), AudioFormat::OUTBOUND)
            .to_json()
            .unwrap();

        let reply: serde_json::Value =
            serde_json::from_str(&echo.answer(&frame).unwrap().expect("one block converted")).unwrap();
        let blob = &reply["serverContent"]["modelTurn"]["parts"][0]["inlineData"];
        assert_eq!(blob["mimeType"], "audio/pcm;rate=24000");
        assert!(!blob["data"].as_str().unwrap().is_empty());
    }

    #[test]
    fn setup_frame_is_acknowledged() {
        let setup = ClientMessage::setup(&request()).to_json().unwrap();
        accept_setup(&setup).unwrap();

        let audio = ClientMessage::audio("AAAA".into(), AudioFormat::OUTBOUND)
            .to_json()
            .unwrap();
        assert!(matches!(accept_setup(&audio), Err(VoxlineError::Handshake(_))));
    }

    #[tokio::test]
    async fn refusing_connector_fails_handshake() {
        let err = LoopbackConnector::refusing("quota exceeded")
            .connect(request())
            .await
            .unwrap_err();
        assert!(matches!(err, VoxlineError::Handshake(_)));
    }
}
