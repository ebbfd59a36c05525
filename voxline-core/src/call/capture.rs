//! Capture-and-send: encode each microphone frame and submit it to the session.
//!
//! Runs as its own task once the call is active. The device side never waits
//! on this task, and this task never waits on the network: `send_audio` is a
//! non-blocking submission. A refused submission is counted and skipped.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::audio::CaptureStream;
use crate::buffering::AudioFormat;
use crate::call::diagnostics::CallDiagnostics;
use crate::codec;
use crate::remote::LiveSession;

/// Everything the capture task needs, moved into it at spawn time.
pub struct CaptureContext {
    pub stream: CaptureStream,
    pub session: Arc<dyn LiveSession>,
    pub format: AudioFormat,
    pub diagnostics: Arc<CallDiagnostics>,
}

/// Pump frames until the stream stops. Returns the number of frames sent.
pub async fn run(ctx: CaptureContext) -> usize {
    let CaptureContext {
        mut stream,
        session,
        format,
        diagnostics,
    } = ctx;

    info!(rate = format.sample_rate, "capture started");
    let mut sent = 0usize;

    while let Some(frame) = stream.next_frame().await {
        CallDiagnostics::bump(&diagnostics.frames_captured);
        let payload = codec::encode_outbound(&frame.samples);
        match session.send_audio(payload, format) {
            Ok(()) => {
                sent += 1;
                CallDiagnostics::bump(&diagnostics.frames_sent);
            }
            Err(e) => {
                CallDiagnostics::bump(&diagnostics.send_errors);
                warn!(seq = frame.seq, "audio frame not sent: {e}");
            }
        }
    }

    debug!(sent, "capture loop ended");
    sent
}
