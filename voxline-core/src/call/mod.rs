//! `CallSession`: lifecycle controller for one realtime voice call.
//!
//! ## Lifecycle
//!
//! ```text
//! CallSession::new()                       Idle
//!     └─► open()                           Selecting
//!         └─► select_voice(..)             Selecting
//!         └─► start().await                Connecting
//!               ├─ speaker opened
//!               ├─ microphone + handshake  (concurrently)
//!               └─► ok                     Active ─► run() / step()
//!                   err / cancelled        Closed (partial resources released)
//!  close() from any state                  Closed
//! ```
//!
//! `close()` is idempotent and best-effort: every teardown step is attempted
//! even when an earlier one fails. Dropping a session closes it.
//!
//! ## Concurrency
//!
//! The session is the single writer for the playback scheduler. Inbound audio,
//! interruptions and finished notifications are handled one at a time in
//! [`CallSession::step`], so no event observes a half-applied interruption.
//! Capture runs as a separate task that only reads frames and submits them.

pub mod capture;
pub mod diagnostics;
pub mod scheduler;

pub use diagnostics::{CallDiagnostics, DiagnosticsSnapshot};
pub use scheduler::{PlaybackScheduler, PlaybackUnit};

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    audio::{AudioBackend, CaptureStopper, CaptureStream, FinishedReceiver, UnitId},
    buffering::AudioFormat,
    error::{Result, VoxlineError},
    events::{CallState, CallStatusEvent, SpeakingEvent},
    remote::{InboundEvent, LiveConnector, LiveSession, SessionHandle, SessionRequest, Voice, DEFAULT_CALL_PROMPT},
};

/// Broadcast channel capacity for status and speaking events.
const BROADCAST_CAP: usize = 64;

/// Detail attached to the `Closed` status when the remote ends the call.
pub const REMOTE_CLOSED_DETAIL: &str = "remote session closed";

/// Detail attached to the `Closed` status when the user hangs up mid-call.
pub const CANCELLED_DETAIL: &str = "call cancelled";

/// Configuration for `CallSession`.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Format captured and sent to the remote. Default: 16 kHz mono.
    pub capture_format: AudioFormat,
    /// Format the remote speaks and the speaker plays. Default: 24 kHz mono.
    pub output_format: AudioFormat,
    /// Samples per capture frame. Default: 4096 (256 ms at 16 kHz).
    pub capture_frame_samples: usize,
    /// Voice preselected when the picker opens.
    pub voice: Voice,
    /// Persona prompt sent in the handshake.
    pub system_prompt: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            capture_format: AudioFormat::OUTBOUND,
            output_format: AudioFormat::INBOUND,
            capture_frame_samples: 4_096,
            voice: Voice::default(),
            system_prompt: DEFAULT_CALL_PROMPT.to_string(),
        }
    }
}

/// What one [`CallSession::step`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// An inbound chunk was scheduled for playback.
    ChunkScheduled(PlaybackUnit),
    /// An inbound chunk failed to decode or schedule and was discarded.
    ChunkDropped,
    /// Playback was cut off and the cursor reset.
    Interrupted,
    TurnComplete,
    /// A unit played to its end.
    UnitFinished(UnitId),
    /// The call ended. No further events follow.
    Closed { reason: Option<String> },
}

/// Requests teardown from another task, e.g. a hang-up button.
///
/// Takes effect at the next await point of `start()` or `step()`. A cancel
/// issued while the session is `Idle` or `Selecting` is latched and closes the
/// session on its next `open()`, `select_voice()` or `start()`, which then
/// return `Cancelled`.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

struct CaptureTask {
    stopper: CaptureStopper,
    handle: JoinHandle<usize>,
}

enum Wake {
    Cancel,
    Finished(UnitId),
    Remote(Option<InboundEvent>),
}

/// One voice call. See module docs for the lifecycle.
pub struct CallSession<B: AudioBackend, C: LiveConnector> {
    config: CallConfig,
    backend: Arc<B>,
    connector: Arc<C>,
    state: CallState,
    voice: Voice,
    remote: Option<Arc<dyn LiveSession>>,
    inbound: Option<mpsc::Receiver<InboundEvent>>,
    scheduler: Option<PlaybackScheduler<B::Output>>,
    finished_rx: Option<FinishedReceiver>,
    capture: Option<CaptureTask>,
    status_tx: broadcast::Sender<CallStatusEvent>,
    speaking_tx: broadcast::Sender<SpeakingEvent>,
    diagnostics: Arc<CallDiagnostics>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl<B: AudioBackend, C: LiveConnector> CallSession<B, C> {
    /// Create an idle session. Nothing is opened until `start()`.
    pub fn new(backend: B, connector: C, config: CallConfig) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (speaking_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        Self {
            voice: config.voice,
            config,
            backend: Arc::new(backend),
            connector: Arc::new(connector),
            state: CallState::Idle,
            remote: None,
            inbound: None,
            scheduler: None,
            finished_rx: None,
            capture: None,
            status_tx,
            speaking_tx,
            diagnostics: Arc::new(CallDiagnostics::default()),
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    /// Open the voice picker.
    ///
    /// # Errors
    /// `InvalidTransition` unless the session is `Idle`; `Cancelled` when a
    /// cancel was already requested.
    pub fn open(&mut self) -> Result<()> {
        self.require(CallState::Idle, "open")?;
        self.check_cancelled()?;
        self.set_state(CallState::Selecting, None);
        Ok(())
    }

    /// Choose the voice used by the next `start()`.
    ///
    /// # Errors
    /// `InvalidTransition` unless the session is `Selecting`.
    pub fn select_voice(&mut self, voice: Voice) -> Result<()> {
        self.require(CallState::Selecting, "select a voice")?;
        self.check_cancelled()?;
        debug!(voice = %voice, "voice selected");
        self.voice = voice;
        Ok(())
    }

    /// Acquire the speaker, the microphone and the remote session.
    ///
    /// On success the call is `Active` and capture is streaming. On failure or
    /// cancellation every partially acquired resource is released, a `Closed`
    /// status carrying the error is broadcast and the error is returned.
    ///
    /// # Errors
    /// - `InvalidTransition` unless the session is `Selecting`.
    /// - `MicrophoneDenied`, `Handshake`, `AudioDevice`, ... from setup.
    /// - `Cancelled` when a [`CancelHandle`] fired before or during setup.
    pub async fn start(&mut self) -> Result<()> {
        self.require(CallState::Selecting, "start")?;
        self.check_cancelled()?;
        self.diagnostics.reset();
        self.set_state(CallState::Connecting, None);
        info!(voice = %self.voice, "call connecting");

        match self.acquire().await {
            Ok((stream, handle)) => {
                let SessionHandle { session, events } = handle;
                self.remote = Some(Arc::clone(&session));
                self.inbound = Some(events);
                self.set_state(CallState::Active, None);
                self.spawn_capture(stream, session);
                info!(voice = %self.voice, "call active");
                Ok(())
            }
            Err(e) => {
                warn!("call setup failed: {e}");
                self.teardown();
                self.set_state(CallState::Closed, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Open the speaker, then the microphone and handshake concurrently.
    ///
    /// Whatever this acquires before failing is either stored on `self` (the
    /// speaker) or released here (capture stream, session).
    async fn acquire(&mut self) -> Result<(CaptureStream, SessionHandle)> {
        let backend = Arc::clone(&self.backend);
        let connector = Arc::clone(&self.connector);
        let mut cancel = self.cancel_rx.clone();

        // A speaker that finishes opening after cancellation is dropped, which
        // closes it.
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let output = tokio::select! {
            res = backend.open_output(self.config.output_format.sample_rate, finished_tx) => res?,
            _ = cancel.wait_for(|cancelled| *cancelled) => return Err(VoxlineError::Cancelled),
        };
        self.scheduler = Some(PlaybackScheduler::new(
            output,
            self.speaking_tx.clone(),
            Arc::clone(&self.diagnostics),
        ));
        self.finished_rx = Some(finished_rx);

        let request = SessionRequest {
            voice: self.voice,
            system_prompt: self.config.system_prompt.clone(),
            input_format: self.config.capture_format,
            output_format: self.config.output_format,
        };

        let capture = backend.open_capture(self.config.capture_format, self.config.capture_frame_samples);
        let handshake = connector.connect(request);
        tokio::pin!(capture, handshake);

        let mut stream: Option<CaptureStream> = None;
        let mut handle: Option<SessionHandle> = None;

        let outcome: Result<()> = loop {
            if stream.is_some() && handle.is_some() {
                break Ok(());
            }
            tokio::select! {
                res = &mut capture, if stream.is_none() => match res {
                    Ok(s) => {
                        debug!("microphone granted");
                        stream = Some(s);
                    }
                    Err(e) => break Err(e),
                },
                res = &mut handshake, if handle.is_none() => match res {
                    Ok(h) => {
                        debug!("session handshake complete");
                        handle = Some(h);
                    }
                    Err(e) => break Err(e),
                },
                _ = cancel.wait_for(|cancelled| *cancelled) => break Err(VoxlineError::Cancelled),
            }
        };

        match (outcome, stream, handle) {
            (Ok(()), Some(stream), Some(handle)) => Ok((stream, handle)),
            (outcome, stream, handle) => {
                if let Some(handle) = handle {
                    handle.session.close();
                }
                drop(stream);
                Err(outcome.err().unwrap_or(VoxlineError::Cancelled))
            }
        }
    }

    fn spawn_capture(&mut self, stream: CaptureStream, session: Arc<dyn LiveSession>) {
        let stopper = stream.stopper();
        let handle = tokio::spawn(capture::run(capture::CaptureContext {
            stream,
            session,
            format: self.config.capture_format,
            diagnostics: Arc::clone(&self.diagnostics),
        }));
        self.capture = Some(CaptureTask { stopper, handle });
    }

    /// Wait for and handle the next call event.
    ///
    /// Returns `None` once the call is no longer `Active`.
    pub async fn step(&mut self) -> Option<CallEvent> {
        if self.state != CallState::Active {
            return None;
        }

        let mut cancel = self.cancel_rx.clone();
        let wake = {
            let (Some(inbound), Some(finished)) = (self.inbound.as_mut(), self.finished_rx.as_mut())
            else {
                return None;
            };
            tokio::select! {
                biased;
                _ = cancel.wait_for(|cancelled| *cancelled) => Wake::Cancel,
                Some(id) = finished.recv() => Wake::Finished(id),
                event = inbound.recv() => Wake::Remote(event),
            }
        };

        let event = match wake {
            Wake::Cancel => {
                self.shutdown(Some(CANCELLED_DETAIL.to_string()));
                CallEvent::Closed {
                    reason: Some(CANCELLED_DETAIL.to_string()),
                }
            }
            Wake::Finished(id) => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.on_finished(id);
                }
                CallEvent::UnitFinished(id)
            }
            Wake::Remote(Some(InboundEvent::Audio { data })) => {
                match self.scheduler.as_mut().and_then(|s| s.on_chunk(&data)) {
                    Some(unit) => CallEvent::ChunkScheduled(unit),
                    None => CallEvent::ChunkDropped,
                }
            }
            Wake::Remote(Some(InboundEvent::Interrupted)) => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.interrupt();
                }
                CallEvent::Interrupted
            }
            Wake::Remote(Some(InboundEvent::TurnComplete)) => {
                debug!("model turn complete");
                CallEvent::TurnComplete
            }
            Wake::Remote(Some(InboundEvent::Closed { reason })) => {
                let detail = reason.unwrap_or_else(|| REMOTE_CLOSED_DETAIL.to_string());
                self.shutdown(Some(detail.clone()));
                CallEvent::Closed {
                    reason: Some(detail),
                }
            }
            Wake::Remote(None) => {
                self.shutdown(Some(REMOTE_CLOSED_DETAIL.to_string()));
                CallEvent::Closed {
                    reason: Some(REMOTE_CLOSED_DETAIL.to_string()),
                }
            }
        };
        Some(event)
    }

    /// Drive the call until it closes. Returns the final counters.
    pub async fn run(&mut self) -> DiagnosticsSnapshot {
        while let Some(event) = self.step().await {
            debug!(?event, "call event");
        }
        self.diagnostics.snapshot()
    }

    /// End the call from any state. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.shutdown(None);
    }

    fn shutdown(&mut self, detail: Option<String>) {
        if self.state == CallState::Closed {
            return;
        }
        self.teardown();
        self.set_state(CallState::Closed, detail);
        info!(diagnostics = ?self.diagnostics.snapshot(), "call closed");
    }

    /// Release everything held. Each step runs regardless of the others.
    fn teardown(&mut self) {
        if let Some(task) = self.capture.take() {
            task.stopper.stop();
            task.handle.abort();
        }

        if let Some(mut scheduler) = self.scheduler.take() {
            let stopped = scheduler.stop_all();
            if stopped > 0 {
                debug!(stopped, "playback stopped for teardown");
            }
            if let Err(e) = scheduler.close_output() {
                warn!("failed to close output device: {e}");
            }
        }
        self.finished_rx = None;

        if let Some(remote) = self.remote.take() {
            remote.close();
        }
        self.inbound = None;
    }

    /// Close the session if a cancel was latched before it could be observed.
    fn check_cancelled(&mut self) -> Result<()> {
        if *self.cancel_rx.borrow() {
            self.shutdown(Some(CANCELLED_DETAIL.to_string()));
            return Err(VoxlineError::Cancelled);
        }
        Ok(())
    }

    fn require(&self, expected: CallState, action: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(VoxlineError::InvalidTransition {
                from: self.state,
                action,
            })
        }
    }

    fn set_state(&mut self, state: CallState, detail: Option<String>) {
        self.state = state;
        debug!(?state, detail = detail.as_deref().unwrap_or(""), "call state changed");
        let _ = self.status_tx.send(CallStatusEvent {
            status: state,
            detail,
        });
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn voice(&self) -> Voice {
        self.voice
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Playback cursor, while a speaker is open.
    pub fn cursor(&self) -> Option<f64> {
        self.scheduler.as_ref().map(PlaybackScheduler::cursor)
    }

    /// Number of scheduled units not yet finished.
    pub fn live_units(&self) -> usize {
        self.scheduler.as_ref().map_or(0, PlaybackScheduler::live_len)
    }

    pub fn is_speaking(&self) -> bool {
        self.scheduler
            .as_ref()
            .is_some_and(PlaybackScheduler::is_speaking)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel_tx))
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<CallStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_speaking(&self) -> broadcast::Receiver<SpeakingEvent> {
        self.speaking_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}

impl<B: AudioBackend, C: LiveConnector> Drop for CallSession<B, C> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::virtual_device::VirtualBackend;
    use crate::remote::LoopbackConnector;

    fn session() -> CallSession<VirtualBackend, LoopbackConnector> {
        CallSession::new(
            VirtualBackend::new(),
            LoopbackConnector::new(),
            CallConfig::default(),
        )
    }

    #[test]
    fn fresh_session_is_idle_with_default_voice() {
        let call = session();
        assert_eq!(call.state(), CallState::Idle);
        assert_eq!(call.voice(), Voice::Charon);
        assert_eq!(call.cursor(), None);
    }

    #[test]
    fn voice_can_only_change_while_selecting() {
        let mut call = session();
        assert!(matches!(
            call.select_voice(Voice::Kore),
            Err(VoxlineError::InvalidTransition {
                from: CallState::Idle,
                ..
            })
        ));
        call.open().unwrap();
        call.select_voice(Voice::Kore).unwrap();
        assert_eq!(call.voice(), Voice::Kore);
    }

    #[tokio::test]
    async fn start_requires_selecting() {
        let mut call = session();
        let err = call.start().await.unwrap_err();
        assert!(matches!(err, VoxlineError::InvalidTransition { .. }));
        assert_eq!(call.state(), CallState::Idle);
    }

    #[test]
    fn close_before_any_resource_is_a_plain_transition() {
        let mut call = session();
        let mut status = call.subscribe_status();
        call.close();
        call.close();
        assert_eq!(call.state(), CallState::Closed);

        let event = status.try_recv().expect("one closed event");
        assert_eq!(event.status, CallState::Closed);
        assert!(status.try_recv().is_err());
    }

    #[test]
    fn cancel_before_open_closes_on_open() {
        let mut call = session();
        call.cancel_handle().cancel();

        assert!(matches!(call.open(), Err(VoxlineError::Cancelled)));
        assert_eq!(call.state(), CallState::Closed);
    }

    #[tokio::test]
    async fn cancel_while_selecting_closes_before_any_device_opens() {
        let backend = VirtualBackend::new();
        let clock = backend.clock();
        let mut call = CallSession::new(backend, LoopbackConnector::new(), CallConfig::default());
        let mut status = call.subscribe_status();
        call.open().unwrap();

        call.cancel_handle().cancel();
        assert!(matches!(call.select_voice(Voice::Kore), Err(VoxlineError::Cancelled)));
        assert_eq!(call.state(), CallState::Closed);
        assert_eq!(call.voice(), Voice::Charon);

        let err = call.start().await.unwrap_err();
        assert!(matches!(err, VoxlineError::InvalidTransition { .. }));
        assert!(clock.scheduled().is_empty());
        assert!(!clock.is_closed());

        let states: Vec<_> = std::iter::from_fn(|| status.try_recv().ok()).collect();
        assert_eq!(states.len(), 2);
        assert_eq!(states[1].status, CallState::Closed);
        assert_eq!(states[1].detail.as_deref(), Some(CANCELLED_DETAIL));
    }

    #[tokio::test]
    async fn slow_speaker_open_can_be_cancelled() {
        let backend = VirtualBackend::new();
        backend.delay_output(std::time::Duration::from_secs(60));
        let mut call = CallSession::new(backend, LoopbackConnector::new(), CallConfig::default());
        call.open().unwrap();

        let cancel = call.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let err = call.start().await.unwrap_err();
        assert!(matches!(err, VoxlineError::Cancelled));
        assert_eq!(call.state(), CallState::Closed);
        assert_eq!(call.cursor(), None);
    }

    #[test]
    fn cancel_handle_reports_state() {
        let call = session();
        let handle = call.cancel_handle();
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
