//! Audio device boundary.
//!
//! Two device roles exist for a call:
//!
//! - **Capture**: a microphone opened at the outbound format. Frames are
//!   delivered as messages on a bounded channel ([`CaptureStream`]); the OS
//!   callback never waits on the consumer.
//! - **Output**: a speaker with its own clock. Buffers are scheduled at an
//!   absolute clock time and each one reports completion by sending its
//!   [`UnitId`] on the finished channel handed over at open time.
//!
//! [`AudioBackend`] creates both. `CpalBackend` drives real hardware;
//! [`virtual_device::VirtualBackend`] is a headless backend with a manually
//! advanced clock.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Both cpal devices therefore create and drop their stream on a
//! dedicated worker thread; only channels and atomics cross threads.

pub mod device;
pub mod resample;
pub mod virtual_device;

#[cfg(feature = "audio-cpal")]
pub mod microphone;
#[cfg(feature = "audio-cpal")]
pub mod speaker;

use std::fmt;
use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::mpsc;

use crate::buffering::{AudioBuffer, AudioFormat, CaptureFrame};
use crate::error::Result;

/// Identity of one scheduled playback buffer. Unique per output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Channel on which an output device reports units that played to the end.
pub type FinishedSender = mpsc::UnboundedSender<UnitId>;
pub type FinishedReceiver = mpsc::UnboundedReceiver<UnitId>;

/// An output device with a monotonic clock measured in seconds.
pub trait OutputDevice: Send + 'static {
    /// Native rate of the device clock (Hz). Scheduled buffers must match it.
    fn sample_rate(&self) -> u32;

    /// Current position of the output clock, in seconds since open.
    fn now(&self) -> f64;

    /// Schedule `buffer` to start exactly at `start_at` on the output clock.
    ///
    /// Exactly one finished notification is sent for the returned id when
    /// the buffer plays to its end. Stopped units send nothing.
    fn schedule(&mut self, buffer: AudioBuffer, start_at: f64) -> Result<UnitId>;

    /// Silence a scheduled or playing unit immediately. Unknown ids are ignored.
    fn stop(&mut self, unit: UnitId);

    /// Release the device. Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Factory for the two device roles of a call.
pub trait AudioBackend: Send + Sync + 'static {
    type Output: OutputDevice;

    /// Open the microphone. Suspends while the OS grants access.
    fn open_capture(
        &self,
        format: AudioFormat,
        frame_samples: usize,
    ) -> impl Future<Output = Result<CaptureStream>> + Send;

    /// Open the speaker at `sample_rate`, reporting finished units on `finished`.
    ///
    /// Device setup may block inside the OS, so implementations must not do
    /// it on the calling task.
    fn open_output(
        &self,
        sample_rate: u32,
        finished: FinishedSender,
    ) -> impl Future<Output = Result<Self::Output>> + Send;
}

/// Receiving end of an open microphone.
///
/// Dropping the stream stops capture.
pub struct CaptureStream {
    frames: mpsc::Receiver<CaptureFrame>,
    running: Arc<AtomicBool>,
    format: AudioFormat,
}

impl CaptureStream {
    /// `running` is shared with whatever produces frames; clearing it tells
    /// the producer to stop.
    pub fn new(
        frames: mpsc::Receiver<CaptureFrame>,
        running: Arc<AtomicBool>,
        format: AudioFormat,
    ) -> Self {
        Self {
            frames,
            running,
            format,
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Next captured frame, or `None` once capture has stopped.
    pub async fn next_frame(&mut self) -> Option<CaptureFrame> {
        if !self.is_running() {
            return None;
        }
        let frame = self.frames.recv().await?;
        self.is_running().then_some(frame)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Handle that can stop this stream after it has been moved into a task.
    pub fn stopper(&self) -> CaptureStopper {
        CaptureStopper(Arc::clone(&self.running))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for CaptureStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureStream")
            .field("format", &self.format)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Clonable stop switch for a [`CaptureStream`].
#[derive(Debug, Clone)]
pub struct CaptureStopper(Arc<AtomicBool>);

impl CaptureStopper {
    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        !self.0.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// cpal backend
// ---------------------------------------------------------------------------

/// Real hardware through the platform default cpal host.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    /// Input device name to prefer over the system default.
    pub preferred_input_device: Option<String>,
    /// Output device name to prefer over the system default.
    pub preferred_output_device: Option<String>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input_device(mut self, name: Option<String>) -> Self {
        self.preferred_input_device = name;
        self
    }

    pub fn with_output_device(mut self, name: Option<String>) -> Self {
        self.preferred_output_device = name;
        self
    }
}

#[cfg(feature = "audio-cpal")]
impl AudioBackend for CpalBackend {
    type Output = speaker::SpeakerOutput;

    async fn open_capture(&self, format: AudioFormat, frame_samples: usize) -> Result<CaptureStream> {
        microphone::open(self.preferred_input_device.clone(), format, frame_samples).await
    }

    async fn open_output(&self, sample_rate: u32, finished: FinishedSender) -> Result<Self::Output> {
        let preferred = self.preferred_output_device.clone();
        tokio::task::spawn_blocking(move || {
            speaker::SpeakerOutput::open(preferred.as_deref(), sample_rate, finished)
        })
        .await
        .map_err(|e| crate::error::VoxlineError::AudioStream(format!("speaker open task failed: {e}")))?
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioBackend for CpalBackend {
    type Output = virtual_device::VirtualOutput;

    async fn open_capture(&self, _format: AudioFormat, _frame_samples: usize) -> Result<CaptureStream> {
        Err(crate::error::VoxlineError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    async fn open_output(&self, _sample_rate: u32, _finished: FinishedSender) -> Result<Self::Output> {
        Err(crate::error::VoxlineError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}
