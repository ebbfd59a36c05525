//! Headless audio devices with a manually advanced clock.
//!
//! Used by integration tests and by hosts without sound hardware. Time only
//! moves when [`VirtualClock::advance`] or [`VirtualClock::set_now`] is called,
//! which makes scheduling behaviour fully deterministic.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    audio::{AudioBackend, CaptureStream, FinishedSender, OutputDevice, UnitId},
    buffering::{AudioBuffer, AudioFormat, CaptureFrame},
    error::{Result, VoxlineError},
};

/// One `schedule` call as seen by the virtual output.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledUnit {
    pub id: UnitId,
    pub start_at: f64,
    pub duration: f64,
}

impl ScheduledUnit {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

#[derive(Default)]
struct ClockState {
    now: f64,
    active: Vec<ScheduledUnit>,
    log: Vec<ScheduledUnit>,
    stopped: Vec<UnitId>,
    finished: Option<FinishedSender>,
    closed: bool,
    next_id: u64,
}

/// Shared time source and playback record of a [`VirtualOutput`].
#[derive(Clone, Default)]
pub struct VirtualClock {
    state: Arc<Mutex<ClockState>>,
}

impl VirtualClock {
    pub fn now(&self) -> f64 {
        self.state.lock().now
    }

    /// Move time forward by `secs`, finishing every unit whose end is reached.
    pub fn advance(&self, secs: f64) {
        let target = self.state.lock().now + secs.max(0.0);
        self.set_now(target);
    }

    /// Jump to `now`. Going backwards is ignored.
    pub fn set_now(&self, now: f64) {
        let mut state = self.state.lock();
        if now > state.now {
            state.now = now;
        }
        let current = state.now;
        let (done, still_active): (Vec<_>, Vec<_>) = state
            .active
            .drain(..)
            .partition(|unit| unit.end_at() <= current + f64::EPSILON);
        state.active = still_active;

        if let Some(tx) = state.finished.as_ref() {
            for unit in done {
                let _ = tx.send(unit.id);
            }
        }
    }

    /// Every unit ever scheduled, in scheduling order.
    pub fn scheduled(&self) -> Vec<ScheduledUnit> {
        self.state.lock().log.clone()
    }

    /// Units that were stopped before finishing.
    pub fn stopped(&self) -> Vec<UnitId> {
        self.state.lock().stopped.clone()
    }

    /// Units scheduled and neither finished nor stopped.
    pub fn active_units(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Output device backed by a [`VirtualClock`].
pub struct VirtualOutput {
    sample_rate: u32,
    clock: VirtualClock,
}

impl VirtualOutput {
    pub fn new(sample_rate: u32, clock: VirtualClock, finished: FinishedSender) -> Self {
        {
            let mut state = clock.state.lock();
            state.finished = Some(finished);
            state.closed = false;
        }
        Self { sample_rate, clock }
    }
}

impl OutputDevice for VirtualOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> f64 {
        self.clock.now()
    }

    fn schedule(&mut self, buffer: AudioBuffer, start_at: f64) -> Result<UnitId> {
        if buffer.sample_rate() != self.sample_rate {
            return Err(VoxlineError::FormatMismatch {
                expected: self.sample_rate,
                actual: buffer.sample_rate(),
            });
        }
        let mut state = self.clock.state.lock();
        if state.closed {
            return Err(VoxlineError::DeviceClosed);
        }
        let id = UnitId(state.next_id);
        state.next_id += 1;
        let unit = ScheduledUnit {
            id,
            start_at,
            duration: buffer.duration_secs(),
        };
        state.log.push(unit.clone());
        state.active.push(unit);
        Ok(id)
    }

    fn stop(&mut self, unit: UnitId) {
        let mut state = self.clock.state.lock();
        let before = state.active.len();
        state.active.retain(|u| u.id != unit);
        if state.active.len() != before {
            state.stopped.push(unit);
        }
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.clock.state.lock();
        state.closed = true;
        state.finished = None;
        Ok(())
    }
}

/// Feeds frames into the capture stream of a [`VirtualBackend`].
#[derive(Clone)]
pub struct VirtualMicrophone {
    inner: Arc<Mutex<Option<MicLink>>>,
}

struct MicLink {
    tx: mpsc::Sender<CaptureFrame>,
    running: Arc<AtomicBool>,
    seq: u64,
}

impl VirtualMicrophone {
    /// Deliver one frame. Returns `false` when no capture is open or the
    /// frame queue is full.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        let mut guard = self.inner.lock();
        let Some(link) = guard.as_mut() else {
            return false;
        };
        if !link.running.load(Ordering::Acquire) {
            return false;
        }
        let frame = CaptureFrame {
            seq: link.seq,
            samples,
        };
        link.seq += 1;
        link.tx.try_send(frame).is_ok()
    }

    /// Whether a capture stream is currently open and running.
    pub fn is_open(&self) -> bool {
        self.inner
            .lock()
            .as_ref()
            .is_some_and(|link| link.running.load(Ordering::Acquire) && !link.tx.is_closed())
    }
}

/// Backend producing a [`VirtualOutput`] and a push-driven microphone.
pub struct VirtualBackend {
    clock: VirtualClock,
    microphone: VirtualMicrophone,
    deny_reason: Mutex<Option<String>>,
    output_delay: Mutex<Duration>,
    frame_queue: usize,
}

impl Default for VirtualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self {
            clock: VirtualClock::default(),
            microphone: VirtualMicrophone {
                inner: Arc::new(Mutex::new(None)),
            },
            deny_reason: Mutex::new(None),
            output_delay: Mutex::new(Duration::ZERO),
            frame_queue: 64,
        }
    }

    pub fn clock(&self) -> VirtualClock {
        self.clock.clone()
    }

    pub fn microphone(&self) -> VirtualMicrophone {
        self.microphone.clone()
    }

    /// Make the next `open_capture` calls fail as if permission was refused.
    pub fn deny_microphone(&self, reason: impl Into<String>) {
        *self.deny_reason.lock() = Some(reason.into());
    }

    /// Make `open_output` take `delay` before the speaker is ready.
    pub fn delay_output(&self, delay: Duration) {
        *self.output_delay.lock() = delay;
    }
}

impl AudioBackend for VirtualBackend {
    type Output = VirtualOutput;

    async fn open_capture(&self, format: AudioFormat, _frame_samples: usize) -> Result<CaptureStream> {
        let denied = self.deny_reason.lock().clone();
        if let Some(reason) = denied {
            return Err(VoxlineError::MicrophoneDenied(reason));
        }
        let (tx, rx) = mpsc::channel(self.frame_queue);
        let running = Arc::new(AtomicBool::new(true));
        *self.microphone.inner.lock() = Some(MicLink {
            tx,
            running: Arc::clone(&running),
            seq: 0,
        });
        Ok(CaptureStream::new(rx, running, format))
    }

    async fn open_output(&self, sample_rate: u32, finished: FinishedSender) -> Result<Self::Output> {
        let delay = *self.output_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(VirtualOutput::new(sample_rate, self.clock(), finished))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn half_second() -> AudioBuffer {
        AudioBuffer::mono(vec![0.0; 12_000], 24_000)
    }

    #[test]
    fn advancing_clock_finishes_due_units_only() {
        let clock = VirtualClock::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut out = VirtualOutput::new(24_000, clock.clone(), tx);

        let a = out.schedule(half_second(), 0.0).unwrap();
        let b = out.schedule(half_second(), 0.5).unwrap();

        clock.advance(0.5);
        assert_eq!(rx.try_recv().ok(), Some(a));
        assert!(rx.try_recv().is_err());
        assert_eq!(clock.active_units(), 1);

        clock.advance(0.5);
        assert_eq!(rx.try_recv().ok(), Some(b));
        assert_relative_eq!(clock.now(), 1.0);
    }

    #[test]
    fn stopped_units_never_finish() {
        let clock = VirtualClock::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut out = VirtualOutput::new(24_000, clock.clone(), tx);

        let id = out.schedule(half_second(), 0.0).unwrap();
        out.stop(id);
        clock.advance(2.0);

        assert!(rx.try_recv().is_err());
        assert_eq!(clock.stopped(), vec![id]);
    }

    #[test]
    fn wrong_rate_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut out = VirtualOutput::new(24_000, VirtualClock::default(), tx);
        let err = out
            .schedule(AudioBuffer::mono(vec![0.0; 16], 16_000), 0.0)
            .unwrap_err();
        assert!(matches!(
            err,
            VoxlineError::FormatMismatch {
                expected: 24_000,
                actual: 16_000
            }
        ));
    }

    #[tokio::test]
    async fn denied_microphone_fails_to_open() {
        let backend = VirtualBackend::new();
        backend.deny_microphone("permission refused");
        let err = backend
            .open_capture(AudioFormat::OUTBOUND, 4_096)
            .await
            .unwrap_err();
        assert!(matches!(err, VoxlineError::MicrophoneDenied(_)));
        assert!(!backend.microphone().is_open());
    }

    #[tokio::test]
    async fn pushed_frames_reach_the_stream() {
        let backend = VirtualBackend::new();
        let mut stream = backend.open_capture(AudioFormat::OUTBOUND, 4).await.unwrap();
        let mic = backend.microphone();
        assert!(mic.push(vec![0.1; 4]));
        let frame = stream.next_frame().await.expect("frame");
        assert_eq!(frame.seq, 0);
        drop(stream);
        assert!(!mic.is_open());
    }
}
