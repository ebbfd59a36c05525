//! Per-call counters, shared between the call loop and the capture task.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct CallDiagnostics {
    pub frames_captured: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub send_errors: AtomicUsize,
    pub chunks_received: AtomicUsize,
    pub chunks_scheduled: AtomicUsize,
    pub decode_errors: AtomicUsize,
    pub interruptions: AtomicUsize,
    pub units_finished: AtomicUsize,
}

impl CallDiagnostics {
    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            units_finished: self.units_finished.load(Ordering::Relaxed),
        }
    }

    fn counters(&self) -> [&AtomicUsize; 8] {
        [
            &self.frames_captured,
            &self.frames_sent,
            &self.send_errors,
            &self.chunks_received,
            &self.chunks_scheduled,
            &self.decode_errors,
            &self.interruptions,
            &self.units_finished,
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_captured: usize,
    pub frames_sent: usize,
    pub send_errors: usize,
    pub chunks_received: usize,
    pub chunks_scheduled: usize,
    pub decode_errors: usize,
    pub interruptions: usize,
    pub units_finished: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_zeroes_every_counter() {
        let diag = CallDiagnostics::default();
        CallDiagnostics::bump(&diag.frames_sent);
        CallDiagnostics::bump(&diag.decode_errors);
        assert_eq!(diag.snapshot().frames_sent, 1);

        diag.reset();
        assert_eq!(diag.snapshot(), DiagnosticsSnapshot::default());
    }
}
