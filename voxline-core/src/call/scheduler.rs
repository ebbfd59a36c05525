//! Gapless, interruptible playback of streamed model audio.
//!
//! Every inbound chunk becomes one [`PlaybackUnit`] scheduled on the output
//! device clock at `max(cursor, now)`. The cursor then advances by the unit's
//! duration, so consecutive chunks abut exactly. A chunk that arrives after
//! the cursor has fallen behind the clock starts immediately instead of in the
//! past.
//!
//! Interruption stops every live unit and pulls the cursor back to the
//! current clock time. The scheduler is single-owner (`&mut self` for every
//! mutation), so a finished notification can never interleave with the
//! interruption sweep.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::audio::{OutputDevice, UnitId};
use crate::buffering::{AudioChunk, Direction};
use crate::call::diagnostics::CallDiagnostics;
use crate::error::{Result, VoxlineError};
use crate::events::SpeakingEvent;

/// A decoded chunk bound to a start time on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackUnit {
    pub id: UnitId,
    pub start_at: f64,
    pub duration: f64,
}

impl PlaybackUnit {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

pub struct PlaybackScheduler<O: OutputDevice> {
    output: O,
    cursor: f64,
    live: HashMap<UnitId, PlaybackUnit>,
    speaking_tx: broadcast::Sender<SpeakingEvent>,
    speaking_seq: u64,
    speaking: bool,
    diagnostics: Arc<CallDiagnostics>,
}

impl<O: OutputDevice> PlaybackScheduler<O> {
    pub fn new(
        output: O,
        speaking_tx: broadcast::Sender<SpeakingEvent>,
        diagnostics: Arc<CallDiagnostics>,
    ) -> Self {
        let cursor = output.now();
        Self {
            output,
            cursor,
            live: HashMap::new(),
            speaking_tx,
            speaking_seq: 0,
            speaking: false,
            diagnostics,
        }
    }

    /// Decode and schedule one base64 chunk.
    ///
    /// Returns `None` when the chunk was dropped; the cursor is then unchanged.
    pub fn on_chunk(&mut self, data: &str) -> Option<PlaybackUnit> {
        CallDiagnostics::bump(&self.diagnostics.chunks_received);
        match self.schedule_chunk(data) {
            Ok(unit) => {
                CallDiagnostics::bump(&self.diagnostics.chunks_scheduled);
                Some(unit)
            }
            Err(e) => {
                CallDiagnostics::bump(&self.diagnostics.decode_errors);
                warn!(cursor = self.cursor, "dropped inbound chunk: {e}");
                None
            }
        }
    }

    fn schedule_chunk(&mut self, data: &str) -> Result<PlaybackUnit> {
        let buffer = AudioChunk::from_base64(data, Direction::Inbound)?.to_buffer()?;
        let expected = self.output.sample_rate();
        if buffer.sample_rate() != expected {
            return Err(VoxlineError::FormatMismatch {
                expected,
                actual: buffer.sample_rate(),
            });
        }
        if buffer.is_empty() {
            return Err(VoxlineError::Decode("empty audio chunk".into()));
        }

        let duration = buffer.duration_secs();
        let start_at = self.cursor.max(self.output.now());
        let id = self.output.schedule(buffer, start_at)?;

        let unit = PlaybackUnit {
            id,
            start_at,
            duration,
        };
        self.cursor = unit.end_at();
        let was_silent = self.live.is_empty();
        self.live.insert(id, unit);

        debug!(unit_id = %id, start_at, duration, cursor = self.cursor, "unit scheduled");
        if was_silent {
            self.set_speaking(true);
        }
        Ok(unit)
    }

    /// A unit played to its end.
    pub fn on_finished(&mut self, id: UnitId) {
        if self.live.remove(&id).is_none() {
            debug!(unit_id = %id, "finish for unknown unit ignored");
            return;
        }
        CallDiagnostics::bump(&self.diagnostics.units_finished);
        if self.live.is_empty() {
            self.set_speaking(false);
        }
    }

    /// The remote signalled that the model was talked over.
    pub fn interrupt(&mut self) {
        let stopped = self.stop_all();
        self.cursor = self.output.now();
        CallDiagnostics::bump(&self.diagnostics.interruptions);
        info!(stopped, cursor = self.cursor, "playback interrupted");
    }

    /// Stop and forget every live unit. Returns how many were stopped.
    pub fn stop_all(&mut self) -> usize {
        let stopped = self.live.len();
        for (id, _) in self.live.drain() {
            self.output.stop(id);
        }
        if stopped > 0 || self.speaking {
            self.set_speaking(false);
        }
        stopped
    }

    pub fn close_output(&mut self) -> Result<()> {
        self.output.close()
    }

    fn set_speaking(&mut self, speaking: bool) {
        if self.speaking == speaking {
            return;
        }
        self.speaking = speaking;
        self.speaking_seq += 1;
        let _ = self.speaking_tx.send(SpeakingEvent {
            seq: self.speaking_seq,
            speaking,
        });
    }

    /// Next start time for a chunk that arrives before the clock catches up.
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn live_units(&self) -> impl Iterator<Item = &PlaybackUnit> {
        self.live.values()
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn now(&self) -> f64 {
        self.output.now()
    }
}
