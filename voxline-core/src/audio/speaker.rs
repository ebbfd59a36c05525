//! Speaker output via cpal: a small mixer driven by an atomic frame clock.
//!
//! The render callback owns the list of scheduled units. Scheduling and
//! stopping reach it as commands over a lock-free channel, and units that end
//! (or are stopped) are handed back to the worker thread so the callback never
//! frees sample memory. The worker forwards finished ids to the call loop.
//!
//! When the device cannot run at the requested rate the stream opens at the
//! device default and each unit is converted on the scheduling thread. The
//! public clock stays in seconds, so callers never see the device rate.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        device::{select_device, DeviceRole},
        resample::RateConverter,
        FinishedSender, OutputDevice, UnitId,
    },
    buffering::AudioBuffer,
    error::{Result, VoxlineError},
};

const RETIRE_POLL: Duration = Duration::from_millis(20);

/// Units the callback can hold without reallocating.
const MIXER_CAPACITY: usize = 64;

enum MixerCommand {
    Schedule {
        id: UnitId,
        start_frame: u64,
        samples: Vec<f32>,
    },
    Stop(UnitId),
}

/// A unit leaving the mixer. Dropped on the worker thread.
struct Retired {
    id: UnitId,
    finished: bool,
    _samples: Vec<f32>,
}

struct Voice {
    id: UnitId,
    start_frame: u64,
    samples: Vec<f32>,
    pos: usize,
}

/// Speaker opened through cpal. See module docs.
pub struct SpeakerOutput {
    /// Rate buffers are scheduled at.
    sample_rate: u32,
    /// Rate the hardware runs at.
    device_rate: u32,
    clock: Arc<AtomicU64>,
    commands: Sender<MixerCommand>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    next_id: u64,
    closed: bool,
}

impl SpeakerOutput {
    /// Open `preferred_device` (or the default) for buffers at `sample_rate`.
    pub fn open(
        preferred_device: Option<&str>,
        sample_rate: u32,
        finished: FinishedSender,
    ) -> Result<Self> {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (open_tx, open_rx) = crossbeam_channel::bounded::<Result<u32>>(1);
        let clock = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = {
            let preferred = preferred_device.map(str::to_owned);
            let clock = Arc::clone(&clock);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("voxline-playback".into())
                .spawn(move || {
                    run_worker(PlaybackWorker {
                        preferred,
                        sample_rate,
                        clock,
                        shutdown,
                        commands: cmd_rx,
                        finished,
                        open_tx,
                    })
                })?
        };

        let device_rate = match open_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(VoxlineError::AudioStream(
                    "playback worker exited before reporting open status".into(),
                ));
            }
        };

        info!(sample_rate, device_rate, "speaker open");

        Ok(Self {
            sample_rate,
            device_rate,
            clock,
            commands: cmd_tx,
            shutdown,
            worker: Some(worker),
            next_id: 0,
            closed: false,
        })
    }

    fn to_device_rate(&self, samples: Vec<f32>) -> Result<Vec<f32>> {
        if self.device_rate == self.sample_rate || samples.is_empty() {
            return Ok(samples);
        }
        let expected = ((samples.len() as u64 * self.device_rate as u64)
            / self.sample_rate as u64) as usize;
        let mut converter = RateConverter::new(self.sample_rate, self.device_rate, samples.len())?;
        let mut out = converter.process(&samples)?;
        out.resize(expected, 0.0);
        Ok(out)
    }
}

impl OutputDevice for SpeakerOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> f64 {
        self.clock.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    fn schedule(&mut self, buffer: AudioBuffer, start_at: f64) -> Result<UnitId> {
        if self.closed {
            return Err(VoxlineError::DeviceClosed);
        }
        if buffer.sample_rate() != self.sample_rate {
            return Err(VoxlineError::FormatMismatch {
                expected: self.sample_rate,
                actual: buffer.sample_rate(),
            });
        }

        let samples = self.to_device_rate(buffer.into_mono())?;
        let id = UnitId(self.next_id);
        self.next_id += 1;
        let start_frame = (start_at.max(0.0) * self.device_rate as f64).round() as u64;

        self.commands
            .send(MixerCommand::Schedule {
                id,
                start_frame,
                samples,
            })
            .map_err(|_| VoxlineError::DeviceClosed)?;
        Ok(id)
    }

    fn stop(&mut self, unit: UnitId) {
        if self.closed {
            return;
        }
        let _ = self.commands.send(MixerCommand::Stop(unit));
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| VoxlineError::AudioStream("playback worker panicked".into()))?;
        }
        info!("speaker closed");
        Ok(())
    }
}

impl Drop for SpeakerOutput {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("speaker close on drop failed: {e}");
        }
    }
}

struct PlaybackWorker {
    preferred: Option<String>,
    sample_rate: u32,
    clock: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    commands: Receiver<MixerCommand>,
    finished: FinishedSender,
    open_tx: Sender<Result<u32>>,
}

fn run_worker(worker: PlaybackWorker) {
    let PlaybackWorker {
        preferred,
        sample_rate,
        clock,
        shutdown,
        commands,
        finished,
        open_tx,
    } = worker;

    let (retire_tx, retire_rx) = crossbeam_channel::unbounded::<Retired>();

    // Stream must be created and dropped on this thread.
    let (stream, device_rate) =
        match open_output_stream(preferred.as_deref(), sample_rate, clock, commands, retire_tx) {
            Ok(opened) => opened,
            Err(e) => {
                let _ = open_tx.send(Err(e));
                return;
            }
        };

    if open_tx.send(Ok(device_rate)).is_err() {
        return;
    }

    while !shutdown.load(Ordering::Acquire) {
        match retire_rx.recv_timeout(RETIRE_POLL) {
            Ok(retired) => {
                if retired.finished && finished.send(retired.id).is_err() {
                    debug!(unit_id = %retired.id, "finished receiver gone");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    drop(stream);
    // Anything retired during shutdown is released here without notification.
    while retire_rx.try_recv().is_ok() {}
    debug!("playback worker stopped");
}

fn open_output_stream(
    preferred: Option<&str>,
    sample_rate: u32,
    clock: Arc<AtomicU64>,
    commands: Receiver<MixerCommand>,
    retire: Sender<Retired>,
) -> Result<(Stream, u32)> {
    let host = cpal::default_host();
    let device = select_device(&host, DeviceRole::Output, preferred)?;
    let wanted = SampleRate(sample_rate);

    let exact = device
        .supported_output_configs()
        .map_err(|e| VoxlineError::AudioDevice(e.to_string()))?
        .filter(|c| c.min_sample_rate() <= wanted && c.max_sample_rate() >= wanted)
        .min_by_key(|c| c.channels())
        .map(|c| c.with_sample_rate(wanted));

    let supported = match exact {
        Some(config) => config,
        None => {
            let fallback = device
                .default_output_config()
                .map_err(|e| VoxlineError::AudioDevice(e.to_string()))?;
            warn!(
                requested = sample_rate,
                device_rate = fallback.sample_rate().0,
                "output device cannot run at requested rate, converting per unit"
            );
            fallback
        }
    };

    let device_rate = supported.sample_rate().0;
    let config: StreamConfig = supported.config();

    debug!(
        device = device.name().unwrap_or_default().as_str(),
        device_rate,
        channels = config.channels,
        format = ?supported.sample_format(),
        "output config selected"
    );

    let mixer = Mixer {
        voices: Vec::with_capacity(MIXER_CAPACITY),
        clock,
        commands,
        retire,
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_output::<f32>(&device, &config, mixer),
        SampleFormat::I16 => build_output::<i16>(&device, &config, mixer),
        SampleFormat::U16 => build_output::<u16>(&device, &config, mixer),
        fmt => {
            return Err(VoxlineError::AudioStream(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    }?;

    stream
        .play()
        .map_err(|e| VoxlineError::AudioStream(e.to_string()))?;

    Ok((stream, device_rate))
}

/// State owned by the render callback.
struct Mixer {
    voices: Vec<Voice>,
    clock: Arc<AtomicU64>,
    commands: Receiver<MixerCommand>,
    retire: Sender<Retired>,
}

impl Mixer {
    fn apply_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                MixerCommand::Schedule {
                    id,
                    start_frame,
                    samples,
                } => self.voices.push(Voice {
                    id,
                    start_frame,
                    samples,
                    pos: 0,
                }),
                MixerCommand::Stop(id) => {
                    if let Some(idx) = self.voices.iter().position(|v| v.id == id) {
                        let voice = self.voices.swap_remove(idx);
                        self.retire(voice, false);
                    }
                }
            }
        }
    }

    fn retire(&self, voice: Voice, finished: bool) {
        let _ = self.retire.send(Retired {
            id: voice.id,
            finished,
            _samples: voice.samples,
        });
    }

    /// Mix the next `out.len()` frames into `out` and advance the clock.
    fn render(&mut self, out: &mut [f32]) {
        self.apply_commands();
        out.fill(0.0);

        let base = self.clock.load(Ordering::Relaxed);
        for voice in &mut self.voices {
            // A unit applied after its start frame already passed skips the
            // missed samples so it still ends where it was scheduled to.
            let missed = base.saturating_sub(voice.start_frame) as usize;
            if voice.pos < missed {
                voice.pos = missed.min(voice.samples.len());
            }
            for (i, slot) in out.iter_mut().enumerate() {
                if voice.pos >= voice.samples.len() {
                    break;
                }
                if base + i as u64 >= voice.start_frame {
                    *slot += voice.samples[voice.pos];
                    voice.pos += 1;
                }
            }
        }

        let mut idx = 0;
        while idx < self.voices.len() {
            if self.voices[idx].pos >= self.voices[idx].samples.len() {
                let voice = self.voices.swap_remove(idx);
                self.retire(voice, true);
            } else {
                idx += 1;
            }
        }

        self.clock.store(base + out.len() as u64, Ordering::Release);
    }
}

fn build_output<T>(device: &cpal::Device, config: &StreamConfig, mut mixer: Mixer) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let ch = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info| {
                let frames = data.len() / ch;
                mono.resize(frames, 0.0);
                mixer.render(&mut mono);
                for (frame, &sample) in data.chunks_exact_mut(ch).zip(&mono) {
                    let value = T::from_sample(sample.clamp(-1.0, 1.0));
                    frame.fill(value);
                }
            },
            |err| error!("output stream error: {err}"),
            None,
        )
        .map_err(|e| VoxlineError::AudioStream(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixer() -> (Mixer, Sender<MixerCommand>, Receiver<Retired>) {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (retire_tx, retire_rx) = crossbeam_channel::unbounded();
        let mixer = Mixer {
            voices: Vec::new(),
            clock: Arc::new(AtomicU64::new(0)),
            commands: cmd_rx,
            retire: retire_tx,
        };
        (mixer, cmd_tx, retire_rx)
    }

    #[test]
    fn unit_starts_on_its_frame_and_retires_when_done() {
        let (mut mixer, cmds, retired) = mixer();
        cmds.send(MixerCommand::Schedule {
            id: UnitId(7),
            start_frame: 2,
            samples: vec![0.5; 3],
        })
        .unwrap();

        let mut out = vec![0.0; 4];
        mixer.render(&mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5]);
        assert!(retired.try_recv().is_err());

        mixer.render(&mut out);
        assert_eq!(out, vec![0.5, 0.0, 0.0, 0.0]);
        let done = retired.try_recv().expect("unit retired");
        assert_eq!(done.id, UnitId(7));
        assert!(done.finished);
        assert_eq!(mixer.clock.load(Ordering::Acquire), 8);
    }

    #[test]
    fn back_to_back_units_leave_no_gap() {
        let (mut mixer, cmds, _retired) = mixer();
        for (id, start) in [(0, 0), (1, 3)] {
            cmds.send(MixerCommand::Schedule {
                id: UnitId(id),
                start_frame: start,
                samples: vec![0.25; 3],
            })
            .unwrap();
        }
        let mut out = vec![0.0; 6];
        mixer.render(&mut out);
        assert_eq!(out, vec![0.25; 6]);
    }

    #[test]
    fn late_unit_skips_missed_frames_and_ends_on_schedule() {
        let (mut mixer, cmds, retired) = mixer();
        mixer.clock.store(4, Ordering::Release);
        let samples: Vec<f32> = (0..6).map(|i| i as f32 / 10.0).collect();
        for (id, start) in [(0, 0), (1, 6)] {
            cmds.send(MixerCommand::Schedule {
                id: UnitId(id),
                start_frame: start,
                samples: samples.clone(),
            })
            .unwrap();
        }

        let mut out = vec![0.0; 4];
        mixer.render(&mut out);
        // Frames 4..8: tail of unit 0, then the head of unit 1 with no overlap.
        assert_eq!(out, vec![0.4, 0.5, 0.0, 0.1]);
        let first = retired.try_recv().expect("late unit retired");
        assert_eq!(first.id, UnitId(0));
        assert!(first.finished);
    }

    #[test]
    fn unit_entirely_in_the_past_retires_silently() {
        let (mut mixer, cmds, retired) = mixer();
        mixer.clock.store(100, Ordering::Release);
        cmds.send(MixerCommand::Schedule {
            id: UnitId(3),
            start_frame: 10,
            samples: vec![0.5; 20],
        })
        .unwrap();

        let mut out = vec![0.0; 4];
        mixer.render(&mut out);
        assert_eq!(out, vec![0.0; 4]);
        assert!(retired.try_recv().expect("retired").finished);
    }

    #[test]
    fn stopped_unit_retires_without_finishing() {
        let (mut mixer, cmds, retired) = mixer();
        cmds.send(MixerCommand::Schedule {
            id: UnitId(1),
            start_frame: 0,
            samples: vec![0.5; 100],
        })
        .unwrap();
        let mut out = vec![0.0; 4];
        mixer.render(&mut out);

        cmds.send(MixerCommand::Stop(UnitId(1))).unwrap();
        mixer.render(&mut out);
        assert_eq!(out, vec![0.0; 4]);
        let stopped = retired.try_recv().expect("unit retired");
        assert!(!stopped.finished);
    }
}
