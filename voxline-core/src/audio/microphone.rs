//! Microphone capture via cpal.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate after the first callback, block on a lock, or
//! perform I/O. It only down-mixes to mono and writes into an SPSC ring
//! buffer producer whose `push_slice` is lock-free.
//!
//! A blocking worker owns the `!Send` stream for its whole life, drains the
//! ring, converts to the outbound rate and slices fixed-size frames onto the
//! async frame channel consumed by the call's capture task.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};
use std::time::Duration;

use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, SampleFormat, SizedSample, Stream, StreamConfig,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        device::{select_device, DeviceRole},
        resample::RateConverter,
        CaptureStream,
    },
    buffering::{create_audio_ring, AudioConsumer, AudioFormat, AudioProducer, CaptureFrame, Consumer, Producer},
    error::{Result, VoxlineError},
};

/// Samples drained from the ring per worker iteration (20 ms at 48 kHz).
const DRAIN_CHUNK: usize = 960;

/// Frames buffered between the worker and the capture task before dropping.
const FRAME_QUEUE: usize = 32;

const DEFAULT_SLEEP_EMPTY_MS: u64 = 5;

fn empty_sleep_ms() -> u64 {
    static EMPTY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *EMPTY_SLEEP_MS.get_or_init(|| {
        std::env::var("VOXLINE_CAPTURE_EMPTY_SLEEP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_SLEEP_EMPTY_MS)
    })
}

/// Open the microphone and start delivering `frame_samples`-long frames at
/// `format`.
///
/// Resolves once the device is confirmed open (or failed to open).
pub async fn open(
    preferred_device: Option<String>,
    format: AudioFormat,
    frame_samples: usize,
) -> Result<CaptureStream> {
    let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
    let running = Arc::new(AtomicBool::new(true));
    let (open_tx, open_rx) = oneshot::channel::<Result<u32>>();

    let worker_running = Arc::clone(&running);
    tokio::task::spawn_blocking(move || {
        run_worker(CaptureWorker {
            preferred_device,
            format,
            frame_samples: frame_samples.max(1),
            running: worker_running,
            frames_tx,
            open_tx,
        })
    });

    match open_rx.await {
        Ok(Ok(device_rate)) => {
            info!(device_rate, target_rate = format.sample_rate, "microphone open");
            Ok(CaptureStream::new(frames_rx, running, format))
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(VoxlineError::AudioStream(
            "capture worker exited before reporting open status".into(),
        )),
    }
}

struct CaptureWorker {
    preferred_device: Option<String>,
    format: AudioFormat,
    frame_samples: usize,
    running: Arc<AtomicBool>,
    frames_tx: mpsc::Sender<CaptureFrame>,
    open_tx: oneshot::Sender<Result<u32>>,
}

fn run_worker(worker: CaptureWorker) {
    let CaptureWorker {
        preferred_device,
        format,
        frame_samples,
        running,
        frames_tx,
        open_tx,
    } = worker;

    let (producer, mut consumer) = create_audio_ring();

    // Stream must be created and dropped on this thread.
    let (stream, device_rate) =
        match open_input_stream(producer, Arc::clone(&running), preferred_device.as_deref()) {
            Ok(opened) => opened,
            Err(e) => {
                running.store(false, Ordering::Release);
                let _ = open_tx.send(Err(e));
                return;
            }
        };

    let mut converter = match RateConverter::new(device_rate, format.sample_rate, DRAIN_CHUNK) {
        Ok(c) => c,
        Err(e) => {
            running.store(false, Ordering::Release);
            let _ = open_tx.send(Err(e));
            return;
        }
    };

    if open_tx.send(Ok(device_rate)).is_err() {
        // The caller gave up on the call while the device was opening.
        debug!("capture open abandoned by caller");
        running.store(false, Ordering::Release);
        return;
    }

    pump_frames(
        &mut consumer,
        &mut converter,
        &running,
        &frames_tx,
        frame_samples,
    );

    drop(stream);
    info!("microphone released");
}

fn pump_frames(
    consumer: &mut AudioConsumer,
    converter: &mut RateConverter,
    running: &AtomicBool,
    frames_tx: &mpsc::Sender<CaptureFrame>,
    frame_samples: usize,
) {
    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut pending: Vec<f32> = Vec::with_capacity(frame_samples * 2);
    let mut seq = 0u64;
    let mut dropped = 0usize;

    while running.load(Ordering::Acquire) {
        let n = consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(Duration::from_millis(empty_sleep_ms()));
            continue;
        }

        match converter.process(&raw[..n]) {
            Ok(converted) => pending.extend_from_slice(&converted),
            Err(e) => {
                error!("capture rate conversion failed: {e}");
                continue;
            }
        }

        while pending.len() >= frame_samples {
            let samples: Vec<f32> = pending.drain(..frame_samples).collect();
            let frame = CaptureFrame { seq, samples };
            seq += 1;
            match frames_tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    warn!(seq, dropped, "capture frame queue full: dropped frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    running.store(false, Ordering::Release);
                    break;
                }
            }
        }
    }

    debug!(frames = seq, dropped, "capture worker stopped");
}

fn open_input_stream(
    producer: AudioProducer,
    running: Arc<AtomicBool>,
    preferred_device: Option<&str>,
) -> Result<(Stream, u32)> {
    let host = cpal::default_host();
    let device = select_device(&host, DeviceRole::Input, preferred_device)?;

    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening input device"
    );

    let supported = device
        .default_input_config()
        .map_err(|e| VoxlineError::MicrophoneDenied(e.to_string()))?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let config: StreamConfig = supported.config();

    debug!(sample_rate, channels, format = ?supported.sample_format(), "input config selected");

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_mono_input::<f32>(&device, &config, producer, running),
        SampleFormat::I16 => build_mono_input::<i16>(&device, &config, producer, running),
        SampleFormat::U16 => build_mono_input::<u16>(&device, &config, producer, running),
        fmt => {
            return Err(VoxlineError::AudioStream(format!(
                "unsupported input sample format: {fmt:?}"
            )))
        }
    }?;

    stream
        .play()
        .map_err(|e| VoxlineError::MicrophoneDenied(e.to_string()))?;

    Ok((stream, sample_rate))
}

fn build_mono_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let ch = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / ch;
                mono.resize(frames, 0.0);
                for (slot, frame) in mono.iter_mut().zip(data.chunks_exact(ch)) {
                    let sum: f32 = frame.iter().map(|s| s.to_sample::<f32>()).sum();
                    *slot = sum / ch as f32;
                }
                let written = producer.push_slice(&mono);
                if written < mono.len() {
                    warn!("capture ring full: dropped {} samples", mono.len() - written);
                }
            },
            |err| error!("input stream error: {err}"),
            None,
        )
        .map_err(|e| VoxlineError::MicrophoneDenied(e.to_string()))
}
