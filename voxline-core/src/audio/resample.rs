//! Fixed-ratio sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Two places need it:
//!
//! - the microphone worker, which captures at the device's native rate
//!   (commonly 48 kHz) and must emit 16 kHz frames;
//! - the loopback endpoint, which turns 16 kHz outbound frames into 24 kHz
//!   "model" audio.
//!
//! When both rates are equal the converter is a passthrough and no rubato
//! session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::error::{Result, VoxlineError};

/// Converts mono f32 audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Input held back until a full `block` is available.
    pending: Vec<f32>,
    block: usize,
    /// Scratch output: `[1][output_frames_max]`.
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// `block` is the number of input frames rubato consumes per pass.
    ///
    /// # Errors
    /// `AudioDevice` if rubato rejects the ratio or block size.
    pub fn new(from_rate: u32, to_rate: u32, block: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                block,
                scratch: Vec::new(),
            });
        }

        let ratio = to_rate as f64 / from_rate as f64;
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, block, 1)
            .map_err(|e| VoxlineError::AudioDevice(format!("resampler init: {e}")))?;
        let scratch = vec![vec![0f32; resampler.output_frames_max()]; 1];

        tracing::debug!(from_rate, to_rate, block, "rate converter created");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::with_capacity(block * 2),
            block,
            scratch,
        })
    }

    /// Feed samples and collect whatever output full blocks produced.
    ///
    /// Remainders shorter than one block stay queued for the next call, so
    /// output may be empty.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        let mut consumed_total = 0;

        while self.pending.len() - consumed_total >= self.block {
            let input = &self.pending[consumed_total..consumed_total + self.block];
            let (consumed, produced) = resampler
                .process_into_buffer(&[input], &mut self.scratch, None)
                .map_err(|e| VoxlineError::AudioStream(format!("resampler: {e}")))?;
            out.extend_from_slice(&self.scratch[0][..produced]);
            consumed_total += consumed;
        }

        self.pending.drain(..consumed_total);
        Ok(out)
    }

    /// Samples buffered but not yet converted.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
