//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Two places cross rates:
//!
//! - capture: the microphone runs at the device rate (often 44.1/48 kHz),
//!   segments are handed to the transcriber at `target_sample_rate`;
//! - playback: voices arrive at the synthesizer's rate (commonly 24 kHz),
//!   the output device wants its own default rate.
//!
//! Equal rates skip rubato entirely.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{PrismError, Result};

/// Input frames per rubato call.
pub const DEFAULT_CHUNK: usize = 480;

/// Streaming mono converter between two fixed sample rates.
pub struct RateConverter {
    /// `None` when both rates match.
    resampler: Option<FastFixedIn<f32>>,
    /// Input samples waiting for a full rubato block.
    pending: Vec<f32>,
    chunk_size: usize,
    /// Reused output block: `[1][output_frames_max]`.
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Build a converter from `from_rate` to `to_rate`, feeding rubato
    /// `chunk_size` input frames at a time.
    ///
    /// # Errors
    /// Returns `PrismError::AudioStream` if rubato rejects the ratio.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                chunk_size,
                scratch: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            to_rate as f64 / from_rate as f64,
            1.0,
            PolynomialDegree::Cubic,
            chunk_size,
            1,
        )
        .map_err(|e| PrismError::AudioStream(format!("resampler init: {e}")))?;

        let scratch = vec![vec![0f32; resampler.output_frames_max()]; 1];
        debug!(from_rate, to_rate, chunk_size, "rate converter ready");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::new(),
            chunk_size,
            scratch,
        })
    }

    /// Push samples and return whatever full blocks converted (may be empty).
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();

        while self.pending.len() >= self.chunk_size {
            match resampler.process_into_buffer(
                &[&self.pending[..self.chunk_size]],
                &mut self.scratch,
                None,
            ) {
                Ok((_, produced)) => out.extend_from_slice(&self.scratch[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            self.pending.drain(..self.chunk_size);
        }

        out
    }

    /// Convert the remaining partial block, zero-padded to a full chunk.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.resampler.is_none() || self.pending.is_empty() {
            self.pending.clear();
            return Vec::new();
        }
        let padding = self.chunk_size - self.pending.len();
        self.process(&vec![0.0; padding])
    }

    /// Returns `true` when no conversion happens.
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// Convert a complete buffer in one go (used for synthesized speech).
pub fn resample_all(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    let mut converter = RateConverter::new(from_rate, to_rate, DEFAULT_CHUNK)?;
    let mut out = converter.process(samples);
    out.extend(converter.flush());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 480).expect("converter");
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
        assert!(rc.flush().is_empty());
    }

    #[test]
    fn downsampling_48k_to_16k_keeps_duration() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).expect("converter");
        assert!(!rc.is_passthrough());
        let out = rc.process(&vec![0.0f32; 960]);
        assert!(
            (out.len() as isize - 320).unsigned_abs() <= 10,
            "output len={} expected≈320",
            out.len()
        );
    }

    #[test]
    fn partial_block_waits_for_more_input() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).expect("converter");
        assert!(rc.process(&vec![0.0f32; 500]).is_empty());
        assert!(!rc.process(&vec![0.0f32; 500]).is_empty());
    }

    #[test]
    fn resample_all_flushes_tail() {
        // 0.1 s of 24 kHz voice → ≈ 0.1 s at 48 kHz, including the padded tail.
        let out = resample_all(&vec![0.1f32; 2_400], 24_000, 48_000).expect("resample");
        assert!(out.len() >= 4_600, "tail was dropped: {}", out.len());
    }
}
