//! Energy-based VAD using RMS threshold + hangover counter.
//!
//! ## Algorithm
//!
//! 1. Compute RMS of the incoming frame.
//! 2. If RMS ≥ `threshold` → emit `Speech`, reset hangover counter.
//! 3. If RMS < `threshold` and hangover counter > 0 → emit `Speech`,
//!    decrement counter (prevents clipping syllable endings).
//! 4. Otherwise → emit `Silence`.
//!
//! `threshold` starts at the configured floor and is raised to
//! `ambient × multiplier` after calibration in a noisy room.

use super::{compute_rms, VadDecision, VoiceActivityDetector};

/// A simple energy-based voice activity detector.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    /// Configured RMS floor; calibration never lowers the threshold below it.
    floor: f32,
    /// Ambient RMS is multiplied by this to derive the calibrated threshold.
    ambient_multiplier: f32,
    /// Active RMS threshold. Frames above this are considered speech.
    threshold: f32,
    /// How many consecutive below-threshold frames to still emit `Speech`
    /// after real speech ends (prevents clipping word endings).
    hangover_frames: u32,
    /// Current hangover countdown.
    hangover_counter: u32,
}

impl EnergyVad {
    /// Create a new `EnergyVad`.
    ///
    /// # Parameters
    /// - `floor`: RMS level above which a frame is considered speech before
    ///   calibration. Default: `0.01`.
    /// - `ambient_multiplier`: calibrated threshold = ambient RMS × this.
    ///   Default: `1.5`.
    /// - `hangover_frames`: Number of silent frames to extend speech detection.
    ///   Default: `4` (≈ 80 ms at a 20 ms frame stride).
    pub fn new(floor: f32, ambient_multiplier: f32, hangover_frames: u32) -> Self {
        Self {
            floor,
            ambient_multiplier,
            threshold: floor,
            hangover_frames,
            hangover_counter: 0,
        }
    }

    /// Currently active RMS threshold.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(0.01, 1.5, 4)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&mut self, frame: &[f32]) -> VadDecision {
        let rms = compute_rms(frame);

        if rms >= self.threshold && rms > 0.0 {
            self.hangover_counter = self.hangover_frames;
            VadDecision::Speech
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }

    fn set_noise_floor(&mut self, ambient_rms: f32) {
        self.threshold = self.floor.max(ambient_rms * self.ambient_multiplier);
    }

    fn reset(&mut self) {
        self.hangover_counter = 0;
    }
}
