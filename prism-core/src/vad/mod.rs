//! Voice Activity Detection (VAD) abstraction.
//!
//! `SegmentRecorder` endpoints phrases through `VoiceActivityDetector`, so a
//! neural detector can replace `EnergyVad` without touching the capture loop.

pub mod energy;

pub use energy::EnergyVad;

/// Whether a given audio frame contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// The frame contains speech energy above threshold.
    Speech,
    /// The frame is silent (or below threshold, including hangover period).
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

/// Trait for all VAD implementations.
///
/// Implementors may keep state between frames; `reset` runs before each phrase.
pub trait VoiceActivityDetector: Send + 'static {
    /// Analyse one frame of mono samples and return a speech/silence decision.
    fn classify(&mut self, frame: &[f32]) -> VadDecision;

    /// Adapt to the ambient noise measured during calibration.
    fn set_noise_floor(&mut self, ambient_rms: f32);

    /// Forget per-phrase state such as hangover counters.
    fn reset(&mut self);
}

/// Root-mean-square of a sample slice; `0.0` for an empty slice.
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
