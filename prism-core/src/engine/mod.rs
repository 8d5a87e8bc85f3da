//! The voice interaction core.
//!
//! ## Components
//!
//! ```text
//!                 ┌──────────────── InteractionCoordinator ───────────────┐
//!                 │  playback events ─► stop / resume listening          │
//!                 │  start / stop energy sampling around playback        │
//!                 └───────┬──────────────────────────────────┬───────────┘
//!                         │                                  │
//!   Microphone ─► ListeningController ──speech──►  app  ──► PlaybackController ─► AudioSink
//!                         │   ▲                               ▲      │
//!                         │   └────── BargeInMonitor ─────────┘      │
//!                         └──── EnergyLevel ─► EnergyInterruption ◄──┘ (polled)
//! ```
//!
//! ## Threading
//!
//! Each controller owns its workers: at most one listening loop, at most one
//! playback session worker (plus its barge-in watcher), and the
//! coordinator's event thread. Stops are cooperative: a flag plus a dropped
//! channel wakes whoever is waiting. Nothing is force-killed; blocking
//! backend calls run to completion and their results are discarded.

pub mod barge_in;
pub mod coordinator;
pub mod listening;
pub mod playback;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Broadcast channel capacity for every event stream.
pub(crate) const BROADCAST_CAP: usize = 256;

/// Timing and threshold knobs for the voice core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// How long to wait for speech to begin. `None` waits until stopped.
    pub listen_timeout: Option<Duration>,
    /// Hard cap on a single phrase. Default: 5 s.
    pub phrase_time_limit: Duration,
    /// Trailing silence that ends a phrase. Default: 0.3 s.
    pub pause_threshold: Duration,
    /// Phrases with less voiced audio than this are dropped. Default: 0.1 s.
    pub min_phrase_duration: Duration,
    /// Ambient noise measurement before each capture. Default: 0.2 s.
    pub ambient_calibration: Duration,
    /// RMS floor for speech. Default: 0.01.
    pub energy_threshold: f32,
    /// Calibrated threshold = max(floor, ambient × this). Default: 1.5.
    pub ambient_multiplier: f32,
    /// Rate of segments handed to the transcriber (Hz). Default: 16000.
    pub target_sample_rate: u32,
    /// Echo guard after playback ends. Applies to both the listening gate
    /// and the barge-in predicate. Default: 1 s.
    pub debounce_window: Duration,
    /// Sleep step while the listening loop is gated. Default: 20 ms.
    pub idle_poll: Duration,
    /// Pause after a backend failure. Default: 0.5 s.
    pub backend_backoff: Duration,
    /// Delay between playback end and resumed listening. Default: 0.5 s.
    pub resume_grace: Duration,
    /// Barge-in predicate poll interval. Default: 50 ms.
    pub barge_in_poll: Duration,
    /// Absolute RMS above which the user is considered to be talking over
    /// playback. Default: 0.04.
    pub barge_in_threshold: f32,
    /// Energy samples older than this are ignored by the predicate.
    /// Default: 250 ms.
    pub barge_in_max_sample_age: Duration,
    /// Voice id handed to the synthesizer.
    pub voice: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            listen_timeout: None,
            phrase_time_limit: Duration::from_secs(5),
            pause_threshold: Duration::from_millis(300),
            min_phrase_duration: Duration::from_millis(100),
            ambient_calibration: Duration::from_millis(200),
            energy_threshold: 0.01,
            ambient_multiplier: 1.5,
            target_sample_rate: 16_000,
            debounce_window: Duration::from_secs(1),
            idle_poll: Duration::from_millis(20),
            backend_backoff: Duration::from_millis(500),
            resume_grace: Duration::from_millis(500),
            barge_in_poll: Duration::from_millis(50),
            barge_in_threshold: 0.04,
            barge_in_max_sample_age: Duration::from_millis(250),
            voice: "alloy".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_timings() {
        let cfg = VoiceConfig::default();
        assert_eq!(cfg.listen_timeout, None);
        assert_eq!(cfg.phrase_time_limit, Duration::from_secs(5));
        assert_eq!(cfg.debounce_window, Duration::from_secs(1));
        assert_eq!(cfg.barge_in_poll, Duration::from_millis(50));
        assert_eq!(cfg.backend_backoff, Duration::from_millis(500));
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let cfg: VoiceConfig =
            serde_json::from_str(r#"{ "voice": "nova", "energy_threshold": 0.02 }"#)
                .expect("deserialize partial config");
        assert_eq!(cfg.voice, "nova");
        assert!((cfg.energy_threshold - 0.02).abs() < f32::EPSILON);
        assert_eq!(cfg.resume_grace, Duration::from_millis(500));
    }
}
