//! # prism-core
//!
//! Full-duplex voice engine: continuous speech capture running alongside
//! synthesized playback, with barge-in that ignores the assistant's own echo.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → SegmentRecorder → Transcriber → ListeningController ──SpeechEvent──► host
//!                    │                                 ▲
//!               EnergyLevel                 InteractionCoordinator
//!                    │                                 │
//!          EnergyInterruption ◄── poll ── PlaybackController ◄──speak(text)── host
//!                                                 │
//!                                   Synthesizer → AudioSink
//! ```
//!
//! Device callbacks never allocate. Blocking backend calls run on controller
//! workers, never on the caller's thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod speech;
pub mod stub;
pub mod tts;
pub mod vad;

// Convenience re-exports for downstream crates
pub use audio::output::{AudioSink, PlaybackHandle};
pub use audio::{CaptureStream, Microphone};
pub use buffering::segment::{AudioSegment, SynthesizedAudio};
pub use engine::barge_in::{BargeInMonitor, EnergyInterruption, InterruptionPredicate};
pub use engine::coordinator::{InteractionCoordinator, ListeningIntent};
pub use engine::listening::{ListeningController, ListeningState};
pub use engine::playback::{PlaybackController, PlaybackState};
pub use engine::VoiceConfig;
pub use error::{ErrorKind, PrismError};
pub use ipc::events::{
    FinishReason, ListeningStatus, ListeningStatusEvent, PlaybackEvent, SpeechEvent,
};
pub use speech::Transcriber;
pub use tts::{sanitize_for_speech, Synthesizer};

#[cfg(feature = "audio-cpal")]
pub use audio::{output::CpalSink, CpalMicrophone};

#[cfg(feature = "cloud")]
pub use speech::OpenAiTranscriber;
#[cfg(feature = "cloud")]
pub use tts::OpenAiSynthesizer;
