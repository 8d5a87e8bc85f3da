//! Speech synthesis boundary and spoken-text cleanup.

#[cfg(feature = "cloud")]
pub mod openai;
pub mod sanitize;

#[cfg(feature = "cloud")]
pub use openai::OpenAiSynthesizer;
pub use sanitize::sanitize_for_speech;

use crate::buffering::segment::SynthesizedAudio;
use crate::error::Result;

/// Converts text into playable audio.
///
/// Called from the playback session worker; implementations may block on
/// the network. A failed call must not leave temporary files behind: return
/// decoded samples, not paths.
pub trait Synthesizer: Send + Sync + 'static {
    /// # Errors
    /// `Synthesis` when the backend fails.
    fn synthesize(&self, text: &str, voice: &str) -> Result<SynthesizedAudio>;

    /// Voice ids this backend accepts.
    fn voices(&self) -> Vec<String>;
}
