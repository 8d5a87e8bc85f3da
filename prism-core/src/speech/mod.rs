//! Speech recognition boundary.
//!
//! ## Extending
//!
//! Implement `Transcriber` for any backend (local model, cloud API, test
//! script). The listening loop calls it from its own worker thread, so
//! implementations may block.

#[cfg(feature = "cloud")]
pub mod openai;

#[cfg(feature = "cloud")]
pub use openai::OpenAiTranscriber;

use crate::buffering::segment::AudioSegment;
use crate::error::Result;

/// Converts one captured segment into text.
pub trait Transcriber: Send + Sync + 'static {
    /// `Ok(None)` means the audio was heard but not understood.
    ///
    /// # Errors
    /// `Recognition` when the backend itself failed.
    fn transcribe(&self, segment: &AudioSegment) -> Result<Option<String>>;

    /// Human-readable backend name for logs.
    fn name(&self) -> &str {
        "transcriber"
    }
}
