use thiserror::Error;

/// All errors produced by prism-core.
#[derive(Debug, Error)]
pub enum PrismError {
    #[error("no speech detected before the listen timeout")]
    CaptureTimeout,

    #[error("speech was not understood")]
    Unintelligible,

    #[error("recognition backend error: {0}")]
    Recognition(String),

    #[error("synthesis backend error: {0}")]
    Synthesis(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How a controller reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeout or unintelligible audio: log and keep looping.
    Transient,
    /// Recognition/synthesis service failure: log, back off, continue.
    Backend,
    /// Microphone or speaker unavailable: surface once, return to idle.
    Resource,
    /// Stop observed or call made in the wrong state: no-op.
    Coordination,
}

impl PrismError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PrismError::CaptureTimeout | PrismError::Unintelligible => ErrorKind::Transient,
            PrismError::Recognition(_)
            | PrismError::Synthesis(_)
            | PrismError::Io(_)
            | PrismError::Other(_) => ErrorKind::Backend,
            PrismError::AudioDevice(_)
            | PrismError::AudioStream(_)
            | PrismError::NoDefaultInputDevice
            | PrismError::NoDefaultOutputDevice => ErrorKind::Resource,
            PrismError::Cancelled => ErrorKind::Coordination,
        }
    }
}

pub type Result<T> = std::result::Result<T, PrismError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_covers_every_reaction() {
        assert_eq!(PrismError::CaptureTimeout.kind(), ErrorKind::Transient);
        assert_eq!(PrismError::Unintelligible.kind(), ErrorKind::Transient);
        assert_eq!(
            PrismError::Recognition("503".into()).kind(),
            ErrorKind::Backend
        );
        assert_eq!(PrismError::Synthesis("dns".into()).kind(), ErrorKind::Backend);
        assert_eq!(PrismError::NoDefaultInputDevice.kind(), ErrorKind::Resource);
        assert_eq!(
            PrismError::AudioStream("unplugged".into()).kind(),
            ErrorKind::Resource
        );
        assert_eq!(PrismError::Cancelled.kind(), ErrorKind::Coordination);
    }
}
