//! Events emitted by the voice core.
//!
//! | Event | Source | Subscribe with |
//! |-------|--------|----------------|
//! | `ListeningStatusEvent` | `ListeningController` | `subscribe_status()` |
//! | `SpeechEvent` | `ListeningController` | `subscribe_speech()` |
//! | `PlaybackEvent` | `PlaybackController` | `subscribe()` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Listening
// ---------------------------------------------------------------------------

/// Emitted whenever the listening loop changes what it is doing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListeningStatusEvent {
    pub status: ListeningStatus,
    /// Optional human-readable detail (e.g. the device error).
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListeningStatus {
    /// A session began.
    ListeningStarted,
    /// The microphone is open and waiting for a phrase.
    ListeningForCommand,
    /// A segment was captured and is being transcribed.
    ProcessingSpeech,
    /// The session ended (stop, or a single-shot session completed).
    ListeningStopped,
    /// The microphone could not be opened; the session was abandoned.
    MicrophoneUnavailable,
}

impl ListeningStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ListeningStatus::ListeningStarted => "listening-started",
            ListeningStatus::ListeningForCommand => "listening-for-command",
            ListeningStatus::ProcessingSpeech => "processing-speech",
            ListeningStatus::ListeningStopped => "listening-stopped",
            ListeningStatus::MicrophoneUnavailable => "microphone-unavailable",
        }
    }
}

impl std::fmt::Display for ListeningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recognized user speech.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechEvent {
    /// Monotonically increasing sequence number.
    pub seq: u64,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// Lifecycle of one speaking session. Every `Started` is followed by exactly
/// one `Finished` with the same `session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlaybackEvent {
    Started { session: u64 },
    Finished { session: u64, reason: FinishReason },
}

impl PlaybackEvent {
    pub fn session(&self) -> u64 {
        match *self {
            PlaybackEvent::Started { session } | PlaybackEvent::Finished { session, .. } => session,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FinishReason {
    /// Audio played to the end.
    Completed,
    /// `stop()` was called.
    Stopped,
    /// The barge-in monitor cut playback short.
    Interrupted,
    /// A newer `speak()` replaced this session.
    Superseded,
    /// Synthesis or the output device failed.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listening_status_serializes_as_status_text() {
        let event = ListeningStatusEvent {
            status: ListeningStatus::ListeningForCommand,
            detail: None,
        };
        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "listening-for-command");
        assert_eq!(json["status"], ListeningStatus::ListeningForCommand.as_str());
        assert!(json["detail"].is_null());

        let round_trip: ListeningStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, ListeningStatus::ListeningForCommand);
    }

    #[test]
    fn every_status_text_matches_serde_name() {
        for status in [
            ListeningStatus::ListeningStarted,
            ListeningStatus::ListeningForCommand,
            ListeningStatus::ProcessingSpeech,
            ListeningStatus::ListeningStopped,
            ListeningStatus::MicrophoneUnavailable,
        ] {
            let json = serde_json::to_value(status).expect("serialize status");
            assert_eq!(json, status.as_str());
            assert_eq!(status.to_string(), status.as_str());
        }
    }

    #[test]
    fn playback_event_is_tagged() {
        let event = PlaybackEvent::Finished {
            session: 4,
            reason: FinishReason::Interrupted,
        };
        let json = serde_json::to_value(event).expect("serialize playback event");
        assert_eq!(json["type"], "finished");
        assert_eq!(json["session"], 4);
        assert_eq!(json["reason"], "interrupted");
        assert_eq!(event.session(), 4);
    }
}
