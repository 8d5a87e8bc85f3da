//! OpenAI speech endpoint (blocking), WAV response decoded in memory.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::Serialize;
use tracing::{debug, warn};

use super::Synthesizer;
use crate::buffering::segment::SynthesizedAudio;
use crate::error::{PrismError, Result};

const SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";
const DEFAULT_MODEL: &str = "tts-1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const OPENAI_VOICES: &[&str] = &["alloy", "echo", "fable", "onyx", "nova", "shimmer"];

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
    speed: f32,
}

pub struct OpenAiSynthesizer {
    client: Client,
    api_key: String,
    model: String,
    speed: f32,
}

impl OpenAiSynthesizer {
    /// # Errors
    /// `Synthesis` if the key is blank or the HTTP client cannot be built.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(PrismError::Synthesis(
                "OpenAI API key required for speech".into(),
            ));
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PrismError::Synthesis(format!("http client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            model: DEFAULT_MODEL.into(),
            speed: 1.0,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Clamped to the range the endpoint accepts.
    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed.clamp(0.25, 4.0);
        self
    }
}

impl Synthesizer for OpenAiSynthesizer {
    fn synthesize(&self, text: &str, voice: &str) -> Result<SynthesizedAudio> {
        let voice = if OPENAI_VOICES.contains(&voice) {
            voice
        } else {
            warn!(voice, "unknown voice, using {}", OPENAI_VOICES[0]);
            OPENAI_VOICES[0]
        };

        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice,
            response_format: "wav",
            speed: self.speed,
        };

        let response = self
            .client
            .post(SPEECH_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(|e| PrismError::Synthesis(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(PrismError::Synthesis(format!("HTTP {status}: {body}")));
        }

        let bytes = response
            .bytes()
            .map_err(|e| PrismError::Synthesis(format!("reading audio: {e}")))?;
        let audio = SynthesizedAudio::from_wav_bytes(&bytes)?;
        debug!(
            voice,
            chars = text.len(),
            duration_ms = audio.duration().as_millis() as u64,
            "speech synthesized"
        );
        Ok(audio)
    }

    fn voices(&self) -> Vec<String> {
        OPENAI_VOICES.iter().map(|v| v.to_string()).collect()
    }
}
