//! OpenAI transcription endpoint (blocking).

use std::time::Duration;

use reqwest::blocking::{multipart, Client};
use serde::Deserialize;
use tracing::{debug, warn};

use super::Transcriber;
use crate::buffering::segment::AudioSegment;
use crate::error::{PrismError, Result};

const TRANSCRIPTIONS_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const DEFAULT_MODEL: &str = "gpt-4o-mini-transcribe";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

pub struct OpenAiTranscriber {
    client: Client,
    api_key: String,
    model: String,
    language: Option<String>,
}

impl OpenAiTranscriber {
    /// # Errors
    /// `Recognition` if the key is blank or the HTTP client cannot be built.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(PrismError::Recognition(
                "OpenAI API key required for transcription".into(),
            ));
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PrismError::Recognition(format!("http client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            model: DEFAULT_MODEL.into(),
            language: None,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// ISO-639-1 hint, e.g. `"en"`.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

impl Transcriber for OpenAiTranscriber {
    fn transcribe(&self, segment: &AudioSegment) -> Result<Option<String>> {
        if segment.is_empty() {
            return Ok(None);
        }

        let wav = segment.to_wav_bytes()?;
        let file_part = multipart::Part::bytes(wav)
            .file_name("segment.wav")
            .mime_str("audio/wav")
            .map_err(|e| PrismError::Recognition(format!("multipart: {e}")))?;
        let mut form = multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "json")
            .part("file", file_part);
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(TRANSCRIPTIONS_URL)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| PrismError::Recognition(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            warn!(%status, "transcription request rejected");
            return Err(PrismError::Recognition(format!("HTTP {status}: {body}")));
        }

        let payload: TranscriptionResponse = response
            .json()
            .map_err(|e| PrismError::Recognition(format!("bad response: {e}")))?;
        let text = payload.text.trim();
        debug!(chars = text.len(), "transcription received");

        Ok((!text.is_empty()).then(|| text.to_string()))
    }

    fn name(&self) -> &str {
        "openai"
    }
}
