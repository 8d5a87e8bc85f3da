//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use prism_core::VoiceConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub voice: String,
    pub continuous: bool,
    pub debounce_ms: u64,
    pub resume_grace_ms: u64,
    pub barge_in_threshold: f32,
    pub energy_threshold: f32,
    pub pause_threshold_ms: u64,
    pub phrase_time_limit_ms: u64,
    pub speech_speed: f32,
    pub answer_model: String,
    pub history_turns: usize,
    /// Read from the file if present, never written back.
    #[serde(skip_serializing)]
    pub gemini_api_key: Option<String>,
    #[serde(skip_serializing)]
    pub openai_api_key: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        let voice = VoiceConfig::default();
        Self {
            preferred_input_device: None,
            voice: voice.voice,
            continuous: false,
            debounce_ms: voice.debounce_window.as_millis() as u64,
            resume_grace_ms: voice.resume_grace.as_millis() as u64,
            barge_in_threshold: voice.barge_in_threshold,
            energy_threshold: voice.energy_threshold,
            pause_threshold_ms: voice.pause_threshold.as_millis() as u64,
            phrase_time_limit_ms: voice.phrase_time_limit.as_millis() as u64,
            speech_speed: 1.0,
            answer_model: "gemini-2.0-flash".into(),
            history_turns: 10,
            gemini_api_key: None,
            openai_api_key: None,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.voice = normalize_voice(&self.voice);
        self.debounce_ms = self.debounce_ms.clamp(100, 5_000);
        self.resume_grace_ms = self.resume_grace_ms.clamp(0, 5_000);
        self.barge_in_threshold = self.barge_in_threshold.clamp(0.001, 1.0);
        self.energy_threshold = self.energy_threshold.clamp(0.0005, 0.5);
        self.pause_threshold_ms = self.pause_threshold_ms.clamp(100, 3_000);
        self.phrase_time_limit_ms = self.phrase_time_limit_ms.clamp(1_000, 60_000);
        self.speech_speed = self.speech_speed.clamp(0.25, 4.0);
        self.history_turns = self.history_turns.clamp(1, 50);
        self.answer_model = normalize_answer_model(&self.answer_model);
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.gemini_api_key = trimmed(self.gemini_api_key.take());
        self.openai_api_key = trimmed(self.openai_api_key.take());
    }

    /// Overlay values from the process environment. File values lose.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(voice) = lookup("PRISM_VOICE") {
            self.voice = voice;
        }
        if let Some(flag) = lookup("PRISM_CONTINUOUS").and_then(|v| parse_flag(&v)) {
            self.continuous = flag;
        }
        if let Some(ms) = lookup("PRISM_DEBOUNCE_MS").and_then(|v| v.trim().parse().ok()) {
            self.debounce_ms = ms;
        }
        if let Some(threshold) =
            lookup("PRISM_BARGE_IN_THRESHOLD").and_then(|v| v.trim().parse().ok())
        {
            self.barge_in_threshold = threshold;
        }
        if let Some(key) = lookup("GEMINI_API_KEY") {
            self.gemini_api_key = Some(key);
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.openai_api_key = Some(key);
        }
        self.normalize();
    }

    pub fn to_voice_config(&self) -> VoiceConfig {
        VoiceConfig {
            debounce_window: Duration::from_millis(self.debounce_ms),
            resume_grace: Duration::from_millis(self.resume_grace_ms),
            barge_in_threshold: self.barge_in_threshold,
            energy_threshold: self.energy_threshold,
            pause_threshold: Duration::from_millis(self.pause_threshold_ms),
            phrase_time_limit: Duration::from_millis(self.phrase_time_limit_ms),
            voice: self.voice.clone(),
            ..VoiceConfig::default()
        }
    }
}

pub fn normalize_voice(raw: &str) -> String {
    let voice = raw.trim().to_ascii_lowercase();
    if voice.is_empty() {
        VoiceConfig::default().voice
    } else {
        voice
    }
}

pub fn normalize_answer_model(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "flash" => "gemini-2.0-flash".into(),
        "flash-lite" => "gemini-2.0-flash-lite".into(),
        "pro" => "gemini-1.5-pro".into(),
        other => other.into(),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Prism")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("prism")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

/// Persist `voice` into the file at `path`, leaving every other stored value
/// as it was. Env and CLI overrides live only in memory and are not written.
pub fn save_voice(path: &Path, voice: &str) -> std::io::Result<()> {
    let mut stored = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .filter(Value::is_object)
        .unwrap_or_else(|| Value::Object(Map::new()));
    stored["voice"] = Value::String(voice.to_string());

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&stored).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
