//! Audio device enumeration.
//!
//! Loopback-style inputs ("Stereo Mix", "Monitor of …") capture whatever the
//! speakers play. Feeding one to the listening loop makes the assistant hear
//! its own voice, so they are flagged and never picked as a fallback.

use serde::{Deserialize, Serialize};

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
    /// Heuristic flag for inputs that likely capture system/output audio.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
    "virtual output",
    "speakers (",
    "headphones (",
];

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// List all available audio input devices, default first.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    match host.input_devices() {
        Ok(devices) => sorted(collect(devices.map(|d| d.name()), default_name.as_deref())),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    }
}

/// List all available audio output devices, default first.
#[cfg(feature = "audio-cpal")]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    match host.output_devices() {
        Ok(devices) => sorted(collect(devices.map(|d| d.name()), default_name.as_deref()))
            .into_iter()
            .map(|mut d| {
                d.is_loopback_like = false;
                d
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate output devices: {e}");
            Vec::new()
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
fn collect<E: std::fmt::Display>(
    names: impl Iterator<Item = std::result::Result<String, E>>,
    default_name: Option<&str>,
) -> Vec<DeviceInfo> {
    names
        .enumerate()
        .map(|(idx, name)| {
            let name = name.unwrap_or_else(|_| format!("Device {}", idx + 1));
            DeviceInfo {
                is_default: default_name == Some(name.as_str()),
                is_loopback_like: is_loopback_like_name(&name),
                name,
            }
        })
        .collect()
}

#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
fn sorted(mut list: Vec<DeviceInfo>) -> Vec<DeviceInfo> {
    list.sort_by_key(|d| (!d.is_default, d.is_loopback_like, d.name.to_ascii_lowercase()));
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio Analog Stereo"));
        assert!(!is_loopback_like_name("Microphone Array (USB PnP Audio Device)"));
    }

    #[test]
    fn default_sorts_first_and_loopback_last() {
        let names: Vec<std::result::Result<String, String>> = vec![
            Ok("Stereo Mix (Realtek Audio)".into()),
            Ok("USB Microphone".into()),
            Ok("Built-in Microphone".into()),
            Err("unnamed".into()),
        ];
        let list = sorted(collect(names.into_iter(), Some("Built-in Microphone")));
        assert_eq!(list[0].name, "Built-in Microphone");
        assert!(list[0].is_default);
        assert_eq!(list.last().map(|d| d.name.as_str()), Some("Stereo Mix (Realtek Audio)"));
        assert!(list.iter().any(|d| d.name == "Device 4"));
    }
}
