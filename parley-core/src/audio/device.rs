//! Input device enumeration and selection heuristics.
//!
//! A voice call must hear the caller, not the agent's own playback, so
//! devices that look like loopback/system-output capture are never picked
//! automatically.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub looks_like_loopback: bool,
    /// The device `pick_speech_input` would choose with no preference set.
    pub is_recommended: bool,
}

const LOOPBACK_HINTS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "loopback",
    "monitor of",
    "virtual output",
    "speakers (",
];

const MICROPHONE_HINTS: &[&str] = &["microphone", "mic", "headset", "array", "usb", "webcam"];

pub fn looks_like_loopback(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_HINTS.iter().any(|h| lowered.contains(h))
}

/// Higher is better for capturing a human speaker.
pub fn speech_input_score(name: &str, is_default: bool) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = if looks_like_loopback(&lowered) { -20 } else { 10 };
    if MICROPHONE_HINTS.iter().any(|h| lowered.contains(h)) {
        score += 5;
    }
    if is_default {
        score += 3;
    }
    score
}

/// Index of the best speech input among `(name, is_default)` candidates.
///
/// Returns `None` when the list is empty or every candidate looks like loopback.
pub fn pick_speech_input(candidates: &[(String, bool)]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .filter(|(_, (name, _))| !looks_like_loopback(name))
        .max_by_key(|(_, (name, is_default))| speech_input_score(name, *is_default))
        .map(|(idx, _)| idx)
}

/// List the system's audio input devices, recommended device first.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<InputDeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let names: Vec<(String, bool)> = match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input {}", idx + 1));
                let is_default = default_name.as_deref() == Some(name.as_str());
                (name, is_default)
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            default_name.into_iter().map(|n| (n, true)).collect()
        }
    };

    describe_devices(&names)
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<InputDeviceInfo> {
    vec![]
}

fn describe_devices(names: &[(String, bool)]) -> Vec<InputDeviceInfo> {
    let recommended = pick_speech_input(names);
    let mut list: Vec<InputDeviceInfo> = names
        .iter()
        .enumerate()
        .map(|(idx, (name, is_default))| InputDeviceInfo {
            name: name.clone(),
            is_default: *is_default,
            looks_like_loopback: looks_like_loopback(name),
            is_recommended: recommended == Some(idx),
        })
        .collect();
    list.sort_by_key(|d| (!d.is_recommended, d.looks_like_loopback, d.name.to_ascii_lowercase()));
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_names_are_detected() {
        assert!(looks_like_loopback("Stereo Mix (Realtek Audio)"));
        assert!(looks_like_loopback("Monitor of Built-in Audio"));
        assert!(!looks_like_loopback("USB Microphone"));
    }

    #[test]
    fn picks_microphone_over_loopback_default() {
        let candidates = vec![
            ("Stereo Mix (Realtek Audio)".to_string(), true),
            ("Headset Microphone (USB)".to_string(), false),
        ];
        assert_eq!(pick_speech_input(&candidates), Some(1));
    }

    #[test]
    fn no_pick_when_only_loopback() {
        let candidates = vec![("What U Hear".to_string(), true)];
        assert_eq!(pick_speech_input(&candidates), None);
    }

    #[test]
    fn recommended_device_sorts_first() {
        let names = vec![
            ("Line In".to_string(), false),
            ("Built-in Microphone".to_string(), true),
        ];
        let list = describe_devices(&names);
        assert_eq!(list[0].name, "Built-in Microphone");
        assert!(list[0].is_recommended);
        assert!(!list[1].is_recommended);
    }
}
