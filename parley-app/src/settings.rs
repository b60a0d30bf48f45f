//! Persistent host settings (JSON file in the app data directory).
//!
//! Precedence, lowest first: built-in defaults, the settings file,
//! `PARLEY_*` environment variables, CLI flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_core::{services::http::ServiceEndpoints, CallConfig, CaptureConstraints};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub speech_threshold_db: f32,
    pub silence_floor_db: f32,
    pub silence_debounce_frames: u32,
    pub scoring_delay_secs: u64,
    pub asr_url: String,
    pub dialogue_url: String,
    pub scoring_url: String,
    pub tts_url: String,
    pub api_key: Option<String>,
    pub default_voice_id: String,
    pub preferred_input_device: Option<String>,
    pub database_path: Option<PathBuf>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            speech_threshold_db: -13.0,
            silence_floor_db: -22.0,
            silence_debounce_frames: 300,
            scoring_delay_secs: 60,
            asr_url: "http://127.0.0.1:8787/asr".into(),
            dialogue_url: "http://127.0.0.1:8787/dialogue".into(),
            scoring_url: "http://127.0.0.1:8787/score".into(),
            tts_url: "http://127.0.0.1:8787/tts".into(),
            api_key: None,
            default_voice_id: "default".into(),
            preferred_input_device: None,
            database_path: None,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.speech_threshold_db = finite_or(self.speech_threshold_db, -13.0).clamp(-90.0, 0.0);
        self.silence_floor_db = finite_or(self.silence_floor_db, -22.0).clamp(-100.0, 0.0);
        // A floor above the threshold would make every frame both speech and silence.
        if self.silence_floor_db > self.speech_threshold_db {
            self.silence_floor_db = self.speech_threshold_db;
        }
        self.silence_debounce_frames = self.silence_debounce_frames.clamp(1, 10_000);
        self.scoring_delay_secs = self.scoring_delay_secs.min(3600);

        self.asr_url = normalize_url(&self.asr_url, "http://127.0.0.1:8787/asr");
        self.dialogue_url = normalize_url(&self.dialogue_url, "http://127.0.0.1:8787/dialogue");
        self.scoring_url = normalize_url(&self.scoring_url, "http://127.0.0.1:8787/score");
        self.tts_url = normalize_url(&self.tts_url, "http://127.0.0.1:8787/tts");

        self.api_key = trimmed(self.api_key.as_deref());
        self.preferred_input_device = trimmed(self.preferred_input_device.as_deref());
        let voice = self.default_voice_id.trim();
        self.default_voice_id = if voice.is_empty() {
            "default".into()
        } else {
            voice.to_string()
        };
        self.database_path = self
            .database_path
            .take()
            .filter(|p| !p.as_os_str().is_empty());
    }

    /// Overlay `PARLEY_*` variables read through `lookup`, then re-normalise.
    /// Unparseable numeric values are ignored.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PARLEY_SPEECH_THRESHOLD_DB").and_then(|v| v.trim().parse().ok()) {
            self.speech_threshold_db = v;
        }
        if let Some(v) = lookup("PARLEY_SILENCE_FLOOR_DB").and_then(|v| v.trim().parse().ok()) {
            self.silence_floor_db = v;
        }
        let debounce = lookup("PARLEY_SILENCE_DEBOUNCE_FRAMES").and_then(|v| v.trim().parse().ok());
        if let Some(v) = debounce {
            self.silence_debounce_frames = v;
        }
        if let Some(v) = lookup("PARLEY_SCORING_DELAY_SECS").and_then(|v| v.trim().parse().ok()) {
            self.scoring_delay_secs = v;
        }
        if let Some(v) = lookup("PARLEY_ASR_URL") {
            self.asr_url = v;
        }
        if let Some(v) = lookup("PARLEY_DIALOGUE_URL") {
            self.dialogue_url = v;
        }
        if let Some(v) = lookup("PARLEY_SCORING_URL") {
            self.scoring_url = v;
        }
        if let Some(v) = lookup("PARLEY_TTS_URL") {
            self.tts_url = v;
        }
        if let Some(v) = lookup("PARLEY_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = lookup("PARLEY_VOICE_ID") {
            self.default_voice_id = v;
        }
        if let Some(v) = lookup("PARLEY_INPUT_DEVICE") {
            self.preferred_input_device = Some(v);
        }
        if let Some(v) = lookup("PARLEY_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(v));
        }
        self.normalize();
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    pub fn call_config(&self) -> CallConfig {
        CallConfig {
            speech_threshold_db: self.speech_threshold_db,
            silence_floor_db: self.silence_floor_db,
            silence_debounce_frames: self.silence_debounce_frames,
            scoring_delay: Duration::from_secs(self.scoring_delay_secs),
            constraints: CaptureConstraints {
                preferred_input_device: self.preferred_input_device.clone(),
                ..CaptureConstraints::default()
            },
            ..CallConfig::default()
        }
    }

    pub fn endpoints(&self) -> ServiceEndpoints {
        ServiceEndpoints {
            asr_url: self.asr_url.clone(),
            dialogue_url: self.dialogue_url.clone(),
            scoring_url: self.scoring_url.clone(),
            tts_url: self.tts_url.clone(),
            api_key: self.api_key.clone(),
        }
    }

    /// Copy safe to print: the API key is masked.
    pub fn redacted(&self) -> Self {
        Self {
            api_key: self.api_key.as_ref().map(|_| "***".to_string()),
            ..self.clone()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| data_dir().join("parley.db"))
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

fn trimmed(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn normalize_url(raw: &str, fallback: &str) -> String {
    let url = raw.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        fallback.into()
    }
}

fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Parley")
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
            .join("parley")
    }
}

pub fn default_settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_fills_in_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{ "silenceFloorDb": -30, "apiKey": "  " }"#).unwrap();
        let mut settings = settings;
        settings.normalize();
        assert_eq!(settings.silence_floor_db, -30.0);
        assert_eq!(settings.speech_threshold_db, -13.0);
        assert_eq!(settings.api_key, None);
        assert_eq!(settings.default_voice_id, "default");
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut settings = AppSettings {
            speech_threshold_db: 12.0,
            silence_floor_db: f32::NAN,
            silence_debounce_frames: 0,
            scoring_delay_secs: 99_999,
            asr_url: "ftp://nope".into(),
            tts_url: "https://tts.example.com/v1/".into(),
            default_voice_id: "   ".into(),
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.speech_threshold_db, 0.0);
        assert_eq!(settings.silence_floor_db, -22.0);
        assert_eq!(settings.silence_debounce_frames, 1);
        assert_eq!(settings.scoring_delay_secs, 3600);
        assert_eq!(settings.asr_url, "http://127.0.0.1:8787/asr");
        assert_eq!(settings.tts_url, "https://tts.example.com/v1");
        assert_eq!(settings.default_voice_id, "default");
    }

    #[test]
    fn floor_never_exceeds_threshold() {
        let mut settings = AppSettings {
            speech_threshold_db: -30.0,
            silence_floor_db: -10.0,
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.silence_floor_db, -30.0);
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PARLEY_API_KEY", " sk-test "),
            ("PARLEY_SILENCE_FLOOR_DB", "-35"),
            ("PARLEY_SILENCE_DEBOUNCE_FRAMES", "not a number"),
            ("PARLEY_ASR_URL", "https://asr.example.com"),
        ]);
        let mut settings = AppSettings::default();
        settings.apply_env_with(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.api_key.as_deref(), Some("sk-test"));
        assert_eq!(settings.silence_floor_db, -35.0);
        assert_eq!(settings.silence_debounce_frames, 300);
        assert_eq!(settings.asr_url, "https://asr.example.com");
    }

    #[test]
    fn call_config_carries_vad_and_device_settings() {
        let settings = AppSettings {
            silence_debounce_frames: 120,
            scoring_delay_secs: 5,
            preferred_input_device: Some("USB Headset".into()),
            ..AppSettings::default()
        };
        let config = settings.call_config();
        assert_eq!(config.silence_debounce_frames, 120);
        assert_eq!(config.scoring_delay, Duration::from_secs(5));
        assert_eq!(
            config.constraints.preferred_input_device.as_deref(),
            Some("USB Headset")
        );
        assert!(config.constraints.echo_cancellation);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!(
            "parley-settings-{}-{:08x}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let path = dir.join("settings.json");
        let settings = AppSettings {
            default_voice_id: "voice-9".into(),
            ..AppSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn redacted_masks_only_the_api_key() {
        let settings = AppSettings {
            api_key: Some("sk-live-123".into()),
            default_voice_id: "voice-2".into(),
            ..AppSettings::default()
        };
        let shown = settings.redacted();
        assert_eq!(shown.api_key.as_deref(), Some("***"));
        assert_eq!(shown.default_voice_id, "voice-2");
        assert_eq!(AppSettings::default().redacted().api_key, None);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join("parley-does-not-exist/settings.json");
        assert_eq!(load_settings(&path), AppSettings::default());
    }
}
