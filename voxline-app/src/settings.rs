//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use voxline_core::remote::DEFAULT_CALL_PROMPT;
use voxline_core::{CallConfig, Voice};

const MIN_FRAME_SAMPLES: usize = 256;
const MAX_FRAME_SAMPLES: usize = 16_384;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    /// Voice name as shown to users ("Adam") or as sent upstream ("Charon").
    pub voice: String,
    pub system_prompt: String,
    pub capture_frame_samples: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            preferred_output_device: None,
            voice: Voice::default().api_name().into(),
            system_prompt: DEFAULT_CALL_PROMPT.into(),
            capture_frame_samples: 4_096,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.preferred_input_device = normalize_device(self.preferred_input_device.take());
        self.preferred_output_device = normalize_device(self.preferred_output_device.take());
        self.voice = Voice::from_name(&self.voice)
            .unwrap_or_default()
            .api_name()
            .into();
        if self.system_prompt.trim().is_empty() {
            self.system_prompt = DEFAULT_CALL_PROMPT.into();
        }
        self.capture_frame_samples = self
            .capture_frame_samples
            .clamp(MIN_FRAME_SAMPLES, MAX_FRAME_SAMPLES);
    }

    pub fn voice(&self) -> Voice {
        Voice::from_name(&self.voice).unwrap_or_default()
    }

    pub fn to_call_config(&self) -> CallConfig {
        CallConfig {
            capture_frame_samples: self.capture_frame_samples,
            voice: self.voice(),
            system_prompt: self.system_prompt.clone(),
            ..CallConfig::default()
        }
    }
}

fn normalize_device(raw: Option<String>) -> Option<String> {
    raw.map(|d| d.trim().to_string()).filter(|d| !d.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Voxline")
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
            .join("voxline")
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

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("voxline-settings-{}-{name}", std::process::id()))
            .join("settings.json")
    }

    #[test]
    fn normalize_resolves_display_names_and_blanks() {
        let mut settings = AppSettings {
            preferred_input_device: Some("   ".into()),
            preferred_output_device: Some(" Headphones ".into()),
            voice: "adam".into(),
            system_prompt: "  ".into(),
            capture_frame_samples: 1,
        };
        settings.normalize();

        assert_eq!(settings.preferred_input_device, None);
        assert_eq!(settings.preferred_output_device.as_deref(), Some("Headphones"));
        assert_eq!(settings.voice, "Charon");
        assert_eq!(settings.system_prompt, DEFAULT_CALL_PROMPT);
        assert_eq!(settings.capture_frame_samples, MIN_FRAME_SAMPLES);
    }

    #[test]
    fn unknown_voice_falls_back_to_default() {
        let mut settings = AppSettings {
            voice: "nobody".into(),
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.voice(), Voice::default());
    }

    #[test]
    fn missing_or_corrupt_file_yields_defaults() {
        let path = scratch_path("missing");
        assert_eq!(load_settings(&path), AppSettings::default());

        let corrupt = scratch_path("corrupt");
        fs::create_dir_all(corrupt.parent().unwrap()).unwrap();
        fs::write(&corrupt, "{ not json").unwrap();
        assert_eq!(load_settings(&corrupt), AppSettings::default());
        let _ = fs::remove_dir_all(corrupt.parent().unwrap());
    }

    #[test]
    fn saved_settings_load_back_normalized() {
        let path = scratch_path("save");
        let settings = AppSettings {
            voice: "Kore".into(),
            capture_frame_samples: 2_048,
            ..AppSettings::default()
        };
        save_settings(&path, &settings).unwrap();

        let loaded = load_settings(&path);
        assert_eq!(loaded.voice(), Voice::Kore);
        assert_eq!(loaded.to_call_config().capture_frame_samples, 2_048);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let settings: AppSettings = serde_json::from_str(r#"{"voice":"Kore"}"#).unwrap();
        assert_eq!(settings.capture_frame_samples, 4_096);
        assert_eq!(settings.system_prompt, DEFAULT_CALL_PROMPT);
    }
}
