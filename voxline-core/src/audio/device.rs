//! Audio device enumeration and selection.

use serde::{Deserialize, Serialize};

/// Whether a device records or plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Input,
    Output,
}

/// Metadata about one audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub role: DeviceRole,
    /// Whether this is the system default for its role.
    pub is_default: bool,
    /// Input devices that probably record system output. During a call these
    /// would feed the model's own voice back to it.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
    "wave out",
];

const HEADSET_KEYWORDS: &[&str] = &["headset", "headphone", "earbud", "airpods", "buds"];

/// Best-effort check for capture devices that record system output.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Rank an input device for a duplex call. Higher is better.
///
/// Loopback capture is heavily penalised; headsets are preferred since they
/// keep speaker output out of the microphone.
pub fn call_input_score(info: &DeviceInfo) -> i32 {
    let lowered = info.name.to_ascii_lowercase();
    let mut score = if info.is_loopback_like { -20 } else { 10 };
    if HEADSET_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        score += 5;
    }
    if info.is_default {
        score += 2;
    }
    score
}

/// Pick the best input device name for a call, if any device is usable.
pub fn recommended_input(devices: &[DeviceInfo]) -> Option<&DeviceInfo> {
    devices
        .iter()
        .filter(|d| d.role == DeviceRole::Input && !d.is_loopback_like)
        .max_by_key(|d| call_input_score(d))
}

#[cfg(feature = "audio-cpal")]
fn describe<I>(devices: I, default_name: Option<String>, role: DeviceRole) -> Vec<DeviceInfo>
where
    I: Iterator<Item = cpal::Device>,
{
    use cpal::traits::DeviceTrait;

    devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Device {}", idx + 1));
            DeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                is_loopback_like: role == DeviceRole::Input && is_loopback_like_name(&name),
                name,
                role,
            }
        })
        .collect()
}

/// List every input and output device on the default host.
///
/// Enumeration failures are logged and yield an empty list for that role.
#[cfg(feature = "audio-cpal")]
pub fn list_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let mut out = Vec::new();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    match host.input_devices() {
        Ok(devices) => out.extend(describe(devices, default_input, DeviceRole::Input)),
        Err(e) => tracing::warn!("failed to enumerate input devices: {e}"),
    }

    let default_output = host.default_output_device().and_then(|d| d.name().ok());
    match host.output_devices() {
        Ok(devices) => out.extend(describe(devices, default_output, DeviceRole::Output)),
        Err(e) => tracing::warn!("failed to enumerate output devices: {e}"),
    }

    out
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_devices() -> Vec<DeviceInfo> {
    vec![]
}

/// Resolve a device by preferred name, falling back to the host default and
/// then to the first device of that role.
#[cfg(feature = "audio-cpal")]
pub(crate) fn select_device(
    host: &cpal::Host,
    role: DeviceRole,
    preferred: Option<&str>,
) -> crate::error::Result<cpal::Device> {
    use crate::error::VoxlineError;
    use cpal::traits::{DeviceTrait, HostTrait};

    let enumerate = || -> std::result::Result<Vec<cpal::Device>, cpal::DevicesError> {
        Ok(match role {
            DeviceRole::Input => host.input_devices()?.collect(),
            DeviceRole::Output => host.output_devices()?.collect(),
        })
    };

    if let Some(wanted) = preferred {
        match enumerate() {
            Ok(devices) => {
                if let Some(found) = devices
                    .into_iter()
                    .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                {
                    return Ok(found);
                }
                tracing::warn!(?role, "preferred device '{wanted}' not found, falling back");
            }
            Err(e) => tracing::warn!(?role, "failed to list devices while resolving preference: {e}"),
        }
    }

    let default = match role {
        DeviceRole::Input => host.default_input_device(),
        DeviceRole::Output => host.default_output_device(),
    };
    if let Some(device) = default {
        return Ok(device);
    }

    let missing = match role {
        DeviceRole::Input => VoxlineError::NoDefaultInputDevice,
        DeviceRole::Output => VoxlineError::NoDefaultOutputDevice,
    };
    let devices = enumerate().map_err(|e| VoxlineError::AudioDevice(e.to_string()))?;
    let first = devices.into_iter().next().ok_or(missing)?;
    tracing::warn!(?role, "no default device, falling back to first available");
    Ok(first)
}
