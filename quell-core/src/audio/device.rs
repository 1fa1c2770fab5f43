//! Input device discovery.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDevice {
    pub name: String,
    pub is_default: bool,
    /// Name suggests the device records system output rather than a microphone.
    pub is_loopback: bool,
}

const LOOPBACK_MARKERS: &[&str] = &[
    "stereo mix",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
    "wave out",
    "virtual output",
];

/// True for devices that capture system output instead of a microphone.
pub fn is_loopback_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_MARKERS.iter().any(|m| lowered.contains(m))
}

#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<InputDevice> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                InputDevice {
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    is_loopback: is_loopback_name(&name),
                    name,
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to enumerate input devices");
            Vec::new()
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<InputDevice> {
    Vec::new()
}
