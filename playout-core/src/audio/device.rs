//! Output device enumeration.

use serde::{Deserialize, Serialize};

/// Metadata about an audio output device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default output device.
    pub is_default: bool,
    /// Heuristic flag for null sinks and virtual cables.
    pub is_virtual: bool,
}

const VIRTUAL_KEYWORDS: &[&str] = &[
    "null",
    "dummy",
    "virtual",
    "cable input",
    "loopback",
    "blackhole",
    "soundflower",
];

/// Best-effort heuristic for sinks that swallow audio instead of playing it.
pub fn is_virtual_sink_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    VIRTUAL_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Default device first, virtual sinks last, then alphabetical.
pub fn sort_devices(list: &mut [DeviceInfo]) {
    list.sort_by_key(|d| (!d.is_default, d.is_virtual, d.name.to_ascii_lowercase()));
}

/// List all available audio output devices on the system.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    match host.output_devices() {
        Ok(devices) => {
            let mut list = devices
                .enumerate()
                .map(|(idx, device)| {
                    let name = device
                        .name()
                        .unwrap_or_else(|_| format!("Output Device {}", idx + 1));
                    DeviceInfo {
                        is_default: default_name.as_deref() == Some(name.as_str()),
                        is_virtual: is_virtual_sink_name(&name),
                        name,
                    }
                })
                .collect::<Vec<_>>();
            sort_devices(&mut list);
            list
        }
        Err(e) => {
            tracing::warn!("failed to enumerate output devices: {e}");
            host.default_output_device()
                .map(|default| {
                    let name = default
                        .name()
                        .unwrap_or_else(|_| "Default Output Device".to_string());
                    vec![DeviceInfo {
                        is_virtual: is_virtual_sink_name(&name),
                        name,
                        is_default: true,
                    }]
                })
                .unwrap_or_default()
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_virtual_sinks() {
        assert!(is_virtual_sink_name("Null Output"));
        assert!(is_virtual_sink_name("CABLE Input (VB-Audio Virtual Cable)"));
        assert!(is_virtual_sink_name("BlackHole 2ch"));
        assert!(!is_virtual_sink_name("Speakers (Realtek Audio)"));
    }

    #[test]
    fn default_device_sorts_first_and_virtual_last() {
        let info = |name: &str, is_default| DeviceInfo {
            name: name.into(),
            is_default,
            is_virtual: is_virtual_sink_name(name),
        };
        let mut list = vec![
            info("Null Output", false),
            info("USB DAC", false),
            info("Headphones", true),
            info("Analog Out", false),
        ];
        sort_devices(&mut list);
        let names: Vec<&str> = list.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["Headphones", "Analog Out", "USB DAC", "Null Output"]);
    }

    #[test]
    fn listing_is_already_sorted() {
        // Works with or without hardware; an empty list is fine.
        let list = list_output_devices();
        let mut sorted = list.clone();
        sort_devices(&mut sorted);
        assert_eq!(list, sorted);
    }
}
