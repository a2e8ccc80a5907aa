//! Input device selection
//!
//! Devices are identified by cpal's stable `DeviceId` string, which is
//! what the config persists as the selected microphone UID. Session
//! start prefers the configured device and falls back to the system
//! default when it has been unplugged; the selection outcome says which
//! happened so the caller can surface it.

use std::str::FromStr;

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::DeviceId;
use serde::Serialize;

use crate::error::EngineError;

/// An input device as shown in the microphone picker.
#[derive(Debug, Clone, Serialize)]
pub struct AudioInputDevice {
    /// Stable identifier, persisted across restarts
    pub uid: String,
    /// Human-readable device name
    pub name: String,
    /// Whether this is the system default input
    pub is_default: bool,
}

/// Display name for a device, tolerating backends where the description
/// is unavailable.
pub fn device_name(device: &cpal::Device) -> String {
    match device.description() {
        Ok(description) => description.name().to_string(),
        Err(_) => {
            #[allow(deprecated)]
            device
                .name()
                .unwrap_or_else(|_| "unknown input".to_string())
        }
    }
}

fn stable_uid(device: &cpal::Device) -> Option<String> {
    device.id().ok().map(|id| id.to_string())
}

fn default_input_uid(host: &cpal::Host) -> Option<String> {
    host.default_input_device().as_ref().and_then(stable_uid)
}

/// All input devices, system default first.
///
/// Devices without a stable UID are omitted; they could not be
/// re-selected after a restart anyway.
pub fn list_input_devices() -> Vec<AudioInputDevice> {
    let host = cpal::default_host();
    let default_uid = default_input_uid(&host);

    let Ok(inputs) = host.input_devices() else {
        tracing::warn!(
            "Input device enumeration failed on host {}",
            host.id().name()
        );
        return Vec::new();
    };

    let mut devices: Vec<AudioInputDevice> = inputs
        .filter_map(|device| {
            let uid = stable_uid(&device)?;
            Some(AudioInputDevice {
                name: device_name(&device),
                is_default: default_uid.as_deref() == Some(uid.as_str()),
                uid,
            })
        })
        .collect();

    // Default first; the picker treats it as the implicit choice.
    devices.sort_by_key(|device| !device.is_default);

    tracing::debug!(
        "{} input device(s) on host {}",
        devices.len(),
        host.id().name()
    );
    devices
}

/// Look up a device by its persisted UID.
pub fn resolve_device_uid(uid: &str) -> Option<cpal::Device> {
    let id = DeviceId::from_str(uid).ok()?;
    cpal::default_host().device_by_id(&id)
}

/// Outcome of input selection: the opened device, and whether the
/// configured one had to be abandoned.
pub struct SelectedDevice {
    pub device: cpal::Device,
    pub name: String,
    /// The configured UID no longer resolves; the system default is in
    /// use instead.
    pub fell_back: bool,
}

/// Pick the capture device for a session.
///
/// A configured UID wins while it resolves. Having no input device at
/// all is a transient condition (devices disappear briefly mid-switch)
/// and is classified as such.
pub fn select_input_device(preferred_uid: Option<&str>) -> Result<SelectedDevice, EngineError> {
    if let Some(uid) = preferred_uid {
        if let Some(device) = resolve_device_uid(uid) {
            let name = device_name(&device);
            tracing::info!("Using configured microphone '{}'", name);
            return Ok(SelectedDevice {
                device,
                name,
                fell_back: false,
            });
        }

        let known: Vec<String> = list_input_devices()
            .into_iter()
            .map(|device| device.name)
            .collect();
        tracing::warn!(
            "Configured microphone '{}' is gone (present: {}); using the system default",
            uid,
            known.join(", ")
        );
    }

    let device = cpal::default_host().default_input_device().ok_or_else(|| {
        EngineError::TransientAudioUnavailable("no input devices present".to_string())
    })?;
    let name = device_name(&device);
    Ok(SelectedDevice {
        device,
        name,
        fell_back: preferred_uid.is_some(),
    })
}
