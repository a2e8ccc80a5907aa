//! Audio subsystem for Telecue
//!
//! Handles input device enumeration, capture with a frame tap, and level
//! metering for the published audio-level history.

pub mod capture;
pub mod device;
pub mod metering;

pub use capture::AudioCapture;
pub use device::{
    device_name, list_input_devices, resolve_device_uid, select_input_device, AudioInputDevice,
    SelectedDevice,
};
pub use metering::{calculate_rms, scaled_level, LevelRing, LEVEL_HISTORY};
