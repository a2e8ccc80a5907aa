//! Audio capture with a replaceable frame tap
//!
//! Opens the selected input device and delivers mono frames plus a scaled
//! RMS level to a single tap callback. The capture layer does not decide
//! what a device change means; it only raises the signal and leaves the
//! restart policy to the session controller.

use super::device::select_input_device;
use super::metering::scaled_level;
use cpal::traits::{DeviceTrait, StreamTrait};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::EngineError;

/// Single frame callback: mono samples plus display level.
pub type FrameTap = Box<dyn FnMut(&[f32], f32) + Send>;

/// Raised when the OS reports that the audio graph changed underneath us.
pub type ConfigChangeSignal = Arc<dyn Fn() + Send + Sync>;

/// Captures audio from one input device and feeds the installed tap.
pub struct AudioCapture {
    stream: Option<cpal::Stream>,
    tap: Arc<Mutex<Option<FrameTap>>>,
    on_config_change: Option<ConfigChangeSignal>,
}

impl Default for AudioCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioCapture {
    pub fn new() -> Self {
        Self {
            stream: None,
            tap: Arc::new(Mutex::new(None)),
            on_config_change: None,
        }
    }

    /// Install the frame callback, replacing any prior tap.
    pub fn set_tap(&self, tap: impl FnMut(&[f32], f32) + Send + 'static) {
        *self.tap.lock() = Some(Box::new(tap));
    }

    /// Install the config-change signal. Fired when the stream errors in
    /// a way that indicates the device went away or changed format.
    pub fn set_config_change_signal(&mut self, signal: ConfigChangeSignal) {
        self.on_config_change = Some(signal);
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    /// Acquire the device and start delivering frames to the tap.
    ///
    /// With a `device_uid` the input binds to that specific device,
    /// otherwise the system default is used.
    pub fn start(&mut self, device_uid: Option<&str>) -> Result<(), EngineError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let selected = select_input_device(device_uid)?;
        if selected.fell_back {
            tracing::warn!("Capturing from fallback device '{}'", selected.name);
        }
        let device = selected.device;
        let device_name = selected.name;

        let supported = device.default_input_config().map_err(|e| {
            EngineError::TransientAudioUnavailable(format!(
                "could not read input format for '{}': {}",
                device_name, e
            ))
        })?;

        // Devices mid-switch can transiently report a nonsense format.
        let sample_rate = supported.sample_rate();
        let channels = supported.channels() as usize;
        if sample_rate == 0 || channels == 0 {
            return Err(EngineError::TransientAudioUnavailable(format!(
                "device '{}' reported {}Hz / {} channels",
                device_name, sample_rate, channels
            )));
        }

        tracing::info!(
            "Starting capture: device='{}', {}Hz, {} channels",
            device_name,
            sample_rate,
            channels
        );

        let tap = self.tap.clone();
        let on_change = self.on_config_change.clone();

        let stream = device
            .build_input_stream(
                &supported.into(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Mix to mono before metering and delivery.
                    let mono: Vec<f32> = data
                        .chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                        .collect();
                    let level = scaled_level(&mono);

                    if let Some(tap) = tap.lock().as_mut() {
                        tap(&mono, level);
                    }
                },
                move |err| {
                    tracing::error!("Audio stream error: {}", err);
                    if let Some(signal) = &on_change {
                        signal();
                    }
                },
                None,
            )
            .map_err(|e| {
                EngineError::TransientAudioUnavailable(format!(
                    "failed to open input stream on '{}': {}",
                    device_name, e
                ))
            })?;

        stream.play().map_err(|e| {
            EngineError::TransientAudioUnavailable(format!(
                "failed to start input stream on '{}': {}",
                device_name, e
            ))
        })?;

        self.stream = Some(stream);
        tracing::info!("Capture started");
        Ok(())
    }

    /// Remove the tap and release the device. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::info!("Capture stopped");
        }
        *self.tap.lock() = None;
    }
}
