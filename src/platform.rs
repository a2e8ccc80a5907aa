//! Platform integration hooks
//!
//! Authorization prompts and privacy-pane deep links are provided by the
//! embedding layer; the engine only defines the interface it consumes.

use serde::{Deserialize, Serialize};

/// Result of an authorization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    Granted,
    Denied,
    Undetermined,
}

/// Which privacy pane a denied permission points the user at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivacyPane {
    Microphone,
    SpeechRecognition,
}

impl PrivacyPane {
    /// Deep link opening the relevant system privacy settings.
    pub fn deep_link(self) -> &'static str {
        match self {
            PrivacyPane::Microphone => {
                "x-apple.systempreferences:com.apple.preference.security?Privacy_Microphone"
            }
            PrivacyPane::SpeechRecognition => {
                "x-apple.systempreferences:com.apple.preference.security?Privacy_SpeechRecognition"
            }
        }
    }
}

/// Services the host application provides to the engine.
pub trait PlatformHooks: Send + Sync {
    fn request_microphone_authorization(&self) -> AuthorizationStatus;
    fn request_speech_recognition_authorization(&self) -> AuthorizationStatus;
    fn open_system_privacy_pane(&self, pane: PrivacyPane);
}

/// Hooks that grant everything; used by the CLI driver and tests, and a
/// reasonable default on platforms without permission prompts.
pub struct GrantAllHooks;

impl PlatformHooks for GrantAllHooks {
    fn request_microphone_authorization(&self) -> AuthorizationStatus {
        AuthorizationStatus::Granted
    }

    fn request_speech_recognition_authorization(&self) -> AuthorizationStatus {
        AuthorizationStatus::Granted
    }

    fn open_system_privacy_pane(&self, pane: PrivacyPane) {
        tracing::info!("Privacy pane requested: {}", pane.deep_link());
    }
}
