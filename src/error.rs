//! Engine error types
//!
//! Components return these to the session controller, which decides
//! whether to retry with backoff or surface the error to subscribers.
//! Only user-actionable conditions ever reach the published snapshot.

use thiserror::Error;

/// Errors produced by the tracking engine and its components.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Microphone or speech-recognition permission was denied by the user.
    /// The message carries a deep link to the relevant OS privacy pane.
    #[error("{capability} permission denied. Enable it in {deep_link}")]
    PermissionDenied {
        capability: &'static str,
        deep_link: &'static str,
    },

    /// The input device reported an unusable format (zero sample rate or
    /// channel count). Observed transiently during device switches.
    #[error("audio input temporarily unavailable: {0}")]
    TransientAudioUnavailable(String),

    /// The external transcription binary could not be launched.
    #[error("failed to launch transcription backend at {path}: {reason}")]
    BackendSpawnFailed { path: String, reason: String },

    /// The backend reported a runtime failure on stderr.
    #[error("transcription backend error: {0}")]
    BackendRuntimeError(String),

    /// The external subprocess terminated unexpectedly.
    #[error("transcription backend exited (code {code:?})")]
    BackendExited { code: Option<i32> },

    /// Configuration names a missing executable or model.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// No platform speech recognizer is available for any usable locale.
    #[error("speech recognizer unavailable: {0}")]
    RecognizerUnavailable(String),
}

impl EngineError {
    /// Whether the session controller should retry with backoff rather
    /// than surface the error immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::TransientAudioUnavailable(_)
                | EngineError::BackendRuntimeError(_)
                | EngineError::BackendExited { .. }
        )
    }
}
