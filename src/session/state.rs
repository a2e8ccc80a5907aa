//! Session lifecycle states

use serde::{Deserialize, Serialize};

/// Lifecycle of a tracking session.
///
/// `Idle → Authorizing → Running → (Retrying | Paused) → Idle`, with
/// `Completed` reached at end of script. Terminal transitions are
/// triggered by stop, exhausted retries, or end of script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session; ready to start
    #[default]
    Idle,
    /// Waiting on microphone / speech-recognition authorization
    Authorizing,
    /// Tracking speech against the active page
    Running,
    /// Backend failed; a coalesced restart is pending
    Retrying,
    /// Retries exhausted or fatal error; waiting for the user
    Paused,
    /// The whole script has been read
    Completed,
}

impl SessionState {
    /// Returns a human-readable description of the state
    pub fn description(&self) -> &'static str {
        match self {
            SessionState::Idle => "Ready",
            SessionState::Authorizing => "Requesting permissions",
            SessionState::Running => "Tracking speech",
            SessionState::Retrying => "Recovering from a backend error",
            SessionState::Paused => "Paused on error",
            SessionState::Completed => "Script complete",
        }
    }

    /// Whether a session currently owns the audio device and backend
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Authorizing | SessionState::Running | SessionState::Retrying
        )
    }
}
