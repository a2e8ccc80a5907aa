//! Transcription backends
//!
//! Two variants of the same capability set: the OS-provided streaming
//! recogniser (cumulative hypotheses) and an external streaming ASR
//! subprocess (segment hypotheses). The session controller owns whichever
//! variant is configured and receives its output as tagged events.

pub mod platform;
pub mod stream;

use crossbeam_channel::Sender;

use crate::error::EngineError;

/// How a backend's hypotheses relate to the session audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Each update covers all audio since the session started.
    Cumulative,
    /// Each update covers only the latest speech slice.
    Segment,
}

/// Output of a running backend, tagged with the session generation that
/// started it so stale callbacks can be discarded.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// A transcription hypothesis.
    Transcript { generation: u64, text: String },
    /// A runtime failure reported by the backend.
    RuntimeError { generation: u64, message: String },
    /// The backend terminated on its own.
    Exited { generation: u64, code: Option<i32> },
}

/// A running transcription backend.
///
/// Backends deliver output through the event sender they were built
/// with; `shutdown` must be safe to call more than once and must
/// suppress the exit event for intentional termination.
pub trait TranscriptionBackend: Send {
    fn kind(&self) -> BackendKind;

    fn start(&mut self) -> Result<(), EngineError>;

    /// Where to send captured audio frames, for backends that consume
    /// them. The external subprocess captures its own audio and returns
    /// `None`.
    fn audio_sink(&self) -> Option<Sender<Vec<f32>>> {
        None
    }

    fn shutdown(&mut self);
}
