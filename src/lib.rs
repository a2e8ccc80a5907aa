//! Telecue - real-time speech-tracking engine for teleprompting
//!
//! Given a fixed script and a live stream of partial, noisy
//! speech-to-text hypotheses, the engine maintains an advancing read
//! cursor modelling where the speaker currently is. It owns the audio
//! capture, drives either the platform recogniser or an external
//! streaming ASR subprocess, and runs an anti-jump fuzzy matcher that
//! resists hallucinated tokens and repeated passages while still
//! allowing deliberate skip-ahead jumps.
//!
//! The visual overlay, window management and settings UI live in the
//! embedding application; this crate publishes a small observable
//! snapshot and consumes a handful of platform hooks.

pub mod audio;
pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod matcher;
pub mod platform;
pub mod script;
pub mod session;

pub use backend::BackendKind;
pub use error::EngineError;
pub use matcher::MatchEngine;
pub use script::ScriptPage;
pub use session::{EngineSnapshot, SessionController, SessionState};
