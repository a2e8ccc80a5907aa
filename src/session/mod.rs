//! Session lifecycle and published state
//!
//! The controller owns every component of a tracking session and is the
//! single writer of the observable snapshot.

pub mod controller;
pub mod snapshot;
pub mod state;

pub use controller::{BackendFactory, EngineBuilder, RecognizerFactory, SessionController};
pub use snapshot::{EngineSnapshot, SnapshotPublisher};
pub use state::SessionState;
