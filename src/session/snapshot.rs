//! Published engine state
//!
//! A small snapshot record whose mutations fan out to UI subscribers.
//! Only the session controller's event loop ever writes it; subscribers
//! receive clones over channels and can also read the latest state
//! directly.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::state::SessionState;
use crate::audio::metering::LEVEL_HISTORY;

/// Observable engine state consumed by the UI layer.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    /// Session lifecycle state
    pub state: SessionState,
    /// Current session generation
    pub generation: u64,
    /// Index of the active page
    pub page_index: usize,
    /// Confirmed prefix length into the active page, in chars
    pub recognized_char_count: usize,
    /// Whether the engine is actively tracking speech
    pub is_listening: bool,
    /// Surfaced error, user-actionable conditions only
    pub error: Option<String>,
    /// Recent audio levels, most-recent-last
    pub audio_levels: [f32; LEVEL_HISTORY],
    /// The most recent hypothesis delivered to the matcher
    pub last_spoken_text: String,
    /// Whether recent levels indicate the speaker is talking
    pub is_speaking: bool,
    /// Edge trigger: the script has been fully read
    pub should_dismiss: bool,
    /// Edge trigger: the active page completed and should advance
    pub should_advance_page: bool,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            generation: 0,
            page_index: 0,
            recognized_char_count: 0,
            is_listening: false,
            error: None,
            audio_levels: [0.0; LEVEL_HISTORY],
            last_spoken_text: String::new(),
            is_speaking: false,
            should_dismiss: false,
            should_advance_page: false,
        }
    }
}

/// Single-writer publisher with channel fan-out to subscribers.
#[derive(Default)]
pub struct SnapshotPublisher {
    current: RwLock<EngineSnapshot>,
    subscribers: Mutex<Vec<Sender<EngineSnapshot>>>,
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest published snapshot.
    pub fn current(&self) -> EngineSnapshot {
        self.current.read().clone()
    }

    /// Register a subscriber. Each published snapshot is delivered to
    /// every live subscriber; dropped receivers are pruned lazily.
    pub fn subscribe(&self) -> Receiver<EngineSnapshot> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Replace the snapshot and fan it out. Must only be called from the
    /// controller's event loop.
    pub fn publish(&self, snapshot: EngineSnapshot) {
        *self.current.write() = snapshot.clone();

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}
