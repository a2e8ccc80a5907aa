//! Session controller integration tests for Telecue.
//!
//! Drives the controller end to end with a scripted fake backend: the
//! test installs the backend's event sender, plays transcripts into the
//! engine, and observes published snapshots.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use telecue::backend::{BackendEvent, BackendKind, TranscriptionBackend};
use telecue::config::{Config, PagingConfig, SpeechEngineMode};
use telecue::session::{BackendFactory, EngineSnapshot, SessionState};
use telecue::SessionController;

/// Shared control surface for the fake backend: the test sends events
/// through whatever sender/generation the controller handed out last.
#[derive(Default)]
struct FakeBackendHandle {
    wiring: Mutex<Option<(Sender<BackendEvent>, u64)>>,
    starts: AtomicU32,
}

impl FakeBackendHandle {
    fn install(&self, sender: Sender<BackendEvent>, generation: u64) {
        *self.wiring.lock() = Some((sender, generation));
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn generation(&self) -> u64 {
        self.wiring.lock().as_ref().expect("backend not started").1
    }

    fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    fn send_transcript(&self, text: &str) {
        let guard = self.wiring.lock();
        let (sender, generation) = guard.as_ref().expect("backend not started");
        sender
            .send(BackendEvent::Transcript {
                generation: *generation,
                text: text.to_string(),
            })
            .unwrap();
    }

    fn send_transcript_with_generation(&self, generation: u64, text: &str) {
        let guard = self.wiring.lock();
        let (sender, _) = guard.as_ref().expect("backend not started");
        sender
            .send(BackendEvent::Transcript {
                generation,
                text: text.to_string(),
            })
            .unwrap();
    }

    fn send_runtime_error(&self, message: &str) {
        let guard = self.wiring.lock();
        let (sender, generation) = guard.as_ref().expect("backend not started");
        sender
            .send(BackendEvent::RuntimeError {
                generation: *generation,
                message: message.to_string(),
            })
            .unwrap();
    }
}

struct FakeBackend;

impl TranscriptionBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Segment
    }

    fn start(&mut self) -> Result<(), telecue::EngineError> {
        Ok(())
    }

    fn shutdown(&mut self) {}
}

fn test_config() -> Config {
    let mut config = Config::default();
    // Segment-style backend; the fake stands in for the subprocess.
    config.speech.engine_mode = SpeechEngineMode::ExternalStream;
    config.paging = PagingConfig {
        auto_next_page: true,
        auto_next_page_delay: 0,
    };
    config
}

fn controller_with_fake(config: Config) -> (SessionController, Arc<FakeBackendHandle>) {
    let handle = Arc::new(FakeBackendHandle::default());
    let factory_handle = handle.clone();
    let factory: BackendFactory = Box::new(move |_config, _hint, events, generation| {
        factory_handle.install(events, generation);
        Ok(Box::new(FakeBackend))
    });

    let controller = SessionController::builder(config)
        .backend_factory(factory)
        .build();
    (controller, handle)
}

/// Wait until a published snapshot satisfies the predicate.
fn wait_for(
    updates: &Receiver<EngineSnapshot>,
    what: &str,
    predicate: impl Fn(&EngineSnapshot) -> bool,
) -> EngineSnapshot {
    let deadline = Instant::now() + Duration::from_secs(5);
    while let Ok(snapshot) = updates.recv_deadline(deadline) {
        if predicate(&snapshot) {
            return snapshot;
        }
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn test_session_tracks_a_clean_read_to_completion() {
    let (controller, backend) = controller_with_fake(test_config());
    let updates = controller.subscribe();

    controller
        .start(vec!["Hello world from the teleprompter.".to_string()])
        .unwrap();
    wait_for(&updates, "running", |s| s.state == SessionState::Running);

    backend.send_transcript("hello");
    let snapshot = wait_for(&updates, "first advance", |s| s.recognized_char_count == 5);
    assert_eq!(snapshot.last_spoken_text, "hello");
    assert!(snapshot.is_listening);

    backend.send_transcript("world from");
    wait_for(&updates, "second advance", |s| s.recognized_char_count == 16);

    backend.send_transcript("the teleprompter");
    let done = wait_for(&updates, "completion", |s| s.state == SessionState::Completed);
    assert_eq!(done.recognized_char_count, 34);
    assert!(done.should_dismiss);
    assert!(!done.is_listening);
}

#[test]
fn test_stop_then_start_returns_to_initial_tracking_state() {
    let (controller, backend) = controller_with_fake(test_config());
    let updates = controller.subscribe();

    controller.start(vec!["one two three four five".to_string()]).unwrap();
    wait_for(&updates, "running", |s| s.state == SessionState::Running);
    let first_generation = backend.generation();

    backend.send_transcript("one two");
    wait_for(&updates, "advance", |s| s.recognized_char_count == 7);

    controller.stop();
    let stopped = wait_for(&updates, "idle", |s| s.state == SessionState::Idle);
    assert_eq!(stopped.recognized_char_count, 0);
    assert!(stopped.error.is_none());

    controller.start(vec!["one two three four five".to_string()]).unwrap();
    let restarted = wait_for(&updates, "running again", |s| s.state == SessionState::Running);
    assert_eq!(restarted.recognized_char_count, 0);
    assert!(restarted.generation > first_generation);
}

#[test]
fn test_stale_generation_transcripts_never_mutate_state() {
    let (controller, backend) = controller_with_fake(test_config());
    let updates = controller.subscribe();

    controller.start(vec!["alpha bravo charlie".to_string()]).unwrap();
    wait_for(&updates, "running", |s| s.state == SessionState::Running);

    // A transcript from a long-dead generation would complete the page
    // if it were processed.
    let stale_generation = backend.generation() + 999;
    backend.send_transcript_with_generation(stale_generation, "alpha bravo charlie");
    backend.send_transcript("alpha");

    let snapshot = wait_for(&updates, "valid transcript", |s| s.last_spoken_text == "alpha");
    assert_eq!(snapshot.recognized_char_count, 5);
    assert_eq!(snapshot.state, SessionState::Running);
}

#[test]
fn test_backend_error_triggers_coalesced_restart() {
    let (controller, backend) = controller_with_fake(test_config());
    let updates = controller.subscribe();

    controller.start(vec!["alpha bravo charlie delta".to_string()]).unwrap();
    wait_for(&updates, "running", |s| s.state == SessionState::Running);
    let generation_before = backend.generation();
    assert_eq!(backend.starts(), 1);

    // Two failures in quick succession coalesce into one pending restart.
    backend.send_runtime_error("dyld: library not loaded");
    backend.send_runtime_error("dyld: library not loaded");
    wait_for(&updates, "retrying", |s| s.state == SessionState::Retrying);

    let recovered = wait_for(&updates, "recovered", |s| {
        s.state == SessionState::Running && s.generation > generation_before
    });
    assert!(recovered.error.is_none());
    assert_eq!(backend.starts(), 2);

    // The relaunched backend keeps tracking from the preserved cursor.
    backend.send_transcript("alpha bravo");
    wait_for(&updates, "post-restart advance", |s| s.recognized_char_count == 11);
}

#[test]
fn test_device_hot_swap_preserves_cursor_and_bumps_generation() {
    let (controller, backend) = controller_with_fake(test_config());
    let updates = controller.subscribe();

    controller
        .start(vec!["alpha bravo charlie delta echo foxtrot".to_string()])
        .unwrap();
    wait_for(&updates, "running", |s| s.state == SessionState::Running);

    backend.send_transcript("alpha");
    backend.send_transcript("bravo");
    backend.send_transcript("charlie");
    let before = wait_for(&updates, "three advances", |s| s.recognized_char_count == 19);

    controller.notify_audio_config_change();
    let rebuilt = wait_for(&updates, "rebuilt", |s| {
        s.state == SessionState::Running && s.generation > before.generation
    });
    assert_eq!(rebuilt.recognized_char_count, 19, "cursor must survive the swap");
    assert_eq!(backend.starts(), 2, "exactly one coalesced restart");

    backend.send_transcript("delta");
    wait_for(&updates, "post-swap advance", |s| s.recognized_char_count == 25);
}

#[test]
fn test_jump_restarts_recognition_under_a_new_generation() {
    let (controller, backend) = controller_with_fake(test_config());
    let updates = controller.subscribe();

    controller
        .start(vec!["alpha bravo charlie delta echo".to_string()])
        .unwrap();
    wait_for(&updates, "running", |s| s.state == SessionState::Running);
    let generation_before = backend.generation();

    controller.jump_to(12);
    let jumped = wait_for(&updates, "jump", |s| s.recognized_char_count == 12);
    assert!(jumped.generation > generation_before);
    assert_eq!(backend.starts(), 2);

    // Jumping to the same offset again is a no-op for the cursor.
    controller.jump_to(12);
    let again = wait_for(&updates, "second jump", |s| s.generation > jumped.generation);
    assert_eq!(again.recognized_char_count, 12);
}

#[test]
fn test_pages_advance_on_completion() {
    let (controller, backend) = controller_with_fake(test_config());
    let updates = controller.subscribe();

    controller
        .start(vec!["first page".to_string(), "second page".to_string()])
        .unwrap();
    wait_for(&updates, "running", |s| s.state == SessionState::Running);

    backend.send_transcript("first page");
    let advanced = wait_for(&updates, "page advance", |s| s.page_index == 1);
    assert!(advanced.should_advance_page);
    assert_eq!(advanced.recognized_char_count, 0);

    backend.send_transcript("second page");
    let done = wait_for(&updates, "completion", |s| s.state == SessionState::Completed);
    assert!(done.should_dismiss);
    assert_eq!(done.page_index, 1);
}

#[test]
fn test_force_stop_clears_script_and_blocks_resume() {
    let (controller, backend) = controller_with_fake(test_config());
    let updates = controller.subscribe();

    controller.start(vec!["alpha bravo charlie".to_string()]).unwrap();
    wait_for(&updates, "running", |s| s.state == SessionState::Running);
    backend.send_transcript("alpha");
    wait_for(&updates, "advance", |s| s.recognized_char_count == 5);

    controller.force_stop();
    wait_for(&updates, "idle", |s| s.state == SessionState::Idle);

    // With the script cleared, resume has nothing to re-enter.
    controller.resume();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(controller.snapshot().state, SessionState::Idle);
    assert_eq!(controller.snapshot().recognized_char_count, 0);
}

#[test]
fn test_empty_script_is_rejected_up_front() {
    let (controller, _backend) = controller_with_fake(test_config());

    assert!(controller.start(vec![]).is_err());
    assert!(controller.start(vec!["   ".to_string()]).is_err());
    assert_eq!(controller.snapshot().state, SessionState::Idle);
}
