//! Session controller
//!
//! Single owner of the session lifecycle: starts and stops the audio
//! capture and transcription backend, applies the retry policy, tags
//! every callback with a generation so stale ones are discarded, and is
//! the only writer of the published snapshot. All mutation happens on one
//! event-loop thread; audio callbacks and backend readers only post
//! events to it.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::snapshot::{EngineSnapshot, SnapshotPublisher};
use super::state::SessionState;
use crate::audio::{AudioCapture, LevelRing};
use crate::backend::platform::{PlatformBackend, SpeechRecognizer};
use crate::backend::stream::StreamBackend;
use crate::backend::{BackendEvent, BackendKind, TranscriptionBackend};
use crate::config::{Config, ListeningMode, SpeechEngineMode};
use crate::error::EngineError;
use crate::matcher::MatchEngine;
use crate::platform::{AuthorizationStatus, GrantAllHooks, PlatformHooks, PrivacyPane};
use crate::script::{dominant_cjk_hint, CjkHint, ScriptPage};

/// Maximum backend restarts before the session pauses with an error.
const MAX_RETRIES: u32 = 10;
/// Per-retry backoff step.
const RESTART_STEP: Duration = Duration::from_millis(500);
/// Backoff ceiling.
const RESTART_MAX: Duration = Duration::from_millis(1500);
/// How long the controller ignores config-change signals after it
/// reassigns the input device itself.
const CONFIG_CHANGE_SUPPRESSION: Duration = Duration::from_secs(1);

/// Creates the transcription backend for a session generation.
pub type BackendFactory = Box<
    dyn Fn(
            &Config,
            Option<CjkHint>,
            Sender<BackendEvent>,
            u64,
        ) -> Result<Box<dyn TranscriptionBackend>, EngineError>
        + Send,
>;

/// Creates a platform recogniser handle per session.
pub type RecognizerFactory = Box<dyn Fn() -> Box<dyn SpeechRecognizer> + Send>;

/// Requests posted to the controller's event loop.
enum Command {
    Start { pages: Vec<String> },
    Stop { force: bool },
    Resume,
    JumpTo { offset: usize },
    Shutdown,
}

/// Everything the event loop reacts to.
enum EngineEvent {
    Command(Command),
    AudioLevel { generation: u64, level: f32 },
    AudioConfigChanged { generation: u64 },
}

/// Builder for [`SessionController`].
pub struct EngineBuilder {
    config: Config,
    hooks: Arc<dyn PlatformHooks>,
    recognizer_factory: Option<RecognizerFactory>,
    backend_factory: Option<BackendFactory>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            hooks: Arc::new(GrantAllHooks),
            recognizer_factory: None,
            backend_factory: None,
        }
    }

    /// Authorization and privacy-pane services from the host app.
    pub fn hooks(mut self, hooks: Arc<dyn PlatformHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Platform recogniser used when the engine mode is `platform`.
    pub fn recognizer(mut self, factory: RecognizerFactory) -> Self {
        self.recognizer_factory = Some(factory);
        self
    }

    /// Replace backend construction wholesale (used by tests).
    pub fn backend_factory(mut self, factory: BackendFactory) -> Self {
        self.backend_factory = Some(factory);
        self
    }

    pub fn build(self) -> SessionController {
        let factory = self
            .backend_factory
            .unwrap_or_else(|| default_backend_factory(self.recognizer_factory));
        SessionController::spawn(self.config, self.hooks, factory)
    }
}

fn default_backend_factory(recognizer_factory: Option<RecognizerFactory>) -> BackendFactory {
    Box::new(move |config, hint, events, generation| match config.speech.engine_mode {
        SpeechEngineMode::ExternalStream => Ok(Box::new(StreamBackend::new(
            config.external.clone(),
            events,
            generation,
        ))),
        SpeechEngineMode::Platform => {
            let factory = recognizer_factory.as_ref().ok_or_else(|| {
                EngineError::RecognizerUnavailable(
                    "no platform recogniser registered".to_string(),
                )
            })?;
            Ok(Box::new(PlatformBackend::new(
                factory(),
                config.speech.locale.clone(),
                hint,
                events,
                generation,
            )))
        }
    })
}

/// Handle to a running session controller.
///
/// Cheap to share; all methods post to the event loop. Dropping the
/// handle stops the session and joins the loop thread.
pub struct SessionController {
    events: Sender<EngineEvent>,
    publisher: Arc<SnapshotPublisher>,
    worker: Option<JoinHandle<()>>,
}

impl SessionController {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    fn spawn(config: Config, hooks: Arc<dyn PlatformHooks>, factory: BackendFactory) -> Self {
        let (events_tx, events_rx) = unbounded();
        let (backend_tx, backend_rx) = unbounded();
        let publisher = Arc::new(SnapshotPublisher::new());

        let inner = Inner {
            config,
            hooks,
            backend_factory: factory,
            events_tx: events_tx.clone(),
            backend_tx,
            publisher: publisher.clone(),
            state: SessionState::Idle,
            generation: 0,
            retry_count: 0,
            pages: Vec::new(),
            page_index: 0,
            matcher: None,
            audio: None,
            backend: None,
            levels: LevelRing::new(),
            last_spoken: String::new(),
            error: None,
            pending_restart: None,
            advance_due: None,
            suppress_config_change_until: None,
            should_dismiss: false,
            should_advance_page: false,
        };

        let worker = std::thread::Builder::new()
            .name("telecue-session".to_string())
            .spawn(move || run_loop(inner, events_rx, backend_rx))
            .expect("failed to spawn session thread");

        Self {
            events: events_tx,
            publisher,
            worker: Some(worker),
        }
    }

    /// Begin tracking a script. Pages advance on completion; the cursor
    /// starts at zero on the first page.
    pub fn start(&self, pages: Vec<String>) -> Result<(), EngineError> {
        if pages.is_empty() || pages[0].trim().is_empty() {
            return Err(EngineError::InvalidConfiguration(
                "cannot start a session with an empty script".to_string(),
            ));
        }
        let _ = self.events.send(EngineEvent::Command(Command::Start { pages }));
        Ok(())
    }

    /// End the session, cancelling pending restarts and releasing the
    /// device and backend. Idempotent.
    pub fn stop(&self) {
        let _ = self
            .events
            .send(EngineEvent::Command(Command::Stop { force: false }));
    }

    /// Like [`SessionController::stop`], but also clears the script and
    /// inhibits any further auto-recovery.
    pub fn force_stop(&self) {
        let _ = self
            .events
            .send(EngineEvent::Command(Command::Stop { force: true }));
    }

    /// Re-enter tracking at the current cursor after a pause.
    pub fn resume(&self) {
        let _ = self.events.send(EngineEvent::Command(Command::Resume));
    }

    /// User jump to a character offset in the active page.
    pub fn jump_to(&self, offset: usize) {
        let _ = self
            .events
            .send(EngineEvent::Command(Command::JumpTo { offset }));
    }

    /// Tell the engine the audio graph changed (device monitors living
    /// outside the capture layer call this).
    pub fn notify_audio_config_change(&self) {
        let generation = self.publisher.current().generation;
        let _ = self
            .events
            .send(EngineEvent::AudioConfigChanged { generation });
    }

    /// Latest published state.
    pub fn snapshot(&self) -> EngineSnapshot {
        self.publisher.current()
    }

    /// Subscribe to every published state change.
    pub fn subscribe(&self) -> Receiver<EngineSnapshot> {
        self.publisher.subscribe()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let _ = self.events.send(EngineEvent::Command(Command::Shutdown));
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct Inner {
    config: Config,
    hooks: Arc<dyn PlatformHooks>,
    backend_factory: BackendFactory,
    events_tx: Sender<EngineEvent>,
    backend_tx: Sender<BackendEvent>,
    publisher: Arc<SnapshotPublisher>,

    state: SessionState,
    generation: u64,
    retry_count: u32,
    pages: Vec<String>,
    page_index: usize,
    matcher: Option<MatchEngine>,
    audio: Option<AudioCapture>,
    backend: Option<Box<dyn TranscriptionBackend>>,
    levels: LevelRing,
    last_spoken: String,
    error: Option<String>,

    pending_restart: Option<Instant>,
    advance_due: Option<Instant>,
    suppress_config_change_until: Option<Instant>,
    should_dismiss: bool,
    should_advance_page: bool,
}

fn run_loop(mut inner: Inner, events: Receiver<EngineEvent>, backend: Receiver<BackendEvent>) {
    loop {
        let timeout = inner
            .next_deadline()
            .map(|due| due.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_secs(3600));

        crossbeam_channel::select! {
            recv(events) -> msg => match msg {
                Ok(EngineEvent::Command(Command::Shutdown)) | Err(_) => {
                    inner.stop_session();
                    break;
                }
                Ok(event) => inner.handle_event(event),
            },
            recv(backend) -> msg => {
                if let Ok(event) = msg {
                    inner.handle_backend_event(event);
                }
            }
            default(timeout) => inner.handle_timers(),
        }
    }
}

impl Inner {
    fn next_deadline(&self) -> Option<Instant> {
        match (self.pending_restart, self.advance_due) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Command(command) => self.handle_command(command),
            EngineEvent::AudioLevel { generation, level } => {
                if generation == self.generation && self.state.is_active() {
                    self.levels.push(level);
                    self.publish();
                }
            }
            EngineEvent::AudioConfigChanged { generation } => {
                self.handle_config_changed(generation)
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { pages } => self.start_session(pages),
            Command::Stop { force } => {
                self.stop_session();
                if force {
                    self.pages.clear();
                    self.retry_count = MAX_RETRIES;
                }
                self.publish();
            }
            Command::Resume => self.resume_session(),
            Command::JumpTo { offset } => self.jump_to(offset),
            Command::Shutdown => unreachable!("handled by the loop"),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn start_session(&mut self, pages: Vec<String>) {
        if self.state.is_active() {
            self.stop_session();
        }

        self.generation += 1;
        self.retry_count = 0;
        self.error = None;
        self.pages = pages;
        self.page_index = 0;
        self.levels.reset();
        self.last_spoken.clear();
        self.should_dismiss = false;
        self.should_advance_page = false;

        self.state = SessionState::Authorizing;
        self.publish();

        if !self.authorize() {
            self.state = SessionState::Idle;
            self.publish();
            return;
        }

        let page = ScriptPage::new(self.pages[self.page_index].clone());
        self.matcher = Some(MatchEngine::new(page, self.backend_kind()));

        if let Err(e) = self.start_audio() {
            if self.config.speech.engine_mode == SpeechEngineMode::Platform {
                tracing::error!("Audio capture failed: {}", e);
                self.fail_or_retry(e.to_string());
                self.publish();
                return;
            }
            // The external recogniser captures its own audio; losing the
            // level meter is not fatal.
            tracing::warn!("Audio capture unavailable, levels disabled: {}", e);
        }

        if self.config.speech.listening_mode == ListeningMode::WordTracking {
            if let Err(e) = self.start_backend() {
                self.handle_backend_start_error(e);
                self.publish();
                return;
            }
        } else {
            tracing::info!(
                "Listening mode {:?}: transcription disabled",
                self.config.speech.listening_mode
            );
        }

        self.refresh_audio_wiring();
        self.state = SessionState::Running;
        tracing::info!(
            "Session started (generation {}, page {}/{})",
            self.generation,
            self.page_index + 1,
            self.pages.len()
        );
        self.publish();
    }

    fn stop_session(&mut self) {
        self.pending_restart = None;
        self.advance_due = None;
        self.suppress_config_change_until = None;

        if let Some(mut backend) = self.backend.take() {
            backend.shutdown();
        }
        if let Some(mut audio) = self.audio.take() {
            audio.stop();
        }

        // The compact index lives only as long as the session.
        self.matcher = None;
        self.levels.reset();
        self.last_spoken.clear();
        self.error = None;
        self.retry_count = 0;
        self.state = SessionState::Idle;
    }

    fn resume_session(&mut self) {
        let Some(matcher) = self.matcher.as_mut() else {
            tracing::debug!("Resume requested without a session");
            return;
        };

        matcher.resume();
        self.retry_count = 0;
        self.error = None;
        self.restart_backend();
        self.publish();
    }

    fn jump_to(&mut self, offset: usize) {
        let Some(matcher) = self.matcher.as_mut() else {
            return;
        };

        matcher.jump_to(offset);
        tracing::info!("Jump to char offset {}", offset);

        if self.state == SessionState::Running || self.state == SessionState::Retrying {
            self.restart_backend();
        } else {
            self.generation += 1;
        }
        self.publish();
    }

    fn authorize(&mut self) -> bool {
        match self.hooks.request_microphone_authorization() {
            AuthorizationStatus::Granted => {}
            status => {
                tracing::warn!("Microphone authorization: {:?}", status);
                self.hooks.open_system_privacy_pane(PrivacyPane::Microphone);
                self.error = Some(
                    EngineError::PermissionDenied {
                        capability: "microphone",
                        deep_link: PrivacyPane::Microphone.deep_link(),
                    }
                    .to_string(),
                );
                return false;
            }
        }

        if self.config.speech.engine_mode == SpeechEngineMode::Platform {
            match self.hooks.request_speech_recognition_authorization() {
                AuthorizationStatus::Granted => {}
                status => {
                    tracing::warn!("Speech recognition authorization: {:?}", status);
                    self.hooks
                        .open_system_privacy_pane(PrivacyPane::SpeechRecognition);
                    self.error = Some(
                        EngineError::PermissionDenied {
                            capability: "speech recognition",
                            deep_link: PrivacyPane::SpeechRecognition.deep_link(),
                        }
                        .to_string(),
                    );
                    return false;
                }
            }
        }

        true
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    fn backend_kind(&self) -> BackendKind {
        match self.config.speech.engine_mode {
            SpeechEngineMode::Platform => BackendKind::Cumulative,
            SpeechEngineMode::ExternalStream => BackendKind::Segment,
        }
    }

    fn start_audio(&mut self) -> Result<(), EngineError> {
        let mut capture = AudioCapture::new();
        let uid = self.config.audio.selected_mic_uid.clone();
        capture.start(uid.as_deref())?;
        self.audio = Some(capture);
        Ok(())
    }

    /// (Re)install the frame tap and config-change signal so both carry
    /// the current generation and feed the current backend.
    fn refresh_audio_wiring(&mut self) {
        let generation = self.generation;
        let sink = self.backend.as_ref().and_then(|b| b.audio_sink());

        let Some(audio) = self.audio.as_mut() else {
            return;
        };

        let signal_tx = self.events_tx.clone();
        audio.set_config_change_signal(Arc::new(move || {
            let _ = signal_tx.send(EngineEvent::AudioConfigChanged { generation });
        }));

        let level_tx = self.events_tx.clone();
        audio.set_tap(move |frame, level| {
            if let Some(sink) = &sink {
                // Dropping frames under backpressure beats blocking the
                // audio callback.
                let _ = sink.try_send(frame.to_vec());
            }
            let _ = level_tx.send(EngineEvent::AudioLevel { generation, level });
        });
    }

    fn start_backend(&mut self) -> Result<(), EngineError> {
        let hint = self
            .matcher
            .as_ref()
            .and_then(|m| dominant_cjk_hint(m.page().text()));
        let mut backend = (self.backend_factory)(
            &self.config,
            hint,
            self.backend_tx.clone(),
            self.generation,
        )?;
        backend.start()?;
        self.backend = Some(backend);
        Ok(())
    }

    /// Tear down and relaunch the backend under a fresh generation.
    fn restart_backend(&mut self) {
        self.pending_restart = None;
        self.generation += 1;

        if let Some(mut backend) = self.backend.take() {
            backend.shutdown();
        }

        if self.audio.is_none() {
            if let Err(e) = self.start_audio() {
                if self.config.speech.engine_mode == SpeechEngineMode::Platform {
                    tracing::warn!("Audio capture still unavailable: {}", e);
                    self.fail_or_retry(e.to_string());
                    return;
                }
                tracing::warn!("Audio capture unavailable, levels disabled: {}", e);
            }
        }

        if self.config.speech.listening_mode != ListeningMode::WordTracking {
            self.refresh_audio_wiring();
            self.state = SessionState::Running;
            return;
        }

        match self.start_backend() {
            Ok(()) => {
                self.refresh_audio_wiring();
                self.state = SessionState::Running;
                tracing::info!("Backend restarted (generation {})", self.generation);
            }
            Err(e) => self.handle_backend_start_error(e),
        }
    }

    fn handle_backend_start_error(&mut self, error: EngineError) {
        if error.is_retryable() {
            tracing::warn!("Backend start failed (retryable): {}", error);
            self.fail_or_retry(error.to_string());
        } else {
            tracing::error!("Backend start failed: {}", error);
            self.stop_session();
            self.state = SessionState::Idle;
            self.error = Some(error.to_string());
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Transcript { generation, text } => {
                self.handle_transcript(generation, text)
            }
            BackendEvent::RuntimeError {
                generation,
                message,
            } => {
                if generation != self.generation {
                    tracing::debug!("Discarding stale backend error (generation {})", generation);
                    return;
                }
                self.fail_or_retry(EngineError::BackendRuntimeError(message).to_string());
                self.publish();
            }
            BackendEvent::Exited { generation, code } => {
                if generation != self.generation {
                    tracing::debug!("Discarding stale exit (generation {})", generation);
                    return;
                }
                self.backend = None;
                self.fail_or_retry(EngineError::BackendExited { code }.to_string());
                self.publish();
            }
        }
    }

    fn handle_transcript(&mut self, generation: u64, text: String) {
        if generation != self.generation {
            tracing::debug!(
                "Discarding stale transcript (generation {} != {})",
                generation,
                self.generation
            );
            return;
        }
        if self.state != SessionState::Running {
            return;
        }
        let Some(matcher) = self.matcher.as_mut() else {
            return;
        };

        let outcome = matcher.observe(&text);
        self.last_spoken = text;
        // A delivered transcript proves the backend is healthy again.
        self.retry_count = 0;

        if outcome.committed_far_jump {
            tracing::info!("Far jump committed, cursor now {}", outcome.recognized);
        }

        if matcher.is_complete() {
            self.handle_page_complete();
        }
        self.publish();
    }

    fn handle_page_complete(&mut self) {
        if self.page_index + 1 >= self.pages.len() {
            tracing::info!("Script complete");
            self.should_dismiss = true;
            self.state = SessionState::Completed;
            if let Some(mut backend) = self.backend.take() {
                backend.shutdown();
            }
            if let Some(mut audio) = self.audio.take() {
                audio.stop();
            }
            return;
        }

        if self.config.paging.auto_next_page {
            let delay = Duration::from_secs(self.config.paging.auto_next_page_delay as u64);
            self.advance_due = Some(Instant::now() + delay);
            tracing::info!(
                "Page {} complete, advancing in {:?}",
                self.page_index + 1,
                delay
            );
        } else {
            self.should_advance_page = true;
        }
    }

    fn advance_page(&mut self) {
        self.advance_due = None;
        self.page_index += 1;
        let page = ScriptPage::new(self.pages[self.page_index].clone());
        self.matcher = Some(MatchEngine::new(page, self.backend_kind()));
        self.should_advance_page = true;
        self.last_spoken.clear();
        tracing::info!("Advanced to page {}/{}", self.page_index + 1, self.pages.len());

        self.restart_backend();
        self.publish();
    }

    fn handle_config_changed(&mut self, generation: u64) {
        if generation != self.generation {
            tracing::debug!("Discarding stale config change (generation {})", generation);
            return;
        }
        if let Some(until) = self.suppress_config_change_until {
            if Instant::now() < until {
                tracing::debug!("Ignoring self-triggered audio config change");
                return;
            }
        }
        if !self.state.is_active() {
            return;
        }

        tracing::info!("Audio configuration changed, rebuilding capture");

        // Device hot-swap: not an error. Kill the recogniser, rebuild the
        // audio engine, and coalesce a single pending restart.
        if let Some(mut backend) = self.backend.take() {
            backend.shutdown();
        }
        if let Some(mut audio) = self.audio.take() {
            audio.stop();
        }

        self.generation += 1;
        self.suppress_config_change_until = Some(Instant::now() + CONFIG_CHANGE_SUPPRESSION);

        if let Err(e) = self.start_audio() {
            tracing::warn!("Audio rebuild failed, retrying with backend: {}", e);
        }
        self.refresh_audio_wiring();

        self.state = SessionState::Retrying;
        self.pending_restart = Some(Instant::now() + RESTART_STEP);
        self.publish();
    }

    // ------------------------------------------------------------------
    // Retry policy
    // ------------------------------------------------------------------

    fn fail_or_retry(&mut self, surfaced: String) {
        if !self.state.is_active() {
            return;
        }
        if self
            .pages
            .get(self.page_index)
            .map_or(true, |p| p.trim().is_empty())
        {
            return;
        }
        if self.should_dismiss {
            return;
        }

        if self.retry_count < MAX_RETRIES {
            self.retry_count += 1;
            let delay = (RESTART_STEP * self.retry_count).min(RESTART_MAX);
            // Coalesced: a newly scheduled restart replaces any prior one.
            self.pending_restart = Some(Instant::now() + delay);
            self.state = SessionState::Retrying;
            tracing::warn!(
                "Backend failure ({}), retry {}/{} in {:?}",
                surfaced,
                self.retry_count,
                MAX_RETRIES,
                delay
            );
        } else {
            tracing::error!("Retries exhausted: {}", surfaced);
            self.pending_restart = None;
            self.state = SessionState::Paused;
            self.error = Some(surfaced);
            if let Some(mut backend) = self.backend.take() {
                backend.shutdown();
            }
        }
    }

    fn handle_timers(&mut self) {
        let now = Instant::now();

        if self.pending_restart.is_some_and(|due| now >= due) {
            self.pending_restart = None;
            if self.state == SessionState::Retrying {
                self.restart_backend();
                self.publish();
            }
        }

        if self.advance_due.is_some_and(|due| now >= due) {
            self.advance_page();
        }
    }

    // ------------------------------------------------------------------
    // Publication
    // ------------------------------------------------------------------

    fn publish(&mut self) {
        let snapshot = EngineSnapshot {
            state: self.state,
            generation: self.generation,
            page_index: self.page_index,
            recognized_char_count: self.matcher.as_ref().map_or(0, |m| m.recognized()),
            is_listening: self.state == SessionState::Running,
            error: self.error.clone(),
            audio_levels: self.levels.levels(),
            last_spoken_text: self.last_spoken.clone(),
            is_speaking: self.levels.is_speaking(),
            should_dismiss: self.should_dismiss,
            should_advance_page: self.should_advance_page,
        };
        self.publisher.publish(snapshot);

        // Edge triggers fire once per publication.
        self.should_dismiss = false;
        self.should_advance_page = false;
    }
}
