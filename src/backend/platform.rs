//! Platform recogniser backend
//!
//! Adapts an OS-provided streaming speech recogniser. The recogniser
//! itself is supplied by the embedding layer through the
//! [`SpeechRecognizer`] trait; this module owns locale resolution,
//! generation tagging, and the frame-feeding plumbing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::{BackendEvent, BackendKind, TranscriptionBackend};
use crate::error::EngineError;
use crate::script::CjkHint;

/// Streaming recogniser handle provided by the platform layer.
///
/// Hypotheses delivered through the sink are cumulative: each one is the
/// recogniser's best guess for all audio since `begin`.
pub trait SpeechRecognizer: Send {
    /// Locales the recogniser can transcribe (BCP-47 identifiers).
    fn supported_locales(&self) -> Vec<String>;

    /// Start a recognition session in the given locale.
    fn begin(
        &mut self,
        locale: &str,
        sink: Box<dyn Fn(String) + Send>,
    ) -> Result<(), EngineError>;

    /// Append captured audio. Non-blocking; buffered internally.
    fn append(&mut self, samples: &[f32]);

    /// End the session and release the recogniser.
    fn finish(&mut self);
}

fn language_code(locale: &str) -> String {
    locale
        .split(['-', '_'])
        .next()
        .unwrap_or(locale)
        .to_lowercase()
}

/// Current system locale from the environment, normalised to BCP-47
/// (e.g. `en_US.UTF-8` becomes `en-US`).
pub fn system_locale() -> Option<String> {
    let raw = std::env::var("LC_ALL")
        .or_else(|_| std::env::var("LANG"))
        .ok()?;
    let trimmed = raw.split('.').next()?.trim();
    if trimmed.is_empty() || trimmed == "C" || trimmed == "POSIX" {
        return None;
    }
    Some(trimmed.replace('_', "-"))
}

/// Pick the recognition locale for a session.
///
/// Preference order: the user's locale, any locale with the same
/// language, the script's dominant CJK language, the system locale,
/// English, anything at all.
pub fn resolve_locale(
    preferred: &str,
    supported: &[String],
    script_hint: Option<CjkHint>,
    system: Option<&str>,
) -> Option<String> {
    if supported.is_empty() {
        return None;
    }

    if let Some(exact) = supported
        .iter()
        .find(|l| l.eq_ignore_ascii_case(preferred))
    {
        return Some(exact.clone());
    }

    let preferred_lang = language_code(preferred);
    if !preferred_lang.is_empty() {
        if let Some(same_lang) = supported
            .iter()
            .find(|l| language_code(l) == preferred_lang)
        {
            return Some(same_lang.clone());
        }
    }

    if let Some(hint) = script_hint {
        if let Some(hinted) = supported
            .iter()
            .find(|l| language_code(l) == hint.language_code())
        {
            return Some(hinted.clone());
        }
    }

    if let Some(system) = system {
        if let Some(matched) = supported
            .iter()
            .find(|l| l.eq_ignore_ascii_case(system) || language_code(l) == language_code(system))
        {
            return Some(matched.clone());
        }
    }

    if let Some(english) = supported.iter().find(|l| language_code(l) == "en") {
        return Some(english.clone());
    }

    supported.first().cloned()
}

/// Backend wrapping a platform [`SpeechRecognizer`].
pub struct PlatformBackend {
    recognizer: Arc<Mutex<Box<dyn SpeechRecognizer>>>,
    preferred_locale: String,
    script_hint: Option<CjkHint>,
    events: Sender<BackendEvent>,
    generation: u64,
    frames: Option<Sender<Vec<f32>>>,
    feeder: Option<JoinHandle<()>>,
    active: Arc<AtomicBool>,
}

impl PlatformBackend {
    pub fn new(
        recognizer: Box<dyn SpeechRecognizer>,
        preferred_locale: String,
        script_hint: Option<CjkHint>,
        events: Sender<BackendEvent>,
        generation: u64,
    ) -> Self {
        Self {
            recognizer: Arc::new(Mutex::new(recognizer)),
            preferred_locale,
            script_hint,
            events,
            generation,
            frames: None,
            feeder: None,
            active: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl TranscriptionBackend for PlatformBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cumulative
    }

    fn start(&mut self) -> Result<(), EngineError> {
        let supported = self.recognizer.lock().supported_locales();
        let locale = resolve_locale(
            &self.preferred_locale,
            &supported,
            self.script_hint,
            system_locale().as_deref(),
        )
        .ok_or_else(|| {
            EngineError::RecognizerUnavailable("no supported recognition locales".to_string())
        })?;

        tracing::info!(
            "Platform recogniser locale: {} (preferred: {})",
            locale,
            self.preferred_locale
        );

        let events = self.events.clone();
        let generation = self.generation;
        self.recognizer.lock().begin(
            &locale,
            Box::new(move |text| {
                let _ = events.send(BackendEvent::Transcript { generation, text });
            }),
        )?;

        // Frames arrive on the audio callback thread; a small channel
        // decouples it from the recogniser lock. The audio tap may hold
        // a sender clone past shutdown, so the feeder also watches the
        // active flag rather than relying on channel disconnection.
        let (tx, rx) = bounded::<Vec<f32>>(64);
        let recognizer = self.recognizer.clone();
        let active = self.active.clone();
        active.store(true, Ordering::SeqCst);
        self.feeder = Some(std::thread::spawn(move || {
            while active.load(Ordering::SeqCst) {
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(frame) => recognizer.lock().append(&frame),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }));
        self.frames = Some(tx);

        Ok(())
    }

    fn audio_sink(&self) -> Option<Sender<Vec<f32>>> {
        self.frames.clone()
    }

    fn shutdown(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.frames = None;
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
        self.recognizer.lock().finish();
    }
}
