//! External streaming-recogniser subprocess driver
//!
//! Spawns and monitors a long-lived streaming ASR binary, parses its
//! line-delimited partially-annotated output into segment transcripts,
//! and reports stderr failures and exits to the session controller. The
//! subprocess captures its own audio; the engine only drives it.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use regex::Regex;

use super::{BackendEvent, BackendKind, TranscriptionBackend};
use crate::config::ExternalStreamConfig;
use crate::error::EngineError;

/// Expected substring of the executable's basename; guards against a
/// stale config pointing at an unrelated binary.
const EXECUTABLE_MARKER: &str = "sense-voice-stream";

/// Dynamic-linker search path variable for the child process.
#[cfg(target_os = "macos")]
pub const LIBRARY_PATH_VAR: &str = "DYLD_LIBRARY_PATH";
#[cfg(not(target_os = "macos"))]
pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

/// Markers identifying a stderr line as a backend failure.
const ERROR_MARKERS: [&str; 4] = ["error", "failed", "dyld", "couldn't"];

/// ANSI CSI escape sequences (`ESC [ … letter`).
static ANSI_CSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").unwrap());

/// Timestamp spans like `[0.00-1.28]`.
static TIMESTAMP_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\d+(?:\.\d+)?\s*-\s*\d+(?:\.\d+)?\]").unwrap());

/// SenseVoice-style tags like `<|zh|>` or `<|NEUTRAL|>`.
static ANNOTATION_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<\|.*?\|>").unwrap());

static MULTI_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Remove ANSI CSI escapes from a line.
pub fn strip_ansi(line: &str) -> String {
    ANSI_CSI.replace_all(line, "").into_owned()
}

/// A line is a transcript candidate iff it carries a timestamp span or a
/// recogniser tag; everything else is progress chatter.
pub fn is_transcript_line(line: &str) -> bool {
    TIMESTAMP_SPAN.is_match(line) || ANNOTATION_TAG.is_match(line)
}

/// Strip annotations from a transcript line and normalise whitespace.
pub fn sanitize_transcript(line: &str) -> String {
    let without_spans = TIMESTAMP_SPAN.replace_all(line, " ");
    let without_tags = ANNOTATION_TAG.replace_all(&without_spans, " ");
    MULTI_SPACE.replace_all(&without_tags, " ").trim().to_string()
}

/// Whether a stderr line indicates a backend failure.
pub fn is_error_line(line: &str) -> bool {
    let lowered = line.to_lowercase();
    ERROR_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Incremental splitter for subprocess output.
///
/// Accepts arbitrary byte chunks, splits on `\n` or `\r` (progress-style
/// output rewrites lines with bare carriage returns), and coalesces runs
/// of terminators.
#[derive(Debug, Default)]
pub struct LineAccumulator {
    buf: Vec<u8>,
}

impl LineAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n' || b == b'\r') {
            let line = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
            let mut rest = pos;
            while rest < self.buf.len() && (self.buf[rest] == b'\n' || self.buf[rest] == b'\r') {
                rest += 1;
            }
            self.buf.drain(..rest);
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

/// Validate a configured executable path, fixing permissions if needed.
///
/// Returns the usable path, or `None` when the path is empty, missing,
/// misnamed, or cannot be made executable.
pub fn validate_executable(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() || !path.is_file() {
        return None;
    }

    let basename = path.file_name()?.to_string_lossy();
    if !basename.contains(EXECUTABLE_MARKER) {
        tracing::warn!(
            "Executable basename '{}' does not look like a streaming recogniser",
            basename
        );
        return None;
    }

    if !is_executable(path) {
        tracing::info!("Marking {} executable", path.display());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(path) {
                let mut perms = metadata.permissions();
                perms.set_mode(0o755);
                let _ = std::fs::set_permissions(path, perms);
            }
        }
        if !is_executable(path) {
            return None;
        }
    }

    Some(path.to_path_buf())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

/// Default install locations probed when the configured path is invalid.
fn default_install_candidates() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    vec![
        home.join(".telecue").join("bin").join(EXECUTABLE_MARKER),
        home.join(".local").join("bin").join(EXECUTABLE_MARKER),
        home.join("bin").join(EXECUTABLE_MARKER),
    ]
}

/// Resolve the executable to launch.
///
/// Returns the path and whether it came from probing (in which case the
/// caller persists it back to settings).
pub fn resolve_executable(configured: &str) -> Result<(PathBuf, bool), EngineError> {
    if let Some(path) = validate_executable(Path::new(configured)) {
        return Ok((path, false));
    }

    for candidate in default_install_candidates() {
        if let Some(path) = validate_executable(&candidate) {
            tracing::info!(
                "Configured executable '{}' invalid; using {}",
                configured,
                path.display()
            );
            return Ok((path, true));
        }
    }

    Err(EngineError::InvalidConfiguration(format!(
        "streaming recogniser executable not found (configured: '{}')",
        configured
    )))
}

/// Library directories to expose to the child: `../lib`, `../../lib` and
/// the executable's own directory, existing ones only, deduplicated in
/// that order.
pub fn library_search_paths(executable: &Path) -> Vec<PathBuf> {
    let Some(exe_dir) = executable.parent() else {
        return Vec::new();
    };

    let candidates = [
        exe_dir.join("..").join("lib"),
        exe_dir.join("..").join("..").join("lib"),
        exe_dir.to_path_buf(),
    ];

    let mut paths = Vec::new();
    for candidate in candidates {
        let resolved = candidate.canonicalize().unwrap_or(candidate);
        if resolved.is_dir() && !paths.contains(&resolved) {
            paths.push(resolved);
        }
    }
    paths
}

/// Merge resolved library paths with an inherited search path, resolved
/// paths first, deduplicating while preserving order.
pub fn merged_library_path(paths: &[PathBuf], inherited: Option<&str>) -> String {
    let mut entries: Vec<String> = Vec::new();
    for path in paths {
        let entry = path.to_string_lossy().into_owned();
        if !entry.is_empty() && !entries.contains(&entry) {
            entries.push(entry);
        }
    }
    if let Some(inherited) = inherited {
        for entry in inherited.split(':') {
            if !entry.is_empty() && !entries.contains(&entry.to_string()) {
                entries.push(entry.to_string());
            }
        }
    }
    entries.join(":")
}

/// Command-line arguments for the streaming recogniser. This contract is
/// stable and must match the upstream binary.
pub fn build_args(settings: &ExternalStreamConfig) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        settings.model_path.clone(),
        "-l".to_string(),
        settings.language.as_arg().to_string(),
        "--use-vad".to_string(),
        "--chunk-size".to_string(),
        "80".to_string(),
        "-mmc".to_string(),
        "8".to_string(),
        "-mnc".to_string(),
        "120".to_string(),
        "--speech-prob-threshold".to_string(),
        "0.2".to_string(),
    ];
    if settings.disable_gpu {
        args.push("-ng".to_string());
    }
    args
}

/// Backend driving the external streaming recogniser.
pub struct StreamBackend {
    settings: ExternalStreamConfig,
    events: Sender<BackendEvent>,
    generation: u64,
    child: Option<Arc<Mutex<Child>>>,
    intentionally_stopped: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl StreamBackend {
    pub fn new(
        settings: ExternalStreamConfig,
        events: Sender<BackendEvent>,
        generation: u64,
    ) -> Self {
        Self {
            settings,
            events,
            generation,
            child: None,
            intentionally_stopped: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    fn spawn_reader<R: Read + Send + 'static>(
        &mut self,
        reader: R,
        is_stderr: bool,
        last_emitted: Arc<Mutex<String>>,
    ) {
        let events = self.events.clone();
        let generation = self.generation;

        self.workers.push(std::thread::spawn(move || {
            let mut reader = reader;
            let mut accumulator = LineAccumulator::new();
            let mut chunk = [0u8; 4096];

            loop {
                let read = match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                for line in accumulator.push(&chunk[..read]) {
                    let clean = strip_ansi(&line);

                    if is_stderr && is_error_line(&clean) {
                        tracing::warn!("Recogniser stderr: {}", clean);
                        let _ = events.send(BackendEvent::RuntimeError {
                            generation,
                            message: clean.clone(),
                        });
                    }

                    if is_transcript_line(&clean) {
                        let text = sanitize_transcript(&clean);
                        if text.is_empty() {
                            continue;
                        }
                        let mut last = last_emitted.lock();
                        if *last != text {
                            *last = text.clone();
                            drop(last);
                            let _ = events.send(BackendEvent::Transcript { generation, text });
                        }
                    }
                }
            }
        }));
    }
}

impl TranscriptionBackend for StreamBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Segment
    }

    fn start(&mut self) -> Result<(), EngineError> {
        let (executable, probed) = resolve_executable(&self.settings.executable_path)?;
        if probed {
            if let Err(e) =
                crate::config::set_external_executable_path(executable.to_string_lossy().into_owned())
            {
                tracing::warn!("Could not persist probed executable path: {}", e);
            }
        }

        if self.settings.model_path.is_empty()
            || !Path::new(&self.settings.model_path).exists()
        {
            return Err(EngineError::InvalidConfiguration(format!(
                "model path '{}' does not exist",
                self.settings.model_path
            )));
        }

        let library_paths = library_search_paths(&executable);
        let inherited = std::env::var(LIBRARY_PATH_VAR).ok();
        let merged = merged_library_path(&library_paths, inherited.as_deref());

        let args = build_args(&self.settings);
        tracing::info!(
            "Launching {} {} ({}={})",
            executable.display(),
            args.join(" "),
            LIBRARY_PATH_VAR,
            merged
        );

        self.intentionally_stopped.store(false, Ordering::SeqCst);

        let mut command = Command::new(&executable);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !merged.is_empty() {
            command.env(LIBRARY_PATH_VAR, &merged);
        }

        let mut child = command.spawn().map_err(|e| EngineError::BackendSpawnFailed {
            path: executable.to_string_lossy().into_owned(),
            reason: e.to_string(),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Consecutive-duplicate suppression spans both output streams.
        let last_emitted = Arc::new(Mutex::new(String::new()));
        if let Some(stdout) = stdout {
            self.spawn_reader(stdout, false, last_emitted.clone());
        }
        if let Some(stderr) = stderr {
            self.spawn_reader(stderr, true, last_emitted);
        }

        let child = Arc::new(Mutex::new(child));
        self.child = Some(child.clone());

        // Exit watcher. Polls rather than blocking on wait() so stop()
        // can take the child lock to kill.
        let events = self.events.clone();
        let generation = self.generation;
        let intentional = self.intentionally_stopped.clone();
        self.workers.push(std::thread::spawn(move || loop {
            match child.lock().try_wait() {
                Ok(Some(status)) => {
                    if !intentional.load(Ordering::SeqCst) {
                        tracing::warn!("Recogniser exited with {:?}", status.code());
                        let _ = events.send(BackendEvent::Exited {
                            generation,
                            code: status.code(),
                        });
                    }
                    break;
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(e) => {
                    tracing::warn!("Could not poll recogniser: {}", e);
                    break;
                }
            }
        }));

        Ok(())
    }

    fn shutdown(&mut self) {
        self.intentionally_stopped.store(true, Ordering::SeqCst);

        if let Some(child) = self.child.take() {
            let mut guard = child.lock();
            if let Err(e) = guard.kill() {
                tracing::debug!("Recogniser kill: {}", e);
            }
            let _ = guard.wait();
        }

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for StreamBackend {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExternalLanguage;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_line_accumulator_splits_on_newline() {
        let mut acc = LineAccumulator::new();
        assert!(acc.push(b"partial").is_empty());
        let lines = acc.push(b" line\nnext");
        assert_eq!(lines, vec!["partial line".to_string()]);
        let lines = acc.push(b"\n");
        assert_eq!(lines, vec!["next".to_string()]);
    }

    #[test]
    fn test_line_accumulator_coalesces_terminator_runs() {
        let mut acc = LineAccumulator::new();
        let lines = acc.push(b"one\r\n\r\ntwo\n");
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_line_accumulator_splits_on_bare_carriage_return() {
        let mut acc = LineAccumulator::new();
        let lines = acc.push(b"progress 10%\rprogress 20%\r");
        assert_eq!(
            lines,
            vec!["progress 10%".to_string(), "progress 20%".to_string()]
        );
    }

    #[test]
    fn test_strip_ansi_removes_csi_sequences() {
        let line = "\x1b[2K\x1b[1;32m[0.00-1.20] hello\x1b[0m";
        assert_eq!(strip_ansi(line), "[0.00-1.20] hello");
    }

    #[test]
    fn test_transcript_line_classification() {
        assert!(is_transcript_line("[0.00-1.28] hello there"));
        assert!(is_transcript_line("<|en|><|NEUTRAL|> hello there"));
        assert!(!is_transcript_line("loading model weights"));
        assert!(!is_transcript_line("chunk 80 processed"));
    }

    #[test]
    fn test_sanitize_removes_spans_and_tags() {
        assert_eq!(
            sanitize_transcript("[0.00-1.28] hello   there"),
            "hello there"
        );
        assert_eq!(
            sanitize_transcript("<|en|><|NEUTRAL|>hello <|woitn|> there"),
            "hello there"
        );
        assert_eq!(sanitize_transcript("[0.0-2.5]<|zh|>"), "");
    }

    #[test]
    fn test_error_line_markers_case_insensitive() {
        assert!(is_error_line("ERROR: model not found"));
        assert!(is_error_line("dyld: library not loaded"));
        assert!(is_error_line("Couldn't open audio unit"));
        assert!(is_error_line("load Failed for weights"));
        assert!(!is_error_line("loaded model in 1.2s"));
    }

    #[test]
    fn test_build_args_contract() {
        let settings = ExternalStreamConfig {
            executable_path: String::new(),
            model_path: "/models/sense-voice".to_string(),
            language: ExternalLanguage::Zh,
            disable_gpu: false,
        };
        let args = build_args(&settings);
        assert_eq!(
            args,
            vec![
                "-m",
                "/models/sense-voice",
                "-l",
                "zh",
                "--use-vad",
                "--chunk-size",
                "80",
                "-mmc",
                "8",
                "-mnc",
                "120",
                "--speech-prob-threshold",
                "0.2",
            ]
        );
    }

    #[test]
    fn test_build_args_gpu_disabled() {
        let settings = ExternalStreamConfig {
            disable_gpu: true,
            ..Default::default()
        };
        let args = build_args(&settings);
        assert_eq!(args.last().map(String::as_str), Some("-ng"));
    }

    #[test]
    fn test_merged_library_path_dedups_preserving_order() {
        let paths = vec![PathBuf::from("/opt/asr/lib"), PathBuf::from("/opt/asr/bin")];
        let merged = merged_library_path(&paths, Some("/usr/lib:/opt/asr/lib:/usr/local/lib"));
        assert_eq!(merged, "/opt/asr/lib:/opt/asr/bin:/usr/lib:/usr/local/lib");
    }

    #[test]
    fn test_merged_library_path_without_inherited() {
        let paths = vec![PathBuf::from("/a"), PathBuf::from("/a"), PathBuf::from("/b")];
        assert_eq!(merged_library_path(&paths, None), "/a:/b");
    }

    #[test]
    fn test_validate_executable_rejects_missing_and_misnamed() {
        assert!(validate_executable(Path::new("")).is_none());
        assert!(validate_executable(Path::new("/does/not/exist/sense-voice-stream")).is_none());

        let dir = tempfile::tempdir().unwrap();
        let wrong_name = dir.path().join("some-other-binary");
        std::fs::write(&wrong_name, b"#!/bin/sh\n").unwrap();
        assert!(validate_executable(&wrong_name).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_executable_fixes_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sense-voice-stream");
        std::fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let resolved = validate_executable(&path).expect("should become executable");
        assert_eq!(resolved, path);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert!(mode & 0o111 != 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_library_search_paths_keeps_existing_dirs_only() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("pkg").join("bin");
        let lib = dir.path().join("pkg").join("lib");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::create_dir_all(&lib).unwrap();
        let exe = bin.join("sense-voice-stream");
        std::fs::write(&exe, b"").unwrap();

        let paths = library_search_paths(&exe);
        let lib = lib.canonicalize().unwrap();
        let bin = bin.canonicalize().unwrap();
        assert_eq!(paths, vec![lib, bin]);
    }

    #[cfg(unix)]
    #[test]
    fn test_stream_backend_emits_transcripts_and_exit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("sense-voice-stream");
        std::fs::write(
            &exe,
            b"#!/bin/sh\n\
              echo '[0.00-1.20] hello there'\n\
              echo '[1.20-2.40] hello there'\n\
              echo '[2.40-3.60] general kenobi'\n",
        )
        .unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        let model = dir.path().join("model");
        std::fs::write(&model, b"stub").unwrap();

        let settings = ExternalStreamConfig {
            executable_path: exe.to_string_lossy().into_owned(),
            model_path: model.to_string_lossy().into_owned(),
            language: ExternalLanguage::Auto,
            disable_gpu: true,
        };

        let (tx, rx) = unbounded();
        let mut backend = StreamBackend::new(settings, tx, 7);
        backend.start().expect("spawn");

        let mut transcripts = Vec::new();
        let mut exited = false;
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
            match event {
                BackendEvent::Transcript { generation, text } => {
                    assert_eq!(generation, 7);
                    transcripts.push(text);
                }
                BackendEvent::Exited { code, .. } => {
                    assert_eq!(code, Some(0));
                    exited = true;
                    break;
                }
                BackendEvent::RuntimeError { .. } => {}
            }
        }

        // Consecutive duplicate suppressed.
        assert_eq!(
            transcripts,
            vec!["hello there".to_string(), "general kenobi".to_string()]
        );
        assert!(exited);

        backend.shutdown();
    }

    #[cfg(unix)]
    #[test]
    fn test_intentional_stop_suppresses_exit_event() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("sense-voice-stream");
        std::fs::write(&exe, b"#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        let model = dir.path().join("model");
        std::fs::write(&model, b"stub").unwrap();

        let settings = ExternalStreamConfig {
            executable_path: exe.to_string_lossy().into_owned(),
            model_path: model.to_string_lossy().into_owned(),
            language: ExternalLanguage::Auto,
            disable_gpu: false,
        };

        let (tx, rx) = unbounded();
        let mut backend = StreamBackend::new(settings, tx, 1);
        backend.start().expect("spawn");
        backend.shutdown();

        // The intentionally killed child must not report an exit.
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }
}
