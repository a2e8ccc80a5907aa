//! Configuration management for Telecue
//!
//! Persistent settings shared between the engine and whatever UI embeds
//! it, stored as pretty-printed JSON at `~/.telecue/config.json` with a
//! schema version for upgrades.

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

/// Current config schema version
const CURRENT_VERSION: u32 = 1;

/// Global config instance for caching
static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Schema version for upgrades
    pub version: u32,
    /// Speech recognition settings
    pub speech: SpeechConfig,
    /// External streaming-recogniser settings
    pub external: ExternalStreamConfig,
    /// Audio input settings
    pub audio: AudioConfig,
    /// Page advancement settings
    pub paging: PagingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            speech: SpeechConfig::default(),
            external: ExternalStreamConfig::default(),
            audio: AudioConfig::default(),
            paging: PagingConfig::default(),
        }
    }
}

/// Which transcription backend drives the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpeechEngineMode {
    /// The OS-provided streaming recogniser
    #[default]
    Platform,
    /// The external streaming ASR subprocess
    ExternalStream,
}

/// What the engine does while a page is shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListeningMode {
    /// Track spoken words and advance the cursor (runs transcription)
    #[default]
    WordTracking,
    /// Pause scrolling while the speaker is silent (no transcription)
    SilencePaused,
    /// Plain timed scrolling (no transcription)
    Classic,
}

/// Speech recognition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Preferred recognition locale (BCP-47, e.g. "en-US")
    pub locale: String,
    /// Selected transcription backend
    pub engine_mode: SpeechEngineMode,
    /// Listening behaviour while presenting
    pub listening_mode: ListeningMode,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            locale: "en-US".to_string(),
            engine_mode: SpeechEngineMode::default(),
            listening_mode: ListeningMode::default(),
        }
    }
}

/// Language option for the external recogniser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExternalLanguage {
    #[default]
    Auto,
    Zh,
    En,
    Yue,
    Ja,
    Ko,
}

impl ExternalLanguage {
    /// Argument value passed to the external binary's `-l` flag.
    pub fn as_arg(self) -> &'static str {
        match self {
            ExternalLanguage::Auto => "auto",
            ExternalLanguage::Zh => "zh",
            ExternalLanguage::En => "en",
            ExternalLanguage::Yue => "yue",
            ExternalLanguage::Ja => "ja",
            ExternalLanguage::Ko => "ko",
        }
    }
}

/// External streaming-recogniser configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalStreamConfig {
    /// Path to the streaming ASR executable
    pub executable_path: String,
    /// Path to the model directory or file
    pub model_path: String,
    /// Recognition language
    pub language: ExternalLanguage,
    /// Run without GPU acceleration
    pub disable_gpu: bool,
}

impl Default for ExternalStreamConfig {
    fn default() -> Self {
        Self {
            executable_path: String::new(),
            model_path: String::new(),
            language: ExternalLanguage::default(),
            disable_gpu: false,
        }
    }
}

/// Audio input configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AudioConfig {
    /// Stable UID of the selected input device (None for system default)
    pub selected_mic_uid: Option<String>,
}

/// Page advancement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    /// Advance to the next page automatically when a page completes
    pub auto_next_page: bool,
    /// Delay before auto-advancing, in seconds
    pub auto_next_page_delay: u32,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            auto_next_page: true,
            auto_next_page_delay: 1,
        }
    }
}

/// Root of Telecue's on-disk state (`~/.telecue`).
fn state_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".telecue"))
        .unwrap_or_else(|| std::env::temp_dir().join("telecue"))
}

/// Path of the persisted config file.
pub fn get_config_path() -> PathBuf {
    state_root().join("config.json")
}

/// Bring an older config up to the current schema.
///
/// Pure: callers decide whether an upgraded config is written back.
/// Configs from a newer build are refused rather than silently
/// truncated.
fn upgrade(mut config: Config) -> Result<Config> {
    if config.version > CURRENT_VERSION {
        bail!(
            "config version {} is newer than this build supports",
            config.version
        );
    }
    while config.version < CURRENT_VERSION {
        match config.version {
            0 => config.version = 1,
            v => bail!("no upgrade path from config version {v}"),
        }
    }
    Ok(config)
}

fn load() -> Result<Config> {
    let path = get_config_path();
    if !path.exists() {
        tracing::info!("No config file yet, using defaults");
        return Ok(Config::default());
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let parsed: Config =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;

    let from = parsed.version;
    let config = upgrade(parsed)?;
    if config.version != from {
        tracing::info!("Upgraded config schema {} -> {}", from, config.version);
        if let Err(e) = store(&config) {
            tracing::warn!("Could not persist upgraded config: {e:#}");
        }
    }
    Ok(config)
}

fn store(config: &Config) -> Result<()> {
    let path = get_config_path();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let raw = serde_json::to_string_pretty(config).context("serialising config")?;
    std::fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))
}

fn cache() -> &'static RwLock<Config> {
    CONFIG.get_or_init(|| {
        let config = load().unwrap_or_else(|e| {
            tracing::error!("Config unreadable ({e:#}), using defaults");
            Config::default()
        });
        tracing::info!(
            "Config ready: engine_mode={:?}, mic_uid={:?}",
            config.speech.engine_mode,
            config.audio.selected_mic_uid
        );
        RwLock::new(config)
    })
}

/// Get the current configuration
///
/// Cached in memory; loaded from disk on first access.
pub fn get_config() -> Config {
    cache().read().clone()
}

/// Replace the configuration and persist it.
///
/// An incoming config with no microphone selected does not clear an
/// existing selection: generic saves from the settings UI must not wipe
/// the device preference. [`set_selected_mic`] is the intentional path.
pub fn set_config(mut config: Config) -> Result<()> {
    config.version = CURRENT_VERSION;

    if config.audio.selected_mic_uid.is_none() {
        config.audio.selected_mic_uid = cache().read().audio.selected_mic_uid.clone();
    }

    store(&config)?;
    *cache().write() = config;
    Ok(())
}

/// Change the selected microphone, including clearing it to None for
/// "System Default".
pub fn set_selected_mic(uid: Option<String>) -> Result<()> {
    let mut cached = cache().write();
    cached.audio.selected_mic_uid = uid;
    store(&cached)?;
    tracing::info!("Microphone selection: {:?}", cached.audio.selected_mic_uid);
    Ok(())
}

/// Persist a resolved external-executable path back to settings.
///
/// Called when the configured path was invalid and a probe of the
/// default install locations found a working binary.
pub fn set_external_executable_path(path: String) -> Result<()> {
    let mut cached = cache().write();
    cached.external.executable_path = path;
    store(&cached)?;
    tracing::info!(
        "External recogniser path: {}",
        cached.external.executable_path
    );
    Ok(())
}

/// Reset configuration to defaults
pub fn reset_config() -> Result<Config> {
    let defaults = Config::default();
    store(&defaults)?;
    *cache().write() = defaults.clone();
    tracing::info!("Configuration reset to defaults");
    Ok(defaults)
}
