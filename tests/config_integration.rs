//! Configuration persistence integration tests for Telecue.
//!
//! Exercises the on-disk format round-trip using temporary files, so the
//! real `~/.telecue/config.json` is never touched.

use std::fs;
use tempfile::TempDir;

use telecue::config::{
    Config, ExternalLanguage, ListeningMode, PagingConfig, SpeechEngineMode,
};

fn write_config(dir: &TempDir, config: &Config) -> std::path::PathBuf {
    let path = dir.path().join("config.json");
    let contents = serde_json::to_string_pretty(config).unwrap();
    fs::write(&path, contents).unwrap();
    path
}

fn read_config(path: &std::path::Path) -> Config {
    let contents = fs::read_to_string(path).unwrap();
    serde_json::from_str(&contents).unwrap()
}

#[test]
fn test_default_config_round_trips_through_disk() {
    let dir = TempDir::new().unwrap();
    let config = Config::default();

    let path = write_config(&dir, &config);
    let loaded = read_config(&path);

    assert_eq!(loaded.version, config.version);
    assert_eq!(loaded.speech.locale, "en-US");
    assert_eq!(loaded.speech.engine_mode, SpeechEngineMode::Platform);
    assert_eq!(loaded.speech.listening_mode, ListeningMode::WordTracking);
    assert_eq!(loaded.audio.selected_mic_uid, None);
}

#[test]
fn test_customised_config_survives_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.speech.locale = "zh-CN".to_string();
    config.speech.engine_mode = SpeechEngineMode::ExternalStream;
    config.speech.listening_mode = ListeningMode::SilencePaused;
    config.external.executable_path = "/opt/asr/bin/sense-voice-stream".to_string();
    config.external.model_path = "/opt/asr/models/sense-voice".to_string();
    config.external.language = ExternalLanguage::Zh;
    config.external.disable_gpu = true;
    config.audio.selected_mic_uid = Some("usb-audio-7".to_string());
    config.paging = PagingConfig {
        auto_next_page: false,
        auto_next_page_delay: 3,
    };

    let path = write_config(&dir, &config);
    let loaded = read_config(&path);

    assert_eq!(loaded.speech.locale, "zh-CN");
    assert_eq!(loaded.speech.engine_mode, SpeechEngineMode::ExternalStream);
    assert_eq!(loaded.speech.listening_mode, ListeningMode::SilencePaused);
    assert_eq!(
        loaded.external.executable_path,
        "/opt/asr/bin/sense-voice-stream"
    );
    assert_eq!(loaded.external.language, ExternalLanguage::Zh);
    assert!(loaded.external.disable_gpu);
    assert_eq!(loaded.audio.selected_mic_uid, Some("usb-audio-7".to_string()));
    assert!(!loaded.paging.auto_next_page);
    assert_eq!(loaded.paging.auto_next_page_delay, 3);
}

#[test]
fn test_sparse_config_file_fills_in_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    fs::write(
        &path,
        r#"{"version": 1, "external": {"language": "yue"}}"#,
    )
    .unwrap();

    let loaded = read_config(&path);
    assert_eq!(loaded.external.language, ExternalLanguage::Yue);
    // Everything else falls back to defaults.
    assert_eq!(loaded.speech.locale, "en-US");
    assert!(loaded.paging.auto_next_page);
}

#[test]
fn test_unknown_fields_from_newer_versions_are_tolerated() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    fs::write(
        &path,
        r#"{
            "version": 1,
            "speech": {"locale": "ko-KR", "future_option": true},
            "brand_new_section": {"x": 1}
        }"#,
    )
    .unwrap();

    let loaded = read_config(&path);
    assert_eq!(loaded.speech.locale, "ko-KR");
    assert_eq!(loaded.version, 1);
}

#[test]
fn test_pretty_printed_format_is_stable_json() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, &Config::default());
    let contents = fs::read_to_string(&path).unwrap();

    // The persisted file stays human-editable.
    assert!(contents.contains("\"speech\""));
    assert!(contents.contains("\"external\""));
    assert!(contents.contains("\"listening_mode\": \"word_tracking\""));
    assert!(contents.contains('\n'));
}

#[test]
fn test_enum_wire_values_match_settings_contract() {
    // These string values are shared with the settings UI; renaming a
    // variant would silently reset user preferences.
    assert_eq!(
        serde_json::to_string(&SpeechEngineMode::ExternalStream).unwrap(),
        "\"external_stream\""
    );
    assert_eq!(
        serde_json::to_string(&ListeningMode::Classic).unwrap(),
        "\"classic\""
    );
    assert_eq!(serde_json::to_string(&ExternalLanguage::Auto).unwrap(), "\"auto\"");
    assert_eq!(serde_json::to_string(&ExternalLanguage::Ja).unwrap(), "\"ja\"");
}
