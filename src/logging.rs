//! Logging setup for the CLI driver
//!
//! Library code only emits `tracing` events; the binary decides where
//! they go. Output lands on stdout and in a per-day log file under
//! `~/.telecue/logs/`, so a long rehearsal session can be inspected
//! afterwards without digging through one ever-growing file.

use std::fs::{File, OpenOptions};

use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the default log filter. `RUST_LOG`
/// is honoured as well when this one is unset.
const LOG_ENV: &str = "TELECUE_LOG";

/// Local wall-clock timestamps; rehearsals are scheduled in local time.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

fn log_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn log_file_name(date: chrono::NaiveDate) -> String {
    format!("telecue-{}.log", date.format("%Y%m%d"))
}

fn open_log_file() -> Option<File> {
    let dir = dirs::home_dir()?.join(".telecue").join("logs");
    std::fs::create_dir_all(&dir).ok()?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(log_file_name(chrono::Local::now().date_naive())))
        .ok()
}

/// Initialise stdout + file logging. Call once, from the binary.
///
/// When the log directory cannot be created (sandboxed or homeless
/// environments) logging degrades to stdout only.
pub fn init_logging() {
    let timer = ChronoLocal::new(TIMESTAMP_FORMAT.to_string());
    let stdout_layer = tracing_subscriber::fmt::layer().with_timer(timer.clone());
    let base = tracing_subscriber::registry()
        .with(log_filter())
        .with(stdout_layer);

    match open_log_file() {
        Some(file) => base
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(timer)
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
            .init(),
        None => base.init(),
    }
}
