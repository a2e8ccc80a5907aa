//! Telecue CLI driver
//!
//! Runs a tracking session against a UTF-8 script file and prints cursor
//! updates. Pages are separated by blank lines. This is the minimal host
//! around the engine; the real UI replaces it.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use telecue::session::SessionState;
use telecue::SessionController;

fn split_pages(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(|page| page.trim().to_string())
        .filter(|page| !page.is_empty())
        .collect()
}

fn run() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("usage: telecue <script.txt>"))?;

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("could not read {}", path))?;

    let pages = split_pages(&text);
    if pages.is_empty() {
        return Err(anyhow!("{} contains no script text", path));
    }
    tracing::info!("Loaded {} page(s) from {}", pages.len(), path);

    let config = telecue::config::get_config();
    let controller = SessionController::builder(config).build();
    let updates = controller.subscribe();

    controller.start(pages).context("could not start session")?;

    let mut last_cursor = usize::MAX;
    let mut last_state = SessionState::Idle;
    loop {
        let snapshot = match updates.recv_timeout(Duration::from_secs(60)) {
            Ok(snapshot) => snapshot,
            Err(_) => continue,
        };

        if snapshot.state != last_state {
            last_state = snapshot.state;
            println!("[{:?}] {}", snapshot.state, snapshot.state.description());
            if let Some(error) = &snapshot.error {
                eprintln!("  {}", error);
            }
        }

        if snapshot.recognized_char_count != last_cursor {
            last_cursor = snapshot.recognized_char_count;
            println!(
                "page {} cursor {} ({})",
                snapshot.page_index + 1,
                snapshot.recognized_char_count,
                snapshot.last_spoken_text
            );
        }

        match snapshot.state {
            SessionState::Completed => {
                println!("Done.");
                break;
            }
            SessionState::Paused => {
                eprintln!("Session paused; exiting.");
                break;
            }
            _ => {}
        }
    }

    controller.stop();
    Ok(())
}

fn main() {
    telecue::logging::init_logging();

    if let Err(e) = run() {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}
