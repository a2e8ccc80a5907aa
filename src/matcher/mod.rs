//! Fuzzy script matcher
//!
//! Decides whether (and how far) an incoming transcription hypothesis
//! moves the read cursor. Two base matchers (character-level and
//! word-level) scan from a bounded lookback offset and the better result
//! wins. Under the segment backend a global anchor search can override
//! upward, with far jumps requiring two agreeing observations before
//! they commit.

pub mod anchor;
pub mod chars;
pub mod words;

use std::time::Instant;

use crate::backend::BackendKind;
use crate::script::{normalize_compact, ScriptPage};
use anchor::{far_jump_threshold, jump_tolerance, PendingAnchorJump, CONFIRM_WINDOW};

/// Lookback window retained behind the cursor after segment progress.
const SEGMENT_LOOKBACK: usize = 24;

/// Per-update cap on base-matcher advance under the segment backend.
fn base_advance_ceiling(compact_hyp_len: usize) -> usize {
    (compact_hyp_len * 7).clamp(28, 180)
}

/// Result of feeding one hypothesis to the matcher.
#[derive(Debug, Clone, Copy)]
pub struct MatchOutcome {
    /// The cursor after this update.
    pub recognized: usize,
    /// Whether the cursor moved.
    pub advanced: bool,
    /// Whether a confirmed far jump moved it.
    pub committed_far_jump: bool,
}

/// Tracks the read cursor for one page of the script.
///
/// The cursor is monotone non-decreasing except through [`MatchEngine::jump_to`].
pub struct MatchEngine {
    page: ScriptPage,
    backend_kind: BackendKind,
    recognized: usize,
    match_start: usize,
    pending: Option<PendingAnchorJump>,
}

impl MatchEngine {
    pub fn new(page: ScriptPage, backend_kind: BackendKind) -> Self {
        Self {
            page,
            backend_kind,
            recognized: 0,
            match_start: 0,
            pending: None,
        }
    }

    pub fn page(&self) -> &ScriptPage {
        &self.page
    }

    /// Confirmed prefix length into the page, in chars.
    pub fn recognized(&self) -> usize {
        self.recognized
    }

    /// Lower bound for base-matcher scanning. Always `<= recognized()`.
    pub fn match_start(&self) -> usize {
        self.match_start
    }

    /// Whether the whole page has been read.
    pub fn is_complete(&self) -> bool {
        self.recognized >= self.page.char_len()
    }

    /// Feed one hypothesis and advance the cursor.
    pub fn observe(&mut self, hypothesis: &str) -> MatchOutcome {
        self.observe_at(hypothesis, Instant::now())
    }

    /// Like [`MatchEngine::observe`] with an explicit clock, so the
    /// far-jump confirmation window is testable.
    pub fn observe_at(&mut self, hypothesis: &str, now: Instant) -> MatchOutcome {
        // A confirmation that never saw its second anchor expires.
        if let Some(pending) = &self.pending {
            if now.duration_since(pending.at) > CONFIRM_WINDOW {
                self.pending = None;
            }
        }

        let tail = &self.page.chars()[self.match_start..];
        let by_chars = chars::match_prefix(tail, hypothesis);
        let by_words = words::match_prefix(tail, hypothesis);
        let mut proposed = self.match_start + by_chars.max(by_words);

        let hyp_compact = normalize_compact(hypothesis);
        if self.backend_kind == BackendKind::Segment {
            // A short segment transcript cannot legitimately confirm a
            // huge stretch of script in one update.
            proposed = proposed.min(self.recognized + base_advance_ceiling(hyp_compact.len()));
        }

        let mut next = self.recognized.max(proposed);
        let mut committed_far_jump = false;

        if self.backend_kind == BackendKind::Segment {
            if let Some(target) =
                anchor::find_anchor(self.page.compact(), &hyp_compact, self.recognized)
            {
                if target > self.recognized + far_jump_threshold(hyp_compact.len()) {
                    let hits = match &self.pending {
                        Some(p)
                            if target.abs_diff(p.target) <= jump_tolerance(hyp_compact.len())
                                && now.duration_since(p.at) <= CONFIRM_WINDOW =>
                        {
                            p.hits + 1
                        }
                        _ => 1,
                    };
                    if hits >= 2 {
                        next = next.max(target);
                        committed_far_jump = true;
                        self.pending = None;
                    } else {
                        self.pending = Some(PendingAnchorJump { target, hits, at: now });
                    }
                } else {
                    next = next.max(target);
                    self.pending = None;
                }
            }
        }

        let advanced = next > self.recognized;
        self.recognized = next.min(self.page.char_len());
        if advanced && self.backend_kind == BackendKind::Segment {
            self.match_start = self.recognized.saturating_sub(SEGMENT_LOOKBACK);
        }

        MatchOutcome {
            recognized: self.recognized,
            advanced,
            committed_far_jump,
        }
    }

    /// User-initiated jump: the cursor may move in either direction.
    pub fn jump_to(&mut self, offset: usize) {
        let offset = offset.min(self.page.char_len());
        self.recognized = offset;
        self.match_start = offset;
        self.pending = None;
    }

    /// Re-enter tracking at the current cursor after a pause.
    pub fn resume(&mut self) {
        self.match_start = self.recognized;
    }
}
