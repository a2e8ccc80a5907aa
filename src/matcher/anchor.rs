//! Global anchor search over the compact index
//!
//! The segment backend only ever sees a short transcript of the latest
//! speech slice, so the base matchers underestimate progress when the
//! speaker skips ahead. The anchor search scans the whole compact page
//! for the hypothesis and proposes a forward cursor, with a repetition
//! classifier that keeps repeated passages from yanking the cursor to
//! the wrong occurrence.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use crate::script::CompactIndex;

/// Minimum compact-hypothesis length eligible for anchoring.
const MIN_QUERY_LEN: usize = 4;
/// Minimum compact-hypothesis length eligible for exact whole-query scan.
const MIN_EXACT_LEN: usize = 6;
/// First-letter candidate count beyond which a second letter is required.
const FIRST_LETTER_CANDIDATE_LIMIT: usize = 240;
/// Hard cap on fuzzy candidate windows per search.
const CANDIDATE_CAP: usize = 320;
/// Two agreeing far anchors within this window commit the jump.
pub const CONFIRM_WINDOW: Duration = Duration::from_millis(1800);

/// Debounce state for a far jump awaiting confirmation.
#[derive(Debug, Clone)]
pub struct PendingAnchorJump {
    pub target: usize,
    pub hits: u32,
    pub at: Instant,
}

/// Distance beyond which an anchored offset counts as a far jump.
pub fn far_jump_threshold(query_len: usize) -> usize {
    (query_len * 7).clamp(90, 260)
}

/// How close two consecutive far anchors must land to count as agreeing.
pub fn jump_tolerance(query_len: usize) -> usize {
    (query_len * 6).max(60)
}

/// How the hypothesis relates to repeated material in the script.
#[derive(Debug, Clone, Copy)]
struct RepetitionContext {
    /// The hypothesis (or its seed) also occurs behind the cursor, or the
    /// seed repeats ahead of it: resolve to the nearest forward match.
    prefer_nearest: bool,
    /// Unambiguous text: distant anchors are trustworthy.
    allow_far_jump: bool,
}

fn find_occurrences(haystack: &[char], needle: &[char]) -> Vec<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return Vec::new();
    }
    (0..=haystack.len() - needle.len())
        .filter(|&i| haystack[i..i + needle.len()] == *needle)
        .collect()
}

fn classify(compact: &[char], compact_cursor: usize, query: &[char]) -> RepetitionContext {
    let has_prior_exact = find_occurrences(compact, query)
        .iter()
        .any(|&i| i + query.len() <= compact_cursor);

    let seed = &query[..query.len().min(6)];
    let seed_occurrences = find_occurrences(compact, seed);
    let has_prior_seed = seed_occurrences
        .iter()
        .any(|&i| i + seed.len() <= compact_cursor);
    let forward_duplicate_seed = seed_occurrences
        .iter()
        .filter(|&&i| i >= compact_cursor)
        .count()
        >= 2;

    let prefer_nearest = has_prior_exact || has_prior_seed || forward_duplicate_seed;
    RepetitionContext {
        prefer_nearest,
        allow_far_jump: !prefer_nearest,
    }
}

/// Local-distance cap applied to anchors in ambiguous contexts.
fn strict_local_limit(query_len: usize) -> usize {
    (query_len * 6).clamp(70, 220)
}

fn similarity_threshold(query_len: usize, ctx: RepetitionContext) -> f32 {
    let base: f32 = if query_len <= 7 {
        0.45
    } else if query_len <= 11 {
        0.52
    } else {
        0.58
    };
    if ctx.prefer_nearest {
        (base - 0.12).max(0.32)
    } else {
        base
    }
}

/// Soft distance limit a candidate may only exceed with near-exact
/// similarity. Unlimited for very long queries.
fn soft_jump_limit(query_len: usize) -> Option<usize> {
    if query_len <= 12 {
        Some(420)
    } else if query_len <= 20 {
        Some(700)
    } else if query_len <= 32 {
        Some(1000)
    } else {
        None
    }
}

fn local_bias_limit(query_len: usize) -> usize {
    if query_len <= 7 {
        220
    } else if query_len <= 11 {
        320
    } else if query_len <= 20 {
        450
    } else {
        600
    }
}

fn similarity_slack(query_len: usize) -> f32 {
    if query_len <= 7 {
        0.02
    } else if query_len <= 11 {
        0.05
    } else {
        0.08
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    end: usize,
    distance: usize,
    similarity: f32,
}

fn nearest_first(a: &Candidate, b: &Candidate) -> Ordering {
    a.distance
        .cmp(&b.distance)
        .then(
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal),
        )
        .then(a.end.cmp(&b.end))
}

/// Whole-query exact scan. Nearest forward occurrence wins.
fn exact_anchor(
    index: &CompactIndex,
    query: &[char],
    recognized: usize,
    ctx: RepetitionContext,
) -> Option<usize> {
    if query.len() < MIN_EXACT_LEN {
        return None;
    }

    let mut best: Option<(usize, usize)> = None;
    for i in find_occurrences(index.chars(), query) {
        let end = index.end_offset(i + query.len() - 1);
        if end < recognized {
            continue;
        }
        let distance = end - recognized;
        if !ctx.allow_far_jump && !ctx.prefer_nearest && distance > strict_local_limit(query.len())
        {
            continue;
        }
        if best.map_or(true, |(d, _)| distance < d) {
            best = Some((distance, end));
        }
    }
    best.map(|(_, end)| end)
}

/// Windowed fuzzy scan with candidate pruning.
fn fuzzy_anchor(
    index: &CompactIndex,
    query: &[char],
    recognized: usize,
    ctx: RepetitionContext,
) -> Option<usize> {
    let compact = index.chars();
    let window_count = compact.len() - query.len() + 1;

    let mut starts: Vec<usize> = (0..window_count)
        .filter(|&i| compact[i] == query[0])
        .collect();
    if starts.len() > FIRST_LETTER_CANDIDATE_LIMIT && query.len() >= 2 {
        starts.retain(|&i| compact[i + 1] == query[1]);
    }
    if starts.is_empty() {
        // Coarse fallback: stride the page when the first letter never occurs.
        let stride = (query.len() / 3).max(1);
        starts = (0..window_count).step_by(stride).collect();
    }
    if starts.len() > CANDIDATE_CAP {
        let stride = starts.len().div_ceil(CANDIDATE_CAP);
        starts = starts.into_iter().step_by(stride).collect();
    }

    let threshold = similarity_threshold(query.len(), ctx);
    let strict_limit = strict_local_limit(query.len());
    let soft_limit = soft_jump_limit(query.len());
    let query_string: String = query.iter().collect();

    let mut candidates: Vec<Candidate> = Vec::new();
    for &i in &starts {
        let window = &compact[i..i + query.len()];

        // Cheap pruning: a plausible window shares a character with the
        // query's head or tail.
        if query.len() >= 8 {
            let head = &query[..3];
            let tail = &query[query.len() - 3..];
            if !window.iter().any(|c| head.contains(c) || tail.contains(c)) {
                continue;
            }
        }

        let window_string: String = window.iter().collect();
        let distance_edits = strsim::levenshtein(&query_string, &window_string);
        let similarity = 1.0 - distance_edits as f32 / query.len() as f32;
        if similarity < threshold {
            continue;
        }

        let end = index.end_offset(i + query.len() - 1);
        if end < recognized {
            continue;
        }
        let distance = end - recognized;
        if !ctx.allow_far_jump && !ctx.prefer_nearest && distance > strict_limit {
            continue;
        }
        if let Some(soft) = soft_limit {
            if distance > soft && similarity < 0.82 {
                continue;
            }
        }

        candidates.push(Candidate { end, distance, similarity });
    }

    if candidates.is_empty() {
        return None;
    }

    if ctx.prefer_nearest {
        candidates.sort_by(nearest_first);
        return Some(candidates[0].end);
    }

    let best_similarity = candidates
        .iter()
        .map(|c| c.similarity)
        .fold(f32::MIN, f32::max);

    // Local lock: a nearby candidate close to the best similarity beats
    // everything further out.
    let lock_floor = (threshold + 0.08).max(best_similarity - 0.10);
    let locked = candidates
        .iter()
        .filter(|c| c.distance <= local_bias_limit(query.len()) && c.similarity >= lock_floor)
        .min_by(|a, b| nearest_first(a, b));
    if let Some(hit) = locked {
        return Some(hit.end);
    }

    if !ctx.allow_far_jump {
        // Ambiguous repeat context with no local candidate: hold progress.
        return None;
    }

    let floor = threshold.max(best_similarity - similarity_slack(query.len()));
    candidates.retain(|c| c.similarity >= floor);
    candidates.sort_by(nearest_first);
    candidates.first().map(|c| c.end)
}

/// Search the whole page for the hypothesis and return the proposed
/// cursor (original end offset), or `None` when the context is too
/// ambiguous or nothing scores above threshold.
pub fn find_anchor(
    index: &CompactIndex,
    hypothesis_compact: &[char],
    recognized: usize,
) -> Option<usize> {
    let query = hypothesis_compact;
    if query.len() < MIN_QUERY_LEN || query.len() > index.len() {
        return None;
    }

    let compact_cursor = index.compact_pos_at(recognized);
    let ctx = classify(index.chars(), compact_cursor, query);

    exact_anchor(index, query, recognized, ctx)
        .or_else(|| fuzzy_anchor(index, query, recognized, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{normalize_compact, ScriptPage};

    fn index_for(text: &str) -> CompactIndex {
        ScriptPage::new(text).compact().clone()
    }

    #[test]
    fn test_short_query_rejected() {
        let index = index_for("some ordinary page text");
        assert_eq!(find_anchor(&index, &normalize_compact("abc"), 0), None);
    }

    #[test]
    fn test_query_longer_than_page_rejected() {
        let index = index_for("tiny");
        let query = normalize_compact("much longer than the page");
        assert_eq!(find_anchor(&index, &query, 0), None);
    }

    #[test]
    fn test_exact_forward_anchor() {
        let page = "alpha bravo charlie delta echo foxtrot";
        let index = index_for(page);
        let query = normalize_compact("charlie delta");
        let end = find_anchor(&index, &query, 0).expect("anchor");
        // End of "delta" in the original text.
        assert_eq!(end, page.find("delta").unwrap() + "delta".len());
    }

    #[test]
    fn test_anchor_behind_cursor_is_discarded() {
        let page = "alpha bravo charlie delta echo foxtrot";
        let index = index_for(page);
        let cursor = page.find("echo").unwrap();
        let query = normalize_compact("alpha bravo");
        assert_eq!(find_anchor(&index, &query, cursor), None);
    }

    #[test]
    fn test_repeated_passage_resolves_to_nearest() {
        let page = "The product is fast. The product is cheap. The product is easy.";
        let index = index_for(page);
        // Cursor just past the first sentence.
        let end = find_anchor(&index, &normalize_compact("the product is"), 20).expect("anchor");
        // Nearest forward occurrence: end of "is" in the second sentence.
        assert_eq!(end, 35);
    }

    #[test]
    fn test_fuzzy_anchor_tolerates_recognition_noise() {
        let page = "alpha bravo charlie delta echo foxtrot golf hotel";
        let index = index_for(page);
        // "charlie delta" with two characters garbled.
        let end = find_anchor(&index, &normalize_compact("charlee deltu"), 0).expect("anchor");
        assert_eq!(end, page.find("delta").unwrap() + "delta".len());
    }

    #[test]
    fn test_far_jump_threshold_brackets() {
        assert_eq!(far_jump_threshold(4), 90);
        assert_eq!(far_jump_threshold(20), 140);
        assert_eq!(far_jump_threshold(60), 260);
    }

    #[test]
    fn test_jump_tolerance_floor() {
        assert_eq!(jump_tolerance(4), 60);
        assert_eq!(jump_tolerance(20), 120);
    }

    #[test]
    fn test_classifier_flags_prior_occurrence() {
        let page = "the quick fox and then the quick fox again plus more text here";
        let index = index_for(page);
        let query = normalize_compact("the quick fox");
        let cursor = page.find("again").unwrap();
        let ctx = classify(index.chars(), index.compact_pos_at(cursor), &query);
        assert!(ctx.prefer_nearest);
        assert!(!ctx.allow_far_jump);
    }

    #[test]
    fn test_classifier_allows_far_jump_for_unique_text() {
        let page = "alpha bravo charlie delta echo foxtrot golf hotel india juliet";
        let index = index_for(page);
        let query = normalize_compact("golf hotel");
        let ctx = classify(index.chars(), 0, &query);
        assert!(!ctx.prefer_nearest);
        assert!(ctx.allow_far_jump);
    }
}
