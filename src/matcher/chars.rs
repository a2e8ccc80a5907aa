//! Character-level base matcher
//!
//! Walks the script tail and the hypothesis in lockstep over their
//! letter/digit projections. Small desyncs (inserted or dropped STT
//! characters) are absorbed by a bounded lookahead on either side; runs
//! of substitutions advance both pointers without crediting progress, so
//! a hallucinated stretch cannot drag the cursor forward.

/// How far ahead either pointer may look to re-synchronise on a mismatch.
const RESYNC_LOOKAHEAD: usize = 3;

/// Match the hypothesis against the script tail character by character.
///
/// Returns the end offset (in chars, relative to `tail`) of the last
/// script character confirmed by the hypothesis. Zero when nothing
/// matched.
pub fn match_prefix(tail: &[char], hypothesis: &str) -> usize {
    // Letter/digit projection of the tail, each entry carrying the end
    // offset in the original tail after consuming it.
    let script: Vec<(char, usize)> = tail
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_alphanumeric())
        .flat_map(|(i, c)| c.to_lowercase().map(move |lower| (lower, i + 1)))
        .collect();
    let hyp: Vec<char> = crate::script::normalize_compact(hypothesis);

    let mut si = 0;
    let mut hi = 0;
    let mut confirmed = 0;

    while si < script.len() && hi < hyp.len() {
        if script[si].0 == hyp[hi] {
            confirmed = script[si].1;
            si += 1;
            hi += 1;
            continue;
        }

        // An inserted hypothesis character: skip ahead in the hypothesis.
        if let Some(k) = (1..=RESYNC_LOOKAHEAD)
            .find(|&k| hi + k < hyp.len() && hyp[hi + k] == script[si].0)
        {
            hi += k;
            continue;
        }

        // A dropped script character: skip ahead in the script.
        if let Some(k) = (1..=RESYNC_LOOKAHEAD)
            .find(|&k| si + k < script.len() && script[si + k].0 == hyp[hi])
        {
            si += k;
            continue;
        }

        // Substitution: advance both pointers but do not credit progress.
        si += 1;
        hi += 1;
    }

    confirmed
}
