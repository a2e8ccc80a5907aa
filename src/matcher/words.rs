//! Word-level base matcher
//!
//! Tokenises the script tail and the hypothesis on whitespace and walks
//! them with fuzzy per-token comparison. Stage directions and other
//! annotation tokens in the script are consumed automatically: they count
//! toward progress but never require a spoken equivalent.

/// How many tokens either side may be skipped to re-synchronise.
const TOKEN_LOOKAHEAD: usize = 3;

/// A script token with its end offset in the scanned tail.
#[derive(Debug)]
struct ScriptToken {
    lower: String,
    /// End offset (in chars, relative to the tail) just past the token.
    end: usize,
    /// `[…]` tokens and tokens with no letters or digits.
    annotation: bool,
}

fn tokenize_tail(tail: &[char]) -> Vec<ScriptToken> {
    let mut tokens = Vec::new();
    let mut start = None;

    for (i, &c) in tail.iter().enumerate() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                tokens.push(make_token(&tail[s..i], i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        tokens.push(make_token(&tail[s..], tail.len()));
    }

    tokens
}

fn make_token(word: &[char], end: usize) -> ScriptToken {
    let bracketed = word.len() >= 2 && word[0] == '[' && word[word.len() - 1] == ']';
    let annotation = bracketed || !word.iter().any(|c| c.is_alphanumeric());
    let lower: String = word.iter().flat_map(|c| c.to_lowercase()).collect();
    ScriptToken { lower, end, annotation }
}

/// Fuzzy token equivalence, tolerant of STT phonetic prefixes and small
/// recognition errors.
pub fn is_fuzzy_match(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    if a.starts_with(b) || b.starts_with(a) {
        return true;
    }
    if a.contains(b) || b.contains(a) {
        return true;
    }

    let a_len = a.chars().count();
    let b_len = b.chars().count();
    let shorter = a_len.min(b_len);
    let shared = a
        .chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .count();
    let needed = (((shorter as f32) * 0.6).ceil() as usize).max(2);
    if shared >= needed {
        return true;
    }

    let longer = a_len.max(b_len);
    let allowed = if longer <= 4 {
        1
    } else if longer <= 8 {
        2
    } else {
        longer / 3
    };
    strsim::levenshtein(a, b) <= allowed
}

/// Match the hypothesis against the script tail word by word.
///
/// Returns the end offset (in chars, relative to `tail`) just past the
/// last consumed script token.
pub fn match_prefix(tail: &[char], hypothesis: &str) -> usize {
    let script = tokenize_tail(tail);
    let hyp: Vec<String> = hypothesis
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();

    let mut si = 0;
    let mut hi = 0;
    let mut progress = 0;

    while si < script.len() {
        if hi >= hyp.len() {
            break;
        }

        let token = &script[si];
        if token.annotation {
            progress = token.end;
            si += 1;
            continue;
        }

        if is_fuzzy_match(&token.lower, &hyp[hi]) {
            progress = token.end;
            si += 1;
            hi += 1;
            continue;
        }

        // Inserted hypothesis tokens (hallucinations): skip them.
        if let Some(k) = (1..=TOKEN_LOOKAHEAD)
            .find(|&k| hi + k < hyp.len() && is_fuzzy_match(&token.lower, &hyp[hi + k]))
        {
            hi += k;
            continue;
        }

        // Unrecognised script tokens: skip and credit them as read.
        if let Some(k) = (1..=TOKEN_LOOKAHEAD)
            .find(|&k| si + k < script.len() && is_fuzzy_match(&script[si + k].lower, &hyp[hi]))
        {
            progress = script[si + k - 1].end;
            si += k;
            continue;
        }

        hi += 1;
    }

    // Annotations at the very end of the page never block completion.
    if progress > 0 && script[si..].iter().all(|t| t.annotation) {
        if let Some(last) = script.last() {
            progress = progress.max(last.end);
        }
    }

    progress
}
