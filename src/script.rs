//! Script pages and the compact index
//!
//! A script is an ordered sequence of pages; only the active page is
//! tracked. The compact index projects a page down to its letters and
//! digits (lowercased) while remembering, for every compact character,
//! the end offset in the original page after consuming it. The matcher
//! works on the compact projection and maps results back through the
//! index.

use serde::{Deserialize, Serialize};

/// Letter/digit-only lowercased projection of a page, plus the mapping
/// back to original character offsets.
///
/// Invariant: `chars.len() == end_offsets.len()` and `end_offsets` is
/// non-decreasing.
#[derive(Debug, Clone)]
pub struct CompactIndex {
    chars: Vec<char>,
    /// 1-based end offset into the original page (in chars) after
    /// consuming the compact character at the same position.
    end_offsets: Vec<usize>,
}

impl CompactIndex {
    /// Build the index from the original page characters.
    pub fn build(original: &[char]) -> Self {
        let mut chars = Vec::with_capacity(original.len());
        let mut end_offsets = Vec::with_capacity(original.len());

        for (i, &c) in original.iter().enumerate() {
            if c.is_alphanumeric() {
                for lower in c.to_lowercase() {
                    chars.push(lower);
                    end_offsets.push(i + 1);
                }
            }
        }

        debug_assert_eq!(chars.len(), end_offsets.len());
        Self { chars, end_offsets }
    }

    /// The compact characters.
    pub fn chars(&self) -> &[char] {
        &self.chars
    }

    /// Number of compact characters.
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    /// Whether the page contained no letters or digits at all.
    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// Original end offset (1-based, in chars) after consuming the
    /// compact character at `pos`.
    pub fn end_offset(&self, pos: usize) -> usize {
        self.end_offsets[pos]
    }

    /// Number of compact characters fully consumed within the first
    /// `original_offset` characters of the page.
    pub fn compact_pos_at(&self, original_offset: usize) -> usize {
        self.end_offsets.partition_point(|&end| end <= original_offset)
    }
}

/// One page of the script, with its compact index built once per session.
#[derive(Debug, Clone)]
pub struct ScriptPage {
    text: String,
    chars: Vec<char>,
    compact: CompactIndex,
}

impl ScriptPage {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let chars: Vec<char> = text.chars().collect();
        let compact = CompactIndex::build(&chars);
        Self { text, chars, compact }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Page length in characters; the cursor never exceeds this.
    pub fn char_len(&self) -> usize {
        self.chars.len()
    }

    pub fn chars(&self) -> &[char] {
        &self.chars
    }

    pub fn compact(&self) -> &CompactIndex {
        &self.compact
    }
}

/// Lowercase letter/digit projection of a hypothesis, matching the
/// compact-index normalisation.
pub fn normalize_compact(text: &str) -> Vec<char> {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Dominant CJK writing system of a script, if any.
///
/// Used as a locale hint when the preferred recognition locale is not
/// supported: a script that is mostly Han/Kana/Hangul text is a strong
/// signal for the recognition language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CjkHint {
    /// Han ideographs (Chinese)
    Han,
    /// Hiragana/Katakana (Japanese)
    Kana,
    /// Hangul (Korean)
    Hangul,
}

impl CjkHint {
    /// BCP-47 language code for this writing system.
    pub fn language_code(self) -> &'static str {
        match self {
            CjkHint::Han => "zh",
            CjkHint::Kana => "ja",
            CjkHint::Hangul => "ko",
        }
    }
}

/// Count codepoints in the Han / Kana / Hangul ranges and return the
/// dominant system, or `None` if the text contains none of them.
pub fn dominant_cjk_hint(text: &str) -> Option<CjkHint> {
    let mut han = 0usize;
    let mut kana = 0usize;
    let mut hangul = 0usize;

    for c in text.chars() {
        match c as u32 {
            // CJK Unified Ideographs + Extension A
            0x4E00..=0x9FFF | 0x3400..=0x4DBF => han += 1,
            // Hiragana + Katakana
            0x3040..=0x309F | 0x30A0..=0x30FF => kana += 1,
            // Hangul syllables + Jamo
            0xAC00..=0xD7AF | 0x1100..=0x11FF => hangul += 1,
            _ => {}
        }
    }

    let max = han.max(kana).max(hangul);
    if max == 0 {
        return None;
    }
    if max == han {
        Some(CjkHint::Han)
    } else if max == kana {
        Some(CjkHint::Kana)
    } else {
        Some(CjkHint::Hangul)
    }
}
