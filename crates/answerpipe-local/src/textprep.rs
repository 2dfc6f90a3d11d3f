//! Minimal, deterministic text normalization helpers.
//!
//! `clean_*` functions are display-safe; `scrub`/`tokens` are lossy and used only for
//! matching and scoring.

use std::collections::BTreeSet;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Invisible characters that leak out of CMS editors and search snippets.
const INVISIBLE: &[char] = &['\u{200b}', '\u{200c}', '\u{200d}', '\u{2060}', '\u{feff}'];

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in", "is",
    "it", "its", "of", "on", "or", "that", "the", "this", "to", "was", "were", "which", "with",
    "will", "what", "when", "where", "who", "why", "how",
];

/// Remove invisible characters, fold NBSP to space, collapse whitespace runs.
pub fn clean_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = true;
    for ch in s.chars() {
        if INVISIBLE.contains(&ch) {
            continue;
        }
        let ch = if ch == '\u{a0}' { ' ' } else { ch };
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out.trim_end().to_string()
}

/// Like [`clean_text`] but keeps paragraph breaks (blank lines collapse to one).
pub fn clean_multiline(s: &str) -> String {
    let mut paras: Vec<String> = Vec::new();
    for line in s.lines() {
        let c = clean_text(line);
        if c.is_empty() {
            continue;
        }
        paras.push(c);
    }
    paras.join("\n")
}

/// Truncate to at most `max_chars` characters without splitting a code point.
pub fn clip_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Text content of an HTML fragment, with every named and numeric entity decoded.
///
/// Search APIs return snippets with `<b>` highlights and entity-escaped punctuation.
pub fn fragment_text(s: &str) -> String {
    if !s.contains('<') && !s.contains('&') {
        return s.to_string();
    }
    let frag = html_scraper::Html::parse_fragment(s);
    frag.root_element().text().collect()
}

/// Matching key: NFKD, diacritics dropped, recomposed, lowercased; non-alphanumerics
/// become single spaces.
pub fn scrub(s: &str) -> String {
    let folded: String = s
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .nfc()
        .collect();
    let mut out = String::with_capacity(folded.len());
    let mut last_space = true;
    for ch in folded.chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Content tokens: scrubbed, stopwords removed, single ASCII chars dropped.
pub fn tokens(s: &str) -> BTreeSet<String> {
    scrub(s)
        .split_whitespace()
        .filter(|t| !STOPWORDS.contains(t))
        .filter(|t| t.chars().count() > 1 || !t.is_ascii())
        .map(|t| t.to_string())
        .collect()
}

/// Fraction of `needle`'s content tokens that also appear in `haystack` (0.0 when `needle` has none).
pub fn token_overlap(needle: &BTreeSet<String>, haystack: &BTreeSet<String>) -> f32 {
    if needle.is_empty() {
        return 0.0;
    }
    let hit = needle.iter().filter(|t| haystack.contains(*t)).count();
    hit as f32 / needle.len() as f32
}

pub fn is_hangul(ch: char) -> bool {
    matches!(ch as u32, 0xAC00..=0xD7A3 | 0x1100..=0x11FF | 0x3130..=0x318F)
}

/// Share of alphabetic characters that are Hangul.
pub fn hangul_ratio(s: &str) -> f32 {
    let mut letters = 0usize;
    let mut hangul = 0usize;
    for ch in s.chars() {
        if is_hangul(ch) {
            hangul += 1;
            letters += 1;
        } else if ch.is_alphabetic() {
            letters += 1;
        }
    }
    if letters == 0 {
        0.0
    } else {
        hangul as f32 / letters as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn clean_text_drops_invisibles_and_collapses_whitespace() {
        assert_eq!(
            clean_text("\u{feff}Hello\u{a0}\u{a0}wor\u{200d}ld \n\t again "),
            "Hello world again"
        );
    }

    #[test]
    fn fragment_text_decodes_markup_and_entities() {
        assert_eq!(
            fragment_text("<b>Seoul</b> &amp; Busan &quot;news&quot;"),
            "Seoul & Busan \"news\""
        );
        assert_eq!(
            clean_text(&fragment_text(
                "Tom&#x27;s &ldquo;guide&rdquo; &hellip; 5&nbsp;&#8364;"
            )),
            "Tom's \u{201c}guide\u{201d} \u{2026} 5 \u{20ac}"
        );
        assert_eq!(fragment_text("a plain snippet"), "a plain snippet");
    }

    #[test]
    fn scrub_folds_compatibility_forms_and_diacritics() {
        assert_eq!(scrub("Café NAÏVE \u{fb01}le"), "cafe naive file");
        assert_eq!(scrub("ＵＳＤ／ＫＲＷ"), "usd krw");
        assert_eq!(scrub("서울 날씨!"), "서울 날씨");
    }

    #[test]
    fn tokens_drop_stopwords() {
        let t = tokens("What is the capital of France?");
        assert!(t.contains("capital"));
        assert!(t.contains("france"));
        assert!(!t.contains("the"));
        assert!(!t.contains("what"));
    }

    #[test]
    fn overlap_is_fraction_of_needle() {
        let a = tokens("paris capital france");
        let b = tokens("Paris is the capital city");
        let o = token_overlap(&a, &b);
        assert!((o - 2.0 / 3.0).abs() < 1e-6, "o={o}");
        assert_eq!(token_overlap(&BTreeSet::new(), &b), 0.0);
    }

    #[test]
    fn hangul_ratio_detects_korean() {
        assert!(hangul_ratio("오늘 서울 날씨") > 0.9);
        assert_eq!(hangul_ratio("weather in Seoul"), 0.0);
        assert_eq!(hangul_ratio("123 ?!"), 0.0);
    }

    proptest! {
        #[test]
        fn clip_chars_never_exceeds_limit(s in any::<String>(), n in 0usize..64) {
            let c = clip_chars(&s, n);
            prop_assert!(c.chars().count() <= n);
            prop_assert!(s.starts_with(&c));
        }

        #[test]
        fn clean_text_has_no_double_spaces(s in any::<String>()) {
            let c = clean_text(&s);
            prop_assert!(!c.contains("  "));
            prop_assert!(!c.chars().any(|ch| INVISIBLE.contains(&ch)));
        }
    }
}
