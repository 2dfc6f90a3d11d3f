//! Sentence-level verification of a drafted answer against the numbered sources.
//!
//! A sentence survives when it cites a known source whose text overlaps it, or when it
//! overlaps some source above the support threshold. Markers that point outside the source
//! list are removed; surviving markers are renumbered by first appearance.

use crate::evidence::Source;
use answerpipe_core::Citation;
use answerpipe_local::textprep::{scrub, tokens};
use std::collections::BTreeSet;

/// Overlap a cited sentence needs with its own sources.
const CITED_MIN_OVERLAP: f32 = 0.25;

/// Korean particles stripped before substring matching ("서울은" should match "서울").
const PARTICLES: &[&str] = &[
    "에서", "으로", "에게", "까지", "부터", "은", "는", "이", "가", "을", "를", "의", "에", "로",
    "와", "과", "도", "만",
];

const SOURCE_HEADINGS: &[&str] = &["sources", "source", "references", "출처", "참고"];

#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    pub text: String,
    pub citations: Vec<Citation>,
    pub kept: usize,
    pub removed: usize,
    pub dropped_markers: usize,
}

impl Verification {
    pub fn all_removed(&self) -> bool {
        self.kept == 0
    }
}

struct SourceIndex<'a> {
    source: &'a Source,
    tokens: BTreeSet<String>,
    scrubbed: String,
}

impl<'a> SourceIndex<'a> {
    fn new(source: &'a Source) -> Self {
        let body = format!("{} {}", source.title, source.text);
        Self {
            source,
            tokens: tokens(&body),
            scrubbed: scrub(&body),
        }
    }

    fn support(&self, needle: &BTreeSet<String>) -> f32 {
        if needle.is_empty() {
            return 0.0;
        }
        let hit = needle.iter().filter(|t| self.has_token(t)).count();
        hit as f32 / needle.len() as f32
    }

    fn has_token(&self, t: &str) -> bool {
        if self.tokens.contains(t) {
            return true;
        }
        if t.is_ascii() {
            return false;
        }
        let stem = strip_particle(t);
        !stem.is_empty() && self.scrubbed.contains(stem)
    }
}

fn strip_particle(t: &str) -> &str {
    for p in PARTICLES {
        if let Some(stem) = t.strip_suffix(p) {
            if !stem.is_empty() {
                return stem;
            }
        }
    }
    t
}

pub fn verify(draft: &str, sources: &[Source], threshold: f32) -> Verification {
    let index: Vec<SourceIndex<'_>> = sources.iter().map(SourceIndex::new).collect();
    let mut kept_sentences: Vec<(String, Vec<usize>)> = Vec::new();
    let mut removed = 0;
    let mut dropped_markers = 0;

    for sentence in split_sentences(draft) {
        let (body, markers) = parse_markers(&sentence);
        let body = body.trim().to_string();
        if is_source_listing(&body) {
            continue;
        }
        let needle = tokens(&strip_urls(&body));
        if needle.is_empty() {
            continue;
        }

        let (valid, invalid): (Vec<usize>, Vec<usize>) = markers
            .into_iter()
            .partition(|m| (1..=sources.len()).contains(m));
        dropped_markers += invalid.len();

        let cited_support = valid
            .iter()
            .map(|m| index[m - 1].support(&needle))
            .fold(0.0f32, f32::max);
        let cited_ok = !valid.is_empty() && cited_support >= CITED_MIN_OVERLAP.min(threshold);

        let citations = if cited_ok {
            valid
        } else {
            // Reattribute to the best-matching source when it clears the threshold.
            let best = index
                .iter()
                .map(|s| (s.source.index, s.support(&needle)))
                .fold(None::<(usize, f32)>, |acc, cur| match acc {
                    Some(a) if a.1 >= cur.1 => Some(a),
                    _ => Some(cur),
                });
            match best {
                Some((i, score)) if score >= threshold => {
                    if !valid.is_empty() {
                        tracing::debug!(sentence = %body, "citation reattributed to best-matching source");
                    }
                    vec![i]
                }
                _ => {
                    tracing::debug!(sentence = %body, "dropping unsupported sentence");
                    removed += 1;
                    continue;
                }
            }
        };
        kept_sentences.push((body, citations));
    }

    // Renumber by first appearance.
    let mut order: Vec<usize> = Vec::new();
    for (_, cites) in &kept_sentences {
        for c in cites {
            if !order.contains(c) {
                order.push(*c);
            }
        }
    }
    let renumber = |old: usize| order.iter().position(|o| *o == old).map(|p| p + 1);

    let text = kept_sentences
        .iter()
        .map(|(body, cites)| {
            let mut new: Vec<usize> = cites.iter().filter_map(|c| renumber(*c)).collect();
            new.dedup();
            let marks: String = new.iter().map(|n| format!("[{n}]")).collect();
            attach_markers(body, &marks)
        })
        .collect::<Vec<_>>()
        .join(" ");

    let citations = order
        .iter()
        .filter_map(|old| sources.get(old - 1))
        .map(|s| Citation {
            url: s.url.clone(),
            title: s.title.clone(),
        })
        .collect();

    Verification {
        text,
        citations,
        kept: kept_sentences.len(),
        removed,
        dropped_markers,
    }
}

/// Put markers before the closing punctuation: "Water boils at 100°C [1]."
fn attach_markers(body: &str, marks: &str) -> String {
    if marks.is_empty() {
        return body.to_string();
    }
    let trimmed = body.trim_end_matches(['.', '!', '?', '。']);
    let tail = &body[trimmed.len()..];
    format!("{} {marks}{tail}", trimmed.trim_end())
}

fn is_source_listing(body: &str) -> bool {
    let head = body
        .trim()
        .trim_end_matches(':')
        .trim()
        .to_lowercase();
    SOURCE_HEADINGS.contains(&head.as_str())
        || SOURCE_HEADINGS
            .iter()
            .any(|h| head.starts_with(&format!("{h}:")))
}

fn strip_urls(s: &str) -> String {
    s.split_whitespace()
        .filter(|w| !w.contains("://"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split on sentence punctuation followed by whitespace, and on newlines. Markers written
/// after the punctuation ("... 100°C. [1]") stay with their sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            push_sentence(&mut out, &mut cur);
            i += 1;
            continue;
        }
        cur.push(c);
        i += 1;
        let terminal = matches!(c, '.' | '!' | '?' | '。');
        let at_break = i >= chars.len() || chars[i].is_whitespace() || chars[i] == '[';
        if terminal && at_break {
            // Absorb trailing markers.
            let mut j = i;
            loop {
                let mut k = j;
                while k < chars.len() && chars[k] == ' ' {
                    k += 1;
                }
                match marker_end(&chars, k) {
                    Some(end) => {
                        cur.extend(&chars[j..end]);
                        j = end;
                    }
                    None => break,
                }
            }
            i = j;
            push_sentence(&mut out, &mut cur);
        }
    }
    push_sentence(&mut out, &mut cur);
    out
}

fn push_sentence(out: &mut Vec<String>, cur: &mut String) {
    let s = cur.trim();
    if !s.is_empty() {
        out.push(s.to_string());
    }
    cur.clear();
}

/// If `chars[start..]` begins with a citation marker like `[1]` or `[1, 3]`, return the index
/// just past its closing bracket.
fn marker_end(chars: &[char], start: usize) -> Option<usize> {
    if chars.get(start) != Some(&'[') {
        return None;
    }
    let mut k = start + 1;
    let mut digits = false;
    while let Some(&c) = chars.get(k) {
        match c {
            ']' => return digits.then_some(k + 1),
            '0'..='9' => digits = true,
            ',' | ' ' => {}
            _ => return None,
        }
        k += 1;
    }
    None
}

/// Remove citation markers from a sentence, returning the text and the marker numbers.
pub fn parse_markers(sentence: &str) -> (String, Vec<usize>) {
    let chars: Vec<char> = sentence.chars().collect();
    let mut text = String::with_capacity(sentence.len());
    let mut markers = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if let Some(end) = marker_end(&chars, i) {
            let inner: String = chars[i + 1..end - 1].iter().collect();
            for n in inner.split(',').filter_map(|p| p.trim().parse::<usize>().ok()) {
                if !markers.contains(&n) {
                    markers.push(n);
                }
            }
            i = end;
            continue;
        }
        text.push(chars[i]);
        i += 1;
    }
    // Collapse the gaps markers leave behind ("100°C [1]." -> "100°C .").
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let text = text
        .replace(" .", ".")
        .replace(" !", "!")
        .replace(" ?", "?")
        .replace(" ,", ",");
    (text, markers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(index: usize, url: &str, text: &str) -> Source {
        Source {
            index,
            url: url.to_string(),
            title: format!("title {index}"),
            text: text.to_string(),
        }
    }

    fn sources() -> Vec<Source> {
        vec![
            src(1, "https://rates.example/usd-krw", "The USD to KRW exchange rate is 1,380.50 won per dollar today."),
            src(2, "https://news.example/won", "The Korean won weakened against the dollar after the central bank meeting."),
        ]
    }

    #[test]
    fn splits_sentences_and_keeps_trailing_markers() {
        let s = split_sentences("Rate is 1,380.50 won. [1] The won weakened [2]. Done!\nNext line");
        assert_eq!(
            s,
            vec!["Rate is 1,380.50 won. [1]", "The won weakened [2].", "Done!", "Next line"]
        );
    }

    #[test]
    fn parses_single_and_grouped_markers() {
        let (t, m) = parse_markers("Water boils at 100°C [1][3] and freezes at 0°C [2, 3].");
        assert_eq!(t, "Water boils at 100°C and freezes at 0°C.");
        assert_eq!(m, vec![1, 3, 2]);
        let (t, m) = parse_markers("An [array] stays.");
        assert_eq!(t, "An [array] stays.");
        assert!(m.is_empty());
    }

    #[test]
    fn keeps_supported_and_renumbers_by_first_appearance() {
        let draft = "The Korean won weakened against the dollar [2]. \
                     The USD to KRW exchange rate is 1,380.50 won [1].";
        let v = verify(draft, &sources(), 0.5);
        assert_eq!(v.kept, 2);
        assert_eq!(v.removed, 0);
        assert_eq!(
            v.text,
            "The Korean won weakened against the dollar [1]. The USD to KRW exchange rate is 1,380.50 won [2]."
        );
        assert_eq!(v.citations[0].url, "https://news.example/won");
        assert_eq!(v.citations[1].url, "https://rates.example/usd-krw");
    }

    #[test]
    fn drops_unsupported_sentences_and_fabricated_markers() {
        let draft = "The USD to KRW exchange rate is 1,380.50 won [1]. \
                     Aliens control the bond market [7]. \
                     Sources:\n- https://made-up.example/";
        let v = verify(draft, &sources(), 0.5);
        assert_eq!(v.kept, 1);
        assert_eq!(v.removed, 1);
        assert_eq!(v.dropped_markers, 1);
        assert_eq!(v.citations.len(), 1);
        assert!(!v.text.contains("Aliens"));
        assert!(!v.text.contains("made-up"));
    }

    #[test]
    fn uncited_supported_sentence_is_attributed() {
        let v = verify("The won weakened against the dollar.", &sources(), 0.5);
        assert_eq!(v.kept, 1);
        assert_eq!(v.text, "The won weakened against the dollar [1].");
        assert_eq!(v.citations[0].url, "https://news.example/won");
    }

    #[test]
    fn korean_particles_do_not_block_support() {
        let s = vec![src(1, "https://kr.example/", "서울 날씨 맑음 기온 21도")];
        let v = verify("서울은 맑고 기온은 21도입니다 [1].", &s, 0.5);
        assert_eq!(v.kept, 1, "text={}", v.text);
        assert_eq!(v.citations.len(), 1);
    }

    #[test]
    fn no_sources_means_nothing_survives() {
        let v = verify("The sky is green [1].", &[], 0.5);
        assert!(v.all_removed());
        assert!(v.citations.is_empty());
        assert_eq!(v.dropped_markers, 1);
    }
}
