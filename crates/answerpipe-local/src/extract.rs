//! HTML → readable text, as a fallback chain that never fails.
//!
//! 1. main-content scoring (`readability`)
//! 2. known blog/news body selectors (`site_template`)
//! 3. visible text with chrome removed, truncated (`fallback_visible`)
//! 4. the search snippet (`snippet`)
//!
//! Each step is accepted only when it yields at least `min_text_chars`.

use crate::textprep::{clean_multiline, clean_text, clip_chars};
use answerpipe_core::{ExtractedDocument, ExtractionMethod, SearchResult};
use html_scraper::{ElementRef, Html, Selector};
use std::io::Cursor;

pub const CONFIDENCE_STRUCTURED: f32 = 1.0;
pub const CONFIDENCE_READABILITY: f32 = 0.9;
pub const CONFIDENCE_SITE_TEMPLATE: f32 = 0.75;
pub const CONFIDENCE_FALLBACK: f32 = 0.5;
pub const CONFIDENCE_SNIPPET: f32 = 0.2;

#[derive(Debug, Clone)]
pub struct ExtractSettings {
    pub min_text_chars: usize,
    pub max_chars: usize,
    /// Upper bound on candidate containers scored per page.
    pub max_scan_elems: usize,
}

impl Default for ExtractSettings {
    fn default() -> Self {
        Self {
            min_text_chars: 200,
            max_chars: 2_000,
            max_scan_elems: 20_000,
        }
    }
}

/// Body selectors for blog/news layouts that main-content scoring tends to miss
/// (SmartEditor blogs, portal news bodies, common CMS themes).
const SITE_TEMPLATE_SELECTORS: &[&str] = &[
    ".se-main-container",
    "#postViewArea",
    "#newsEndContents",
    "#articleBodyContents",
    "#dic_area",
    "#newsct_article",
    ".news_read_area",
    ".article_body",
    ".news-content",
    ".post-content",
    ".entry-content",
    "#content",
];

const CHROME_TAGS: &[&str] = &[
    "script", "style", "noscript", "header", "footer", "form", "nav", "aside",
];

/// Convert HTML to plain text with html2text; callers bound the output.
pub fn html_to_text(html: &str, width: usize) -> String {
    html2text::from_read(Cursor::new(html.as_bytes()), width).unwrap_or_else(|_| html.to_string())
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn class_or_id_lc(el: &ElementRef) -> String {
    let mut out = String::new();
    if let Some(c) = el.value().attr("class") {
        out.push_str(c);
        out.push(' ');
    }
    if let Some(i) = el.value().attr("id") {
        out.push_str(i);
    }
    out.to_ascii_lowercase()
}

fn is_generic_boilerplate_container(el: &ElementRef) -> bool {
    let s = class_or_id_lc(el);
    if s.is_empty() {
        return false;
    }
    [
        "nav",
        "navbar",
        "menu",
        "sidebar",
        "footer",
        "header",
        "banner",
        "cookie",
        "consent",
        "ads",
        "advert",
        "promo",
        "subscribe",
        "newsletter",
        "comment",
    ]
    .iter()
    .any(|bad| s.contains(bad))
}

fn element_text_chars(el: &ElementRef) -> usize {
    el.text().map(|t| t.chars().count()).sum()
}

fn element_link_text_chars(el: &ElementRef, links: &Selector) -> usize {
    el.select(links)
        .map(|a| a.text().map(|t| t.chars().count()).sum::<usize>())
        .sum()
}

/// Text nodes of `el`, skipping anything inside script/style/noscript.
fn visible_text(el: &ElementRef) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for node in el.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|a| matches!(a.value().name(), "script" | "style" | "noscript"));
        if !hidden {
            parts.push(text);
        }
    }
    norm_ws(&parts.join(" "))
}

/// Score article/main/section/div containers by dense non-link text.
pub fn pick_main_text(html: &str, max_elems: usize) -> Option<String> {
    let max_elems = max_elems.clamp(50, 50_000);
    let doc = Html::parse_document(html);
    let sel = Selector::parse("article, main, section, div").ok()?;
    let links = Selector::parse("a").ok()?;

    let mut best_score: i64 = 0;
    let mut best: Option<ElementRef> = None;
    for el in doc.select(&sel).take(max_elems) {
        if is_generic_boilerplate_container(&el) {
            continue;
        }
        let txt = element_text_chars(&el);
        if txt < 20 {
            continue;
        }
        let link_txt = element_link_text_chars(&el, &links);
        // Link text is usually navigation, TOCs, or tag clouds.
        let mut score = txt as i64 - 2 * (link_txt as i64);
        match el.value().name() {
            "article" => score += 500,
            "main" => score += 300,
            _ => {}
        }
        if link_txt > txt / 2 {
            score -= 500;
        }
        if score > best_score {
            best_score = score;
            best = Some(el);
        }
    }
    let out = visible_text(&best?);
    (!out.trim().is_empty()).then_some(out)
}

/// First known body container with text, by selector priority.
pub fn site_template_text(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    SITE_TEMPLATE_SELECTORS.iter().find_map(|raw| {
        let sel = Selector::parse(raw).ok()?;
        let el = doc.select(&sel).next()?;
        let t = visible_text(&el);
        (!t.trim().is_empty()).then_some(t)
    })
}

/// Remove `<tag ...> ... </tag>` blocks (ASCII case-insensitive; stops at an unclosed tag).
fn strip_tag_blocks(html: &str, tag: &str) -> String {
    let open_pat = format!("<{}", tag.to_ascii_lowercase());
    let close_pat = format!("</{}>", tag.to_ascii_lowercase());
    let lower = html.to_ascii_lowercase();

    let mut out = String::with_capacity(html.len());
    let mut i = 0usize;
    while let Some(rel_start) = lower[i..].find(&open_pat) {
        let start = i + rel_start;
        let after_open = start + open_pat.len();
        // `<header` must not match `<headers>`-like custom tags.
        let boundary = lower[after_open..]
            .chars()
            .next()
            .map(|c| c == '>' || c.is_ascii_whitespace() || c == '/')
            .unwrap_or(false);
        if !boundary {
            out.push_str(&html[i..after_open]);
            i = after_open;
            continue;
        }
        let Some(rel_end) = lower[after_open..].find(&close_pat) else {
            break;
        };
        out.push_str(&html[i..start]);
        i = after_open + rel_end + close_pat.len();
    }
    out.push_str(&html[i..]);
    out
}

/// Visible page text with page chrome removed.
pub fn fallback_visible_text(html: &str) -> String {
    let mut stripped = html.to_string();
    for tag in CHROME_TAGS {
        stripped = strip_tag_blocks(&stripped, tag);
    }
    clean_multiline(&html_to_text(&stripped, 10_000))
}

/// Naver blog posts render their body inside `iframe#mainFrame`; return the frame url to fetch.
pub fn follow_frame_url(page_url: &str, html: &str) -> Option<String> {
    let base = url::Url::parse(page_url).ok()?;
    if !base.host_str()?.ends_with("blog.naver.com") {
        return None;
    }
    let doc = Html::parse_document(html);
    let sel = Selector::parse("iframe#mainFrame").ok()?;
    let src = doc.select(&sel).next()?.value().attr("src")?;
    base.join(src).ok().map(|u| u.to_string())
}

fn content_type_lc_prefix(ct: Option<&str>) -> String {
    ct.unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Best-effort sniff for whether bytes are HTML-ish.
pub fn bytes_look_like_html(bytes: &[u8]) -> bool {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let rest = &bytes[start..];
    let head = &rest[..rest.len().min(16)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html") || head.starts_with("<head")
        || head.starts_with("<body")
}

/// True when a fetched body is something this chain can read (HTML or plain text).
pub fn is_extractable(content_type: Option<&str>, bytes: &[u8]) -> bool {
    let ct = content_type_lc_prefix(content_type);
    if ct.is_empty() {
        return bytes_look_like_html(bytes);
    }
    ct == "text/html" || ct == "application/xhtml+xml" || ct == "text/plain"
}

fn bounded(text: &str, max_chars: usize, warnings: &mut Vec<&'static str>) -> String {
    let clean = clean_text(text);
    if clean.chars().count() > max_chars {
        warnings.push("text_truncated");
        clip_chars(&clean, max_chars)
    } else {
        clean
    }
}

/// Run the chain over a fetched page. Never fails; the worst case is a snippet-only document.
pub fn extract(url: &str, raw_html: &str, snippet: &str, cfg: &ExtractSettings) -> ExtractedDocument {
    let min = cfg.min_text_chars;
    let long_enough = |s: &str| clean_text(s).chars().count() >= min;
    let mut warnings: Vec<&'static str> = Vec::new();

    if raw_html.trim().is_empty() {
        return snippet_only(url, snippet, "empty_html");
    }

    if let Some(t) = pick_main_text(raw_html, cfg.max_scan_elems).filter(|t| long_enough(t)) {
        return ExtractedDocument {
            url: url.to_string(),
            clean_text: bounded(&t, cfg.max_chars, &mut warnings),
            method: ExtractionMethod::Readability,
            confidence: CONFIDENCE_READABILITY,
            engine: "readability",
            warnings,
        };
    }
    warnings.push("readability_below_min_chars");

    if let Some(t) = site_template_text(raw_html).filter(|t| long_enough(t)) {
        return ExtractedDocument {
            url: url.to_string(),
            clean_text: bounded(&t, cfg.max_chars, &mut warnings),
            method: ExtractionMethod::Readability,
            confidence: CONFIDENCE_SITE_TEMPLATE,
            engine: "site_template",
            warnings,
        };
    }

    let t = fallback_visible_text(raw_html);
    if long_enough(&t) {
        let text = clip_chars(&clean_text(&t), cfg.max_chars);
        warnings.push("fallback_visible_text");
        return ExtractedDocument {
            url: url.to_string(),
            clean_text: text,
            method: ExtractionMethod::FallbackTruncated,
            confidence: CONFIDENCE_FALLBACK,
            engine: "fallback_visible",
            warnings,
        };
    }

    let mut doc = snippet_only(url, snippet, "page_text_below_min_chars");
    warnings.append(&mut doc.warnings);
    doc.warnings = warnings;
    doc
}

/// Last link of the chain: used directly when the page could not be fetched or read.
pub fn snippet_only(url: &str, snippet: &str, reason: &'static str) -> ExtractedDocument {
    ExtractedDocument {
        url: url.to_string(),
        clean_text: clean_text(snippet),
        method: ExtractionMethod::SnippetOnly,
        confidence: CONFIDENCE_SNIPPET,
        engine: "snippet",
        warnings: vec![reason],
    }
}

/// Wrap a provider direct answer; no page fetch involved.
pub fn from_structured(r: &SearchResult) -> ExtractedDocument {
    ExtractedDocument {
        url: r.url.clone(),
        clean_text: clean_text(&r.snippet),
        method: ExtractionMethod::StructuredAnswerBox,
        confidence: CONFIDENCE_STRUCTURED,
        engine: "answer_box",
        warnings: Vec::new(),
    }
}
