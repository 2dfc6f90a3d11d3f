//! Evidence gathered during one run. Owned by the loop; grows monotonically.

use crate::dispatch::url_key;
use answerpipe_core::{ExtractedDocument, SearchResult};
use answerpipe_local::extract;
use answerpipe_local::textprep::clip_chars;
use std::collections::{BTreeMap, HashSet};

/// A numbered source as shown to the model and used for verification.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    /// 1-based marker number.
    pub index: usize,
    pub url: String,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct Evidence {
    results: Vec<SearchResult>,
    result_keys: HashSet<String>,
    documents: BTreeMap<String, ExtractedDocument>,
    queries: Vec<String>,
}

impl Evidence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&mut self, q: &str) {
        self.queries.push(q.to_string());
    }

    pub fn has_searched(&self, q: &str) -> bool {
        let q = q.trim();
        self.queries.iter().any(|p| p.trim().eq_ignore_ascii_case(q))
    }

    pub fn queries(&self) -> &[String] {
        &self.queries
    }

    /// Add results not seen before. Structured results get their document immediately.
    /// Returns how many were new.
    pub fn add_results(&mut self, results: Vec<SearchResult>) -> usize {
        let mut added = 0;
        for r in results {
            let key = url_key(&r.url);
            if !self.result_keys.insert(key.clone()) {
                continue;
            }
            if r.structured {
                self.documents
                    .entry(key)
                    .or_insert_with(|| extract::from_structured(&r));
            }
            self.results.push(r);
            added += 1;
        }
        added
    }

    /// Keep the first document per url; later ones are ignored.
    pub fn add_document(&mut self, doc: ExtractedDocument) -> bool {
        let key = url_key(&doc.url);
        if self.documents.contains_key(&key) {
            return false;
        }
        self.documents.insert(key, doc);
        true
    }

    pub fn results(&self) -> &[SearchResult] {
        &self.results
    }

    pub fn document(&self, url: &str) -> Option<&ExtractedDocument> {
        self.documents.get(&url_key(url))
    }

    pub fn documents(&self) -> impl Iterator<Item = &ExtractedDocument> {
        self.documents.values()
    }

    pub fn contains_url(&self, url: &str) -> bool {
        self.result_keys.contains(&url_key(url))
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Results whose snippet is too thin and that have no document yet, in merge order.
    pub fn needs_extraction(&self, min_snippet_chars: usize) -> Vec<&SearchResult> {
        self.results
            .iter()
            .filter(|r| !r.structured)
            .filter(|r| r.snippet.chars().count() < min_snippet_chars)
            .filter(|r| self.document(&r.url).is_none())
            .collect()
    }

    /// Numbered sources in evidence order; documents win over snippets, empty text is skipped.
    pub fn sources(&self, max_chars: usize) -> Vec<Source> {
        let mut out = Vec::new();
        for r in &self.results {
            let text = match self.document(&r.url) {
                Some(d) if !d.clean_text.trim().is_empty() => d.clean_text.as_str(),
                _ => r.snippet.as_str(),
            };
            if text.trim().is_empty() {
                continue;
            }
            out.push(Source {
                index: out.len() + 1,
                url: r.url.clone(),
                title: r.title.clone(),
                text: clip_chars(text.trim(), max_chars),
            });
        }
        out
    }

    pub fn degraded_documents(&self) -> usize {
        self.documents.values().filter(|d| d.is_degraded()).count()
    }
}

/// Render sources as the model sees them.
pub fn render_sources(sources: &[Source]) -> String {
    if sources.is_empty() {
        return "(no sources)".to_string();
    }
    sources
        .iter()
        .map(|s| format!("[{}] {}\nURL: {}\n{}", s.index, s.title, s.url, s.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use answerpipe_core::{EngineId, ExtractionMethod};

    fn result(url: &str, snippet: &str, structured: bool) -> SearchResult {
        SearchResult {
            title: format!("title {url}"),
            url: url.to_string(),
            snippet: snippet.to_string(),
            source: EngineId::Generic,
            rank: 0,
            structured,
        }
    }

    #[test]
    fn results_dedup_and_structured_get_documents() {
        let mut ev = Evidence::new();
        let added = ev.add_results(vec![
            result("https://box.example/", "USD/KRW 1,380.50", true),
            result("https://a.example/x", "short", false),
            result("https://a.example/x#top", "dup", false),
        ]);
        assert_eq!(added, 2);
        let doc = ev.document("https://box.example/").unwrap();
        assert_eq!(doc.method, ExtractionMethod::StructuredAnswerBox);
        assert!(ev.contains_url("https://a.example/x"));
        assert!(!ev.contains_url("https://elsewhere.example/"));
    }

    #[test]
    fn needs_extraction_skips_structured_long_and_extracted() {
        let mut ev = Evidence::new();
        ev.add_results(vec![
            result("https://box.example/", "", true),
            result("https://a.example/", "short", false),
            result("https://b.example/", &"long snippet ".repeat(20), false),
            result("https://c.example/", "short", false),
        ]);
        ev.add_document(extract::snippet_only("https://c.example/", "short", "fetch_failed"));
        let urls: Vec<&str> = ev
            .needs_extraction(80)
            .into_iter()
            .map(|r| r.url.as_str())
            .collect();
        assert_eq!(urls, vec!["https://a.example/"]);
    }

    #[test]
    fn first_document_per_url_wins() {
        let mut ev = Evidence::new();
        assert!(ev.add_document(extract::snippet_only("https://a.example/", "one", "r")));
        assert!(!ev.add_document(extract::snippet_only("https://a.example/", "two", "r")));
        assert_eq!(ev.document("https://a.example/").unwrap().clean_text, "one");
    }

    #[test]
    fn sources_prefer_documents_and_are_numbered() {
        let mut ev = Evidence::new();
        ev.add_results(vec![
            result("https://a.example/", "snippet a", false),
            result("https://empty.example/", "", false),
            result("https://b.example/", "snippet b", false),
        ]);
        let mut doc = extract::snippet_only("https://b.example/", "full text b", "r");
        doc.method = ExtractionMethod::Readability;
        ev.add_document(doc);
        let s = ev.sources(100);
        assert_eq!(s.len(), 2);
        assert_eq!((s[0].index, s[0].text.as_str()), (1, "snippet a"));
        assert_eq!((s[1].index, s[1].text.as_str()), (2, "full text b"));
        assert!(render_sources(&s).contains("[2] title https://b.example/\nURL: https://b.example/"));
    }

    #[test]
    fn searched_queries_compare_case_insensitively() {
        let mut ev = Evidence::new();
        ev.record_query("USD KRW rate");
        assert!(ev.has_searched(" usd krw RATE "));
        assert!(!ev.has_searched("EUR KRW rate"));
    }
}
