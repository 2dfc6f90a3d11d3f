//! Concurrent fan-out to the selected search engines, with a deterministic merge.
//!
//! 1. Query every selected engine concurrently with [`futures::future::join_all`]
//! 2. Bound each call with an outer timeout (adapters also enforce their own)
//! 3. Record a status per engine; failures never abort the dispatch
//! 4. Merge: structured answers first, then each engine's results in selection order
//! 5. Drop duplicate urls (normalised), keeping the first occurrence

use answerpipe_core::{
    EngineId, EngineSelection, RefinedQuery, SearchErrorKind, SearchFailure, SearchProvider,
    SearchQuery, SearchResponse, SearchResult,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Slack on top of the adapter timeout before the dispatcher gives up on an engine.
const OUTER_TIMEOUT_SLACK_MS: u64 = 1_000;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EngineStatus {
    pub engine: EngineId,
    pub provider: &'static str,
    pub ok: bool,
    pub result_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<SearchFailure>,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchOutcome {
    pub results: Vec<SearchResult>,
    pub statuses: Vec<EngineStatus>,
}

impl DispatchOutcome {
    /// True only when every selected engine failed.
    pub fn all_failed(&self) -> bool {
        !self.statuses.is_empty() && self.statuses.iter().all(|s| !s.ok)
    }

    pub fn failed_engines(&self) -> Vec<EngineId> {
        self.statuses
            .iter()
            .filter(|s| !s.ok)
            .map(|s| s.engine)
            .collect()
    }
}

/// Registry of adapters keyed by engine.
#[derive(Clone)]
pub struct Dispatcher {
    providers: BTreeMap<EngineId, Arc<dyn SearchProvider>>,
    max_results: usize,
    per_engine_timeout_ms: u64,
}

impl Dispatcher {
    pub fn new(max_results: usize, per_engine_timeout_ms: u64) -> Self {
        Self {
            providers: BTreeMap::new(),
            max_results: max_results.max(1),
            per_engine_timeout_ms: per_engine_timeout_ms.max(1),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn SearchProvider>) -> Self {
        self.providers.insert(provider.engine(), provider);
        self
    }

    pub fn engines(&self) -> Vec<EngineId> {
        self.providers.keys().copied().collect()
    }

    pub async fn dispatch(
        &self,
        refined: &RefinedQuery,
        selection: &EngineSelection,
        language: Option<&str>,
    ) -> DispatchOutcome {
        let query = SearchQuery {
            query: refined.text.clone(),
            max_results: self.max_results,
            language: language.map(str::to_string),
            country: language.and_then(country_for_language).map(str::to_string),
            timeout_ms: Some(self.per_engine_timeout_ms),
        };

        let futures: Vec<_> = selection
            .iter()
            .map(|engine| {
                let provider = self.providers.get(&engine).cloned();
                let q = &query;
                async move { self.call_engine(engine, provider, q).await }
            })
            .collect();
        let responses = futures::future::join_all(futures).await;

        let mut statuses = Vec::with_capacity(responses.len());
        for r in &responses {
            match &r.failure {
                None => {
                    tracing::debug!(engine = %r.engine, count = r.results.len(), "engine returned results");
                }
                Some(f) => {
                    tracing::warn!(engine = %r.engine, kind = %f.kind, error = %f.message, "engine query failed");
                }
            }
            statuses.push(EngineStatus {
                engine: r.engine,
                provider: r.provider,
                ok: r.is_ok(),
                result_count: r.results.len(),
                failure: r.failure.clone(),
                elapsed_ms: r.elapsed_ms,
            });
        }

        let results = merge(responses);
        tracing::info!(
            engines = selection.len(),
            failed = statuses.iter().filter(|s| !s.ok).count(),
            results = results.len(),
            "dispatch complete"
        );
        DispatchOutcome { results, statuses }
    }

    async fn call_engine(
        &self,
        engine: EngineId,
        provider: Option<Arc<dyn SearchProvider>>,
        q: &SearchQuery,
    ) -> SearchResponse {
        let Some(provider) = provider else {
            return SearchResponse::failed(
                engine,
                "unconfigured",
                SearchFailure::new(
                    SearchErrorKind::UpstreamUnavailable,
                    format!("no adapter configured for engine {engine}"),
                ),
                0,
            );
        };
        let t0 = Instant::now();
        let budget = provider.budget_ms(self.per_engine_timeout_ms);
        let limit = Duration::from_millis(budget.saturating_add(OUTER_TIMEOUT_SLACK_MS));
        match tokio::time::timeout(limit, provider.search(q)).await {
            Ok(mut resp) => {
                // Adapters tag their own results, but the merge relies on it.
                for r in &mut resp.results {
                    r.source = engine;
                }
                resp
            }
            Err(_) => SearchResponse::failed(
                engine,
                provider.name(),
                SearchFailure::new(
                    SearchErrorKind::Timeout,
                    format!("no response within {}ms", limit.as_millis()),
                ),
                t0.elapsed().as_millis(),
            ),
        }
    }
}

fn country_for_language(lang: &str) -> Option<&'static str> {
    match lang {
        "ko" => Some("kr"),
        "en" => Some("us"),
        _ => None,
    }
}

/// Structured answers first, then per-engine results in selection order; first url wins.
pub fn merge(responses: Vec<SearchResponse>) -> Vec<SearchResult> {
    let mut structured = Vec::new();
    let mut organic = Vec::new();
    for resp in responses {
        for r in resp.results {
            if r.structured {
                structured.push(r);
            } else {
                organic.push(r);
            }
        }
    }
    let mut seen: HashSet<String> = HashSet::new();
    structured
        .into_iter()
        .chain(organic)
        .filter(|r| seen.insert(url_key(&r.url)))
        .collect()
}

/// Tracking parameters ignored when comparing urls.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
];

/// Normalised identity of a url: lowercase host, no fragment, no default port, no tracking
/// parameters, no trailing slash. Unparseable input is returned trimmed.
pub fn url_key(raw: &str) -> String {
    let Ok(mut u) = url::Url::parse(raw.trim()) else {
        return raw.trim().to_string();
    };
    u.set_fragment(None);
    let pairs: Vec<(String, String)> = u
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.to_ascii_lowercase().as_str()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        u.set_query(None);
    } else {
        u.query_pairs_mut().clear().extend_pairs(pairs);
    }
    let mut s = u.to_string();
    if u.path() != "/" && u.query().is_none() && s.ends_with('/') {
        s.pop();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use answerpipe_core::{Error, SearchErrorKind};

    struct Fake {
        engine: EngineId,
        delay_ms: u64,
        outcome: std::result::Result<Vec<(&'static str, bool)>, SearchErrorKind>,
        /// Extra time claimed for a fallback that runs after the primary call.
        fallback_ms: u64,
    }

    #[async_trait::async_trait]
    impl SearchProvider for Fake {
        fn engine(&self) -> EngineId {
            self.engine
        }

        fn name(&self) -> &'static str {
            "fake"
        }

        fn budget_ms(&self, timeout_ms: u64) -> u64 {
            timeout_ms + self.fallback_ms
        }

        async fn search(&self, _q: &SearchQuery) -> SearchResponse {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            match &self.outcome {
                Ok(urls) => SearchResponse::ok(
                    self.engine,
                    "fake",
                    urls.iter()
                        .enumerate()
                        .map(|(i, (u, structured))| SearchResult {
                            title: format!("t{i}"),
                            url: u.to_string(),
                            snippet: "s".to_string(),
                            source: self.engine,
                            rank: i,
                            structured: *structured,
                        })
                        .collect(),
                    self.delay_ms as u128,
                ),
                Err(kind) => SearchResponse::failed(
                    self.engine,
                    "fake",
                    Error::search(*kind, "boom").into(),
                    0,
                ),
            }
        }
    }

    fn fake(
        engine: EngineId,
        delay_ms: u64,
        outcome: std::result::Result<Vec<(&'static str, bool)>, SearchErrorKind>,
    ) -> Arc<dyn SearchProvider> {
        Arc::new(Fake {
            engine,
            delay_ms,
            outcome,
            fallback_ms: 0,
        })
    }

    fn rq() -> RefinedQuery {
        RefinedQuery::verbatim("q")
    }

    #[tokio::test]
    async fn fallback_that_outlives_the_engine_timeout_is_not_cut_off() {
        // Primary call times out at 100ms; the fallback answers 1.2s later.
        let slow_fallback = Arc::new(Fake {
            engine: EngineId::Generic,
            delay_ms: 1_300,
            outcome: Ok(vec![("https://rendered.example/1", false)]),
            fallback_ms: 2_000,
        });
        let d = Dispatcher::new(5, 100).with_provider(slow_fallback);
        let out = d
            .dispatch(&rq(), &EngineSelection::single(EngineId::Generic), Some("en"))
            .await;
        assert!(!out.all_failed(), "statuses: {:?}", out.statuses);
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0].url, "https://rendered.example/1");

        // Without a declared fallback the same delay is a timeout.
        let d = Dispatcher::new(5, 100).with_provider(fake(
            EngineId::Generic,
            1_300,
            Ok(vec![("https://rendered.example/1", false)]),
        ));
        let out = d
            .dispatch(&rq(), &EngineSelection::single(EngineId::Generic), Some("en"))
            .await;
        assert!(out.all_failed());
        assert_eq!(
            out.statuses[0].failure.as_ref().map(|f| f.kind),
            Some(SearchErrorKind::Timeout)
        );
    }

    #[tokio::test]
    async fn merge_order_ignores_completion_order() {
        let d = Dispatcher::new(5, 2_000)
            .with_provider(fake(
                EngineId::Generic,
                60,
                Ok(vec![("https://a.com/1", false), ("https://a.com/2", false)]),
            ))
            .with_provider(fake(
                EngineId::AnswerBox,
                0,
                Ok(vec![("https://box.com", true), ("https://b.com/1", false)]),
            ))
            .with_provider(fake(EngineId::Locale, 10, Ok(vec![("https://a.com/1#x", false)])));
        let sel =
            EngineSelection::new([EngineId::Generic, EngineId::Locale, EngineId::AnswerBox]).unwrap();
        let out = d.dispatch(&rq(), &sel, Some("en")).await;
        let urls: Vec<&str> = out.results.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://box.com", "https://a.com/1", "https://a.com/2", "https://b.com/1"]
        );
        assert_eq!(out.statuses.len(), 3);
        assert!(!out.all_failed());
    }

    #[tokio::test]
    async fn partial_failure_is_recorded_not_raised() {
        let d = Dispatcher::new(5, 2_000)
            .with_provider(fake(EngineId::Generic, 0, Ok(vec![("https://a.com", false)])))
            .with_provider(fake(EngineId::AnswerBox, 0, Err(SearchErrorKind::RateLimited)))
            .with_provider(fake(EngineId::Locale, 0, Ok(vec![("https://n.com", false)])));
        let sel = EngineSelection::new(EngineId::ALL).unwrap();
        let out = d.dispatch(&rq(), &sel, None).await;
        assert_eq!(out.results.len(), 2);
        assert_eq!(out.failed_engines(), vec![EngineId::AnswerBox]);
        let st = out
            .statuses
            .iter()
            .find(|s| s.engine == EngineId::AnswerBox)
            .unwrap();
        assert_eq!(st.failure.as_ref().unwrap().kind, SearchErrorKind::RateLimited);
        assert!(!out.all_failed());
    }

    #[tokio::test]
    async fn outer_timeout_and_missing_adapter_fail_softly() {
        let d = Dispatcher::new(5, 20)
            .with_provider(fake(EngineId::Generic, 5_000, Ok(vec![("https://a.com", false)])));
        let sel = EngineSelection::new([EngineId::Generic, EngineId::Locale]).unwrap();
        let out = d.dispatch(&rq(), &sel, None).await;
        assert!(out.results.is_empty());
        assert!(out.all_failed());
        assert_eq!(
            out.statuses[0].failure.as_ref().unwrap().kind,
            SearchErrorKind::Timeout
        );
        assert_eq!(
            out.statuses[1].failure.as_ref().unwrap().kind,
            SearchErrorKind::UpstreamUnavailable
        );
    }

    #[test]
    fn url_key_normalises_equivalent_urls() {
        assert_eq!(
            url_key("https://Example.COM/path/?utm_source=x#frag"),
            url_key("https://example.com/path")
        );
        assert_eq!(url_key("https://example.com:443/"), "https://example.com/");
        assert_ne!(url_key("https://a.com/?id=1"), url_key("https://a.com/?id=2"));
        assert_eq!(url_key("  not a url "), "not a url");
    }
}
