//! Shared plumbing for the HTTP search adapters.
//!
//! Adapters do their upstream work in a `Result`-returning inner function and convert the
//! outcome into a [`SearchResponse`] at the trait boundary via [`guarded`], so callers only
//! ever see results or a classified failure.

use answerpipe_core::{
    EngineId, Error, Result, SearchErrorKind, SearchFailure, SearchQuery, SearchResponse,
    SearchResult,
};
use std::future::Future;
use std::time::{Duration, Instant};

pub const DEFAULT_SEARCH_TIMEOUT_MS: u64 = 20_000;

pub fn timeout_ms_from_query(q: &SearchQuery) -> u64 {
    // Provider requests can hang indefinitely without an explicit timeout.
    q.timeout_ms
        .unwrap_or(DEFAULT_SEARCH_TIMEOUT_MS)
        .clamp(1_000, 60_000)
}

pub fn classify_status(status: reqwest::StatusCode) -> SearchErrorKind {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        SearchErrorKind::RateLimited
    } else if status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::GATEWAY_TIMEOUT
    {
        SearchErrorKind::Timeout
    } else {
        SearchErrorKind::UpstreamUnavailable
    }
}

pub fn transport_error(provider: &str, e: reqwest::Error) -> Error {
    let kind = if e.is_timeout() {
        SearchErrorKind::Timeout
    } else if e.is_decode() {
        SearchErrorKind::MalformedResponse
    } else {
        SearchErrorKind::UpstreamUnavailable
    };
    Error::search(kind, format!("{provider}: {e}"))
}

/// Check the status and decode a JSON body, classifying every failure.
pub async fn read_json<T: serde::de::DeserializeOwned>(
    provider: &str,
    resp: reqwest::Response,
) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let body = crate::textprep::clip_chars(body.trim(), 200);
        return Err(Error::search(
            classify_status(status),
            format!("{provider} HTTP {status}: {body}"),
        ));
    }
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| transport_error(provider, e))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        Error::search(
            SearchErrorKind::MalformedResponse,
            format!("{provider}: {e}"),
        )
    })
}

/// Run an adapter body under a hard timeout and fold its outcome into a [`SearchResponse`].
pub async fn guarded<F>(
    engine: EngineId,
    provider: &'static str,
    timeout_ms: u64,
    fut: F,
) -> SearchResponse
where
    F: Future<Output = Result<Vec<SearchResult>>>,
{
    let t0 = Instant::now();
    let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await;
    let elapsed_ms = t0.elapsed().as_millis();
    match outcome {
        Ok(Ok(results)) => {
            tracing::debug!(%engine, provider, count = results.len(), elapsed_ms, "search ok");
            SearchResponse::ok(engine, provider, results, elapsed_ms)
        }
        Ok(Err(e)) => {
            let failure = SearchFailure::from(e);
            tracing::warn!(%engine, provider, kind = %failure.kind, error = %failure.message, "search failed");
            SearchResponse::failed(engine, provider, failure, elapsed_ms)
        }
        Err(_) => {
            tracing::warn!(%engine, provider, timeout_ms, "search timed out");
            SearchResponse::failed(
                engine,
                provider,
                SearchFailure::new(
                    SearchErrorKind::Timeout,
                    format!("{provider}: no response within {timeout_ms}ms"),
                ),
                elapsed_ms,
            )
        }
    }
}

/// Assign backend-local ranks and drop entries without a usable http(s) url.
pub fn finalize(mut results: Vec<SearchResult>, max_results: usize) -> Vec<SearchResult> {
    results.retain(|r| answerpipe_core::is_http_url(&r.url));
    results.truncate(max_results);
    for (i, r) in results.iter_mut().enumerate() {
        r.rank = i;
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(url: &str) -> SearchResult {
        SearchResult {
            title: "t".to_string(),
            url: url.to_string(),
            snippet: String::new(),
            source: EngineId::Generic,
            rank: 99,
            structured: false,
        }
    }

    #[test]
    fn timeout_is_clamped() {
        let mut q = SearchQuery::new("x", 5);
        assert_eq!(timeout_ms_from_query(&q), DEFAULT_SEARCH_TIMEOUT_MS);
        q.timeout_ms = Some(10);
        assert_eq!(timeout_ms_from_query(&q), 1_000);
        q.timeout_ms = Some(u64::MAX);
        assert_eq!(timeout_ms_from_query(&q), 60_000);
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS),
            SearchErrorKind::RateLimited
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::BAD_GATEWAY),
            SearchErrorKind::UpstreamUnavailable
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::GATEWAY_TIMEOUT),
            SearchErrorKind::Timeout
        );
    }

    #[test]
    fn finalize_reranks_and_drops_bad_urls() {
        let rs = vec![
            result("https://a.example/"),
            result("javascript:void(0)"),
            result("https://b.example/"),
            result("https://c.example/"),
        ];
        let out = finalize(rs, 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].url, "https://a.example/");
        assert_eq!(out[1].url, "https://b.example/");
        assert_eq!(out[1].rank, 1);
    }

    #[tokio::test]
    async fn guarded_maps_slow_future_to_timeout() {
        let resp = guarded(EngineId::Generic, "slow", 20, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        })
        .await;
        assert!(resp.results.is_empty());
        assert_eq!(resp.failure.unwrap().kind, SearchErrorKind::Timeout);
    }

    #[tokio::test]
    async fn guarded_maps_error_to_failure() {
        let resp = guarded(EngineId::Locale, "broken", 1_000, async {
            Err(Error::search(SearchErrorKind::RateLimited, "429"))
        })
        .await;
        assert_eq!(resp.engine, EngineId::Locale);
        assert_eq!(resp.failure.unwrap().kind, SearchErrorKind::RateLimited);
    }
}
