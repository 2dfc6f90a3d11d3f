//! SerpApi adapter. Direct answers (weather, finance, short facts) and knowledge-graph cards
//! are surfaced as a single structured result ahead of the organic links.

use crate::search::{finalize, guarded, read_json, timeout_ms_from_query, transport_error};
use crate::textprep::clean_text;
use answerpipe_core::{
    is_http_url, EngineId, Error, Result, SearchProvider, SearchQuery, SearchResponse,
    SearchResult,
};
use serde::Deserialize;
use serde_json::Value;

pub const PROVIDER: &str = "serpapi";
pub const DEFAULT_ENDPOINT: &str = "https://serpapi.com/search";

#[derive(Debug, Clone)]
pub struct SerpApiProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    endpoint: String,
}

#[derive(Debug, Default, Deserialize)]
struct SerpResponse {
    error: Option<String>,
    search_metadata: Option<SearchMetadata>,
    answer_box: Option<AnswerBox>,
    knowledge_graph: Option<KnowledgeGraph>,
    #[serde(default)]
    organic_results: Vec<OrganicResult>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchMetadata {
    google_url: Option<String>,
}

/// Fields vary by box type and some are numbers on one vertical and strings on another.
#[derive(Debug, Default, Deserialize)]
struct AnswerBox {
    #[serde(rename = "type")]
    kind: Option<String>,
    title: Option<Value>,
    link: Option<String>,
    answer: Option<Value>,
    snippet: Option<Value>,
    #[serde(default)]
    highlighted_words: Vec<String>,
    location: Option<Value>,
    weather: Option<Value>,
    temperature: Option<Value>,
    unit: Option<Value>,
    stock: Option<Value>,
    exchange: Option<Value>,
    price: Option<Value>,
    currency: Option<Value>,
    previous_close: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct KnowledgeGraph {
    title: Option<String>,
    description: Option<String>,
    website: Option<String>,
    source: Option<KgSource>,
}

#[derive(Debug, Default, Deserialize)]
struct KgSource {
    link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrganicResult {
    link: Option<String>,
    title: Option<String>,
    snippet: Option<String>,
}

fn val(v: &Option<Value>) -> Option<String> {
    match v.as_ref()? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn or_na(v: &Option<Value>) -> String {
    val(v).unwrap_or_else(|| "n/a".to_string())
}

/// Render an answer box as (title, text). `None` when the box carries nothing usable.
fn answer_box_text(b: &AnswerBox) -> Option<(String, String)> {
    match b.kind.as_deref() {
        Some("weather_result") => {
            let loc = or_na(&b.location);
            let text = format!(
                "Weather for {loc}: {}, {} {}",
                or_na(&b.weather),
                or_na(&b.temperature),
                val(&b.unit).unwrap_or_default()
            );
            Some((format!("Weather: {loc}"), clean_text(&text)))
        }
        Some("finance_results") if b.price.is_some() => {
            let text = format!(
                "{} ({}) on {}: price {} {}, previous close {}",
                or_na(&b.title),
                or_na(&b.stock),
                or_na(&b.exchange),
                or_na(&b.price),
                val(&b.currency).unwrap_or_default(),
                or_na(&b.previous_close)
            );
            Some((
                format!("Stock quote: {}", or_na(&b.stock)),
                clean_text(&text),
            ))
        }
        _ => {
            let words = b.highlighted_words.join(" / ");
            let answer = val(&b.answer)
                .or_else(|| val(&b.snippet))
                .or_else(|| (!words.trim().is_empty()).then_some(words))
                .or_else(|| val(&b.title))?;
            let title = val(&b.title).unwrap_or_else(|| "Direct answer".to_string());
            Some((title, clean_text(&answer)))
        }
    }
}

fn fallback_url(parsed: &SerpResponse, q: &SearchQuery) -> String {
    if let Some(u) = parsed
        .search_metadata
        .as_ref()
        .and_then(|m| m.google_url.clone())
        .filter(|u| is_http_url(u))
    {
        return u;
    }
    let mut u = url::Url::parse("https://www.google.com/search").ok();
    if let Some(u) = u.as_mut() {
        u.query_pairs_mut().append_pair("q", &q.query);
    }
    u.map(|u| u.to_string())
        .unwrap_or_else(|| "https://www.google.com/search".to_string())
}

fn structured_result(parsed: &SerpResponse, q: &SearchQuery) -> Option<SearchResult> {
    if let Some(b) = parsed.answer_box.as_ref() {
        if let Some((title, text)) = answer_box_text(b) {
            let url = b
                .link
                .clone()
                .filter(|u| is_http_url(u))
                .unwrap_or_else(|| fallback_url(parsed, q));
            return Some(SearchResult {
                title,
                url,
                snippet: text,
                source: EngineId::AnswerBox,
                rank: 0,
                structured: true,
            });
        }
    }
    let kg = parsed.knowledge_graph.as_ref()?;
    let title = kg.title.clone().filter(|t| !t.trim().is_empty())?;
    let desc = kg.description.clone().unwrap_or_default();
    let url = kg
        .website
        .clone()
        .or_else(|| kg.source.as_ref().and_then(|s| s.link.clone()))
        .filter(|u| is_http_url(u))
        .unwrap_or_else(|| fallback_url(parsed, q));
    Some(SearchResult {
        snippet: clean_text(&format!("{title}: {desc}")),
        title,
        url,
        source: EngineId::AnswerBox,
        rank: 0,
        structured: true,
    })
}

fn to_results(parsed: SerpResponse, q: &SearchQuery) -> Vec<SearchResult> {
    let mut out: Vec<SearchResult> = structured_result(&parsed, q).into_iter().collect();
    for r in parsed.organic_results {
        let Some(url) = r.link else { continue };
        if out.iter().any(|o| o.url == url) {
            continue;
        }
        out.push(SearchResult {
            title: clean_text(r.title.as_deref().unwrap_or("")),
            url,
            snippet: clean_text(r.snippet.as_deref().unwrap_or("")),
            source: EngineId::AnswerBox,
            rank: 0,
            structured: false,
        });
    }
    // The structured entry does not count against the organic budget.
    let has_structured = out.first().map(|r| r.structured).unwrap_or(false);
    finalize(out, q.max_results + usize::from(has_structured))
}

impl SerpApiProvider {
    pub fn new(client: reqwest::Client, api_key: Option<String>, endpoint: Option<String>) -> Self {
        Self {
            client,
            api_key,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn search_inner(&self, q: &SearchQuery, timeout_ms: u64) -> Result<Vec<SearchResult>> {
        let Some(key) = self.api_key.as_deref() else {
            return Err(Error::NotConfigured(
                "missing ANSWERPIPE_SERPAPI_API_KEY (or SERPAPI_API_KEY)".to_string(),
            ));
        };
        let num = q.max_results.clamp(1, 20).to_string();
        let mut req = self.client.get(&self.endpoint).query(&[
            ("engine", "google"),
            ("q", q.query.as_str()),
            ("api_key", key),
            ("num", num.as_str()),
        ]);
        if let Some(lang) = q.language.as_deref() {
            req = req.query(&[("hl", lang)]);
        }
        if let Some(country) = q.country.as_deref() {
            req = req.query(&[("gl", country)]);
        }
        let resp = req
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        let parsed: SerpResponse = read_json(PROVIDER, resp).await?;
        if let Some(err) = parsed.error.as_deref() {
            // "Google hasn't returned any results" arrives as 200 + error.
            if err.to_ascii_lowercase().contains("hasn't returned any results") {
                return Ok(Vec::new());
            }
            return Err(Error::search(
                answerpipe_core::SearchErrorKind::UpstreamUnavailable,
                format!("{PROVIDER}: {err}"),
            ));
        }
        Ok(to_results(parsed, q))
    }
}

#[async_trait::async_trait]
impl SearchProvider for SerpApiProvider {
    fn engine(&self) -> EngineId {
        EngineId::AnswerBox
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn produces_structured_answer(&self) -> bool {
        true
    }

    async fn search(&self, q: &SearchQuery) -> SearchResponse {
        let timeout_ms = timeout_ms_from_query(q);
        guarded(
            EngineId::AnswerBox,
            PROVIDER,
            timeout_ms,
            self.search_inner(q, timeout_ms),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use answerpipe_core::SearchErrorKind;
    use axum::{http::StatusCode, routing::get, Json, Router};
    use std::net::SocketAddr;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn parse(js: &str) -> Vec<SearchResult> {
        let parsed: SerpResponse = serde_json::from_str(js).unwrap();
        to_results(parsed, &SearchQuery::new("q", 5))
    }

    #[test]
    fn weather_box_becomes_structured_rank_zero() {
        let rs = parse(
            r#"{
              "search_metadata": {"google_url": "https://www.google.com/search?q=seoul+weather"},
              "answer_box": {"type":"weather_result","location":"Seoul","weather":"Sunny","temperature":"21","unit":"Celsius"},
              "organic_results": [{"title":"KMA","link":"https://weather.example/","snippet":"forecast"}]
            }"#,
        );
        assert_eq!(rs.len(), 2);
        assert!(rs[0].structured);
        assert_eq!(rs[0].rank, 0);
        assert_eq!(rs[0].url, "https://www.google.com/search?q=seoul+weather");
        assert_eq!(rs[0].snippet, "Weather for Seoul: Sunny, 21 Celsius");
        assert!(!rs[1].structured);
        assert_eq!(rs[1].rank, 1);
    }

    #[test]
    fn finance_box_accepts_numeric_fields() {
        let rs = parse(
            r#"{
              "answer_box": {"type":"finance_results","title":"Samsung Electronics","stock":"005930","exchange":"KRX","price":71200,"currency":"KRW","previous_close":70900}
            }"#,
        );
        assert_eq!(rs.len(), 1);
        assert!(rs[0].snippet.contains("price 71200 KRW"));
        assert!(rs[0].snippet.contains("previous close 70900"));
        assert!(rs[0].url.starts_with("https://www.google.com/search?q="));
    }

    #[test]
    fn generic_box_prefers_answer_then_snippet_then_highlights() {
        let rs = parse(r#"{"answer_box":{"highlighted_words":["Paris"],"title":"Capital"}}"#);
        assert_eq!(rs[0].snippet, "Paris");
        assert_eq!(rs[0].title, "Capital");
        let rs = parse(r#"{"answer_box":{"answer":"8,849 m","snippet":"ignored"}}"#);
        assert_eq!(rs[0].snippet, "8,849 m");
    }

    #[test]
    fn knowledge_graph_used_when_no_answer_box() {
        let rs = parse(
            r#"{
              "knowledge_graph": {"title":"Rust","description":"A systems language.","website":"https://rust-lang.org/"},
              "organic_results": [{"title":"Rust","link":"https://rust-lang.org/","snippet":"dup"}]
            }"#,
        );
        assert_eq!(rs.len(), 1, "organic duplicate of the card url is dropped");
        assert!(rs[0].structured);
        assert_eq!(rs[0].snippet, "Rust: A systems language.");
    }

    #[test]
    fn organic_only_has_no_structured_entry() {
        let rs = parse(
            r#"{"organic_results":[{"title":"A","link":"https://a.example/"},{"title":"no link"}]}"#,
        );
        assert_eq!(rs.len(), 1);
        assert!(!rs[0].structured);
    }

    #[tokio::test]
    async fn no_results_error_is_an_empty_success() {
        let app = Router::new().route(
            "/search",
            get(|| async {
                Json(serde_json::json!({"error": "Google hasn't returned any results for this query."}))
            }),
        );
        let addr = serve(app).await;
        let p = SerpApiProvider::new(
            reqwest::Client::new(),
            Some("k".to_string()),
            Some(format!("http://{addr}/search")),
        );
        let resp = p.search(&SearchQuery::new("zzzz", 3)).await;
        assert!(resp.is_ok());
        assert!(resp.results.is_empty());
    }

    #[tokio::test]
    async fn upstream_500_is_unavailable() {
        let app = Router::new().route(
            "/search",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let addr = serve(app).await;
        let p = SerpApiProvider::new(
            reqwest::Client::new(),
            Some("k".to_string()),
            Some(format!("http://{addr}/search")),
        );
        let resp = p.search(&SearchQuery::new("q", 3)).await;
        assert_eq!(
            resp.failure.unwrap().kind,
            SearchErrorKind::UpstreamUnavailable
        );
        assert!(p.produces_structured_answer());
    }
}
