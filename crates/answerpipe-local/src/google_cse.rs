//! General web search: Google Custom Search JSON API, with a rendered results-page scrape
//! as a fallback when the API fails or comes back short.

use crate::render_playwright::PlaywrightRenderer;
use crate::search::{finalize, guarded, read_json, timeout_ms_from_query, transport_error};
use crate::textprep::clean_text;
use answerpipe_core::{
    EngineId, Error, Result, SearchProvider, SearchQuery, SearchResponse, SearchResult,
};
use html_scraper::{ElementRef, Html, Selector};
use serde::Deserialize;

pub const PROVIDER: &str = "google_cse";
pub const DEFAULT_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";
pub const DEFAULT_SCRAPE_BASE: &str = "https://www.google.com/search";

#[derive(Debug, Clone)]
pub struct GoogleCseSettings {
    pub api_key: Option<String>,
    pub cse_id: Option<String>,
    pub endpoint: String,
    pub scrape_base: String,
}

impl Default for GoogleCseSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            cse_id: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            scrape_base: DEFAULT_SCRAPE_BASE.to_string(),
        }
    }
}

impl GoogleCseSettings {
    pub fn api_configured(&self) -> bool {
        self.api_key.is_some() && self.cse_id.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct GoogleCseProvider {
    client: reqwest::Client,
    settings: GoogleCseSettings,
    renderer: Option<PlaywrightRenderer>,
}

#[derive(Debug, Deserialize)]
struct CseResponse {
    #[serde(default)]
    items: Vec<CseItem>,
}

#[derive(Debug, Deserialize)]
struct CseItem {
    link: Option<String>,
    title: Option<String>,
    snippet: Option<String>,
}

impl GoogleCseProvider {
    pub fn new(
        client: reqwest::Client,
        settings: GoogleCseSettings,
        renderer: Option<PlaywrightRenderer>,
    ) -> Self {
        Self {
            client,
            settings,
            renderer: renderer.filter(|r| r.enabled()),
        }
    }

    /// True when either the API or the browser fallback can serve a query.
    pub fn is_usable(&self) -> bool {
        self.settings.api_configured() || self.renderer.is_some()
    }

    async fn search_api(&self, q: &SearchQuery, timeout_ms: u64) -> Result<Vec<SearchResult>> {
        let (Some(key), Some(cx)) = (
            self.settings.api_key.as_deref(),
            self.settings.cse_id.as_deref(),
        ) else {
            return Err(Error::NotConfigured(
                "missing ANSWERPIPE_GOOGLE_API_KEY / ANSWERPIPE_GOOGLE_CSE_ID".to_string(),
            ));
        };
        // The API caps `num` at 10.
        let num = q.max_results.clamp(1, 10).to_string();
        let mut req = self
            .client
            .get(&self.settings.endpoint)
            .query(&[("key", key), ("cx", cx), ("q", q.query.as_str())])
            .query(&[("num", num.as_str())]);
        if let Some(lang) = q.language.as_deref() {
            req = req.query(&[("lr", format!("lang_{lang}"))]);
        }
        if let Some(country) = q.country.as_deref() {
            req = req.query(&[("gl", country)]);
        }
        let resp = req
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        let parsed: CseResponse = read_json(PROVIDER, resp).await?;
        Ok(parsed
            .items
            .into_iter()
            .filter_map(|it| {
                Some(SearchResult {
                    url: it.link?,
                    title: clean_text(it.title.as_deref().unwrap_or("")),
                    snippet: clean_text(it.snippet.as_deref().unwrap_or("")),
                    source: EngineId::Generic,
                    rank: 0,
                    structured: false,
                })
            })
            .collect())
    }

    async fn search_rendered(
        &self,
        renderer: &PlaywrightRenderer,
        q: &SearchQuery,
    ) -> Result<Vec<SearchResult>> {
        let mut url = url::Url::parse(&self.settings.scrape_base)
            .map_err(|e| Error::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("q", &q.query)
            .append_pair("num", &q.max_results.clamp(1, 20).to_string());
        if let Some(lang) = q.language.as_deref() {
            url.query_pairs_mut().append_pair("hl", lang);
        }
        let page = renderer.render(url.as_str(), q.language.as_deref()).await?;
        Ok(parse_results_page(&page.html))
    }

    async fn search_inner(&self, q: &SearchQuery, timeout_ms: u64) -> Result<Vec<SearchResult>> {
        let api = if self.settings.api_configured() {
            self.search_api(q, timeout_ms).await
        } else {
            Err(Error::NotConfigured(
                "google_cse api credentials not set".to_string(),
            ))
        };
        let short = match &api {
            Ok(rs) => rs.len() < q.max_results,
            Err(_) => true,
        };
        let Some(renderer) = self.renderer.as_ref().filter(|_| short) else {
            return api.map(|rs| finalize(rs, q.max_results));
        };

        if let Err(e) = &api {
            tracing::info!(provider = PROVIDER, error = %e, "api unavailable; trying rendered results page");
        }
        match self.search_rendered(renderer, q).await {
            Ok(scraped) => {
                let mut merged = api.unwrap_or_default();
                for r in scraped {
                    if !merged.iter().any(|m| m.url == r.url) {
                        merged.push(r);
                    }
                }
                Ok(finalize(merged, q.max_results))
            }
            Err(render_err) => {
                tracing::warn!(provider = PROVIDER, error = %render_err, "browser fallback failed");
                match api {
                    Ok(rs) => Ok(finalize(rs, q.max_results)),
                    Err(api_err) => Err(api_err),
                }
            }
        }
    }
}

/// Pull organic result links out of a rendered results page (anchors wrapping an `<h3>`).
pub fn parse_results_page(html: &str) -> Vec<SearchResult> {
    let doc = Html::parse_document(html);
    let Ok(h3) = Selector::parse("h3") else {
        return Vec::new();
    };
    let mut out: Vec<SearchResult> = Vec::new();
    for heading in doc.select(&h3) {
        let anchor = heading
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == "a");
        let Some(href) = anchor.and_then(|a| a.value().attr("href")) else {
            continue;
        };
        let Some(url) = resolve_result_href(href) else {
            continue;
        };
        if out.iter().any(|r| r.url == url) {
            continue;
        }
        out.push(SearchResult {
            title: clean_text(&heading.text().collect::<Vec<_>>().join(" ")),
            url,
            snippet: String::new(),
            source: EngineId::Generic,
            rank: 0,
            structured: false,
        });
    }
    out
}

/// Accept absolute external links and `/url?q=` redirect wrappers; drop in-page navigation.
fn resolve_result_href(href: &str) -> Option<String> {
    if href.starts_with("/url?") {
        let u = url::Url::parse(&format!("https://www.google.com{href}")).ok()?;
        let target = u
            .query_pairs()
            .find(|(k, _)| k == "q" || k == "url")
            .map(|(_, v)| v.to_string())?;
        return answerpipe_core::is_http_url(&target).then_some(target);
    }
    if !answerpipe_core::is_http_url(href) {
        return None;
    }
    let host = url::Url::parse(href).ok()?.host_str()?.to_ascii_lowercase();
    if host.ends_with("google.com") {
        return None;
    }
    Some(href.to_string())
}

#[async_trait::async_trait]
impl SearchProvider for GoogleCseProvider {
    fn engine(&self) -> EngineId {
        EngineId::Generic
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }

    /// The browser fallback runs after the API call, so its budget adds to the API timeout.
    fn budget_ms(&self, timeout_ms: u64) -> u64 {
        match &self.renderer {
            Some(r) => timeout_ms.saturating_add(r.budget_ms()),
            None => timeout_ms,
        }
    }

    async fn search(&self, q: &SearchQuery) -> SearchResponse {
        let timeout_ms = timeout_ms_from_query(q);
        guarded(
            EngineId::Generic,
            PROVIDER,
            self.budget_ms(timeout_ms),
            self.search_inner(q, timeout_ms),
        )
        .await
    }
}
