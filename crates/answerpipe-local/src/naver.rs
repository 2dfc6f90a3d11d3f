//! Naver Open API search (Korean news, blogs, cafes, Q&A, encyclopedia, shopping).

use crate::search::{finalize, guarded, read_json, timeout_ms_from_query, transport_error};
use crate::textprep::{clean_text, fragment_text};
use answerpipe_core::{
    EngineId, Error, Result, SearchProvider, SearchQuery, SearchResponse, SearchResult,
};
use serde::Deserialize;

pub const PROVIDER: &str = "naver";
pub const DEFAULT_BASE: &str = "https://openapi.naver.com/v1/search";

/// Naver search verticals, checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaverService {
    News,
    Blog,
    Encyclopedia,
    Cafe,
    Knowledge,
    Shopping,
    Document,
    Book,
    Web,
}

impl NaverService {
    pub fn path(self) -> &'static str {
        match self {
            NaverService::News => "news",
            NaverService::Blog => "blog",
            NaverService::Encyclopedia => "encyc",
            NaverService::Cafe => "cafearticle",
            NaverService::Knowledge => "kin",
            NaverService::Shopping => "shop",
            NaverService::Document => "doc",
            NaverService::Book => "book",
            NaverService::Web => "webkr",
        }
    }
}

const SERVICE_KEYWORDS: &[(NaverService, &[&str])] = &[
    (
        NaverService::News,
        &["뉴스", "기사", "보도", "언론", "속보", "news"],
    ),
    (
        NaverService::Blog,
        &["블로그", "후기", "리뷰", "맛집", "blog", "review"],
    ),
    (
        NaverService::Encyclopedia,
        &["백과사전", "사전", "백과", "뜻", "encyclopedia"],
    ),
    (NaverService::Cafe, &["카페글", "카페 포스트", "카페"]),
    (NaverService::Knowledge, &["지식인", "질문", "답변"]),
    (
        NaverService::Shopping,
        &["쇼핑", "상품", "최저가", "가격비교", "shopping"],
    ),
    (NaverService::Document, &["전문자료", "논문", "리포트"]),
    (NaverService::Book, &["책", "도서", "출판"]),
];

/// Phrases that leak from page chrome into Naver snippets.
const BOILERPLATE: &[&str] = &[
    "URL 복사",
    "이웃추가",
    "본문 기타 기능",
    "구독하기",
    "메뉴 바로가기",
    "본문 바로가기",
    "copy url",
    "subscribe",
    "skip to content",
];

pub fn detect_service(query: &str) -> NaverService {
    let text = query.to_lowercase();
    SERVICE_KEYWORDS
        .iter()
        .find(|(_, kws)| kws.iter().any(|kw| text.contains(kw)))
        .map(|(svc, _)| *svc)
        .unwrap_or(NaverService::Web)
}

/// Labels dropped only as whole tokens ("광고", "[광고]"); "광고주" stays.
const LABELS: &[&str] = &["광고"];

/// Strip markup, entities, invisible characters and page-chrome phrases.
pub fn clean_snippet(s: &str) -> String {
    let mut t = fragment_text(s);
    for phrase in BOILERPLATE {
        t = remove_ascii_case_insensitive(&t, phrase);
    }
    let kept: Vec<&str> = t
        .split_whitespace()
        .filter(|tok| !LABELS.contains(&tok.trim_matches(|c: char| !c.is_alphanumeric())))
        .collect();
    clean_text(&kept.join(" "))
}

fn remove_ascii_case_insensitive(haystack: &str, needle: &str) -> String {
    if needle.is_empty() {
        return haystack.to_string();
    }
    let lower = haystack.to_ascii_lowercase();
    let needle_l = needle.to_ascii_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut pos = 0;
    // ASCII lowercasing keeps byte offsets aligned with the original.
    while let Some(i) = lower[pos..].find(&needle_l) {
        out.push_str(&haystack[pos..pos + i]);
        out.push(' ');
        pos += i + needle_l.len();
    }
    out.push_str(&haystack[pos..]);
    out
}

#[derive(Debug, Clone)]
pub struct NaverProvider {
    client: reqwest::Client,
    client_id: Option<String>,
    client_secret: Option<String>,
    base: String,
}

#[derive(Debug, Deserialize)]
struct NaverResponse {
    #[serde(default)]
    items: Vec<NaverItem>,
}

#[derive(Debug, Deserialize)]
struct NaverItem {
    title: Option<String>,
    link: Option<String>,
    description: Option<String>,
}

impl NaverProvider {
    pub fn new(
        client: reqwest::Client,
        client_id: Option<String>,
        client_secret: Option<String>,
        base: Option<String>,
    ) -> Self {
        Self {
            client,
            client_id,
            client_secret,
            base: base.unwrap_or_else(|| DEFAULT_BASE.to_string()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }

    fn endpoint(&self, svc: NaverService) -> String {
        format!("{}/{}.json", self.base.trim_end_matches('/'), svc.path())
    }

    async fn search_inner(&self, q: &SearchQuery, timeout_ms: u64) -> Result<Vec<SearchResult>> {
        let (Some(id), Some(secret)) = (self.client_id.as_deref(), self.client_secret.as_deref())
        else {
            return Err(Error::NotConfigured(
                "missing ANSWERPIPE_NAVER_CLIENT_ID / ANSWERPIPE_NAVER_CLIENT_SECRET".to_string(),
            ));
        };
        let svc = detect_service(&q.query);
        tracing::debug!(provider = PROVIDER, service = svc.path(), "naver service chosen");
        // The API accepts display in 1..=100.
        let display = q.max_results.clamp(1, 100).to_string();
        let resp = self
            .client
            .get(self.endpoint(svc))
            .header("X-Naver-Client-Id", id)
            .header("X-Naver-Client-Secret", secret)
            .query(&[("query", q.query.as_str()), ("display", display.as_str())])
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;
        let parsed: NaverResponse = read_json(PROVIDER, resp).await?;
        let out = parsed
            .items
            .into_iter()
            .filter_map(|it| {
                Some(SearchResult {
                    url: it.link.filter(|l| !l.trim().is_empty())?,
                    title: clean_snippet(it.title.as_deref().unwrap_or("")),
                    snippet: clean_snippet(it.description.as_deref().unwrap_or("")),
                    source: EngineId::Locale,
                    rank: 0,
                    structured: false,
                })
            })
            .collect();
        Ok(finalize(out, q.max_results))
    }
}

#[async_trait::async_trait]
impl SearchProvider for NaverProvider {
    fn engine(&self) -> EngineId {
        EngineId::Locale
    }

    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn search(&self, q: &SearchQuery) -> SearchResponse {
        let timeout_ms = timeout_ms_from_query(q);
        guarded(
            EngineId::Locale,
            PROVIDER,
            timeout_ms,
            self.search_inner(q, timeout_ms),
        )
        .await
    }
}
