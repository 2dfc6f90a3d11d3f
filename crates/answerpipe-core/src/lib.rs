use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("search failed ({kind}): {message}")]
    Search {
        kind: SearchErrorKind,
        message: String,
    },
    #[error("llm failed ({kind}): {message}")]
    Llm { kind: LlmErrorKind, message: String },
    #[error("synthesis failed: {0}")]
    SynthesisFailed(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl Error {
    pub fn llm(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Error::Llm {
            kind,
            message: message.into(),
        }
    }

    pub fn search(kind: SearchErrorKind, message: impl Into<String>) -> Self {
        Error::Search {
            kind,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Uniform failure taxonomy for search adapters.
///
/// Every upstream-specific failure (HTTP status, transport error, JSON shape drift, missing
/// credentials) is mapped into one of these before it leaves an adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SearchErrorKind {
    RateLimited,
    UpstreamUnavailable,
    MalformedResponse,
    Timeout,
}

impl SearchErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchErrorKind::RateLimited => "rate-limited",
            SearchErrorKind::UpstreamUnavailable => "upstream-unavailable",
            SearchErrorKind::MalformedResponse => "malformed-response",
            SearchErrorKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for SearchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum LlmErrorKind {
    Timeout,
    RateLimited,
    MalformedOutput,
    Unavailable,
}

impl LlmErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LlmErrorKind::Timeout => "timeout",
            LlmErrorKind::RateLimited => "rate-limited",
            LlmErrorKind::MalformedOutput => "malformed-output",
            LlmErrorKind::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a search backend, as used by engine selection and configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EngineId {
    /// General-purpose web search.
    Generic,
    /// Search aggregation with direct-answer / knowledge-graph boxes.
    AnswerBox,
    /// Regional blog/news content search.
    Locale,
}

impl EngineId {
    pub const ALL: [EngineId; 3] = [EngineId::Generic, EngineId::AnswerBox, EngineId::Locale];

    pub fn as_str(self) -> &'static str {
        match self {
            EngineId::Generic => "generic",
            EngineId::AnswerBox => "answer-box",
            EngineId::Locale => "locale",
        }
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "generic" => Ok(EngineId::Generic),
            "answer-box" | "answerbox" => Ok(EngineId::AnswerBox),
            "locale" => Ok(EngineId::Locale),
            other => Err(Error::Config(format!("unknown engine id: {other}"))),
        }
    }
}

/// Ordered, non-empty set of engines chosen for one query.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct EngineSelection(Vec<EngineId>);

impl EngineSelection {
    /// Build a selection, dropping duplicates while keeping first-seen order.
    pub fn new(ids: impl IntoIterator<Item = EngineId>) -> Result<Self> {
        let mut out: Vec<EngineId> = Vec::new();
        for id in ids {
            if !out.contains(&id) {
                out.push(id);
            }
        }
        if out.is_empty() {
            return Err(Error::Config("engine selection must not be empty".to_string()));
        }
        Ok(Self(out))
    }

    pub fn single(id: EngineId) -> Self {
        Self(vec![id])
    }

    pub fn as_slice(&self) -> &[EngineId] {
        &self.0
    }

    pub fn contains(&self, id: EngineId) -> bool {
        self.0.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = EngineId> + '_ {
        self.0.iter().copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrievalDecision {
    pub needs_search: bool,
    pub rationale: String,
}

impl RetrievalDecision {
    pub const UNAVAILABLE: &'static str = "decision-unavailable";

    /// Fail-closed decision used when the model cannot be consulted.
    pub fn unavailable() -> Self {
        Self {
            needs_search: true,
            rationale: Self::UNAVAILABLE.to_string(),
        }
    }
}

/// Which rewrite prompt produced a refined query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RewriteStyle {
    /// "why / how / what" questions, rewritten to a topical phrase.
    Question,
    /// Direct task requests ("how to", "where to buy"), rewritten to keywords.
    Keyword,
    /// Broad exploration (examples, comparisons, trends).
    Exploratory,
    /// Short or unclear input; minimal cleanup only.
    Basic,
    /// The original query, used when the rewrite was unavailable.
    Verbatim,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefinedQuery {
    pub text: String,
    pub style: RewriteStyle,
}

impl RefinedQuery {
    pub fn verbatim(query: &str) -> Self {
        Self {
            text: query.trim().to_string(),
            style: RewriteStyle::Verbatim,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: usize,
    pub language: Option<String>,
    pub country: Option<String>,
    /// Per-call upstream timeout; adapters clamp it to a sane range.
    pub timeout_ms: Option<u64>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>, max_results: usize) -> Self {
        Self {
            query: query.into(),
            max_results,
            language: None,
            country: None,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub source: EngineId,
    /// Backend-local position (0-based); not comparable across engines.
    pub rank: usize,
    /// True for a provider-supplied direct answer / knowledge-graph entry.
    pub structured: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchFailure {
    pub kind: SearchErrorKind,
    pub message: String,
}

impl SearchFailure {
    pub fn new(kind: SearchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<Error> for SearchFailure {
    fn from(e: Error) -> Self {
        match e {
            Error::Search { kind, message } => SearchFailure { kind, message },
            other => SearchFailure::new(SearchErrorKind::UpstreamUnavailable, other.to_string()),
        }
    }
}

/// What an adapter hands back: results, or an empty set plus a failure signal.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub engine: EngineId,
    pub provider: &'static str,
    pub results: Vec<SearchResult>,
    pub failure: Option<SearchFailure>,
    pub elapsed_ms: u128,
}

impl SearchResponse {
    pub fn ok(
        engine: EngineId,
        provider: &'static str,
        results: Vec<SearchResult>,
        elapsed_ms: u128,
    ) -> Self {
        Self {
            engine,
            provider,
            results,
            failure: None,
            elapsed_ms,
        }
    }

    pub fn failed(
        engine: EngineId,
        provider: &'static str,
        failure: SearchFailure,
        elapsed_ms: u128,
    ) -> Self {
        Self {
            engine,
            provider,
            results: Vec::new(),
            failure: Some(failure),
            elapsed_ms,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    fn engine(&self) -> EngineId;

    /// Stable provider name for logs and reports (e.g. "serpapi").
    fn name(&self) -> &'static str;

    /// True if this backend can surface a direct answer that needs no page extraction.
    fn produces_structured_answer(&self) -> bool {
        false
    }

    /// Wall-clock time one search may take when each upstream call gets `timeout_ms`.
    /// Adapters that chain a fallback after a failed call report the sum.
    fn budget_ms(&self, timeout_ms: u64) -> u64 {
        timeout_ms
    }

    /// Run one search. Implementations must not panic or block past their own timeout;
    /// failures are reported through [`SearchResponse::failure`].
    async fn search(&self, q: &SearchQuery) -> SearchResponse;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    /// Timeout for the operation (network + processing).
    pub timeout_ms: Option<u64>,
    /// Hard cap on bytes read from the response body.
    pub max_bytes: Option<u64>,
    /// Optional headers to add (best-effort; adapter may drop unsafe headers).
    pub headers: BTreeMap<String, String>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_ms: None,
            max_bytes: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub truncated: bool,
    pub timings_ms: BTreeMap<String, u128>,
}

impl FetchResponse {
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).to_string()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait::async_trait]
pub trait FetchBackend: Send + Sync {
    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionMethod {
    StructuredAnswerBox,
    Readability,
    FallbackTruncated,
    SnippetOnly,
}

impl ExtractionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionMethod::StructuredAnswerBox => "structured-answer-box",
            ExtractionMethod::Readability => "readability",
            ExtractionMethod::FallbackTruncated => "fallback-truncated",
            ExtractionMethod::SnippetOnly => "snippet-only",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractedDocument {
    pub url: String,
    pub clean_text: String,
    pub method: ExtractionMethod,
    /// 0.0..=1.0; lower for degraded extraction paths.
    pub confidence: f32,
    /// Which concrete strategy produced the text (finer than `method`).
    pub engine: &'static str,
    pub warnings: Vec<&'static str>,
}

impl ExtractedDocument {
    pub fn is_degraded(&self) -> bool {
        matches!(
            self.method,
            ExtractionMethod::FallbackTruncated | ExtractionMethod::SnippetOnly
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalAnswer {
    pub text: String,
    pub citations: Vec<Citation>,
    pub verified: bool,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Decide,
    Refine,
    Sufficiency,
    Synthesize,
    DirectAnswer,
}

impl PromptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptKind::Decide => "decide",
            PromptKind::Refine => "refine",
            PromptKind::Sufficiency => "sufficiency",
            PromptKind::Synthesize => "synthesize",
            PromptKind::DirectAnswer => "direct_answer",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Prompt {
    pub kind: PromptKind,
    pub system: String,
    pub user: String,
    pub max_tokens: Option<u64>,
}

impl Prompt {
    pub fn new(kind: PromptKind, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            kind,
            system: system.into(),
            user: user.into(),
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, n: u64) -> Self {
        self.max_tokens = Some(n);
        self
    }
}

/// Opaque text-completion capability.
///
/// Callers must tolerate empty or garbled output; nothing here promises determinism.
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, prompt: &Prompt) -> Result<String>;
}

/// True for absolute http(s) URLs with a host.
pub fn is_http_url(s: &str) -> bool {
    match url::Url::parse(s.trim()) {
        Ok(u) => matches!(u.scheme(), "http" | "https") && u.host_str().is_some(),
        Err(_) => false,
    }
}
