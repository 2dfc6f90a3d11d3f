//! Search-necessity decision and query refinement.
//!
//! Both steps consult the language model but never fail: an unusable decision falls back to
//! searching, an unusable rewrite falls back to the original query.

use crate::prompts;
use answerpipe_core::{
    Error, LanguageModel, LlmErrorKind, Prompt, RefinedQuery, Result, RetrievalDecision,
    RewriteStyle,
};
use tokio::sync::OnceCell;
use tokio::time::{timeout_at, Instant};

/// Decision and refinement for a single run; the decision is computed at most once.
pub struct DecisionStage<'a> {
    llm: &'a dyn LanguageModel,
    decision: OnceCell<RetrievalDecision>,
    deadline: Option<Instant>,
}

impl<'a> DecisionStage<'a> {
    pub fn new(llm: &'a dyn LanguageModel) -> Self {
        Self {
            llm,
            decision: OnceCell::new(),
            deadline: None,
        }
    }

    /// Bound both model calls by the request deadline. An expired call is handled like a
    /// failed one.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    async fn ask(&self, prompt: &Prompt) -> Result<String> {
        let Some(at) = self.deadline else {
            return self.llm.complete(prompt).await;
        };
        timeout_at(at, self.llm.complete(prompt))
            .await
            .unwrap_or_else(|_| {
                Err(Error::llm(
                    LlmErrorKind::Timeout,
                    "request deadline expired",
                ))
            })
    }

    /// Memoised for the lifetime of this stage, so repeated calls agree.
    pub async fn decide(&self, query: &str) -> RetrievalDecision {
        self.decision
            .get_or_init(|| async {
                let d = match self.ask(&prompts::decide(query)).await {
                    Ok(raw) => parse_decision(&raw).unwrap_or_else(|| {
                        tracing::warn!(output = %clip(&raw), "unparseable decision; searching");
                        RetrievalDecision::unavailable()
                    }),
                    Err(err) => {
                        tracing::warn!(error = %err, "decision model call failed; searching");
                        RetrievalDecision::unavailable()
                    }
                };
                tracing::info!(needs_search = d.needs_search, rationale = %d.rationale, "decided");
                d
            })
            .await
            .clone()
    }

    pub async fn refine(&self, query: &str, rationale: &str) -> RefinedQuery {
        let style = route_style(query);
        match self.ask(&prompts::refine(style, query, rationale)).await {
            Ok(raw) => match clean_rewrite(&raw, query) {
                Some(text) => {
                    tracing::debug!(?style, refined = %text, "query refined");
                    RefinedQuery { text, style }
                }
                None => {
                    tracing::warn!(?style, "empty or runaway rewrite; using query verbatim");
                    RefinedQuery::verbatim(query)
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "refine model call failed; using query verbatim");
                RefinedQuery::verbatim(query)
            }
        }
    }
}

fn clip(s: &str) -> String {
    s.chars().take(120).collect()
}

/// Read `SEARCH` / `NO_SEARCH` from the first non-empty line.
pub fn parse_decision(raw: &str) -> Option<RetrievalDecision> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let cleaned = line.trim_start_matches(|c: char| !c.is_alphanumeric());
    let upper = cleaned.to_ascii_uppercase();
    let (needs_search, tag_len) = if upper.starts_with("NO_SEARCH") || upper.starts_with("NO SEARCH")
    {
        (false, "NO_SEARCH".len())
    } else if upper.starts_with("SEARCH") {
        (true, "SEARCH".len())
    } else {
        return None;
    };
    let reason = cleaned
        .get(tag_len..)
        .unwrap_or("")
        .trim_start_matches(|c: char| !c.is_alphanumeric())
        .trim();
    let rationale = if reason.is_empty() {
        if needs_search {
            "model requested search"
        } else {
            "answerable from general knowledge"
        }
        .to_string()
    } else {
        reason.to_string()
    };
    Some(RetrievalDecision {
        needs_search,
        rationale,
    })
}

const STYLE_KEYWORDS: &[(RewriteStyle, &[&str])] = &[
    (
        RewriteStyle::Keyword,
        &[
            "방법", "팁", "찾기", "구매", "설치", "만들기", "요청", "how to", "tips", "install",
            "buy", "where to",
        ],
    ),
    (
        RewriteStyle::Question,
        &[
            "왜", "어떻게", "무엇", "언제", "어디서", "정의", "원인", "이유", "why", "what",
            "when", "where", "who", "how", "definition", "cause", "reason",
        ],
    ),
    (
        RewriteStyle::Exploratory,
        &[
            "사례", "추천", "비교", "동향", "트렌드", "종류", "영향", "전망", "examples",
            "recommend", "compare", "comparison", "trends", "types", "impact", "outlook",
        ],
    ),
];

/// Pick a rewrite style from keyword hits; ties go to the earlier row, no hits to `Basic`.
pub fn route_style(query: &str) -> RewriteStyle {
    let lower = query.to_lowercase();
    let mut best = (RewriteStyle::Basic, 0usize);
    for (style, kws) in STYLE_KEYWORDS {
        let hits = kws.iter().filter(|kw| lower.contains(**kw)).count();
        if hits > best.1 {
            best = (*style, hits);
        }
    }
    best.0
}

const REWRITE_LABELS: &[&str] = &[
    "rewritten query:",
    "rewritten:",
    "search query:",
    "query:",
    "재작성된 쿼리:",
    "검색어:",
];

/// First line of the model output, without labels or quotes. `None` when nothing usable is left
/// or the rewrite balloons far past the original.
pub fn clean_rewrite(raw: &str, original: &str) -> Option<String> {
    let mut line = raw.lines().map(str::trim).find(|l| !l.is_empty())?.to_string();
    let lower = line.to_lowercase();
    if let Some(label) = REWRITE_LABELS.iter().find(|l| lower.starts_with(**l)) {
        // Labels are ASCII or whole Hangul syllables, so byte lengths match after lowercasing.
        if let Some(rest) = line.get(label.len()..) {
            line = rest.trim().to_string();
        }
    }
    let text = line
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '“' | '”' | '‘' | '’'))
        .trim()
        .to_string();
    if text.is_empty() {
        return None;
    }
    let limit = original.chars().count() * 3 + 60;
    if text.chars().count() > limit {
        return None;
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use answerpipe_core::{Error, LlmErrorKind, Prompt, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        reply: Result<String>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn ok(s: &str) -> Self {
            Self {
                reply: Ok(s.to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                reply: Err(Error::llm(LlmErrorKind::Timeout, "slow")),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl LanguageModel for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _prompt: &Prompt) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Ok(s) => Ok(s.clone()),
                Err(_) => Err(Error::llm(LlmErrorKind::Timeout, "slow")),
            }
        }
    }

    /// Never answers within any reasonable budget.
    struct Stalled;

    #[async_trait::async_trait]
    impl LanguageModel for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn complete(&self, _prompt: &Prompt) -> Result<String> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok("SEARCH: too late".to_string())
        }
    }

    #[tokio::test]
    async fn expired_deadline_fails_closed_and_keeps_query_verbatim() {
        let llm = Stalled;
        let t0 = Instant::now();
        let stage = DecisionStage::new(&llm)
            .with_deadline(t0 + std::time::Duration::from_millis(50));

        let d = stage.decide("weather in Busan tomorrow").await;
        assert!(d.needs_search);
        assert_eq!(d.rationale, RetrievalDecision::UNAVAILABLE);

        let r = stage.refine("weather in Busan tomorrow", &d.rationale).await;
        assert_eq!(r.text, "weather in Busan tomorrow");
        assert!(t0.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn parses_decision_lines() {
        let d = parse_decision("NO_SEARCH: general knowledge").unwrap();
        assert!(!d.needs_search);
        assert_eq!(d.rationale, "general knowledge");

        let d = parse_decision("\n  **SEARCH** - needs live data\n").unwrap();
        assert!(d.needs_search);
        assert_eq!(d.rationale, "needs live data");

        let d = parse_decision("search").unwrap();
        assert!(d.needs_search);

        assert!(parse_decision("maybe?").is_none());
        assert!(parse_decision("   ").is_none());
    }

    #[tokio::test]
    async fn decision_is_memoised_within_a_stage() {
        let llm = Scripted::ok("NO_SEARCH: stable fact");
        let stage = DecisionStage::new(&llm);
        let a = stage.decide("boiling point of water").await;
        let b = stage.decide("boiling point of water").await;
        assert_eq!(a, b);
        assert!(!a.needs_search);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn model_failure_fails_closed() {
        let llm = Scripted::failing();
        let stage = DecisionStage::new(&llm);
        let d = stage.decide("anything").await;
        assert!(d.needs_search);
        assert_eq!(d.rationale, RetrievalDecision::UNAVAILABLE);
    }

    #[tokio::test]
    async fn garbage_decision_fails_closed() {
        let llm = Scripted::ok("I think perhaps");
        let d = DecisionStage::new(&llm).decide("q").await;
        assert!(d.needs_search);
        assert_eq!(d.rationale, RetrievalDecision::UNAVAILABLE);
    }

    #[test]
    fn routes_styles_by_keyword() {
        assert_eq!(route_style("유튜브 썸네일 만들기 방법 알려줘"), RewriteStyle::Keyword);
        assert_eq!(route_style("왜 금리가 오르나요"), RewriteStyle::Question);
        assert_eq!(route_style("AI 서비스 추천 및 동향"), RewriteStyle::Exploratory);
        assert_eq!(route_style("엔비디아"), RewriteStyle::Basic);
    }

    #[test]
    fn cleans_rewrite_output() {
        assert_eq!(
            clean_rewrite("Rewritten query: \"최근 금리 인상 원인\"\nextra", "왜 금리가 오르나요").as_deref(),
            Some("최근 금리 인상 원인")
        );
        assert_eq!(
            clean_rewrite("재작성된 쿼리: 엔비디아 주가", "엔비디아 주가 얼마임?").as_deref(),
            Some("엔비디아 주가")
        );
        assert!(clean_rewrite("  \n ''", "q").is_none());
        assert!(clean_rewrite(&"x".repeat(500), "q").is_none());
    }

    #[tokio::test]
    async fn refine_falls_back_to_verbatim() {
        let llm = Scripted::failing();
        let r = DecisionStage::new(&llm).refine("  서울 날씨  ", "live").await;
        assert_eq!(r, RefinedQuery::verbatim("서울 날씨"));

        let llm = Scripted::ok("\"\"");
        let r = DecisionStage::new(&llm).refine("서울 날씨", "live").await;
        assert_eq!(r.style, RewriteStyle::Verbatim);
    }

    #[tokio::test]
    async fn refine_uses_cleaned_model_output() {
        let llm = Scripted::ok("Rewritten: USD KRW exchange rate today");
        let r = DecisionStage::new(&llm)
            .refine("what is the current USD to KRW exchange rate", "live data")
            .await;
        assert_eq!(r.text, "USD KRW exchange rate today");
        assert_eq!(r.style, RewriteStyle::Question);
    }
}
