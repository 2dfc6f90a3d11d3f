//! Engine selection: query context detection plus a configurable rule table.

use crate::config::EnginePolicy;
use answerpipe_core::{EngineId, EngineSelection, RefinedQuery};
use answerpipe_local::textprep::hangul_ratio;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    News,
    Finance,
    Weather,
    LocalBusiness,
    Shopping,
    Academic,
    GeneralFactual,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::News => "news",
            Category::Finance => "finance",
            Category::Weather => "weather",
            Category::LocalBusiness => "local-business",
            Category::Shopping => "shopping",
            Category::Academic => "academic",
            Category::GeneralFactual => "general-factual",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueryContext {
    /// `ko` or `en`.
    pub language: String,
    pub category: Category,
    /// 0.0..=1.0; how sure the category guess is.
    pub confidence: f32,
}

/// Share of Hangul letters above which a query is treated as Korean.
const KOREAN_RATIO: f32 = 0.2;

const CATEGORY_KEYWORDS: &[(Category, &[&str])] = &[
    (
        Category::Weather,
        &[
            "날씨", "기온", "강수", "미세먼지", "일기예보", "weather", "forecast", "temperature",
            "rain",
        ],
    ),
    (
        Category::Finance,
        &[
            "주가", "환율", "시세", "주식", "코스피", "코스닥", "금리", "비트코인", "stock",
            "price", "exchange rate", "usd", "krw", "share", "nasdaq", "bitcoin", "interest rate",
        ],
    ),
    (
        Category::News,
        &[
            "뉴스", "속보", "기사", "최신", "오늘", "발표", "news", "latest", "breaking",
            "today", "announced",
        ],
    ),
    (
        Category::LocalBusiness,
        &[
            "맛집", "근처", "영업시간", "카페", "병원", "예약", "near me", "opening hours",
            "restaurant",
        ],
    ),
    (
        Category::Shopping,
        &[
            "최저가", "구매", "쇼핑", "가격비교", "할인", "buy", "cheapest", "deal", "shopping",
        ],
    ),
    (
        Category::Academic,
        &[
            "논문", "연구", "학술", "정의", "원리", "paper", "research", "study", "theorem",
            "definition", "arxiv",
        ],
    ),
];

/// Detect language and category for engine selection.
///
/// Confidence: no keyword hit → 0.3 (general-factual); a clear winner with one hit → 0.6,
/// two or more → 0.9; a tie between categories → 0.4.
pub fn detect_context(text: &str) -> QueryContext {
    let language = if hangul_ratio(text) >= KOREAN_RATIO {
        "ko"
    } else {
        "en"
    };
    let lower = text.to_lowercase();
    let mut scored: Vec<(Category, usize)> = CATEGORY_KEYWORDS
        .iter()
        .map(|(cat, kws)| (*cat, kws.iter().filter(|kw| contains_term(&lower, kw)).count()))
        .filter(|(_, n)| *n > 0)
        .collect();
    // Stable sort keeps table order among equal scores.
    scored.sort_by(|a, b| b.1.cmp(&a.1));

    let (category, confidence) = match scored.as_slice() {
        [] => (Category::GeneralFactual, 0.3),
        [(cat, n), rest @ ..] => {
            let tied = rest.first().is_some_and(|(_, m)| m == n);
            let c = if tied {
                0.4
            } else if *n >= 2 {
                0.9
            } else {
                0.6
            };
            (*cat, c)
        }
    };
    QueryContext {
        language: language.to_string(),
        category,
        confidence,
    }
}

/// ASCII keywords must match on word boundaries ("usd" should not hit "usda"); Hangul ones are
/// matched as substrings since particles attach directly to nouns.
fn contains_term(haystack: &str, kw: &str) -> bool {
    if !kw.is_ascii() {
        return haystack.contains(kw);
    }
    let bytes = haystack.as_bytes();
    let mut start = 0;
    while let Some(i) = haystack[start..].find(kw) {
        let at = start + i;
        let end = at + kw.len();
        let left_ok = at == 0 || !bytes[at - 1].is_ascii_alphanumeric();
        let right_ok = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if left_ok && right_ok {
            return true;
        }
        start = at + 1;
        while !haystack.is_char_boundary(start) {
            start += 1;
        }
    }
    false
}

/// Choose engines for a refined query.
///
/// `available` lists engines that are actually configured. The result is filtered to them.
/// When none of the chosen engines is available the policy default is tried, then any
/// available engine; only with nothing configured at all is the unfiltered choice returned,
/// and dispatch records the failures.
pub fn select_engines(
    refined: &RefinedQuery,
    ctx: &QueryContext,
    policy: &EnginePolicy,
    available: &[EngineId],
) -> EngineSelection {
    let matched = policy.rules.iter().find(|r| {
        r.language.as_deref().map_or(true, |l| l == ctx.language)
            && r.category.map_or(true, |c| c == ctx.category)
    });
    let mut chosen: Vec<EngineId> = match matched {
        Some(rule) => rule.engines.clone(),
        None => policy.default.clone(),
    };
    if ctx.confidence < policy.multi_engine_below_confidence {
        chosen.extend(policy.fallback.iter().copied());
    }

    let usable = |engines: &[EngineId]| -> Vec<EngineId> {
        engines.iter().copied().filter(|e| available.contains(e)).collect()
    };
    let mut picked = usable(&chosen);
    if picked.is_empty() {
        picked = usable(&policy.default);
        if picked.is_empty() {
            picked = available.to_vec();
        }
        if picked.is_empty() {
            tracing::warn!(
                wanted = ?chosen,
                "no search engine is configured; dispatching unfiltered selection"
            );
            picked = chosen;
        } else {
            tracing::info!(
                wanted = ?chosen,
                using = ?picked,
                "chosen engines are not configured; routing to configured ones"
            );
        }
    }

    tracing::debug!(
        query = %refined.text,
        language = %ctx.language,
        category = %ctx.category,
        confidence = ctx.confidence,
        engines = ?picked,
        "engines selected"
    );
    EngineSelection::new(picked.iter().copied())
        .or_else(|_| EngineSelection::new(policy.default.iter().copied()))
        .unwrap_or_else(|_| EngineSelection::single(EngineId::Generic))
}
