//! Prompt builders. Each returns a [`Prompt`] tagged with its [`PromptKind`].

use answerpipe_core::{Prompt, PromptKind, RewriteStyle};

const DECIDE_SYSTEM: &str = "You route user questions for a search-augmented assistant. \
Answer with exactly one line: `SEARCH: <reason>` or `NO_SEARCH: <reason>`.";

pub fn decide(query: &str) -> Prompt {
    let user = format!(
        "Decide whether the question below needs a web search.\n\
- NO_SEARCH when the meaning is unclear, or when general knowledge answers it accurately right away.\n\
- SEARCH when the user explicitly asks for a search, or when the answer depends on recent or \
changing information (news, prices, rates, statistics, schedules, weather).\n\
\n\
Question: 'ㅇ'\nAnswer: NO_SEARCH: meaningless input\n\n\
Question: 'what is a Python list comprehension?'\nAnswer: NO_SEARCH: stable programming concept\n\n\
Question: '엔비디아 최신 주가 알려줘'\nAnswer: SEARCH: live stock price\n\n\
Question: 'search about RAG basics'\nAnswer: SEARCH: explicit search request\n\n\
Question: {query}\nAnswer:"
    );
    Prompt::new(PromptKind::Decide, DECIDE_SYSTEM, user).with_max_tokens(40)
}

const REFINE_SYSTEM: &str = "You rewrite user questions into web search queries. \
Output only the rewritten query on one line, without quotes or labels.";

pub fn refine(style: RewriteStyle, query: &str, rationale: &str) -> Prompt {
    let (task, examples) = match style {
        RewriteStyle::Question => (
            "Rewrite this question into a concise keyword phrase that search results would contain. \
Keep the key nouns and intent; drop interrogatives (why, how, what, when, where) and filler.",
            "Query: '왜 금리가 계속 오르고 있나요?'\nRewritten: 최근 금리 인상 원인\n\n\
Query: 'how does ChatGPT work?'\nRewritten: ChatGPT working principle technology",
        ),
        RewriteStyle::Keyword => (
            "Identify what the user wants to do and rewrite it as a precise search phrase. \
Keep concrete constraints (version, region, period); drop requests like 'tell me'.",
            "Query: '파이썬 3.10 버전으로 웹 크롤링 하는 기초적인 법 알려줘'\nRewritten: 파이썬 3.10 웹 크롤링 기초\n\n\
Query: 'tips for writing a one-minute interview self introduction'\nRewritten: one minute interview self introduction tips",
        ),
        RewriteStyle::Exploratory => (
            "The user is exploring a broad topic (examples, recommendations, comparisons, trends). \
Rewrite it into a slightly more specific search sentence that reflects that intent without \
leaving the original topic.",
            "Query: '요즘 인기 있는 AI 서비스 뭐가 있어?'\nRewritten: 최신 인기 AI 서비스 종류 및 특징 비교\n\n\
Query: 'climate change impact'\nRewritten: climate change environmental and social impact analysis",
        ),
        RewriteStyle::Basic | RewriteStyle::Verbatim => (
            "The query is short or unclear. Keep its most important words and remove noise. \
Do not invent places, dates or other context that the user did not give.",
            "Query: '엔비디아 주가 얼마임?'\nRewritten: 엔비디아 주가\n\n\
Query: 'weather'\nRewritten: weather information",
        ),
    };
    let user = format!(
        "{task}\n\n{examples}\n\nWhy a search is needed: {rationale}\n\nQuery: {query}\nRewritten:"
    );
    Prompt::new(PromptKind::Refine, REFINE_SYSTEM, user).with_max_tokens(64)
}

const SUFFICIENCY_SYSTEM: &str = "You judge whether retrieved sources are enough to answer a question. \
Reply with one line: `SUFFICIENT` or `INSUFFICIENT: <follow-up search query>`.";

pub fn sufficiency(query: &str, sources: &str) -> Prompt {
    let user = format!(
        "Question: {query}\n\nSources gathered so far:\n{sources}\n\n\
Can the question be answered from these sources alone? If not, give one short follow-up \
search query that would fill the gap."
    );
    Prompt::new(PromptKind::Sufficiency, SUFFICIENCY_SYSTEM, user).with_max_tokens(48)
}

const SYNTHESIZE_SYSTEM: &str = "You answer questions strictly from the numbered sources you are given. \
Every factual sentence ends with the marker of the source it comes from, like [1] or [2]. \
Never cite a number that is not in the list. Do not add a separate source list.";

pub fn synthesize(query: &str, refined: &str, sources: &str, caveat: Option<&str>) -> Prompt {
    let mut user = format!(
        "Question: {query}\nSearch query used: {refined}\n\nSources:\n{sources}\n\n\
Write an answer of at least three or four sentences based only on the sources. Keep important \
facts, figures and names; leave out ads and unrelated material."
    );
    if let Some(c) = caveat {
        user.push_str("\n\nNote: ");
        user.push_str(c);
    }
    Prompt::new(PromptKind::Synthesize, SYNTHESIZE_SYSTEM, user).with_max_tokens(700)
}

pub fn direct_answer(query: &str) -> Prompt {
    Prompt::new(
        PromptKind::DirectAnswer,
        "Answer briefly and clearly from general knowledge.",
        format!("Question: {query}\nAnswer:"),
    )
    .with_max_tokens(200)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_carry_their_kind_and_input() {
        let p = decide("latest NVIDIA stock price");
        assert_eq!(p.kind, PromptKind::Decide);
        assert!(p.user.ends_with("Question: latest NVIDIA stock price\nAnswer:"));

        let p = refine(RewriteStyle::Keyword, "설치 방법", "how-to");
        assert_eq!(p.kind, PromptKind::Refine);
        assert!(p.user.contains("Query: 설치 방법\nRewritten:"));
        assert!(p.user.contains("how-to"));

        let p = synthesize("q", "r", "[1] a", Some("retrieval was unavailable"));
        assert_eq!(p.kind, PromptKind::Synthesize);
        assert!(p.user.contains("retrieval was unavailable"));
    }

    #[test]
    fn each_style_gets_a_distinct_instruction() {
        let a = refine(RewriteStyle::Question, "x", "r").user;
        let b = refine(RewriteStyle::Keyword, "x", "r").user;
        let c = refine(RewriteStyle::Exploratory, "x", "r").user;
        let d = refine(RewriteStyle::Basic, "x", "r").user;
        assert!(a != b && b != c && c != d && a != d);
    }
}
