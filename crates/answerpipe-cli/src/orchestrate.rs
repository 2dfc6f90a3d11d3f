//! The answer loop as an explicit state machine.
//!
//! `Gathering` runs at most `max_iterations` steps. Each step plans one [`Action`], runs it
//! under the request deadline, and folds the resulting [`Observation`] into the evidence.
//! Tools never touch the evidence themselves. When gathering ends the loop moves through
//! `Synthesizing` and `Verifying` to `Done`, or finishes as `Exhausted` when the ceiling was
//! hit first.

use crate::config::Config;
use crate::dispatch::{DispatchOutcome, Dispatcher, EngineStatus};
use crate::evidence::{render_sources, Evidence};
use crate::pipeline::PipelineIssue;
use crate::prompts;
use crate::verify::verify;
use answerpipe_core::{
    EngineSelection, Error, ExtractedDocument, FetchBackend, FetchRequest, FinalAnswer,
    LanguageModel, LlmErrorKind, Prompt, RefinedQuery, Result,
};
use answerpipe_local::extract::{self, ExtractSettings};
use futures::StreamExt;
use serde::Serialize;
use tokio::time::{timeout_at, Duration, Instant};

pub const RETRIEVAL_UNAVAILABLE: &str = "Retrieval was unavailable: every search backend failed or \
timed out, so no sourced answer could be produced for this question.";
pub const NO_SOURCES_FOUND: &str =
    "No relevant sources were found for this question, so no sourced answer could be produced.";
pub const DEADLINE_BEFORE_SOURCES: &str = "The request ran out of time before any sources were \
retrieved, so no sourced answer could be produced.";
pub const UNVERIFIABLE_DRAFT: &str = "The drafted answer could not be verified against the \
retrieved sources, so it has been withheld.";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Gathering,
    Synthesizing,
    Verifying,
    Done,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Search { query: String },
    Extract { urls: Vec<String> },
    /// `sufficient` is false when synthesis is chosen only because nothing more can be gathered.
    Synthesize { sufficient: bool },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Search { .. } => "search",
            Action::Extract { .. } => "extract",
            Action::Synthesize { .. } => "synthesize",
        }
    }
}

#[derive(Debug)]
pub enum Observation {
    Searched(DispatchOutcome),
    Extracted(Vec<ExtractedDocument>),
    DeadlineExpired,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceStep {
    pub iteration: usize,
    pub action: &'static str,
    pub detail: String,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Sufficient,
    Insufficient(Option<String>),
}

#[derive(Debug)]
pub struct LoopOutcome {
    pub answer: FinalAnswer,
    /// Terminal state: `Done`, or `Exhausted` when the iteration ceiling was hit.
    pub state: LoopState,
    /// Every state entered, in order.
    pub transitions: Vec<LoopState>,
    pub trace: Vec<TraceStep>,
    pub statuses: Vec<EngineStatus>,
    pub issues: Vec<PipelineIssue>,
    /// Urls of every search result gathered during the run.
    pub evidence_urls: Vec<String>,
}

pub struct Orchestrator<'a> {
    llm: &'a dyn LanguageModel,
    dispatcher: &'a Dispatcher,
    fetcher: &'a dyn FetchBackend,
    cfg: &'a Config,
}

/// Mutable bookkeeping for one run, kept out of the evidence itself.
#[derive(Default)]
struct RunState {
    trace: Vec<TraceStep>,
    statuses: Vec<EngineStatus>,
    last_dispatch_all_failed: bool,
    extracted_since_search: bool,
    timed_out: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        llm: &'a dyn LanguageModel,
        dispatcher: &'a Dispatcher,
        fetcher: &'a dyn FetchBackend,
        cfg: &'a Config,
    ) -> Self {
        Self {
            llm,
            dispatcher,
            fetcher,
            cfg,
        }
    }

    /// Run the loop against the request `deadline`, which the caller started before the
    /// decision so the whole request shares one budget.
    pub async fn run(
        &self,
        query: &str,
        refined: &RefinedQuery,
        selection: &EngineSelection,
        language: &str,
        deadline: Instant,
    ) -> Result<LoopOutcome> {
        let lc = &self.cfg.loop_;
        let mut ev = Evidence::new();
        let mut rs = RunState::default();
        let mut sufficient = false;
        let mut exhausted = false;
        let mut state = LoopState::Gathering;
        let mut transitions = vec![state];

        let mut iteration = 0;
        while state == LoopState::Gathering {
            if iteration >= lc.max_iterations {
                tracing::warn!(iterations = iteration, "iteration ceiling reached");
                exhausted = true;
                state = LoopState::Synthesizing;
                break;
            }
            let t0 = Instant::now();
            if t0 >= deadline {
                rs.timed_out = true;
                rs.trace.push(TraceStep {
                    iteration,
                    action: "plan",
                    detail: "request deadline expired".to_string(),
                    elapsed_ms: 0,
                });
                tracing::warn!(iteration, "request deadline expired before the step started");
                state = LoopState::Synthesizing;
                break;
            }
            let action = match timeout_at(deadline, self.plan(query, refined, &ev, &rs, iteration)).await
            {
                Ok(a) => a,
                Err(_) => {
                    rs.timed_out = true;
                    rs.trace.push(TraceStep {
                        iteration,
                        action: "plan",
                        detail: "request deadline expired".to_string(),
                        elapsed_ms: t0.elapsed().as_millis(),
                    });
                    state = LoopState::Synthesizing;
                    break;
                }
            };
            tracing::debug!(iteration, action = action.name(), "planned");

            let observation = match &action {
                Action::Synthesize { sufficient: s } => {
                    sufficient = *s;
                    rs.trace.push(TraceStep {
                        iteration,
                        action: action.name(),
                        detail: if *s { "sufficient" } else { "best effort" }.to_string(),
                        elapsed_ms: t0.elapsed().as_millis(),
                    });
                    state = LoopState::Synthesizing;
                    break;
                }
                Action::Search { query: q } => {
                    ev.record_query(q);
                    let step_query = RefinedQuery {
                        text: q.clone(),
                        style: refined.style,
                    };
                    let fut = self
                        .dispatcher
                        .dispatch(&step_query, selection, Some(language));
                    timeout_at(deadline, fut)
                        .await
                        .map(Observation::Searched)
                        .unwrap_or(Observation::DeadlineExpired)
                }
                Action::Extract { urls } => {
                    let targets: Vec<(String, String)> = urls
                        .iter()
                        .map(|u| {
                            let snippet = ev
                                .results()
                                .iter()
                                .find(|r| &r.url == u)
                                .map(|r| r.snippet.clone())
                                .unwrap_or_default();
                            (u.clone(), snippet)
                        })
                        .collect();
                    timeout_at(deadline, self.extract_batch(targets))
                        .await
                        .map(Observation::Extracted)
                        .unwrap_or(Observation::DeadlineExpired)
                }
            };

            let detail = self.observe(observation, &mut ev, &mut rs);
            rs.trace.push(TraceStep {
                iteration,
                action: action.name(),
                detail,
                elapsed_ms: t0.elapsed().as_millis(),
            });
            if rs.timed_out {
                tracing::warn!(iteration, "request deadline expired; synthesizing what was gathered");
                state = LoopState::Synthesizing;
            }
            iteration += 1;
        }
        debug_assert_eq!(state, LoopState::Synthesizing);
        transitions.push(state);

        let mut issues = Vec::new();
        for st in rs.statuses.iter().filter(|s| !s.ok) {
            let issue = PipelineIssue::BackendUnavailable {
                engine: st.engine,
                kind: st.failure.as_ref().map(|f| f.kind),
            };
            if !issues.contains(&issue) {
                issues.push(issue);
            }
        }
        let degraded = ev.degraded_documents();
        if degraded > 0 {
            issues.push(PipelineIssue::ExtractionDegraded {
                documents: degraded,
            });
        }
        if exhausted {
            issues.push(PipelineIssue::BudgetExhausted {
                reason: "iteration-ceiling",
            });
        }
        if rs.timed_out {
            issues.push(PipelineIssue::BudgetExhausted {
                reason: "request-deadline",
            });
        }

        let sources = ev.sources(lc.max_source_chars);
        let evidence_urls: Vec<String> = ev.results().iter().map(|r| r.url.clone()).collect();
        let final_state = if exhausted {
            LoopState::Exhausted
        } else {
            LoopState::Done
        };
        let finish = |mut transitions: Vec<LoopState>| {
            transitions.push(final_state);
            transitions
        };

        if sources.is_empty() {
            let all_failed = !rs.statuses.is_empty() && rs.statuses.iter().all(|s| !s.ok);
            let text = if all_failed {
                RETRIEVAL_UNAVAILABLE
            } else if rs.timed_out {
                DEADLINE_BEFORE_SOURCES
            } else {
                NO_SOURCES_FOUND
            };
            tracing::warn!(all_failed, "no evidence gathered; skipping synthesis");
            return Ok(LoopOutcome {
                answer: FinalAnswer {
                    text: text.to_string(),
                    citations: Vec::new(),
                    verified: false,
                    low_confidence: true,
                },
                state: final_state,
                transitions: finish(transitions),
                trace: rs.trace,
                statuses: rs.statuses,
                issues,
                evidence_urls,
            });
        }

        let caveat = if exhausted || rs.timed_out || !sufficient {
            Some("The sources may be incomplete. Say so briefly if they do not fully answer the question.")
        } else {
            None
        };
        let prompt = prompts::synthesize(query, &refined.text, &render_sources(&sources), caveat);
        let draft = final_call(self.llm, &prompt, final_call_deadline(deadline, lc.synthesis_floor_ms))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "synthesis failed");
                Error::SynthesisFailed(e.to_string())
            })?;

        transitions.push(LoopState::Verifying);
        let v = verify(&draft, &sources, lc.support_threshold);
        tracing::info!(
            kept = v.kept,
            removed = v.removed,
            dropped_markers = v.dropped_markers,
            citations = v.citations.len(),
            "draft verified"
        );
        let answer = if v.all_removed() {
            issues.push(PipelineIssue::SynthesisFailed {
                reason: "no sentence of the draft was supported by the sources".to_string(),
            });
            FinalAnswer {
                text: UNVERIFIABLE_DRAFT.to_string(),
                citations: Vec::new(),
                verified: false,
                low_confidence: true,
            }
        } else {
            FinalAnswer {
                text: v.text,
                citations: v.citations,
                verified: true,
                low_confidence: exhausted || rs.timed_out || !sufficient,
            }
        };

        Ok(LoopOutcome {
            answer,
            state: final_state,
            transitions: finish(transitions),
            trace: rs.trace,
            statuses: rs.statuses,
            issues,
            evidence_urls,
        })
    }

    async fn plan(
        &self,
        query: &str,
        refined: &RefinedQuery,
        ev: &Evidence,
        rs: &RunState,
        iteration: usize,
    ) -> Action {
        if iteration == 0 {
            return Action::Search {
                query: refined.text.clone(),
            };
        }
        if !rs.extracted_since_search {
            let urls: Vec<String> = ev
                .needs_extraction(self.cfg.extract.min_snippet_chars)
                .into_iter()
                .take(self.cfg.loop_.max_extract_per_iteration)
                .map(|r| r.url.clone())
                .collect();
            if !urls.is_empty() {
                return Action::Extract { urls };
            }
        }
        if ev.is_empty() && rs.last_dispatch_all_failed {
            return Action::Synthesize { sufficient: false };
        }
        match self.assess(query, ev).await {
            Verdict::Sufficient => Action::Synthesize { sufficient: true },
            Verdict::Insufficient(Some(follow_up)) if !ev.has_searched(&follow_up) => {
                Action::Search { query: follow_up }
            }
            Verdict::Insufficient(_) => Action::Synthesize { sufficient: false },
        }
    }

    async fn assess(&self, query: &str, ev: &Evidence) -> Verdict {
        let sources = ev.sources(self.cfg.loop_.max_source_chars);
        let prompt = prompts::sufficiency(query, &render_sources(&sources));
        match self.llm.complete(&prompt).await {
            Ok(raw) => match parse_verdict(&raw) {
                Some(v) => v,
                None => {
                    tracing::debug!("unparseable sufficiency verdict; using heuristic");
                    heuristic_verdict(ev, self.cfg.extract.min_snippet_chars)
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "sufficiency check failed; using heuristic");
                heuristic_verdict(ev, self.cfg.extract.min_snippet_chars)
            }
        }
    }

    /// Fold one observation into the evidence; returns a short trace detail.
    fn observe(&self, obs: Observation, ev: &mut Evidence, rs: &mut RunState) -> String {
        match obs {
            Observation::Searched(outcome) => {
                let failed = outcome.failed_engines().len();
                rs.last_dispatch_all_failed = outcome.all_failed();
                rs.extracted_since_search = false;
                rs.statuses.extend(outcome.statuses);
                let added = ev.add_results(outcome.results);
                format!("{added} new results, {failed} engine(s) failed")
            }
            Observation::Extracted(docs) => {
                rs.extracted_since_search = true;
                let n = docs.len();
                let degraded = docs.iter().filter(|d| d.is_degraded()).count();
                for d in docs {
                    ev.add_document(d);
                }
                format!("{n} documents, {degraded} degraded")
            }
            Observation::DeadlineExpired => {
                rs.timed_out = true;
                "request deadline expired".to_string()
            }
        }
    }

    /// Fetch and extract pages concurrently; output order follows `targets`.
    async fn extract_batch(&self, targets: Vec<(String, String)>) -> Vec<ExtractedDocument> {
        futures::stream::iter(
            targets
                .into_iter()
                .map(|(url, snippet)| self.extract_one(url, snippet)),
        )
        .buffered(self.cfg.loop_.max_in_flight_extractions.max(1))
        .collect()
        .await
    }

    async fn extract_one(&self, url: String, snippet: String) -> ExtractedDocument {
        let xc = &self.cfg.extract;
        let request = |u: &str| {
            let mut req = FetchRequest::new(u);
            req.timeout_ms = Some(xc.fetch_timeout_ms);
            req.max_bytes = Some(xc.max_bytes);
            req
        };
        let resp = match self.fetcher.fetch(&request(&url)).await {
            Ok(r) => r,
            Err(err) => {
                tracing::debug!(url = %url, error = %err, "fetch failed; keeping snippet");
                return extract::snippet_only(&url, &snippet, "fetch_failed");
            }
        };
        if !resp.is_success() {
            tracing::debug!(url = %url, status = resp.status, "non-success status; keeping snippet");
            return extract::snippet_only(&url, &snippet, "http_status");
        }
        if !extract::is_extractable(resp.content_type.as_deref(), &resp.bytes) {
            return extract::snippet_only(&url, &snippet, "unsupported_content_type");
        }
        let mut html = resp.text_lossy();
        if let Some(frame) = extract::follow_frame_url(&resp.final_url, &html) {
            match self.fetcher.fetch(&request(&frame)).await {
                Ok(r) if r.is_success() => html = r.text_lossy(),
                _ => tracing::debug!(url = %url, frame = %frame, "frame fetch failed; using outer page"),
            }
        }

        let settings = ExtractSettings {
            min_text_chars: xc.min_text_chars,
            max_chars: xc.max_chars,
            ..ExtractSettings::default()
        };
        let (u, s) = (url.clone(), snippet.clone());
        match tokio::task::spawn_blocking(move || extract::extract(&u, &html, &s, &settings)).await {
            Ok(doc) => doc,
            Err(err) => {
                tracing::warn!(url = %url, error = %err, "extraction task failed");
                extract::snippet_only(&url, &snippet, "extract_task_failed")
            }
        }
    }
}

/// `SUFFICIENT` or `INSUFFICIENT: <follow-up query>` on the first non-empty line.
/// The last model call of a request may outlive the request deadline by up to `floor_ms`.
pub fn final_call_deadline(deadline: Instant, floor_ms: u64) -> Instant {
    deadline.max(Instant::now() + Duration::from_millis(floor_ms))
}

/// A model call that reports an elapsed `until` as a timeout.
pub async fn final_call(llm: &dyn LanguageModel, prompt: &Prompt, until: Instant) -> Result<String> {
    match timeout_at(until, llm.complete(prompt)).await {
        Ok(r) => r,
        Err(_) => Err(Error::llm(
            LlmErrorKind::Timeout,
            format!("{} call exceeded the request deadline", prompt.kind.as_str()),
        )),
    }
}

fn parse_verdict(raw: &str) -> Option<Verdict> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line.trim_start_matches(|c: char| !c.is_alphanumeric());
    let upper = line.to_ascii_uppercase();
    if upper.starts_with("INSUFFICIENT") {
        let rest = line
            .get("INSUFFICIENT".len()..)
            .unwrap_or("")
            .trim_start_matches(|c: char| !c.is_alphanumeric())
            .trim()
            .trim_matches(|c: char| matches!(c, '"' | '\'' | '`'))
            .trim();
        Some(Verdict::Insufficient(
            (!rest.is_empty()).then(|| rest.to_string()),
        ))
    } else if upper.starts_with("SUFFICIENT") {
        Some(Verdict::Sufficient)
    } else {
        None
    }
}

/// Enough when there is a direct answer, a well-extracted page, or two substantial snippets.
fn heuristic_verdict(ev: &Evidence, min_snippet_chars: usize) -> Verdict {
    let strong_doc = ev.documents().any(|d| !d.is_degraded());
    let substantial = ev
        .results()
        .iter()
        .filter(|r| r.snippet.chars().count() >= min_snippet_chars)
        .count();
    if strong_doc || substantial >= 2 {
        Verdict::Sufficient
    } else {
        Verdict::Insufficient(None)
    }
}
