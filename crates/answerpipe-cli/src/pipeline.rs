//! Caller-facing entry point: one query in, one cited answer out.
//!
//! A [`Pipeline`] is built once from an immutable [`Config`] and keeps no state between calls;
//! every `answer*` call gets its own decision memo, evidence and deadline.

use crate::config::{Config, LlmProvider};
use crate::decide::DecisionStage;
use crate::dispatch::{Dispatcher, EngineStatus};
use crate::orchestrate::{final_call, final_call_deadline, LoopState, Orchestrator, TraceStep};
use crate::prompts;
use crate::select::{detect_context, select_engines, QueryContext};
use answerpipe_core::{
    EngineId, EngineSelection, Error, FetchBackend, FinalAnswer, LanguageModel, RefinedQuery,
    Result, RetrievalDecision, SearchErrorKind,
};
use answerpipe_local::google_cse::{GoogleCseProvider, GoogleCseSettings};
use answerpipe_local::naver::NaverProvider;
use answerpipe_local::ollama::OllamaClient;
use answerpipe_local::openai_compat::{OpenAiCompatClient, OpenAiCompatSettings};
use answerpipe_local::render_playwright::{PlaywrightRenderer, RenderSettings};
use answerpipe_local::serpapi::SerpApiProvider;
use answerpipe_local::LocalFetcher;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Non-fatal conditions surfaced alongside an answer.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "issue", rename_all = "kebab-case")]
pub enum PipelineIssue {
    /// The decision model could not be consulted; the run searched anyway.
    DecisionUnavailable,
    BackendUnavailable {
        engine: EngineId,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<SearchErrorKind>,
    },
    ExtractionDegraded { documents: usize },
    /// The draft produced nothing that survived verification.
    SynthesisFailed { reason: String },
    BudgetExhausted { reason: &'static str },
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerReport {
    pub query: String,
    pub decision: RetrievalDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refined: Option<RefinedQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<QueryContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<EngineSelection>,
    pub answer: FinalAnswer,
    pub state: LoopState,
    pub transitions: Vec<LoopState>,
    pub statuses: Vec<EngineStatus>,
    pub trace: Vec<TraceStep>,
    pub issues: Vec<PipelineIssue>,
    /// Urls of every search result gathered; citations are always drawn from these.
    pub evidence_urls: Vec<String>,
    pub elapsed_ms: u128,
}

pub struct Pipeline {
    cfg: Arc<Config>,
    llm: Arc<dyn LanguageModel>,
    dispatcher: Dispatcher,
    fetcher: Arc<dyn FetchBackend>,
}

impl Pipeline {
    pub fn new(
        cfg: Arc<Config>,
        llm: Arc<dyn LanguageModel>,
        dispatcher: Dispatcher,
        fetcher: Arc<dyn FetchBackend>,
    ) -> Self {
        Self {
            cfg,
            llm,
            dispatcher,
            fetcher,
        }
    }

    /// Wire the real adapters, fetcher and model client from configuration.
    /// Adapters without credentials are left out; selection then routes around them.
    /// An invalid configuration is an error here, before anything is built.
    pub fn from_config(cfg: Arc<Config>) -> Result<Self> {
        cfg.validate()?;
        let overall = cfg.loop_.request_timeout_ms.max(cfg.llm.timeout_ms);
        let client =
            answerpipe_local::http_client(Duration::from_secs(10), Duration::from_millis(overall))?;

        let llm: Arc<dyn LanguageModel> = match cfg.llm.provider {
            LlmProvider::OpenAiCompat => {
                if !cfg.llm_configured() {
                    tracing::warn!("no OpenAI API key or base url configured; model calls will fail");
                }
                let settings = OpenAiCompatSettings {
                    base_url: cfg
                        .llm
                        .base_url
                        .clone()
                        .unwrap_or_else(|| answerpipe_local::openai_compat::DEFAULT_BASE_URL.to_string()),
                    api_key: cfg.llm.api_key.clone(),
                    model: cfg.llm.model.clone(),
                    timeout_ms: cfg.llm.timeout_ms,
                    temperature: cfg.llm.temperature,
                };
                Arc::new(OpenAiCompatClient::new(client.clone(), settings)?)
            }
            LlmProvider::Ollama => Arc::new(OllamaClient::new(
                client.clone(),
                cfg.llm.base_url.clone(),
                cfg.llm.model.clone(),
                cfg.llm.timeout_ms,
                cfg.llm.temperature,
            )?),
        };

        let s = &cfg.search;
        let mut dispatcher = Dispatcher::new(s.max_results, s.per_engine_timeout_ms);

        let renderer = PlaywrightRenderer::new(RenderSettings {
            enabled: cfg.render.enabled,
            node_bin: cfg.render.node_bin.clone(),
            node_path: cfg.render.node_path.clone(),
            timeout_ms: cfg.render.timeout_ms,
            ..RenderSettings::default()
        });
        let google = GoogleCseProvider::new(
            client.clone(),
            GoogleCseSettings {
                api_key: s.google_cse.api_key.clone(),
                cse_id: s.google_cse.cse_id.clone(),
                endpoint: s
                    .google_cse
                    .endpoint
                    .clone()
                    .unwrap_or_else(|| answerpipe_local::google_cse::DEFAULT_ENDPOINT.to_string()),
                ..GoogleCseSettings::default()
            },
            Some(renderer),
        );
        if google.is_usable() {
            dispatcher = dispatcher.with_provider(Arc::new(google));
        }
        let serpapi = SerpApiProvider::new(
            client.clone(),
            s.serpapi.api_key.clone(),
            s.serpapi.endpoint.clone(),
        );
        if serpapi.is_configured() {
            dispatcher = dispatcher.with_provider(Arc::new(serpapi));
        }
        let naver = NaverProvider::new(
            client.clone(),
            s.naver.client_id.clone(),
            s.naver.client_secret.clone(),
            s.naver.base.clone(),
        );
        if naver.is_configured() {
            dispatcher = dispatcher.with_provider(Arc::new(naver));
        }
        if dispatcher.engines().is_empty() {
            tracing::warn!("no search backend is configured; searches will report retrieval unavailable");
        }

        let fetcher = Arc::new(LocalFetcher::new(client).with_default_max_bytes(cfg.extract.max_bytes));
        tracing::debug!(
            llm = llm.name(),
            engines = ?dispatcher.engines(),
            "pipeline ready"
        );
        Ok(Self::new(cfg, llm, dispatcher, fetcher))
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub async fn answer(&self, query: &str) -> Result<FinalAnswer> {
        Ok(self.answer_with_report(query).await?.answer)
    }

    pub async fn answer_with_report(&self, query: &str) -> Result<AnswerReport> {
        let t0 = Instant::now();
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::NotSupported("empty query".to_string()));
        }

        let deadline = t0 + Duration::from_millis(self.cfg.loop_.request_timeout_ms);
        let stage = DecisionStage::new(self.llm.as_ref()).with_deadline(deadline);
        let decision = stage.decide(query).await;
        let mut issues = Vec::new();
        if decision.rationale == RetrievalDecision::UNAVAILABLE {
            issues.push(PipelineIssue::DecisionUnavailable);
        }

        if !decision.needs_search {
            let until = final_call_deadline(deadline, self.cfg.loop_.synthesis_floor_ms);
            let text = final_call(self.llm.as_ref(), &prompts::direct_answer(query), until)
                .await
                .map_err(|e| Error::SynthesisFailed(e.to_string()))?;
            tracing::info!("answered without search");
            return Ok(AnswerReport {
                query: query.to_string(),
                decision,
                refined: None,
                context: None,
                selection: None,
                answer: FinalAnswer {
                    text: text.trim().to_string(),
                    citations: Vec::new(),
                    verified: false,
                    low_confidence: false,
                },
                state: LoopState::Done,
                transitions: vec![LoopState::Synthesizing, LoopState::Done],
                statuses: Vec::new(),
                trace: Vec::new(),
                issues,
                evidence_urls: Vec::new(),
                elapsed_ms: t0.elapsed().as_millis(),
            });
        }

        let refined = stage.refine(query, &decision.rationale).await;
        let context = detect_context(query);
        let selection = select_engines(
            &refined,
            &context,
            &self.cfg.policy,
            &self.dispatcher.engines(),
        );
        let outcome = Orchestrator::new(
            self.llm.as_ref(),
            &self.dispatcher,
            self.fetcher.as_ref(),
            &self.cfg,
        )
        .run(query, &refined, &selection, &context.language, deadline)
        .await?;
        issues.extend(outcome.issues);

        tracing::info!(
            state = ?outcome.state,
            citations = outcome.answer.citations.len(),
            verified = outcome.answer.verified,
            low_confidence = outcome.answer.low_confidence,
            "answer ready"
        );
        Ok(AnswerReport {
            query: query.to_string(),
            decision,
            refined: Some(refined),
            context: Some(context),
            selection: Some(selection),
            answer: outcome.answer,
            state: outcome.state,
            transitions: outcome.transitions,
            statuses: outcome.statuses,
            trace: outcome.trace,
            issues,
            evidence_urls: outcome.evidence_urls,
            elapsed_ms: t0.elapsed().as_millis(),
        })
    }
}
