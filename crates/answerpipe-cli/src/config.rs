//! Process-wide configuration, read once at startup.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. a JSON file (`--config`, `ANSWERPIPE_CONFIG`, or `<config dir>/answerpipe/config.json`)
//! 3. environment variables for secrets and endpoints (`ANSWERPIPE_*`, then vendor names)
//!
//! The resulting [`Config`] is validated and then shared read-only (`Arc<Config>`).

use crate::select::Category;
use answerpipe_core::{EngineId, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// OpenAI chat completions or any server speaking the same protocol.
    #[serde(alias = "openai")]
    OpenAiCompat,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAiCompat,
            model: answerpipe_local::openai_compat::DEFAULT_MODEL.to_string(),
            base_url: None,
            api_key: None,
            timeout_ms: 30_000,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleCseConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub cse_id: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SerpApiConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NaverConfig {
    pub client_id: Option<String>,
    #[serde(skip_serializing)]
    pub client_secret: Option<String>,
    pub base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Results requested from each engine.
    pub max_results: usize,
    /// Outer bound on one engine call, on top of the adapter's own timeout.
    pub per_engine_timeout_ms: u64,
    pub google_cse: GoogleCseConfig,
    pub serpapi: SerpApiConfig,
    pub naver: NaverConfig,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            max_results: 5,
            per_engine_timeout_ms: 10_000,
            google_cse: GoogleCseConfig::default(),
            serpapi: SerpApiConfig::default(),
            naver: NaverConfig::default(),
        }
    }
}

/// One row of the engine policy. A rule matches when every field it sets matches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineRule {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
    pub engines: Vec<EngineId>,
}

impl EngineRule {
    fn new(language: Option<&str>, category: Option<Category>, engines: &[EngineId]) -> Self {
        Self {
            language: language.map(str::to_string),
            category,
            engines: engines.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginePolicy {
    /// Checked in order; the first matching rule wins.
    pub rules: Vec<EngineRule>,
    /// Used when no rule matches.
    pub default: Vec<EngineId>,
    /// Appended when category confidence is below `multi_engine_below_confidence`.
    pub fallback: Vec<EngineId>,
    pub multi_engine_below_confidence: f32,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        use Category::*;
        use EngineId::*;
        Self {
            rules: vec![
                EngineRule::new(None, Some(Weather), &[AnswerBox]),
                EngineRule::new(None, Some(Finance), &[AnswerBox, Generic]),
                EngineRule::new(Some("ko"), Some(News), &[Locale, AnswerBox]),
                EngineRule::new(None, Some(News), &[AnswerBox]),
                EngineRule::new(Some("ko"), Some(LocalBusiness), &[Locale]),
                EngineRule::new(Some("ko"), Some(Shopping), &[Locale]),
                EngineRule::new(None, Some(Academic), &[Generic]),
                EngineRule::new(Some("ko"), None, &[Locale]),
            ],
            default: vec![Generic],
            fallback: vec![Generic, Locale],
            multi_engine_below_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Minimum characters for an extraction step to be accepted.
    pub min_text_chars: usize,
    /// Cap on stored text per document.
    pub max_chars: usize,
    /// Snippets shorter than this trigger a page fetch.
    pub min_snippet_chars: usize,
    pub fetch_timeout_ms: u64,
    pub max_bytes: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            min_text_chars: 200,
            max_chars: 2_000,
            min_snippet_chars: 120,
            fetch_timeout_ms: 10_000,
            max_bytes: 2_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub enabled: bool,
    pub node_bin: String,
    pub node_path: Option<String>,
    pub timeout_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            node_bin: "node".to_string(),
            node_path: None,
            timeout_ms: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Hard ceiling on gathering iterations.
    pub max_iterations: usize,
    pub max_extract_per_iteration: usize,
    pub max_in_flight_extractions: usize,
    /// Wall-clock budget for one request, from the decision to the last tool step.
    pub request_timeout_ms: u64,
    /// Time still granted to the final model call when the budget is already spent.
    pub synthesis_floor_ms: u64,
    /// Minimum token overlap for an uncited sentence to count as supported.
    pub support_threshold: f32,
    /// Cap on characters of each source shown to the model.
    pub max_source_chars: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            max_extract_per_iteration: 3,
            max_in_flight_extractions: 3,
            request_timeout_ms: 60_000,
            synthesis_floor_ms: 15_000,
            support_threshold: 0.5,
            max_source_chars: 1_500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub search: SearchSettings,
    pub policy: EnginePolicy,
    pub extract: ExtractConfig,
    pub render: RenderConfig,
    #[serde(rename = "loop")]
    pub loop_: LoopConfig,
    /// tracing filter used when `ANSWERPIPE_LOG` is unset.
    pub log_level: Option<String>,
}

/// Default location of the config file, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("answerpipe").join("config.json"))
}

impl Config {
    /// Load, overlay env, validate.
    ///
    /// An explicitly named file must exist; the default location is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| answerpipe_local::env("ANSWERPIPE_CONFIG").map(PathBuf::from));
        let mut cfg = match explicit {
            Some(p) => Self::from_file(&p)?,
            None => match default_config_path().filter(|p| p.is_file()) {
                Some(p) => Self::from_file(&p)?,
                None => Self::default(),
            },
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(answerpipe_local::env);
    }

    /// Overlay secrets and endpoints from `get` (project key first, vendor key second).
    /// Values already present in the file are only replaced when the env sets them.
    pub fn apply_env_with(&mut self, get: impl Fn(&str) -> Option<String>) {
        let any = |keys: &[&str]| keys.iter().find_map(|k| get(k));
        let set = |slot: &mut Option<String>, keys: &[&str]| {
            if let Some(v) = any(keys) {
                *slot = Some(v);
            }
        };

        if let Some(p) = any(&["ANSWERPIPE_LLM_PROVIDER"]) {
            match p.to_ascii_lowercase().as_str() {
                "ollama" => self.llm.provider = LlmProvider::Ollama,
                "openai" | "openai_compat" | "openai-compat" => {
                    self.llm.provider = LlmProvider::OpenAiCompat
                }
                other => tracing::warn!(provider = other, "ignoring unknown ANSWERPIPE_LLM_PROVIDER"),
            }
        }
        if let Some(m) = any(&["ANSWERPIPE_LLM_MODEL", "OPENAI_MODEL"]) {
            self.llm.model = m;
        }
        match self.llm.provider {
            LlmProvider::OpenAiCompat => {
                set(&mut self.llm.api_key, &["ANSWERPIPE_OPENAI_API_KEY", "OPENAI_API_KEY"]);
                set(
                    &mut self.llm.base_url,
                    &["ANSWERPIPE_OPENAI_BASE_URL", "OPENAI_BASE_URL"],
                );
            }
            LlmProvider::Ollama => {
                set(&mut self.llm.base_url, &["ANSWERPIPE_OLLAMA_BASE_URL", "OLLAMA_HOST"]);
            }
        }

        let s = &mut self.search;
        set(&mut s.google_cse.api_key, &["ANSWERPIPE_GOOGLE_API_KEY", "GOOGLE_API_KEY"]);
        set(&mut s.google_cse.cse_id, &["ANSWERPIPE_GOOGLE_CSE_ID", "CSE_ID"]);
        set(&mut s.serpapi.api_key, &["ANSWERPIPE_SERPAPI_API_KEY", "SERPAPI_API_KEY"]);
        set(&mut s.naver.client_id, &["ANSWERPIPE_NAVER_CLIENT_ID", "NAVER_CLIENT_ID"]);
        set(
            &mut s.naver.client_secret,
            &["ANSWERPIPE_NAVER_CLIENT_SECRET", "NAVER_CLIENT_SECRET"],
        );

        if let Some(v) = any(&["ANSWERPIPE_RENDER_ENABLED"]) {
            self.render.enabled = !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off");
        }
        set(&mut self.render.node_path, &["ANSWERPIPE_NODE_PATH"]);
    }

    pub fn validate(&self) -> Result<()> {
        fn bad(msg: &str) -> Result<()> {
            Err(Error::Config(msg.to_string()))
        }
        if self.llm.model.trim().is_empty() {
            return bad("llm.model must not be empty");
        }
        if self.llm.timeout_ms == 0 {
            return bad("llm.timeout_ms must be greater than 0");
        }
        if self.search.max_results == 0 {
            return bad("search.max_results must be greater than 0");
        }
        if self.search.per_engine_timeout_ms == 0 {
            return bad("search.per_engine_timeout_ms must be greater than 0");
        }
        if self.policy.default.is_empty() {
            return bad("policy.default must name at least one engine");
        }
        if let Some(i) = self.policy.rules.iter().position(|r| r.engines.is_empty()) {
            return Err(Error::Config(format!(
                "policy.rules[{i}] must name at least one engine"
            )));
        }
        if !(0.0..=1.0).contains(&self.policy.multi_engine_below_confidence) {
            return bad("policy.multi_engine_below_confidence must be within 0..=1");
        }
        if self.extract.fetch_timeout_ms == 0 || self.extract.max_bytes == 0 {
            return bad("extract.fetch_timeout_ms and extract.max_bytes must be greater than 0");
        }
        if self.extract.max_chars == 0 {
            return bad("extract.max_chars must be greater than 0");
        }
        if self.loop_.max_iterations == 0 {
            return bad("loop.max_iterations must be greater than 0");
        }
        if self.loop_.max_extract_per_iteration == 0 || self.loop_.max_in_flight_extractions == 0 {
            return bad("loop extraction budgets must be greater than 0");
        }
        if self.loop_.request_timeout_ms == 0 || self.loop_.synthesis_floor_ms == 0 {
            return bad("loop.request_timeout_ms and loop.synthesis_floor_ms must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.loop_.support_threshold) {
            return bad("loop.support_threshold must be within 0..=1");
        }
        if self.loop_.max_source_chars == 0 {
            return bad("loop.max_source_chars must be greater than 0");
        }
        Ok(())
    }

    pub fn google_cse_configured(&self) -> bool {
        let g = &self.search.google_cse;
        g.api_key.is_some() && g.cse_id.is_some()
    }

    pub fn serpapi_configured(&self) -> bool {
        self.search.serpapi.api_key.is_some()
    }

    pub fn naver_configured(&self) -> bool {
        let n = &self.search.naver;
        n.client_id.is_some() && n.client_secret.is_some()
    }

    /// Engines that can serve a query with the current settings.
    pub fn configured_engines(&self) -> Vec<EngineId> {
        let mut out = Vec::new();
        if self.google_cse_configured() || self.render.enabled {
            out.push(EngineId::Generic);
        }
        if self.serpapi_configured() {
            out.push(EngineId::AnswerBox);
        }
        if self.naver_configured() {
            out.push(EngineId::Locale);
        }
        out
    }

    pub fn llm_configured(&self) -> bool {
        match self.llm.provider {
            LlmProvider::OpenAiCompat => self.llm.api_key.is_some() || self.llm.base_url.is_some(),
            LlmProvider::Ollama => true,
        }
    }
}
