use answerpipe_core::{Error, LanguageModel, LlmErrorKind, Prompt, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct OpenAiCompatSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_ms: u64,
    pub temperature: f64,
}

impl Default for OpenAiCompatSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            timeout_ms: 30_000,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    settings: OpenAiCompatSettings,
}

pub(crate) fn classify_llm_status(status: reqwest::StatusCode) -> LlmErrorKind {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        LlmErrorKind::RateLimited
    } else if status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::GATEWAY_TIMEOUT
    {
        LlmErrorKind::Timeout
    } else {
        LlmErrorKind::Unavailable
    }
}

pub(crate) fn classify_llm_transport(who: &str, e: reqwest::Error) -> Error {
    let kind = if e.is_timeout() {
        LlmErrorKind::Timeout
    } else if e.is_decode() {
        LlmErrorKind::MalformedOutput
    } else {
        LlmErrorKind::Unavailable
    };
    Error::llm(kind, format!("{who}: {e}"))
}

impl OpenAiCompatClient {
    pub fn new(client: reqwest::Client, settings: OpenAiCompatSettings) -> Result<Self> {
        if settings.model.trim().is_empty() {
            return Err(Error::NotConfigured(
                "missing model for openai_compat".to_string(),
            ));
        }
        Ok(Self { client, settings })
    }

    pub fn base_url(&self) -> &str {
        &self.settings.base_url
    }

    fn endpoint_chat_completions(&self) -> String {
        let base = self.settings.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    pub async fn chat(&self, system: &str, user: &str, max_tokens: Option<u64>) -> Result<String> {
        let req = ChatCompletionsRequest {
            model: self.settings.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens,
            temperature: Some(self.settings.temperature),
            stream: Some(false),
        };

        let mut rb = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(std::time::Duration::from_millis(self.settings.timeout_ms))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(k) = &self.settings.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
        }

        let resp = rb
            .json(&req)
            .send()
            .await
            .map_err(|e| classify_llm_transport("openai_compat", e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::llm(
                classify_llm_status(status),
                format!("openai_compat chat.completions HTTP {status}"),
            ));
        }

        let parsed: ChatCompletionsResponse = resp
            .json()
            .await
            .map_err(|e| Error::llm(LlmErrorKind::MalformedOutput, e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                Error::llm(
                    LlmErrorKind::MalformedOutput,
                    "openai_compat: response had no message content",
                )
            })
    }
}

#[async_trait::async_trait]
impl LanguageModel for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.settings.model
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        tracing::debug!(kind = prompt.kind.as_str(), model = %self.settings.model, "llm call");
        self.chat(&prompt.system, &prompt.user, prompt.max_tokens)
            .await
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}
