use crate::openai_compat::{classify_llm_status, classify_llm_transport};
use answerpipe_core::{Error, LanguageModel, LlmErrorKind, Prompt, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout_ms: u64,
    temperature: f64,
}

impl OllamaClient {
    pub fn new(
        client: reqwest::Client,
        base_url: Option<String>,
        model: String,
        timeout_ms: u64,
        temperature: f64,
    ) -> Result<Self> {
        if model.trim().is_empty() {
            return Err(Error::NotConfigured("missing model for ollama".to_string()));
        }
        Ok(Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model,
            timeout_ms,
            temperature,
        })
    }

    fn endpoint_chat(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn chat(&self, system: &str, user: &str, max_tokens: Option<u64>) -> Result<String> {
        let req = ChatRequest {
            model: &self.model,
            messages: [
                OutMessage {
                    role: "system",
                    content: system,
                },
                OutMessage {
                    role: "user",
                    content: user,
                },
            ],
            stream: false,
            options: ChatOptions {
                temperature: self.temperature,
                num_predict: max_tokens,
            },
        };

        let resp = self
            .client
            .post(self.endpoint_chat())
            .timeout(std::time::Duration::from_millis(self.timeout_ms))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&req)
            .send()
            .await
            .map_err(|e| classify_llm_transport("ollama", e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::llm(
                classify_llm_status(status),
                format!("ollama chat HTTP {status}"),
            ));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| Error::llm(LlmErrorKind::MalformedOutput, e.to_string()))?;
        Ok(parsed.message.content)
    }
}

#[async_trait::async_trait]
impl LanguageModel for OllamaClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        tracing::debug!(kind = prompt.kind.as_str(), model = %self.model, "llm call");
        self.chat(&prompt.system, &prompt.user, prompt.max_tokens)
            .await
    }
}

/// Non-streaming `/api/chat` body; `num_predict` caps the reply length.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [OutMessage<'a>; 2],
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct OutMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ReplyMessage,
}
