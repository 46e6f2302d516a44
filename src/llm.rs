use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::{LlmConfig, LlmProvider};

const COST_ROUNDING: i32 = 4;
const TOKENS_DIV_BY: f64 = 1024.0;
/// Rough average for English-like text; good enough to stay under a context limit.
const CHARS_PER_TOKEN: usize = 4;
const DEFAULT_TOKEN_LIMIT: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default = "assistant_role")]
    role: String,
    #[serde(default)]
    content: Option<String>,
}

fn assistant_role() -> String {
    "assistant".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Per-1K-token prices and context size of a model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub cost_input: f64,
    pub cost_output: f64,
    pub token_limit: usize,
}

impl ModelPricing {
    /// Built-in prices for the models the pipeline was first run against.
    pub fn for_model(name: &str) -> Option<Self> {
        let (cost_input, cost_output, token_limit) = match name {
            "gpt-3.5-turbo" => (0.0015, 0.002, 4096),
            "gpt-3.5-turbo-1106" => (0.003, 0.004, 16384),
            "gpt-4" => (0.03, 0.06, 8192),
            "gpt-4-32k" => (0.06, 0.12, 32768),
            _ => return None,
        };
        Some(Self {
            cost_input,
            cost_output,
            token_limit,
        })
    }

    /// Table entry for the model with any configured overrides applied.
    pub fn from_config(config: &LlmConfig) -> Self {
        let base = Self::for_model(&config.model).unwrap_or(Self {
            cost_input: 0.0,
            cost_output: 0.0,
            token_limit: DEFAULT_TOKEN_LIMIT,
        });
        Self {
            cost_input: config.cost_input.unwrap_or(base.cost_input),
            cost_output: config.cost_output.unwrap_or(base.cost_output),
            token_limit: config.token_limit.unwrap_or(base.token_limit),
        }
    }

    pub fn cost(&self, usage: &Usage) -> f64 {
        let input = round_to(
            usage.prompt_tokens as f64 / TOKENS_DIV_BY * self.cost_input,
            COST_ROUNDING,
        );
        let output = round_to(
            usage.completion_tokens as f64 / TOKENS_DIV_BY * self.cost_output,
            COST_ROUNDING,
        );
        input + output
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Cut `text` so that it fits in roughly `max_tokens` tokens.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> &str {
    let max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub message: ChatMessage,
    pub usage: Usage,
    pub cost: f64,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("connection to the {provider} API failed: {source}")]
    Connection {
        provider: LlmProvider,
        #[source]
        source: reqwest::Error,
    },
    #[error("the {provider} API returned a rate limiting error: {body}")]
    RateLimited { provider: LlmProvider, body: String },
    #[error("the {provider} API returned a non-success status ({status}): {body}")]
    Status {
        provider: LlmProvider,
        status: u16,
        body: String,
    },
    #[error("malformed response from the {provider} API: {reason}")]
    Malformed { provider: LlmProvider, reason: String },
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Connection { .. } | LlmError::RateLimited { .. } => true,
            LlmError::Status { status, .. } => *status >= 500,
            LlmError::Malformed { .. } => false,
        }
    }
}

/// OpenAI-compatible chat completions client (OpenAI, OpenRouter, Ollama).
pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
    pricing: ModelPricing,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let pricing = ModelPricing::from_config(&config);
        Self {
            client: reqwest::Client::new(),
            config,
            pricing,
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Tokens left for input once the completion budget is reserved.
    pub fn input_token_budget(&self) -> usize {
        self.pricing
            .token_limit
            .saturating_sub(self.config.max_tokens as usize)
    }

    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<Completion, LlmError> {
        let provider = self.config.provider;
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            response_format: self.config.json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let url = format!("{}/chat/completions", self.config.effective_base_url());

        debug!("Sending request to {}: {}", provider, url);

        let mut builder = self
            .client
            .post(&url)
            .timeout(self.config.timeout())
            .header("Content-Type", "application/json")
            .json(&request);
        if !self.config.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        let response = builder
            .send()
            .await
            .map_err(|source| LlmError::Connection { provider, source })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::RateLimited { provider, body });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                provider,
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|source| LlmError::Connection { provider, source })?;
        let chat_response: ChatResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::Malformed {
                provider,
                reason: e.to_string(),
            })?;

        let choice = chat_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Malformed {
                provider,
                reason: "no choices in response".to_string(),
            })?;

        let usage = chat_response.usage;
        let cost = self.pricing.cost(&usage);
        debug!(
            "{} usage: {} prompt / {} completion tokens",
            self.config.model, usage.prompt_tokens, usage.completion_tokens
        );

        Ok(Completion {
            message: ChatMessage {
                role: choice.message.role,
                content: choice.message.content.unwrap_or_default(),
            },
            usage,
            cost,
        })
    }
}

/// A running prompt exchange. The first prompt is the system prompt,
/// every later one is a user turn; replies are appended as they arrive.
pub struct Conversation<'a> {
    client: &'a LlmClient,
    messages: Vec<ChatMessage>,
    total_cost: f64,
}

impl<'a> Conversation<'a> {
    pub fn new(client: &'a LlmClient) -> Self {
        Self {
            client,
            messages: Vec::new(),
            total_cost: 0.0,
        }
    }

    pub fn add_prompt(&mut self, prompt: impl Into<String>) {
        let message = if self.messages.is_empty() {
            ChatMessage::system(prompt)
        } else {
            ChatMessage::user(prompt)
        };
        self.messages.push(message);
    }

    #[cfg(test)]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    pub async fn execute(&mut self) -> Result<Completion, LlmError> {
        let completion = self.client.chat(&self.messages).await?;
        self.total_cost += completion.cost;
        self.messages.push(completion.message.clone());
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: &str) -> LlmConfig {
        LlmConfig {
            id: 1,
            provider: LlmProvider::Openai,
            model: "gpt-3.5-turbo-1106".to_string(),
            base_url: base_url.to_string(),
            api_key: "sk-test".to_string(),
            max_tokens: 1024,
            cost_input: None,
            cost_output: None,
            token_limit: None,
            json_mode: false,
            timeout_secs: 120,
        }
    }

    #[test]
    fn test_cost_uses_per_1k_prices_rounded() {
        let pricing = ModelPricing::for_model("gpt-3.5-turbo-1106").unwrap();
        let usage = Usage {
            prompt_tokens: 1024,
            completion_tokens: 512,
        };
        // 1.0 * 0.003 + 0.5 * 0.004
        assert!((pricing.cost(&usage) - 0.005).abs() < 1e-9);

        let tiny = Usage {
            prompt_tokens: 1,
            completion_tokens: 1,
        };
        assert_eq!(pricing.cost(&tiny), 0.0);
    }

    #[test]
    fn test_pricing_overrides_and_unknown_models() {
        let mut config = test_config("");
        config.model = "some-local-model".to_string();
        let pricing = ModelPricing::from_config(&config);
        assert_eq!(pricing.cost_input, 0.0);
        assert_eq!(pricing.token_limit, DEFAULT_TOKEN_LIMIT);

        config.cost_input = Some(0.01);
        config.token_limit = Some(2048);
        let pricing = ModelPricing::from_config(&config);
        assert_eq!(pricing.cost_input, 0.01);
        assert_eq!(pricing.token_limit, 2048);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "привет мир";
        assert_eq!(truncate_to_tokens(text, 1), "прив");
        assert_eq!(truncate_to_tokens(text, 100), text);
        assert_eq!(truncate_to_tokens(text, 0), "");
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[tokio::test]
    async fn test_conversation_roles_and_cost() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "{\"ok\":true}" } }],
                "usage": { "prompt_tokens": 2048, "completion_tokens": 1024 }
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(test_config(&server.uri()));
        let mut conversation = Conversation::new(&client);
        conversation.add_prompt("You are a test.");
        conversation.add_prompt("Hello");
        let completion = conversation.execute().await.unwrap();

        assert_eq!(completion.message.content, "{\"ok\":true}");
        assert_eq!(completion.usage.prompt_tokens, 2048);
        let roles: Vec<&str> = conversation
            .messages()
            .iter()
            .map(|m| m.role.as_str())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
        assert!((conversation.total_cost() - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_error_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;
        let client = LlmClient::new(test_config(&server.uri()));
        let err = client.chat(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { .. }));
        assert!(err.is_retryable());

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;
        let client = LlmClient::new(test_config(&server.uri()));
        let err = client.chat(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::Status { status: 401, .. }));
        assert!(!err.is_retryable());

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;
        let client = LlmClient::new(test_config(&server.uri()));
        let err = client.chat(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_stalled_provider_times_out_as_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "choices": [] }))
                    .set_delay(std::time::Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let client = LlmClient::new(LlmConfig {
            timeout_secs: 1,
            ..test_config(&server.uri())
        });
        let started = std::time::Instant::now();
        let err = client.chat(&[ChatMessage::user("hi")]).await.unwrap_err();

        assert!(started.elapsed() < std::time::Duration::from_secs(4));
        match &err {
            LlmError::Connection { source, .. } => assert!(source.is_timeout()),
            other => panic!("expected a connection error, got {:?}", other),
        }
        assert!(err.is_retryable());
    }
}
