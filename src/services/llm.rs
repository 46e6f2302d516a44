use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{extract_json, AnalysisService, ServiceError, Translation, TranslationService};
use crate::llm::{estimate_tokens, truncate_to_tokens, Conversation, LlmClient};
use crate::templates;

/// Never squeeze the message below this many tokens, even on tiny models.
const MIN_INPUT_TOKENS: usize = 256;
/// Room for the JSON wrapper and the requirement prompt.
const ENVELOPE_TOKENS: usize = 64;

fn check_credentials(client: &LlmClient) -> Result<(), ServiceError> {
    let config = client.config();
    if config.requires_api_key() && config.api_key.is_empty() {
        return Err(ServiceError::MissingCredentials(format!(
            "no API key set for {} model '{}'",
            config.provider, config.model
        )));
    }
    Ok(())
}

/// Cut the message so template + message + completion fit the model.
fn fit_to_model<'t>(client: &LlmClient, system_prompt: &str, extra: &str, text: &'t str) -> &'t str {
    let overhead = estimate_tokens(system_prompt) + estimate_tokens(extra) + ENVELOPE_TOKENS;
    let budget = client
        .input_token_budget()
        .saturating_sub(overhead)
        .max(MIN_INPUT_TOKENS);
    let fitted = truncate_to_tokens(text, budget);
    if fitted.len() < text.len() {
        warn!(
            "Message truncated to ~{} tokens for model '{}'",
            budget,
            client.config().model
        );
    }
    fitted
}

#[derive(Debug, Deserialize)]
struct TranslationReply {
    translation: String,
    #[serde(default)]
    source_language: Option<String>,
}

/// Translates through a chat-completions LLM using the translate template.
pub struct LlmTranslator {
    client: LlmClient,
    system_prompt: String,
    target_language: String,
}

impl LlmTranslator {
    pub fn new(client: LlmClient, template: &str, target_language: &str) -> Self {
        let system_prompt = templates::render(template, &[("target_language", target_language)]);
        Self {
            client,
            system_prompt,
            target_language: target_language.to_string(),
        }
    }
}

#[async_trait]
impl TranslationService for LlmTranslator {
    fn uid(&self) -> &str {
        "llm"
    }

    async fn translate(&self, text: &str) -> Result<Translation, ServiceError> {
        info!("LLM translation request ({})", self.client.config().model);

        if text.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "text to translate must be non-empty".to_string(),
            ));
        }
        check_credentials(&self.client)?;

        let text = fit_to_model(&self.client, &self.system_prompt, "", text);

        let mut conversation = Conversation::new(&self.client);
        conversation.add_prompt(self.system_prompt.as_str());
        conversation.add_prompt(
            json!({ "translate_to": self.target_language, "message": text }).to_string(),
        );

        let completion = conversation.execute().await?;
        debug!("Raw translation JSON: {}", completion.message.content);

        let reply: TranslationReply = serde_json::from_str(extract_json(&completion.message.content))
            .map_err(|e| {
                ServiceError::MalformedResponse(format!(
                    "translation was not valid JSON ({}): {}",
                    e, completion.message.content
                ))
            })?;

        info!(
            "Translation complete, {} tokens, cost: ${:.4}",
            completion.usage.total(),
            conversation.total_cost()
        );

        Ok(Translation {
            text: reply.translation,
            source_language: reply
                .source_language
                .map(|l| l.trim().to_lowercase())
                .filter(|l| !l.is_empty()),
        })
    }
}

/// Runs analysis requirements through a chat-completions LLM.
pub struct LlmAnalyser {
    client: LlmClient,
    system_prompt: String,
}

impl LlmAnalyser {
    pub fn new(client: LlmClient, template: &str) -> Self {
        Self {
            client,
            system_prompt: template.to_string(),
        }
    }
}

#[async_trait]
impl AnalysisService for LlmAnalyser {
    fn uid(&self) -> &str {
        &self.client.config().model
    }

    async fn analyse(&self, prompt: &str, content_text: &str) -> Result<String, ServiceError> {
        info!("LLM analysis request ({})", self.client.config().model);

        if prompt.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "prompt must be a non-empty string".to_string(),
            ));
        }
        if content_text.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "content text must be a non-empty string".to_string(),
            ));
        }
        check_credentials(&self.client)?;

        let content_text = fit_to_model(&self.client, &self.system_prompt, prompt, content_text);

        let mut conversation = Conversation::new(&self.client);
        conversation.add_prompt(self.system_prompt.as_str());
        conversation.add_prompt(json!({ "requirement": prompt, "text": content_text }).to_string());

        let completion = conversation.execute().await?;

        // The template pins the reply to a JSON object so the analysis can be
        // separated from anything else the model adds.
        let reply: Value = serde_json::from_str(extract_json(&completion.message.content))
            .map_err(|e| {
                warn!("LLM raw response: {}", completion.message.content);
                ServiceError::MalformedResponse(format!("analysis was not valid JSON: {}", e))
            })?;

        info!(
            "Analysis complete, {} tokens, cost: ${:.4}",
            completion.usage.total(),
            conversation.total_cost()
        );

        match reply.get("analysis") {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Null) | None => Err(ServiceError::MalformedResponse(
                "response has no 'analysis' field".to_string(),
            )),
            Some(other) => Ok(other.to_string()),
        }
    }
}
