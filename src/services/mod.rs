pub mod deepl;
pub mod llm;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::Config;
use crate::llm::{LlmClient, LlmError};
use crate::templates::PromptTemplates;

use self::deepl::DeepLTranslator;
use self::llm::{LlmAnalyser, LlmTranslator};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("missing credentials: {0}")]
    MissingCredentials(String),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("connection to the {service} API failed: {source}")]
    Connection {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("the {service} API returned a non-success status ({status}): {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("unexpected response: {0}")]
    MalformedResponse(String),
}

impl ServiceError {
    /// Whether trying the same request later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Llm(e) => e.is_retryable(),
            ServiceError::Connection { .. } => true,
            ServiceError::Status { status, .. } => *status == 429 || *status >= 500,
            ServiceError::InvalidInput(_)
            | ServiceError::MissingCredentials(_)
            | ServiceError::MalformedResponse(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub text: String,
    /// Language of the original text as reported by the service
    pub source_language: Option<String>,
}

#[async_trait]
pub trait TranslationService: Send + Sync {
    fn uid(&self) -> &str;

    async fn translate(&self, text: &str) -> Result<Translation, ServiceError>;
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    fn uid(&self) -> &str;

    /// Run one requirement prompt against a message text and return the
    /// analysis to store.
    async fn analyse(&self, prompt: &str, content_text: &str) -> Result<String, ServiceError>;
}

/// Analysis services keyed by the `llm_id` that requirements reference.
#[derive(Default, Clone)]
pub struct AnalysisRegistry {
    services: BTreeMap<i64, Arc<dyn AnalysisService>>,
}

impl AnalysisRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One LLM-backed analyser per configured `[[llms]]` entry.
    pub fn from_config(config: &Config, templates: &PromptTemplates) -> Self {
        let mut registry = Self::new();
        for llm in &config.llms {
            let client = LlmClient::new(llm.clone());
            registry.register(llm.id, Arc::new(LlmAnalyser::new(client, &templates.analyse)));
        }
        registry
    }

    pub fn register(&mut self, llm_id: i64, service: Arc<dyn AnalysisService>) {
        self.services.insert(llm_id, service);
    }

    pub fn get(&self, llm_id: i64) -> Option<Arc<dyn AnalysisService>> {
        self.services.get(&llm_id).cloned()
    }

    pub fn llm_ids(&self) -> Vec<i64> {
        self.services.keys().copied().collect()
    }
}

/// Build the translation service named in `[translation] service`.
pub fn build_translator(
    config: &Config,
    templates: &PromptTemplates,
) -> Result<Arc<dyn TranslationService>> {
    let translation = &config.translation;
    match translation.service.as_str() {
        "llm" => {
            let llm = config.llm(translation.llm_id).with_context(|| {
                format!(
                    "Translation uses LLM id {} but no [[llms]] entry has that id",
                    translation.llm_id
                )
            })?;
            Ok(Arc::new(LlmTranslator::new(
                LlmClient::new(llm.clone()),
                &templates.translate,
                &translation.target_language,
            )))
        }
        "deepl" => {
            let deepl = config
                .deepl
                .clone()
                .context("Translation service 'deepl' needs a [deepl] section or DEEPL_API_KEY")?;
            Ok(Arc::new(DeepLTranslator::new(deepl)))
        }
        other => anyhow::bail!("Unknown translation service '{}'", other),
    }
}

/// LLMs like to wrap JSON answers in markdown fences; strip them.
pub(crate) fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }

    #[test]
    fn test_retry_classification() {
        assert!(!ServiceError::InvalidInput("x".into()).is_retryable());
        assert!(!ServiceError::MissingCredentials("x".into()).is_retryable());
        assert!(ServiceError::Status {
            service: "DeepL",
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!ServiceError::Status {
            service: "DeepL",
            status: 403,
            body: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn test_registry_and_translator_from_config() {
        let config = Config::parse(
            r#"
            [[llms]]
            id = 1
            model = "gpt-3.5-turbo-1106"

            [[llms]]
            id = 7
            provider = "ollama"
            model = "llama3"
            "#,
        )
        .unwrap();
        let templates = PromptTemplates::builtin();

        let registry = AnalysisRegistry::from_config(&config, &templates);
        assert_eq!(registry.llm_ids(), vec![1, 7]);
        assert!(registry.get(2).is_none());

        let translator = build_translator(&config, &templates).unwrap();
        assert_eq!(translator.uid(), "llm");

        let mut deepl_config = config.clone();
        deepl_config.translation.service = "deepl".to_string();
        assert!(build_translator(&deepl_config, &templates).is_err());

        let mut unknown = config.clone();
        unknown.translation.service = "babelfish".to_string();
        assert!(build_translator(&unknown, &templates).is_err());

        let mut missing_llm = config;
        missing_llm.translation.llm_id = 99;
        assert!(build_translator(&missing_llm, &templates).is_err());
    }
}
