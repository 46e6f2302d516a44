use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ServiceError, Translation, TranslationService};
use crate::config::DeepLConfig;

const SERVICE: &str = "DeepL";

#[derive(Serialize)]
struct TranslateRequest<'a> {
    text: [&'a str; 1],
    target_lang: &'a str,
}

#[derive(Deserialize)]
struct TranslateResponse {
    translations: Vec<DeepLTranslation>,
}

#[derive(Deserialize)]
struct DeepLTranslation {
    #[serde(default)]
    detected_source_language: Option<String>,
    text: String,
}

/// DeepL REST API (`/v2/translate`)
pub struct DeepLTranslator {
    client: reqwest::Client,
    config: DeepLConfig,
}

impl DeepLTranslator {
    pub fn new(config: DeepLConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl TranslationService for DeepLTranslator {
    fn uid(&self) -> &str {
        "deepl"
    }

    async fn translate(&self, text: &str) -> Result<Translation, ServiceError> {
        info!("DeepL translation request");

        if self.config.api_key.is_empty() {
            return Err(ServiceError::MissingCredentials(
                "no DeepL API key has been set".to_string(),
            ));
        }
        if text.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "text to translate must be non-empty".to_string(),
            ));
        }

        let url = format!("{}/translate", self.config.base_url.trim_end_matches('/'));
        debug!("Sending request to DeepL: {}", url);

        let response = self
            .client
            .post(&url)
            .timeout(self.config.timeout())
            .header(
                "Authorization",
                format!("DeepL-Auth-Key {}", self.config.api_key),
            )
            .json(&TranslateRequest {
                text: [text],
                target_lang: &self.config.target_lang,
            })
            .send()
            .await
            .map_err(|source| ServiceError::Connection {
                service: SERVICE,
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body,
            });
        }

        let body: TranslateResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::MalformedResponse(format!("DeepL response: {}", e)))?;

        let first = body
            .translations
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::MalformedResponse("DeepL returned no translations".to_string()))?;

        Ok(Translation {
            text: first.text,
            source_language: first.detected_source_language.map(|l| l.to_lowercase()),
        })
    }
}
