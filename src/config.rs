use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Openai,
    Openrouter,
    Ollama,
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProvider::Openai => write!(f, "openai"),
            LlmProvider::Openrouter => write!(f, "openrouter"),
            LlmProvider::Ollama => write!(f, "ollama"),
        }
    }
}

/// One LLM an analysis requirement can reference through its `llm_id`.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub id: i64,
    #[serde(default)]
    pub provider: LlmProvider,
    pub model: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Price per 1K prompt tokens, overrides the built-in table
    #[serde(default)]
    pub cost_input: Option<f64>,
    /// Price per 1K completion tokens, overrides the built-in table
    #[serde(default)]
    pub cost_output: Option<f64>,
    #[serde(default)]
    pub token_limit: Option<usize>,
    /// Ask the provider for a JSON object response (`response_format`)
    #[serde(default)]
    pub json_mode: bool,
    /// Whole-request deadline, connect to last body byte
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl LlmConfig {
    /// Returns the effective base_url: if the stored value is empty,
    /// fall back to the canonical URL for the configured provider.
    pub fn effective_base_url(&self) -> &str {
        if !self.base_url.is_empty() {
            return self.base_url.trim_end_matches('/');
        }
        match self.provider {
            LlmProvider::Openai => "https://api.openai.com/v1",
            LlmProvider::Openrouter => "https://openrouter.ai/api/v1",
            LlmProvider::Ollama => "http://localhost:11434/v1",
        }
    }

    /// Local Ollama servers accept unauthenticated requests.
    pub fn requires_api_key(&self) -> bool {
        self.provider != LlmProvider::Ollama
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The entry an environment-only deployment gets when OPENAI_API_KEY is set.
    fn openai_default() -> Self {
        Self {
            id: 1,
            provider: LlmProvider::Openai,
            model: DEFAULT_OPENAI_MODEL.to_string(),
            base_url: String::new(),
            api_key: String::new(),
            max_tokens: default_max_tokens(),
            cost_input: None,
            cost_output: None,
            token_limit: None,
            json_mode: true,
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Register unknown chats as sources on their first message
    #[serde(default = "default_true")]
    pub auto_register_sources: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TranslationConfig {
    /// `llm` or `deepl`
    #[serde(default = "default_translation_service")]
    pub service: String,
    /// Which `[[llms]]` entry the `llm` service uses
    #[serde(default = "default_translation_llm_id")]
    pub llm_id: i64,
    #[serde(default = "default_target_language")]
    pub target_language: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeepLConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_deepl_base_url")]
    pub base_url: String,
    #[serde(default = "default_deepl_target_lang")]
    pub target_lang: String,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl DeepLConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkersConfig {
    #[serde(default = "default_concurrency")]
    pub translation_concurrency: usize,
    #[serde(default = "default_concurrency")]
    pub analysis_concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: u64,
}

impl WorkersConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TemplatesConfig {
    /// Directory holding `translate.txt` and `analyse.txt`. Built-in
    /// templates are used when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MaintenanceConfig {
    #[serde(default = "default_heartbeat_cron")]
    pub heartbeat_cron: String,
    #[serde(default = "default_purge_cron")]
    pub purge_cron: String,
    /// Completed tasks older than this are deleted from the broker
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

impl MaintenanceConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default = "default_database_config")]
    pub database: DatabaseConfig,
    #[serde(default = "default_broker_config")]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub llms: Vec<LlmConfig>,
    #[serde(default = "default_translation_config")]
    pub translation: TranslationConfig,
    pub deepl: Option<DeepLConfig>,
    #[serde(default = "default_workers_config")]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub templates: TemplatesConfig,
    #[serde(default = "default_maintenance_config")]
    pub maintenance: MaintenanceConfig,
}

const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo-1106";

fn default_true() -> bool {
    true
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_db_path() -> PathBuf {
    PathBuf::from("osint.db")
}

fn default_broker_path() -> PathBuf {
    PathBuf::from("broker.db")
}

fn default_max_attempts() -> u32 {
    5
}

fn default_translation_service() -> String {
    "llm".to_string()
}

fn default_translation_llm_id() -> i64 {
    1
}

fn default_target_language() -> String {
    "English".to_string()
}

fn default_deepl_base_url() -> String {
    "https://api-free.deepl.com/v2".to_string()
}

fn default_deepl_target_lang() -> String {
    "EN-US".to_string()
}

fn default_concurrency() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_lease_secs() -> u64 {
    300
}

fn default_retry_base_secs() -> u64 {
    10
}

fn default_retry_max_secs() -> u64 {
    600
}

fn default_heartbeat_cron() -> String {
    "0 */5 * * * *".to_string()
}

fn default_purge_cron() -> String {
    "0 0 * * * *".to_string()
}

fn default_retention_hours() -> u64 {
    72
}

fn default_database_config() -> DatabaseConfig {
    DatabaseConfig {
        path: default_db_path(),
    }
}

fn default_broker_config() -> BrokerConfig {
    BrokerConfig {
        path: default_broker_path(),
        max_attempts: default_max_attempts(),
    }
}

fn default_translation_config() -> TranslationConfig {
    TranslationConfig {
        service: default_translation_service(),
        llm_id: default_translation_llm_id(),
        target_language: default_target_language(),
    }
}

fn default_workers_config() -> WorkersConfig {
    WorkersConfig {
        translation_concurrency: default_concurrency(),
        analysis_concurrency: default_concurrency(),
        poll_interval_ms: default_poll_interval_ms(),
        lease_secs: default_lease_secs(),
        retry_base_secs: default_retry_base_secs(),
        retry_max_secs: default_retry_max_secs(),
    }
}

fn default_maintenance_config() -> MaintenanceConfig {
    MaintenanceConfig {
        heartbeat_cron: default_heartbeat_cron(),
        purge_cron: default_purge_cron(),
        retention_hours: default_retention_hours(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::parse(&content)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults plus environment overrides, for deployments
    /// without a config file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// With no file there is no `[[llms]]` table, so an OpenAI key alone
    /// brings in LLM 1 on the default model.
    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::parse("")?;
        if lookup("OPENAI_API_KEY").is_some_and(|key| !key.is_empty()) {
            config.llms.push(LlmConfig::openai_default());
        }
        config.apply_env(lookup);
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Environment variables win over the file so secrets can stay out of it.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(path) = lookup("OSINT_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(path) = lookup("OSINT_BROKER_PATH") {
            self.broker.path = PathBuf::from(path);
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            for llm in self
                .llms
                .iter_mut()
                .filter(|l| l.provider == LlmProvider::Openai && l.api_key.is_empty())
            {
                llm.api_key = key.clone();
            }
        }
        if let Some(key) = lookup("DEEPL_API_KEY") {
            let deepl = self.deepl.get_or_insert_with(|| DeepLConfig {
                api_key: String::new(),
                base_url: default_deepl_base_url(),
                target_lang: default_deepl_target_lang(),
                timeout_secs: default_request_timeout_secs(),
            });
            deepl.api_key = key;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for llm in &self.llms {
            if !seen.insert(llm.id) {
                anyhow::bail!("Duplicate LLM id {} in [[llms]]", llm.id);
            }
        }
        if self.broker.max_attempts == 0 {
            anyhow::bail!("broker.max_attempts must be at least 1");
        }
        if self.workers.translation_concurrency == 0 || self.workers.analysis_concurrency == 0 {
            anyhow::bail!("Worker concurrency must be at least 1");
        }
        let timeouts = self
            .llms
            .iter()
            .map(|l| (format!("LLM {}", l.id), l.timeout_secs))
            .chain(self.deepl.iter().map(|d| ("DeepL".to_string(), d.timeout_secs)));
        for (service, secs) in timeouts {
            if secs == 0 || secs >= self.workers.lease_secs {
                anyhow::bail!(
                    "{} timeout_secs must be between 1 and workers.lease_secs ({}), got {}",
                    service,
                    self.workers.lease_secs,
                    secs
                );
            }
        }
        Ok(())
    }

    pub fn llm(&self, id: i64) -> Option<&LlmConfig> {
        self.llms.iter().find(|l| l.id == id)
    }
}
