use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};

use crate::collection::{telegram, Collector};
use crate::config::Config;
use crate::maintenance::Maintenance;
use crate::queue::{SqliteQueue, TaskQueue, ANALYSIS_QUEUE, TRANSLATION_QUEUE};
use crate::services::{self, AnalysisRegistry};
use crate::store::Store;
use crate::tasks::{AnalyseHandler, TranslateHandler};
use crate::templates::PromptTemplates;
use crate::worker::{Worker, WorkerOptions};

/// Content store and task broker, opened once per process.
pub struct Backends {
    pub store: Store,
    pub queue: SqliteQueue,
}

impl Backends {
    pub fn open(config: &Config) -> Result<Self> {
        let store = Store::open(&config.database.path).context("Failed to open content store")?;
        let queue = SqliteQueue::open(&config.broker.path, config.broker.max_attempts)
            .context("Failed to open task broker")?;
        Ok(Self { store, queue })
    }

    fn task_queue(&self) -> Arc<dyn TaskQueue> {
        Arc::new(self.queue.clone())
    }
}

fn templates(config: &Config) -> Result<PromptTemplates> {
    PromptTemplates::load(config.templates.directory.as_deref())
}

pub fn translation_worker(config: &Config, backends: &Backends) -> Result<Worker> {
    let translator = services::build_translator(config, &templates(config)?)?;
    info!("Translation service: {}", translator.uid());

    let handler = TranslateHandler::new(backends.store.clone(), backends.task_queue(), translator);
    Ok(Worker::new(
        backends.task_queue(),
        Arc::new(handler),
        WorkerOptions::from_config(
            TRANSLATION_QUEUE,
            config.workers.translation_concurrency,
            &config.workers,
        ),
    ))
}

pub fn analysis_worker(config: &Config, backends: &Backends) -> Result<Worker> {
    let analysers = AnalysisRegistry::from_config(config, &templates(config)?);
    if analysers.llm_ids().is_empty() {
        anyhow::bail!("No [[llms]] configured, analysis requirements cannot run");
    }
    info!("Analysis services for LLM IDs {:?}", analysers.llm_ids());

    let handler = AnalyseHandler::new(backends.store.clone(), analysers);
    Ok(Worker::new(
        backends.task_queue(),
        Arc::new(handler),
        WorkerOptions::from_config(
            ANALYSIS_QUEUE,
            config.workers.analysis_concurrency,
            &config.workers,
        ),
    ))
}

async fn collector(config: &Config, backends: &Backends) -> Result<Arc<Collector>> {
    let collector = Collector::register(
        backends.store.clone(),
        backends.task_queue(),
        telegram::SHORT_NAME,
        telegram::LONG_NAME,
        config.telegram.auto_register_sources,
    )
    .await?;
    Ok(Arc::new(collector))
}

pub async fn collect(config: &Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    let backends = Backends::open(config)?;
    let collector = collector(config, &backends).await?;
    telegram::run(&config.telegram.bot_token, collector, shutdown).await
}

/// Run one worker with the maintenance jobs alongside it.
pub async fn work(
    config: &Config,
    backends: Backends,
    worker: Worker,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let maintenance = Maintenance::start(backends.queue.clone(), &config.maintenance).await?;
    info!("Worker {} starting", worker.id());
    let result = worker.run(shutdown).await;
    maintenance.shutdown().await?;
    result
}

pub async fn translate_worker(config: &Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    let backends = Backends::open(config)?;
    let worker = translation_worker(config, &backends)?;
    work(config, backends, worker, shutdown).await
}

pub async fn analyse_worker(config: &Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    let backends = Backends::open(config)?;
    let worker = analysis_worker(config, &backends)?;
    work(config, backends, worker, shutdown).await
}

/// Collector, both workers and maintenance in one process.
pub async fn run_all(config: &Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    if config.telegram.bot_token.is_empty() {
        anyhow::bail!("Telegram bot token is not set (telegram.bot_token or TELEGRAM_BOT_TOKEN)");
    }

    let backends = Backends::open(config)?;
    let translator = translation_worker(config, &backends)?;
    let analyser = analysis_worker(config, &backends)?;
    let collector = collector(config, &backends).await?;
    let maintenance = Maintenance::start(backends.queue.clone(), &config.maintenance).await?;

    info!(
        "Pipeline running with workers {} and {}, press Ctrl+C to stop",
        translator.id(),
        analyser.id()
    );
    let (collected, translated, analysed) = futures::join!(
        telegram::run(&config.telegram.bot_token, collector, shutdown.clone()),
        translator.run(shutdown.clone()),
        analyser.run(shutdown),
    );

    maintenance.shutdown().await?;

    let mut failed = false;
    for (component, result) in [
        ("collector", collected),
        ("translation worker", translated),
        ("analysis worker", analysed),
    ] {
        if let Err(e) = result {
            error!("The {} stopped with an error: {:#}", component, e);
            failed = true;
        }
    }
    if failed {
        anyhow::bail!("One or more pipeline components failed");
    }
    info!("Pipeline stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path, extra: &str) -> Config {
        let mut config = Config::parse(extra).unwrap();
        config.database.path = dir.join("osint.db");
        config.broker.path = dir.join("broker.db");
        config
    }

    #[tokio::test]
    async fn test_backends_create_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), "");
        Backends::open(&config).unwrap();
        assert!(dir.path().join("osint.db").exists());
        assert!(dir.path().join("broker.db").exists());
    }

    #[tokio::test]
    async fn test_workers_need_services() {
        let dir = tempfile::tempdir().unwrap();
        let empty = config(dir.path(), "");
        let backends = Backends::open(&empty).unwrap();
        assert!(translation_worker(&empty, &backends).is_err());
        assert!(analysis_worker(&empty, &backends).is_err());

        let configured = config(
            dir.path(),
            r#"
            [[llms]]
            id = 1
            model = "gpt-3.5-turbo-1106"
            "#,
        );
        assert!(translation_worker(&configured, &backends).is_ok());
        assert!(analysis_worker(&configured, &backends).is_ok());
    }

    #[tokio::test]
    async fn test_run_all_requires_token() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = watch::channel(false);
        assert!(run_all(&config(dir.path(), ""), rx).await.is_err());
    }
}
