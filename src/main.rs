mod admin;
mod app;
mod cli;
mod collection;
mod config;
mod llm;
mod maintenance;
mod queue;
mod services;
mod store;
mod tasks;
mod templates;
mod worker;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::Backends;
use crate::cli::{Args, Command};
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,osint_pipeline=debug".into())
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args.config)?;
    let mut out = std::io::stdout();

    match args.command {
        Command::Collect => app::collect(&config, shutdown_signal()).await,
        Command::TranslateWorker => app::translate_worker(&config, shutdown_signal()).await,
        Command::AnalyseWorker => app::analyse_worker(&config, shutdown_signal()).await,
        Command::Run => app::run_all(&config, shutdown_signal()).await,
        Command::Sources { action } => {
            let backends = Backends::open(&config)?;
            admin::sources(&backends.store, &backends.queue, action, &mut out).await
        }
        Command::Requirements { action } => {
            let backends = Backends::open(&config)?;
            admin::requirements(&backends.store, &config, action, &mut out).await
        }
        Command::Content { id } => {
            let backends = Backends::open(&config)?;
            admin::content(&backends.store, id, &mut out).await
        }
        Command::Enqueue { task } => {
            let backends = Backends::open(&config)?;
            admin::enqueue(&backends.store, &backends.queue, task, &mut out).await
        }
        Command::Queue { action } => {
            let backends = Backends::open(&config)?;
            admin::broker(&backends.queue, &config, action, &mut out).await
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        warn!(
            "Config file {} not found, using defaults and environment",
            path.display()
        );
        return Config::from_env();
    }

    info!("Loading configuration from: {}", path.display());
    let config = Config::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Database: {}", config.database.path.display());
    info!("  Broker: {}", config.broker.path.display());
    info!("  LLMs: {}", config.llms.len());
    info!("  Translation: {}", config.translation.service);
    Ok(config)
}

/// Flips to true on Ctrl+C so long-running components can drain and exit.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = tx.send(true);
            // Keep the sender alive so receivers see the flag, not a closed channel
            tx.closed().await;
        }
    });
    rx
}
