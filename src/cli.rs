//! Command-line interface argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::queue::{ANALYSIS_QUEUE, TRANSLATION_QUEUE};

/// OSINT pipeline: Telegram collection, translation and LLM analysis
/// chained through a durable task queue.
///
/// Examples:
///   osint-pipeline run
///   osint-pipeline --config prod.toml translate-worker
///   osint-pipeline requirements add --source 3 --llm 1 --name summary --prompt "Summarise"
///   osint-pipeline queue stats
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to the TOML configuration file
    ///
    /// When the file does not exist, defaults plus environment variables are used.
    #[arg(
        short,
        long,
        default_value = "config.toml",
        env = "OSINT_CONFIG",
        value_name = "FILE"
    )]
    pub config: PathBuf,

    /// Enable debug logging (overrides RUST_LOG)
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Listen to Telegram and store incoming posts
    Collect,
    /// Consume the translation queue
    TranslateWorker,
    /// Consume the analysis queue
    AnalyseWorker,
    /// Run collector and both workers in one process
    Run,
    /// Manage collection sources
    Sources {
        #[command(subcommand)]
        action: SourceCommand,
    },
    /// Manage analysis requirements
    Requirements {
        #[command(subcommand)]
        action: RequirementCommand,
    },
    /// Show a stored message with its analysis results
    Content {
        /// Content ID
        id: i64,
    },
    /// Queue a task by hand
    Enqueue {
        #[command(subcommand)]
        task: EnqueueCommand,
    },
    /// Inspect and maintain the task broker
    Queue {
        #[command(subcommand)]
        action: QueueCommand,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum SourceCommand {
    List,
    /// Register a Telegram chat ahead of its first post
    Add {
        /// Chat ID, e.g. -1001234567890
        #[arg(allow_hyphen_values = true)]
        uid: String,
        #[arg(long)]
        name: Option<String>,
    },
    Enable {
        id: i64,
    },
    Disable {
        id: i64,
    },
    /// Set or clear the free-text note on a source
    Note {
        id: i64,
        note: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum RequirementCommand {
    List {
        /// Only requirements for this source
        #[arg(long)]
        source: Option<i64>,
    },
    Add {
        #[arg(long)]
        source: i64,
        /// `[[llms]]` id that runs the prompt
        #[arg(long)]
        llm: i64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        prompt: String,
        /// Create the requirement disabled
        #[arg(long)]
        disabled: bool,
    },
    Enable {
        id: i64,
    },
    Disable {
        id: i64,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum EnqueueCommand {
    Translate { content_id: i64 },
    Analyse { content_id: i64 },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum QueueCommand {
    Stats,
    /// Delete completed tasks older than the retention window
    Purge {
        /// Override maintenance.retention_hours
        #[arg(long, value_name = "HOURS")]
        older_than: Option<u64>,
    },
    /// Give failed tasks of a queue a fresh set of attempts
    RetryFailed {
        #[arg(value_parser = [TRANSLATION_QUEUE, ANALYSIS_QUEUE])]
        queue: String,
    },
}
