//! Administration commands for sources, requirements and the broker.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use crate::cli::{EnqueueCommand, QueueCommand, RequirementCommand, SourceCommand};
use crate::collection::{telegram, Collector};
use crate::config::Config;
use crate::maintenance;
use crate::queue::{SqliteQueue, Task, TaskQueue};
use crate::store::{NewRequirement, Store};

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

async fn set_source_enabled(
    store: &Store,
    id: i64,
    enabled: bool,
    out: &mut impl Write,
) -> Result<()> {
    if !store.set_source_enabled(id, enabled).await? {
        anyhow::bail!("No source with ID {}", id);
    }
    writeln!(out, "Source {} {}", id, on_off(enabled))?;
    Ok(())
}

async fn set_requirement_enabled(
    store: &Store,
    id: i64,
    enabled: bool,
    out: &mut impl Write,
) -> Result<()> {
    if !store.set_requirement_enabled(id, enabled).await? {
        anyhow::bail!("No analysis requirement with ID {}", id);
    }
    writeln!(out, "Requirement {} {}", id, on_off(enabled))?;
    Ok(())
}

pub async fn sources(
    store: &Store,
    queue: &SqliteQueue,
    action: SourceCommand,
    out: &mut impl Write,
) -> Result<()> {
    match action {
        SourceCommand::List => {
            let sources = store.list_sources().await?;
            if sources.is_empty() {
                writeln!(out, "No sources registered.")?;
            }
            for s in sources {
                writeln!(
                    out,
                    "{:>5}  {:<20} {:<30} {}{}",
                    s.id,
                    s.uid,
                    s.friendly_name.as_deref().unwrap_or("-"),
                    on_off(s.enabled),
                    s.user_note
                        .map(|n| format!("  ({})", n))
                        .unwrap_or_default()
                )?;
            }
        }
        SourceCommand::Add { uid, name } => {
            let collector = Collector::register(
                store.clone(),
                Arc::new(queue.clone()),
                telegram::SHORT_NAME,
                telegram::LONG_NAME,
                false,
            )
            .await?;
            let source = collector.add_source(&uid, name.as_deref()).await?;
            writeln!(out, "Source {} registered as ID {}", source.uid, source.id)?;
        }
        SourceCommand::Enable { id } => set_source_enabled(store, id, true, out).await?,
        SourceCommand::Disable { id } => set_source_enabled(store, id, false, out).await?,
        SourceCommand::Note { id, note } => {
            if !store.set_source_note(id, note.as_deref()).await? {
                anyhow::bail!("No source with ID {}", id);
            }
            writeln!(out, "Note updated for source {}", id)?;
        }
    }
    Ok(())
}

pub async fn requirements(
    store: &Store,
    config: &Config,
    action: RequirementCommand,
    out: &mut impl Write,
) -> Result<()> {
    match action {
        RequirementCommand::List { source } => {
            let requirements = store.list_requirements(source).await?;
            if requirements.is_empty() {
                writeln!(out, "No analysis requirements.")?;
            }
            for r in requirements {
                writeln!(
                    out,
                    "{:>5}  source {:<5} llm {:<3} {:<20} {:<8} {}",
                    r.id,
                    r.source_id,
                    r.llm_id,
                    r.name,
                    on_off(r.enabled),
                    r.prompt.as_deref().unwrap_or("")
                )?;
            }
        }
        RequirementCommand::Add {
            source,
            llm,
            name,
            prompt,
            disabled,
        } => {
            store
                .get_source(source)
                .await?
                .with_context(|| format!("No source with ID {}", source))?;
            if config.llm(llm).is_none() {
                warn!("LLM ID {} is not configured; analysis will fail until it is", llm);
            }
            let id = store
                .add_requirement(&NewRequirement {
                    source_id: source,
                    llm_id: llm,
                    name: &name,
                    prompt: &prompt,
                    enabled: !disabled,
                })
                .await?;
            writeln!(out, "Requirement '{}' added with ID {}", name, id)?;
        }
        RequirementCommand::Enable { id } => set_requirement_enabled(store, id, true, out).await?,
        RequirementCommand::Disable { id } => {
            set_requirement_enabled(store, id, false, out).await?
        }
    }
    Ok(())
}

pub async fn content(store: &Store, id: i64, out: &mut impl Write) -> Result<()> {
    let content = store
        .get_content(id)
        .await?
        .with_context(|| format!("No content with ID {}", id))?;

    writeln!(out, "Content {} from source {}", content.id, content.source_id)?;
    writeln!(out, "Collected: {}", content.collection_time.to_rfc3339())?;
    if let Some(origin) = content.origin_time {
        writeln!(out, "Posted:    {}", origin.to_rfc3339())?;
    }
    writeln!(
        out,
        "Translated: {}  Analysed: {}  Language: {}",
        content.translated,
        content.analysed,
        content.detected_language.as_deref().unwrap_or("-")
    )?;
    writeln!(out, "\n{}", content.original_text.as_deref().unwrap_or(""))?;
    if let Some(translation) = &content.translated_text {
        writeln!(out, "\n--- translation ---\n{}", translation)?;
    }

    for result in store.list_results(id).await? {
        writeln!(
            out,
            "\n--- requirement {} ({}) ---\n{}",
            result.req_id,
            result.analysis_time.to_rfc3339(),
            result.output.as_deref().unwrap_or("")
        )?;
    }
    Ok(())
}

pub async fn enqueue(
    store: &Store,
    queue: &SqliteQueue,
    command: EnqueueCommand,
    out: &mut impl Write,
) -> Result<()> {
    let task = match command {
        EnqueueCommand::Translate { content_id } => Task::TranslateContent { content_id },
        EnqueueCommand::Analyse { content_id } => Task::AnalyseContent { content_id },
    };
    store
        .get_content(task.content_id())
        .await?
        .with_context(|| format!("No content with ID {}", task.content_id()))?;

    let id = queue.enqueue(task).await?;
    writeln!(out, "Queued {} as task {}", task, id)?;
    Ok(())
}

pub async fn broker(
    queue: &SqliteQueue,
    config: &Config,
    action: QueueCommand,
    out: &mut impl Write,
) -> Result<()> {
    match action {
        QueueCommand::Stats => {
            let stats = queue.stats().await?;
            if stats.is_empty() {
                writeln!(out, "Broker is empty.")?;
            }
            for s in stats {
                writeln!(
                    out,
                    "{:<12} pending {:<6} running {:<6} done {:<6} failed {}",
                    s.queue, s.pending, s.running, s.done, s.failed
                )?;
            }
        }
        QueueCommand::Purge { older_than } => {
            let retention = older_than
                .map(|hours| Duration::from_secs(hours.saturating_mul(3600)))
                .unwrap_or_else(|| config.maintenance.retention());
            let purged = maintenance::purge(queue, retention).await?;
            writeln!(out, "Purged {} completed task(s)", purged)?;
        }
        QueueCommand::RetryFailed { queue: name } => {
            let requeued = queue.requeue_failed(&name).await?;
            writeln!(out, "Requeued {} failed task(s) on '{}'", requeued, name)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TRANSLATION_QUEUE;

    fn backends() -> (Store, SqliteQueue, Config) {
        (
            Store::open_in_memory().unwrap(),
            SqliteQueue::open_in_memory(3).unwrap(),
            Config::parse(
                r#"
                [[llms]]
                id = 1
                model = "gpt-4"
                "#,
            )
            .unwrap(),
        )
    }

    fn text(out: Vec<u8>) -> String {
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_source_and_requirement_admin() {
        let (store, queue, config) = backends();
        let mut out = Vec::new();

        sources(
            &store,
            &queue,
            SourceCommand::Add {
                uid: "-1009".to_string(),
                name: Some("Border watch".to_string()),
            },
            &mut out,
        )
        .await
        .unwrap();
        sources(&store, &queue, SourceCommand::Disable { id: 1 }, &mut out)
            .await
            .unwrap();
        assert!(!store.get_source(1).await.unwrap().unwrap().enabled);
        assert!(sources(&store, &queue, SourceCommand::Enable { id: 99 }, &mut out)
            .await
            .is_err());

        let add = |source| RequirementCommand::Add {
            source,
            llm: 1,
            name: "summary".to_string(),
            prompt: "Summarise".to_string(),
            disabled: false,
        };
        requirements(&store, &config, add(1), &mut out).await.unwrap();
        assert!(requirements(&store, &config, add(2), &mut out).await.is_err());

        let mut listing = Vec::new();
        requirements(&store, &config, RequirementCommand::List { source: None }, &mut listing)
            .await
            .unwrap();
        let listing = text(listing);
        assert!(listing.contains("summary"));
        assert!(listing.contains("Summarise"));

        let mut listing = Vec::new();
        sources(&store, &queue, SourceCommand::List, &mut listing)
            .await
            .unwrap();
        let listing = text(listing);
        assert!(listing.contains("-1009"));
        assert!(listing.contains("disabled"));
    }

    #[tokio::test]
    async fn test_enqueue_checks_content() {
        let (store, queue, config) = backends();
        let mut out = Vec::new();

        let missing = EnqueueCommand::Translate { content_id: 5 };
        assert!(enqueue(&store, &queue, missing, &mut out).await.is_err());

        let collector = store.register_collector("telegram", "Telegram").await.unwrap();
        let source = store.add_source(collector, "-1", None).await.unwrap().unwrap();
        let content_id = store
            .add_content(source.id, None, "text", &serde_json::json!({}))
            .await
            .unwrap();
        enqueue(&store, &queue, EnqueueCommand::Translate { content_id }, &mut out)
            .await
            .unwrap();

        let mut stats = Vec::new();
        broker(&queue, &config, QueueCommand::Stats, &mut stats)
            .await
            .unwrap();
        let stats = text(stats);
        assert!(stats.contains(TRANSLATION_QUEUE));
        assert!(stats.contains("pending 1"));
    }

    #[tokio::test]
    async fn test_purge_accepts_any_age() {
        let (_store, queue, config) = backends();
        let id = queue
            .enqueue(Task::TranslateContent { content_id: 1 })
            .await
            .unwrap();
        queue
            .claim(TRANSLATION_QUEUE, "w", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(queue.ack(id, "w").await.unwrap());

        let mut out = Vec::new();
        broker(
            &queue,
            &config,
            QueueCommand::Purge {
                older_than: Some(u64::MAX),
            },
            &mut out,
        )
        .await
        .unwrap();
        assert!(text(out).contains("Purged 0"));

        let mut out = Vec::new();
        broker(
            &queue,
            &config,
            QueueCommand::Purge {
                older_than: Some(0),
            },
            &mut out,
        )
        .await
        .unwrap();
        assert!(text(out).contains("Purged 1"));
    }
}
