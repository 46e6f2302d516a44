pub mod telegram;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::queue::{Task, TaskQueue};
use crate::store::{Source, Store};

/// A post received from any collection platform
#[derive(Debug, Clone)]
pub struct IncomingPost {
    /// Platform identifier of the channel or group
    pub source_uid: String,
    pub source_name: Option<String>,
    pub origin_time: Option<DateTime<Utc>>,
    pub text: String,
    pub metadata: serde_json::Value,
}

/// Persists incoming posts and hands them to the translation queue.
pub struct Collector {
    store: Store,
    queue: Arc<dyn TaskQueue>,
    collector_id: i64,
    short_name: String,
    auto_register: bool,
}

impl Collector {
    /// Register the collector row (idempotent) and build a collector for it.
    pub async fn register(
        store: Store,
        queue: Arc<dyn TaskQueue>,
        short_name: &str,
        long_name: &str,
        auto_register: bool,
    ) -> Result<Self> {
        let collector_id = store
            .register_collector(short_name, long_name)
            .await
            .with_context(|| format!("Failed to register collector '{}'", short_name))?;
        info!("Collector '{}' registered with ID {}", short_name, collector_id);
        Ok(Self {
            store,
            queue,
            collector_id,
            short_name: short_name.to_string(),
            auto_register,
        })
    }

    pub fn collector_id(&self) -> i64 {
        self.collector_id
    }

    /// Register a source for this collector ahead of its first post.
    pub async fn add_source(&self, uid: &str, friendly_name: Option<&str>) -> Result<Source> {
        if let Some(source) = self.store.add_source(self.collector_id, uid, friendly_name).await? {
            return Ok(source);
        }
        self.store
            .get_source_by_uid(self.collector_id, uid)
            .await?
            .with_context(|| format!("Source '{}' vanished after insert", uid))
    }

    async fn resolve_source(&self, post: &IncomingPost) -> Result<Option<Source>> {
        if let Some(source) = self
            .store
            .get_source_by_uid(self.collector_id, &post.source_uid)
            .await?
        {
            return Ok(Some(source));
        }
        if !self.auto_register {
            return Ok(None);
        }
        let source = self
            .add_source(&post.source_uid, post.source_name.as_deref())
            .await?;
        info!(
            "Registered new {} source '{}' ({})",
            self.short_name,
            post.source_name.as_deref().unwrap_or("unnamed"),
            post.source_uid
        );
        Ok(Some(source))
    }

    /// Store a post and enqueue its translation. Returns the content id, or
    /// `None` when the post was skipped.
    pub async fn ingest(&self, post: &IncomingPost) -> Result<Option<i64>> {
        if post.text.trim().is_empty() {
            debug!("Skipping post without text from {}", post.source_uid);
            return Ok(None);
        }

        let Some(source) = self.resolve_source(post).await? else {
            debug!("Skipping post from unregistered source {}", post.source_uid);
            return Ok(None);
        };

        let content_id = self
            .store
            .add_content(source.id, post.origin_time, &post.text, &post.metadata)
            .await
            .context("Failed to store post")?;

        let task_id = self
            .queue
            .enqueue(Task::TranslateContent { content_id })
            .await
            .context("Failed to enqueue translation")?;
        info!(
            "Content {} from source {} queued for translation (task {})",
            content_id, source.id, task_id
        );
        Ok(Some(content_id))
    }
}
