use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::queue::{Task, TaskQueue};
use crate::services::TranslationService;
use crate::store::Store;
use crate::worker::{TaskError, TaskHandler};

use super::preview;

/// Body of the `translate_content` task
pub struct TranslateHandler {
    store: Store,
    queue: Arc<dyn TaskQueue>,
    translator: Arc<dyn TranslationService>,
}

impl TranslateHandler {
    pub fn new(
        store: Store,
        queue: Arc<dyn TaskQueue>,
        translator: Arc<dyn TranslationService>,
    ) -> Self {
        Self {
            store,
            queue,
            translator,
        }
    }

    async fn translate_content(&self, content_id: i64) -> Result<(), TaskError> {
        info!("Translation request for content ID {}", content_id);

        let content = self
            .store
            .get_content(content_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| {
                TaskError::permanent(anyhow!("No content record found with ID {}", content_id))
            })?;

        // A redelivery after the translation was stored only needs the hand-off
        if content.translated {
            info!(
                "Content ID {} already translated, re-issuing analysis",
                content_id
            );
        } else {
            let original = content
                .original_text
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| {
                    TaskError::permanent(anyhow!("Content ID {} has no text to translate", content_id))
                })?;
            info!("Original: '{}'", preview(original));

            let started = Instant::now();
            let translation = self.translator.translate(original).await.map_err(|e| {
                error!("Failed to translate content ID {}: {}", content_id, e);
                if e.is_retryable() {
                    TaskError::retryable(e)
                } else {
                    TaskError::permanent(e)
                }
            })?;
            info!(
                "Time taken for translation: {:.1} seconds",
                started.elapsed().as_secs_f32()
            );

            if translation.text.trim().is_empty() {
                return Err(TaskError::permanent(anyhow!(
                    "{} returned an empty translation for content ID {}",
                    self.translator.uid(),
                    content_id
                )));
            }
            info!("Translated: '{}'", preview(&translation.text));

            self.store
                .set_translation(
                    content_id,
                    &translation.text,
                    translation.source_language.as_deref(),
                )
                .await
                .map_err(TaskError::retryable)?;
        }

        self.queue
            .enqueue(Task::AnalyseContent { content_id })
            .await
            .map_err(TaskError::retryable)?;
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for TranslateHandler {
    async fn handle(&self, task: Task) -> Result<(), TaskError> {
        match task {
            Task::TranslateContent { content_id } => self.translate_content(content_id).await,
            other => Err(TaskError::permanent(anyhow!(
                "Translation worker cannot run {}",
                other
            ))),
        }
    }
}
