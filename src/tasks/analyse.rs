use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::queue::Task;
use crate::services::AnalysisRegistry;
use crate::store::Store;
use crate::worker::{TaskError, TaskHandler};

use super::preview;

/// Body of the `analyse_content` task
pub struct AnalyseHandler {
    store: Store,
    analysers: AnalysisRegistry,
}

impl AnalyseHandler {
    pub fn new(store: Store, analysers: AnalysisRegistry) -> Self {
        Self { store, analysers }
    }

    async fn analyse_content(&self, content_id: i64) -> Result<(), TaskError> {
        info!("Analysis request for content ID {}", content_id);

        let content = self
            .store
            .get_content(content_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| {
                TaskError::permanent(anyhow!("No content record found with ID {}", content_id))
            })?;

        let source = self
            .store
            .get_source(content.source_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| {
                TaskError::permanent(anyhow!("No source record found with ID {}", content.source_id))
            })?;
        info!("Source ID: {}", source.id);

        if !source.enabled {
            info!("Analysis is not enabled for source {}, skipping", source.id);
            return Ok(());
        }

        let requirements = self
            .store
            .get_analysis_requirements(source.id)
            .await
            .map_err(TaskError::retryable)?;
        info!("Retrieved {} analysis requirements", requirements.len());

        if requirements.is_empty() {
            self.store
                .mark_analysed(content_id)
                .await
                .map_err(TaskError::retryable)?;
            return Ok(());
        }

        let text = content.analysis_text().ok_or_else(|| {
            TaskError::permanent(anyhow!("Content ID {} has no text to analyse", content_id))
        })?;

        let mut retryable: Option<anyhow::Error> = None;
        let mut permanent: Vec<String> = Vec::new();

        for requirement in &requirements {
            info!(
                "Processing requirement '{}' (LLM ID {})",
                requirement.name, requirement.llm_id
            );

            let done = self
                .store
                .has_analysis_result(requirement.id, content_id)
                .await
                .map_err(TaskError::retryable)?;
            if done {
                debug!(
                    "Requirement {} already has a result for content ID {}",
                    requirement.id, content_id
                );
                continue;
            }

            let Some(service) = self.analysers.get(requirement.llm_id) else {
                error!(
                    "No analysis service for LLM ID {} (requirement '{}')",
                    requirement.llm_id, requirement.name
                );
                permanent.push(format!(
                    "requirement {}: unknown LLM ID {}",
                    requirement.id, requirement.llm_id
                ));
                continue;
            };

            debug!("Requirement {} runs on {}", requirement.id, service.uid());
            let prompt = requirement.prompt.as_deref().unwrap_or_default();
            match service.analyse(prompt, text).await {
                Ok(analysis) => {
                    info!("Analysis: '{}'", preview(&analysis));
                    let result_id = self
                        .store
                        .save_analysis_result(content_id, requirement.id, &analysis)
                        .await
                        .map_err(TaskError::retryable)?;
                    info!("Stored analysis result with ID {}", result_id);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        "Requirement '{}' hit a transient error: {}",
                        requirement.name, e
                    );
                    retryable.get_or_insert_with(|| {
                        anyhow!("requirement {}: {}", requirement.id, e)
                    });
                }
                Err(e) => {
                    error!(
                        "The analysis service reported an irrecoverable error for '{}': {}",
                        requirement.name, e
                    );
                    permanent.push(format!("requirement {}: {}", requirement.id, e));
                }
            }
        }

        // Completed requirements are skipped when the task comes back
        if let Some(e) = retryable {
            return Err(TaskError::Retryable(e));
        }
        if !permanent.is_empty() {
            return Err(TaskError::permanent(anyhow!(permanent.join("; "))));
        }

        self.store
            .mark_analysed(content_id)
            .await
            .map_err(TaskError::retryable)?;
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for AnalyseHandler {
    async fn handle(&self, task: Task) -> Result<(), TaskError> {
        match task {
            Task::AnalyseContent { content_id } => self.analyse_content(content_id).await,
            other => Err(TaskError::permanent(anyhow!(
                "Analysis worker cannot run {}",
                other
            ))),
        }
    }
}
