use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};

use crate::config::MaintenanceConfig;
use crate::queue::SqliteQueue;

/// Log the depth of every broker queue.
pub async fn heartbeat(queue: &SqliteQueue) -> Result<()> {
    let stats = queue.stats().await?;
    if stats.is_empty() {
        info!("Heartbeat: broker is empty");
    }
    for s in stats {
        info!(
            "Heartbeat: queue '{}' pending={} running={} done={} failed={}",
            s.queue, s.pending, s.running, s.done, s.failed
        );
    }
    Ok(())
}

/// Delete completed tasks older than `retention`.
pub async fn purge(queue: &SqliteQueue, retention: Duration) -> Result<usize> {
    let purged = queue.purge_completed(retention).await?;
    if purged > 0 {
        info!("Purged {} completed task(s) from the broker", purged);
    } else {
        debug!("No completed tasks to purge");
    }
    Ok(purged)
}

type JobFn = dyn Fn(SqliteQueue) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Cron-driven broker housekeeping (heartbeat and purge).
pub struct Maintenance {
    scheduler: JobScheduler,
    queue: SqliteQueue,
}

impl Maintenance {
    pub async fn new(queue: SqliteQueue) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self { scheduler, queue })
    }

    /// Schedule the heartbeat and purge jobs and start ticking.
    pub async fn start(queue: SqliteQueue, config: &MaintenanceConfig) -> Result<Self> {
        let maintenance = Self::new(queue).await?;

        maintenance
            .add_job(&config.heartbeat_cron, "heartbeat", |queue| {
                Box::pin(async move { heartbeat(&queue).await })
            })
            .await?;

        let retention = config.retention();
        maintenance
            .add_job(&config.purge_cron, "purge", move |queue| {
                Box::pin(async move { purge(&queue, retention).await.map(|_| ()) })
            })
            .await?;

        maintenance
            .scheduler
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Maintenance scheduler started");
        Ok(maintenance)
    }

    async fn add_job<F>(&self, cron_expr: &str, name: &'static str, job: F) -> Result<()>
    where
        F: Fn(SqliteQueue) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let job: Arc<JobFn> = Arc::new(job);
        let queue = self.queue.clone();
        let scheduled = Job::new_async(cron_expr, move |_uuid, _lock| {
            let job = Arc::clone(&job);
            let queue = queue.clone();
            Box::pin(async move {
                debug!("Running maintenance job: {}", name);
                if let Err(e) = job(queue).await {
                    error!("Maintenance job '{}' failed: {:#}", name, e);
                }
            })
        })
        .with_context(|| format!("Invalid cron expression for {}: '{}'", name, cron_expr))?;

        self.scheduler
            .add(scheduled)
            .await
            .with_context(|| format!("Failed to add job: {}", name))?;

        info!("Scheduled maintenance job '{}' with cron: {}", name, cron_expr);
        Ok(())
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .context("Failed to shutdown scheduler")?;
        info!("Maintenance scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Task, TaskQueue, TRANSLATION_QUEUE};

    #[tokio::test]
    async fn test_purge_removes_only_completed_tasks() {
        let queue = SqliteQueue::open_in_memory(1).unwrap();
        queue.enqueue(Task::TranslateContent { content_id: 1 }).await.unwrap();
        queue.enqueue(Task::TranslateContent { content_id: 2 }).await.unwrap();
        queue.enqueue(Task::TranslateContent { content_id: 3 }).await.unwrap();

        let lease = Duration::from_secs(60);
        let done = queue.claim(TRANSLATION_QUEUE, "w", lease).await.unwrap().unwrap();
        assert!(queue.ack(done.id, "w").await.unwrap());
        let failed = queue.claim(TRANSLATION_QUEUE, "w", lease).await.unwrap().unwrap();
        assert!(queue.fail(failed.id, "w", "boom").await.unwrap());

        heartbeat(&queue).await.unwrap();
        assert_eq!(purge(&queue, Duration::ZERO).await.unwrap(), 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats[0].done, 0);
        assert_eq!(stats[0].failed, 1);
        assert_eq!(stats[0].pending, 1);
    }

    #[tokio::test]
    async fn test_invalid_cron_is_rejected() {
        let queue = SqliteQueue::open_in_memory(1).unwrap();
        let config = MaintenanceConfig {
            heartbeat_cron: "every now and then".to_string(),
            purge_cron: "0 0 * * * *".to_string(),
            retention_hours: 1,
        };
        assert!(Maintenance::start(queue, &config).await.is_err());
    }
}
