use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::WorkersConfig;
use crate::queue::{Delivery, Retried, Task, TaskQueue};

const MIN_RENEWAL: Duration = Duration::from_millis(10);
const MAX_RENEWAL: Duration = Duration::from_secs(3600);

/// How a task handler failed, which decides whether the broker tries again.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0:#}")]
    Retryable(anyhow::Error),
    #[error("{0:#}")]
    Permanent(anyhow::Error),
}

impl TaskError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        TaskError::Retryable(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        TaskError::Permanent(err.into())
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task) -> Result<(), TaskError>;
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub queue: &'static str,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl WorkerOptions {
    pub fn from_config(queue: &'static str, concurrency: usize, config: &WorkersConfig) -> Self {
        Self {
            queue,
            concurrency: concurrency.max(1),
            poll_interval: config.poll_interval(),
            lease: config.lease(),
            retry_base: Duration::from_secs(config.retry_base_secs),
            retry_max: Duration::from_secs(config.retry_max_secs),
        }
    }

    /// Exponential backoff: base, 2*base, 4*base, ... capped at retry_max.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.retry_base
            .saturating_mul(1u32 << exponent)
            .min(self.retry_max)
    }
}

/// Consumes one named queue, running up to `concurrency` tasks at a time.
pub struct Worker {
    id: String,
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn TaskHandler>,
        options: WorkerOptions,
    ) -> Self {
        let id = format!("{}-{}", options.queue, uuid::Uuid::new_v4());
        Self {
            id,
            queue,
            handler,
            options,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and process tasks until `shutdown` flips to true, then wait for
    /// in-flight tasks to finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Worker {} consuming '{}' with concurrency {}",
            self.id, self.options.queue, self.options.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit?,
                _ = shutdown.changed() => break,
            };

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!("Task execution panicked: {}", e);
                }
            }

            match self
                .queue
                .claim(self.options.queue, &self.id, self.options.lease)
                .await
            {
                Ok(Some(delivery)) => {
                    let queue = Arc::clone(&self.queue);
                    let handler = Arc::clone(&self.handler);
                    let worker_id = self.id.clone();
                    let options = self.options.clone();
                    in_flight.spawn(async move {
                        process_delivery(
                            queue.as_ref(),
                            handler.as_ref(),
                            &worker_id,
                            &options,
                            delivery,
                        )
                        .await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("Failed to claim from '{}': {:#}", self.options.queue, e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(
                "Worker {} waiting for {} in-flight task(s)",
                self.id,
                in_flight.len()
            );
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Task execution panicked: {}", e);
            }
        }
        info!("Worker {} stopped", self.id);
        Ok(())
    }

    /// Claim and process a single task inline. Returns false when the queue
    /// had nothing available.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(delivery) = self
            .queue
            .claim(self.options.queue, &self.id, self.options.lease)
            .await?
        else {
            return Ok(false);
        };
        process_delivery(
            self.queue.as_ref(),
            self.handler.as_ref(),
            &self.id,
            &self.options,
            delivery,
        )
        .await;
        Ok(true)
    }
}

/// Run the handler while renewing the lease every third of its length, then
/// record the outcome under this worker's id.
async fn process_delivery(
    queue: &dyn TaskQueue,
    handler: &dyn TaskHandler,
    worker_id: &str,
    options: &WorkerOptions,
    delivery: Delivery,
) {
    let started = Instant::now();
    debug!(
        "Task {} {} (attempt {})",
        delivery.id, delivery.task, delivery.attempts
    );

    let every = (options.lease / 3).clamp(MIN_RENEWAL, MAX_RENEWAL);
    let mut renewal = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    let mut handling = handler.handle(delivery.task);
    let mut held = true;
    let outcome = loop {
        tokio::select! {
            outcome = &mut handling => break outcome,
            _ = renewal.tick(), if held => {
                match queue.renew(delivery.id, worker_id, options.lease).await {
                    Ok(true) => debug!("Renewed lease on task {}", delivery.id),
                    Ok(false) => {
                        warn!(
                            "Lease on task {} {} passed to another worker",
                            delivery.id, delivery.task
                        );
                        held = false;
                    }
                    Err(e) => warn!("Failed to renew lease on task {}: {:#}", delivery.id, e),
                }
            }
        }
    };
    let elapsed = started.elapsed().as_secs_f32();

    let settled = match outcome {
        Ok(()) => {
            info!(
                "Task {} {} succeeded in {:.1}s",
                delivery.id, delivery.task, elapsed
            );
            queue.ack(delivery.id, worker_id).await
        }
        Err(TaskError::Retryable(e)) => {
            let delay = options.backoff(delivery.attempts);
            let message = format!("{:#}", e);
            match queue.retry(delivery.id, worker_id, &message, delay).await {
                Ok(Retried::Requeued) => {
                    warn!(
                        "Task {} {} failed (attempt {}), retrying in {:?}: {}",
                        delivery.id, delivery.task, delivery.attempts, delay, message
                    );
                    Ok(true)
                }
                Ok(Retried::Exhausted) => {
                    error!(
                        "Task {} {} failed after {} attempts: {}",
                        delivery.id, delivery.task, delivery.attempts, message
                    );
                    Ok(true)
                }
                Ok(Retried::LeaseLost) => Ok(false),
                Err(e) => Err(e),
            }
        }
        Err(TaskError::Permanent(e)) => {
            let message = format!("{:#}", e);
            error!(
                "Task {} {} failed permanently: {}",
                delivery.id, delivery.task, message
            );
            queue.fail(delivery.id, worker_id, &message).await
        }
    };

    match settled {
        Ok(true) => {}
        Ok(false) => warn!(
            "Discarding outcome of task {} {}, its lease passed to another worker",
            delivery.id, delivery.task
        ),
        // The lease will expire and the task be redelivered
        Err(e) => error!("Failed to record outcome of task {}: {:#}", delivery.id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{SqliteQueue, TRANSLATION_QUEUE};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with the given error kind for the first `failures` calls.
    struct FlakyHandler {
        calls: AtomicUsize,
        failures: usize,
        permanent: bool,
    }

    #[async_trait]
    impl TaskHandler for FlakyHandler {
        async fn handle(&self, _task: Task) -> Result<(), TaskError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                let err = anyhow::anyhow!("failure {}", call);
                return Err(if self.permanent {
                    TaskError::permanent(err)
                } else {
                    TaskError::retryable(err)
                });
            }
            Ok(())
        }
    }

    fn options() -> WorkerOptions {
        WorkerOptions {
            queue: TRANSLATION_QUEUE,
            concurrency: 2,
            poll_interval: Duration::from_millis(10),
            lease: Duration::from_secs(60),
            retry_base: Duration::ZERO,
            retry_max: Duration::ZERO,
        }
    }

    fn worker(queue: &SqliteQueue, failures: usize, permanent: bool) -> (Worker, Arc<FlakyHandler>) {
        let handler = Arc::new(FlakyHandler {
            calls: AtomicUsize::new(0),
            failures,
            permanent,
        });
        let worker = Worker::new(Arc::new(queue.clone()), handler.clone(), options());
        (worker, handler)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let opts = WorkerOptions {
            retry_base: Duration::from_secs(10),
            retry_max: Duration::from_secs(60),
            ..options()
        };
        assert_eq!(opts.backoff(1), Duration::from_secs(10));
        assert_eq!(opts.backoff(2), Duration::from_secs(20));
        assert_eq!(opts.backoff(3), Duration::from_secs(40));
        assert_eq!(opts.backoff(4), Duration::from_secs(60));
        assert_eq!(opts.backoff(40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_retryable_failure_is_redelivered() {
        let queue = SqliteQueue::open_in_memory(3).unwrap();
        queue
            .enqueue(Task::TranslateContent { content_id: 1 })
            .await
            .unwrap();
        let (worker, handler) = worker(&queue, 1, false);

        assert!(worker.run_once().await.unwrap());
        assert!(worker.run_once().await.unwrap());
        assert!(!worker.run_once().await.unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats[0].done, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let queue = SqliteQueue::open_in_memory(3).unwrap();
        queue
            .enqueue(Task::TranslateContent { content_id: 1 })
            .await
            .unwrap();
        let (worker, handler) = worker(&queue, 1, true);

        assert!(worker.run_once().await.unwrap());
        assert!(!worker.run_once().await.unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().await.unwrap()[0].failed, 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let queue = SqliteQueue::open_in_memory(2).unwrap();
        queue
            .enqueue(Task::TranslateContent { content_id: 1 })
            .await
            .unwrap();
        let (worker, handler) = worker(&queue, usize::MAX, false);

        while worker.run_once().await.unwrap() {}
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.stats().await.unwrap()[0].failed, 1);
    }

    struct SlowHandler(Duration);

    #[async_trait]
    impl TaskHandler for SlowHandler {
        async fn handle(&self, _task: Task) -> Result<(), TaskError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lease_is_renewed_while_handler_runs() {
        let queue = SqliteQueue::open_in_memory(3).unwrap();
        queue
            .enqueue(Task::TranslateContent { content_id: 1 })
            .await
            .unwrap();
        let worker = Worker::new(
            Arc::new(queue.clone()),
            Arc::new(SlowHandler(Duration::from_millis(900))),
            WorkerOptions {
                lease: Duration::from_millis(300),
                ..options()
            },
        );

        let running = tokio::spawn(async move { worker.run_once().await });
        tokio::time::sleep(Duration::from_millis(600)).await;
        // Well past the original lease, yet nobody else may take the task
        assert!(queue
            .claim(TRANSLATION_QUEUE, "other", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());

        assert!(running.await.unwrap().unwrap());
        let stats = queue.stats().await.unwrap();
        assert_eq!((stats[0].done, stats[0].running), (1, 0));
    }

    #[tokio::test]
    async fn test_outcome_after_lost_lease_is_discarded() {
        let queue = SqliteQueue::open_in_memory(3).unwrap();
        let id = queue
            .enqueue(Task::TranslateContent { content_id: 1 })
            .await
            .unwrap();
        let delivery = queue
            .claim(TRANSLATION_QUEUE, "stale", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        queue
            .claim(TRANSLATION_QUEUE, "current", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let handler = FlakyHandler {
            calls: AtomicUsize::new(0),
            failures: 1,
            permanent: false,
        };
        process_delivery(&queue, &handler, "stale", &options(), delivery).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(queue
            .claim(TRANSLATION_QUEUE, "third", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
        assert!(queue.ack(id, "current").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops_on_shutdown() {
        let queue = SqliteQueue::open_in_memory(3).unwrap();
        for content_id in 1..=5 {
            queue
                .enqueue(Task::TranslateContent { content_id })
                .await
                .unwrap();
        }
        let (worker, handler) = worker(&queue, 0, false);
        let (tx, rx) = watch::channel(false);

        let running = tokio::spawn(async move { worker.run(rx).await });

        for _ in 0..200 {
            if handler.calls.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        running.await.unwrap().unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
        assert_eq!(queue.stats().await.unwrap()[0].done, 5);
    }
}
