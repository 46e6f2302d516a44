pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use sqlite::SqliteQueue;

pub const TRANSLATION_QUEUE: &str = "translation";
pub const ANALYSIS_QUEUE: &str = "analysis";

/// A unit of pipeline work. Serialized as `{"name": ..., "args": {...}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "snake_case")]
pub enum Task {
    TranslateContent { content_id: i64 },
    AnalyseContent { content_id: i64 },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::TranslateContent { .. } => "translate_content",
            Task::AnalyseContent { .. } => "analyse_content",
        }
    }

    /// The named queue this task is routed to.
    pub fn queue(&self) -> &'static str {
        match self {
            Task::TranslateContent { .. } => TRANSLATION_QUEUE,
            Task::AnalyseContent { .. } => ANALYSIS_QUEUE,
        }
    }

    pub fn content_id(&self) -> i64 {
        match self {
            Task::TranslateContent { content_id } | Task::AnalyseContent { content_id } => {
                *content_id
            }
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.content_id())
    }
}

/// A task handed to one worker until it acks, retries, fails or its lease runs out.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: i64,
    pub task: Task,
    /// Includes the current attempt
    pub attempts: u32,
}

/// What became of a delivery handed back with `retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retried {
    /// Pending again, visible after the delay
    Requeued,
    /// Out of attempts and marked failed
    Exhausted,
    /// The lease had already passed to another worker; nothing was written
    LeaseLost,
}

/// Durable task broker. Delivery is at-least-once: a task whose worker dies
/// is handed out again once its lease expires.
///
/// Every write after `claim` is fenced on the claiming worker and the
/// `running` status, so a worker whose lease expired cannot overwrite the
/// outcome of the worker that reclaimed the task.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<i64>;

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Delivery>>;

    /// Push the lease out to `lease` from now. Returns false when the
    /// delivery no longer belongs to `worker_id`.
    async fn renew(&self, id: i64, worker_id: &str, lease: Duration) -> Result<bool>;

    /// Returns false when the delivery no longer belongs to `worker_id`.
    async fn ack(&self, id: i64, worker_id: &str) -> Result<bool>;

    /// Put the task back after `delay`, or mark it failed once it has used
    /// up its attempts.
    async fn retry(&self, id: i64, worker_id: &str, error: &str, delay: Duration)
        -> Result<Retried>;

    /// Returns false when the delivery no longer belongs to `worker_id`.
    async fn fail(&self, id: i64, worker_id: &str, error: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_wire_format() {
        let task = Task::TranslateContent { content_id: 12 };
        assert_eq!(
            serde_json::to_value(task).unwrap(),
            json!({ "name": "translate_content", "args": { "content_id": 12 } })
        );

        let parsed: Task =
            serde_json::from_value(json!({ "name": "analyse_content", "args": { "content_id": 3 } }))
                .unwrap();
        assert_eq!(parsed, Task::AnalyseContent { content_id: 3 });
        assert_eq!(parsed.queue(), ANALYSIS_QUEUE);
        assert_eq!(parsed.to_string(), "analyse_content(3)");
    }
}
