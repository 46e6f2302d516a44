use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Delivery, Retried, Task, TaskQueue};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queue: String,
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
}

/// Task broker stored in its own SQLite file. Producers and workers in
/// different processes coordinate through immediate transactions.
#[derive(Clone)]
pub struct SqliteQueue {
    conn: Arc<Mutex<Connection>>,
    max_attempts: u32,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl SqliteQueue {
    pub fn open(path: &Path, max_attempts: u32) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open broker database: {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Self::run_migrations(&conn)?;

        info!("Task broker initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_attempts,
        })
    }

    /// Open an in-memory broker (for testing)
    pub fn open_in_memory(max_attempts: u32) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_attempts,
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                name TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                available_at_ms INTEGER NOT NULL,
                lease_expires_at_ms INTEGER,
                worker_id TEXT,
                last_error TEXT,
                created_at_ms INTEGER NOT NULL,
                finished_at_ms INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_claim
                ON tasks(queue, status, available_at_ms);
            ",
        )
        .context("Failed to run broker migrations")?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<Vec<QueueStats>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT queue, status, count(*) FROM tasks GROUP BY queue, status ORDER BY queue",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read queue stats")?;

        let mut stats: Vec<QueueStats> = Vec::new();
        for (queue, status, count) in rows {
            let idx = match stats.iter().position(|s| s.queue == queue) {
                Some(idx) => idx,
                None => {
                    stats.push(QueueStats {
                        queue,
                        ..Default::default()
                    });
                    stats.len() - 1
                }
            };
            let entry = &mut stats[idx];
            let count = count.max(0) as u64;
            match status.as_str() {
                "pending" => entry.pending = count,
                "running" => entry.running = count,
                "done" => entry.done = count,
                "failed" => entry.failed = count,
                other => warn!("Unknown task status '{}' in broker", other),
            }
        }
        Ok(stats)
    }

    /// Delete completed tasks finished more than `older_than` ago.
    /// Failed tasks are kept for inspection.
    pub async fn purge_completed(&self, older_than: Duration) -> Result<usize> {
        let cutoff = now_ms().saturating_sub(duration_ms(older_than));
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "DELETE FROM tasks WHERE status = 'done' AND finished_at_ms <= ?1",
                rusqlite::params![cutoff],
            )
            .context("Failed to purge completed tasks")?;
        Ok(rows)
    }

    /// Put failed tasks of a queue back to pending with a fresh attempt budget.
    pub async fn requeue_failed(&self, queue: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE tasks
                 SET status = 'pending', attempts = 0, available_at_ms = ?1,
                     lease_expires_at_ms = NULL, worker_id = NULL, finished_at_ms = NULL
                 WHERE queue = ?2 AND status = 'failed'",
                rusqlite::params![now_ms(), queue],
            )
            .context("Failed to requeue failed tasks")?;
        Ok(rows)
    }

    #[cfg(test)]
    async fn status_of(&self, id: i64) -> Result<(String, u32, Option<String>)> {
        let conn = self.conn.lock().await;
        let row = conn.query_row(
            "SELECT status, attempts, last_error FROM tasks WHERE id = ?1",
            rusqlite::params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(row)
    }
}

#[async_trait]
impl TaskQueue for SqliteQueue {
    async fn enqueue(&self, task: Task) -> Result<i64> {
        let payload = serde_json::to_string(&task)?;
        let now = now_ms();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tasks (queue, name, payload, status, attempts, max_attempts,
                                available_at_ms, created_at_ms)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?5)",
            rusqlite::params![task.queue(), task.name(), payload, self.max_attempts, now],
        )
        .with_context(|| format!("Failed to enqueue {}", task))?;
        let id = conn.last_insert_rowid();
        debug!("Enqueued {} as task {} on '{}'", task, id, task.queue());
        Ok(id)
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Delivery>> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin claim transaction")?;
        let now = now_ms();

        let delivery = loop {
            // Pending tasks that are due, or running tasks whose worker went quiet
            let candidate: Option<(i64, String, u32, u32, String)> = tx
                .query_row(
                    "SELECT id, payload, attempts, max_attempts, status FROM tasks
                     WHERE queue = ?1 AND (
                        (status = 'pending' AND available_at_ms <= ?2)
                        OR (status = 'running' AND lease_expires_at_ms <= ?2)
                     )
                     ORDER BY available_at_ms, id
                     LIMIT 1",
                    rusqlite::params![queue, now],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                )
                .optional()?;

            let Some((id, payload, attempts, max_attempts, status)) = candidate else {
                break None;
            };

            if status == "running" {
                warn!("Lease expired on task {}, reclaiming", id);
                if attempts >= max_attempts {
                    tx.execute(
                        "UPDATE tasks SET status = 'failed', last_error = ?1,
                                          lease_expires_at_ms = NULL, finished_at_ms = ?2
                         WHERE id = ?3",
                        rusqlite::params!["lease expired on final attempt", now, id],
                    )?;
                    continue;
                }
            }

            let task: Task = match serde_json::from_str(&payload) {
                Ok(task) => task,
                Err(e) => {
                    warn!("Dropping task {} with unreadable payload: {}", id, e);
                    tx.execute(
                        "UPDATE tasks SET status = 'failed', last_error = ?1, finished_at_ms = ?2
                         WHERE id = ?3",
                        rusqlite::params![format!("unreadable payload: {}", e), now, id],
                    )?;
                    continue;
                }
            };

            tx.execute(
                "UPDATE tasks SET status = 'running', attempts = attempts + 1,
                                  worker_id = ?1, lease_expires_at_ms = ?2
                 WHERE id = ?3",
                rusqlite::params![worker_id, now.saturating_add(duration_ms(lease)), id],
            )?;

            break Some(Delivery {
                id,
                task,
                attempts: attempts + 1,
            });
        };

        tx.commit().context("Failed to commit claim")?;
        Ok(delivery)
    }

    async fn renew(&self, id: i64, worker_id: &str, lease: Duration) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE tasks SET lease_expires_at_ms = ?1
                 WHERE id = ?2 AND worker_id = ?3 AND status = 'running'",
                rusqlite::params![now_ms().saturating_add(duration_ms(lease)), id, worker_id],
            )
            .with_context(|| format!("Failed to renew lease on task {}", id))?;
        Ok(rows > 0)
    }

    async fn ack(&self, id: i64, worker_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE tasks SET status = 'done', lease_expires_at_ms = NULL, finished_at_ms = ?1
                 WHERE id = ?2 AND worker_id = ?3 AND status = 'running'",
                rusqlite::params![now_ms(), id, worker_id],
            )
            .with_context(|| format!("Failed to ack task {}", id))?;
        Ok(rows > 0)
    }

    async fn retry(
        &self,
        id: i64,
        worker_id: &str,
        error: &str,
        delay: Duration,
    ) -> Result<Retried> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_ms();

        let held: Option<(u32, u32)> = tx
            .query_row(
                "SELECT attempts, max_attempts FROM tasks
                 WHERE id = ?1 AND worker_id = ?2 AND status = 'running'",
                rusqlite::params![id, worker_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context(|| format!("Failed to look up task {}", id))?;
        let Some((attempts, max_attempts)) = held else {
            return Ok(Retried::LeaseLost);
        };

        let retried = if attempts < max_attempts {
            tx.execute(
                "UPDATE tasks SET status = 'pending', last_error = ?1, available_at_ms = ?2,
                                  lease_expires_at_ms = NULL, worker_id = NULL
                 WHERE id = ?3",
                rusqlite::params![error, now.saturating_add(duration_ms(delay)), id],
            )?;
            Retried::Requeued
        } else {
            tx.execute(
                "UPDATE tasks SET status = 'failed', last_error = ?1,
                                  lease_expires_at_ms = NULL, finished_at_ms = ?2
                 WHERE id = ?3",
                rusqlite::params![error, now, id],
            )?;
            Retried::Exhausted
        };
        tx.commit()
            .with_context(|| format!("Failed to reschedule task {}", id))?;
        Ok(retried)
    }

    async fn fail(&self, id: i64, worker_id: &str, error: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE tasks SET status = 'failed', last_error = ?1,
                                  lease_expires_at_ms = NULL, finished_at_ms = ?2
                 WHERE id = ?3 AND worker_id = ?4 AND status = 'running'",
                rusqlite::params![error, now_ms(), id, worker_id],
            )
            .with_context(|| format!("Failed to mark task {} failed", id))?;
        Ok(rows > 0)
    }
}
