//! SQLite-backed task queue.
//!
//! Tasks live in the `tasks` table next to the domain data. Timestamps are
//! Unix milliseconds. A claim is one `UPDATE .. RETURNING` statement, so two
//! workers can never take the same row.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{FailOutcome, QueueStats, Task, TaskEnvelope, TaskQueue, TaskStatus};
use crate::types::YieldError;

/// Retry policy applied to every submitted task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(30 * 60),
        }
    }
}

/// Delay before retry number `attempts`: `base * 2^(attempts - 1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// `TaskQueue` over the shared SQLite pool.
#[derive(Clone)]
pub struct SqliteTaskQueue {
    pool: SqlitePool,
    settings: QueueSettings,
}

impl SqliteTaskQueue {
    /// The pool must have been opened with `storage::sqlite::connect`,
    /// which creates the `tasks` table.
    pub fn new(pool: SqlitePool, settings: QueueSettings) -> Self {
        Self { pool, settings }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    async fn bury(&self, id: &str, error: &str) -> Result<(), YieldError> {
        sqlx::query("UPDATE tasks SET status = 'failed', last_error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn submit(&self, task: &Task) -> Result<String, YieldError> {
        let id = Uuid::new_v4().to_string();
        let (name, args) = task.to_parts()?;
        let now = now_ms();

        sqlx::query(
            "INSERT INTO tasks (id, name, args, status, attempts, max_attempts, run_at, created_at, updated_at) \
             VALUES (?, ?, ?, 'pending', 0, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&name)
        .bind(serde_json::to_string(&args)?)
        .bind(i64::from(self.settings.max_attempts))
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(task_id = %id, task = %task, "Task submitted");
        Ok(id)
    }

    async fn claim(&self) -> Result<Option<TaskEnvelope>, YieldError> {
        loop {
            let now = now_ms();
            let row = sqlx::query(
                "UPDATE tasks SET status = 'running', attempts = attempts + 1, updated_at = ? \
                 WHERE status = 'pending' AND id = ( \
                    SELECT id FROM tasks WHERE status = 'pending' AND run_at <= ? \
                    ORDER BY run_at ASC, rowid ASC LIMIT 1) \
                 RETURNING id, name, args, attempts, max_attempts",
            )
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            let id: String = row.try_get("id")?;
            let name: String = row.try_get("name")?;
            let args: String = row.try_get("args")?;
            let attempts: i64 = row.try_get("attempts")?;
            let max_attempts: i64 = row.try_get("max_attempts")?;

            let decoded = serde_json::from_str(&args)
                .map_err(YieldError::from)
                .and_then(|args| Task::from_parts(&name, args));

            match decoded {
                Ok(task) => {
                    return Ok(Some(TaskEnvelope {
                        id,
                        task,
                        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
                        max_attempts: u32::try_from(max_attempts).unwrap_or(u32::MAX),
                    }))
                }
                Err(e) => {
                    warn!(task_id = %id, name = %name, error = %e, "Undecodable task, marking failed");
                    self.bury(&id, &e.to_string()).await?;
                }
            }
        }
    }

    async fn complete(&self, id: &str) -> Result<(), YieldError> {
        sqlx::query("UPDATE tasks SET status = 'done', last_error = NULL, updated_at = ? WHERE id = ?")
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(&self, id: &str, error: &str, retryable: bool) -> Result<FailOutcome, YieldError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT attempts, max_attempts FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| YieldError::Storage(format!("unknown task {id}")))?;
        let attempts: i64 = row.try_get("attempts")?;
        let max_attempts: i64 = row.try_get("max_attempts")?;
        let now = now_ms();

        let outcome = if retryable && attempts < max_attempts {
            let delay = backoff_delay(
                self.settings.backoff_base,
                self.settings.backoff_max,
                u32::try_from(attempts).unwrap_or(u32::MAX),
            );
            sqlx::query(
                "UPDATE tasks SET status = 'pending', run_at = ?, last_error = ?, updated_at = ? WHERE id = ?",
            )
            .bind(now.saturating_add(millis(delay)))
            .bind(error)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            FailOutcome::Retrying { delay }
        } else {
            sqlx::query("UPDATE tasks SET status = 'failed', last_error = ?, updated_at = ? WHERE id = ?")
                .bind(error)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            FailOutcome::Dead
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, YieldError> {
        let now = now_ms();
        let cutoff = now.saturating_sub(millis(older_than));
        let mut tx = self.pool.begin().await?;

        let buried = sqlx::query(
            "UPDATE tasks SET status = 'failed', last_error = 'abandoned while running', updated_at = ? \
             WHERE status = 'running' AND updated_at < ? AND attempts >= max_attempts",
        )
        .bind(now)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            "UPDATE tasks SET status = 'pending', run_at = ?, updated_at = ? \
             WHERE status = 'running' AND updated_at < ?",
        )
        .bind(now)
        .bind(now)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if buried > 0 || requeued > 0 {
            warn!(requeued, buried, "Recovered stale running tasks");
        }
        Ok(requeued)
    }

    async fn status(&self, id: &str) -> Result<Option<TaskStatus>, YieldError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        status.map(|s| s.parse()).transpose()
    }

    async fn stats(&self) -> Result<QueueStats, YieldError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            let n = n.max(0) as u64;
            match status.parse::<TaskStatus>()? {
                TaskStatus::Pending => stats.pending = n,
                TaskStatus::Running => stats.running = n,
                TaskStatus::Done => stats.done = n,
                TaskStatus::Failed => stats.failed = n,
            }
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
